//! Interactive console: raw keystrokes go to the session, `Ctrl-]` opens a
//! one-line command prompt for chat, effects and session control.

use crate::engine::Utf8Chunker;
use crate::relay::trigger::HACKER_FX;
use crate::relay::{Origin, TerminalDisplay};
use crate::session::{SessionError, SessionHandle, SessionSnapshot};
use crate::terminal::error::CliError;
use crate::terminal::tty::RawModeGuard;
use std::io::{self, IsTerminal, Write};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// `Ctrl-]`, as telnet uses it.
pub const ESCAPE: char = '\u{1d}';
const CHAT_PREFIX: &str = "chat ";

const HELP: &str = "commands: chat <text> | fx [name] | boot | status [json] | log | close | quit";

/// Writes terminal output to stdout.
#[derive(Debug, Default)]
pub struct StdoutDisplay;

impl TerminalDisplay for StdoutDisplay {
    fn write(&self, chunk: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(chunk.as_bytes());
        let _ = stdout.flush();
    }

    fn show_effect(&self, _name: &str) {
        // audible cue; the notifier prints the effect name
        self.write("\x07");
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleAction {
    /// Keystrokes for the terminal.
    Input(String),
    /// Current chat draft, for typing presence.
    Compose(String),
    Chat(String),
    Effect(String),
    Boot,
    Status { json: bool },
    Log,
    Close,
    Quit,
    Help,
    Unknown(String),
    /// Prompt feedback to draw on the console itself.
    Echo(String),
}

/// Splits keystrokes between the terminal and the command prompt.
#[derive(Debug, Default)]
pub struct ConsoleInput {
    prompt: Option<String>,
}

impl ConsoleInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_prompt(&self) -> bool {
        self.prompt.is_some()
    }

    pub fn feed(&mut self, text: &str) -> Vec<ConsoleAction> {
        let mut actions = Vec::new();
        let mut passthrough = String::new();
        for ch in text.chars() {
            let Some(line) = self.prompt.as_mut() else {
                if ch == ESCAPE {
                    flush(&mut passthrough, &mut actions);
                    self.prompt = Some(String::new());
                    actions.push(ConsoleAction::Echo("\r\n[ghost] ".into()));
                } else {
                    passthrough.push(ch);
                }
                continue;
            };
            match ch {
                '\r' | '\n' => {
                    let line = std::mem::take(line);
                    self.prompt = None;
                    actions.push(ConsoleAction::Echo("\r\n".into()));
                    if let Some(action) = parse_command(&line) {
                        actions.push(action);
                    }
                    actions.push(ConsoleAction::Compose(String::new()));
                }
                '\x7f' | '\u{8}' => {
                    if line.pop().is_some() {
                        actions.push(ConsoleAction::Echo("\u{8} \u{8}".into()));
                        if let Some(draft) = chat_draft(line) {
                            actions.push(ConsoleAction::Compose(draft));
                        }
                    }
                }
                ESCAPE | '\x1b' | '\x03' => {
                    self.prompt = None;
                    actions.push(ConsoleAction::Echo(" (cancelled)\r\n".into()));
                    actions.push(ConsoleAction::Compose(String::new()));
                }
                ch if ch.is_control() => {}
                ch => {
                    line.push(ch);
                    actions.push(ConsoleAction::Echo(ch.to_string()));
                    if let Some(draft) = chat_draft(line) {
                        actions.push(ConsoleAction::Compose(draft));
                    }
                }
            }
        }
        flush(&mut passthrough, &mut actions);
        actions
    }
}

fn flush(passthrough: &mut String, actions: &mut Vec<ConsoleAction>) {
    if !passthrough.is_empty() {
        actions.push(ConsoleAction::Input(std::mem::take(passthrough)));
    }
}

fn chat_draft(line: &str) -> Option<String> {
    line.strip_prefix(CHAT_PREFIX).map(str::to_string)
}

pub fn parse_command(line: &str) -> Option<ConsoleAction> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let action = match (word, rest) {
        ("chat", text) => ConsoleAction::Chat(text.to_string()),
        ("fx", "") => ConsoleAction::Effect(HACKER_FX.to_string()),
        ("fx", name) => ConsoleAction::Effect(name.to_string()),
        ("boot", "") => ConsoleAction::Boot,
        ("status", "") => ConsoleAction::Status { json: false },
        ("status", "json") => ConsoleAction::Status { json: true },
        ("log", "") => ConsoleAction::Log,
        ("close", "") => ConsoleAction::Close,
        ("quit" | "exit", "") => ConsoleAction::Quit,
        ("help" | "?", "") => ConsoleAction::Help,
        _ => ConsoleAction::Unknown(line.to_string()),
    };
    Some(action)
}

/// Turns snapshot changes into one-line notices for the operator.
#[derive(Debug)]
pub struct Notifier {
    last: SessionSnapshot,
}

impl Notifier {
    pub fn new(initial: SessionSnapshot) -> Self {
        Self { last: initial }
    }

    pub fn observe(&mut self, next: &SessionSnapshot) -> Vec<String> {
        let mut notices = Vec::new();
        let last = &self.last;
        if next.status != last.status {
            notices.push(format!("status: {}", next.status));
        }
        if next.engine != last.engine {
            notices.push(format!("engine: {}", next.engine));
        }
        if next.connections.len() != last.connections.len() {
            notices.push(format!("peers connected: {}", next.connections.len()));
        }
        for message in next.messages.iter().skip(last.messages.len()) {
            if message.origin == Origin::Remote {
                let sender = message.peer.as_ref().map(|peer| peer.short(8)).unwrap_or("?");
                notices.push(format!("{sender}: {}", message.text));
            }
        }
        for peer in next.typing.iter().filter(|peer| !last.typing.contains(peer)) {
            notices.push(format!("{} is typing...", peer.short(8)));
        }
        for effect in next.effects.iter().filter(|effect| !last.effects.contains(effect)) {
            notices.push(format!("effect: {effect}"));
        }
        if next.last_error != last.last_error {
            if let Some(err) = &next.last_error {
                notices.push(format!("error: {err}"));
            }
        }
        self.last = next.clone();
        notices
    }
}

pub fn status_line(snapshot: &SessionSnapshot) -> String {
    let (codename, id) = match &snapshot.identity {
        Some(identity) => (identity.codename.as_str(), identity.peer_id.as_str()),
        None => ("-", "-"),
    };
    format!(
        "{codename} {id} | {} | engine {} | {} peer(s)",
        snapshot.status,
        snapshot.engine,
        snapshot.connections.len()
    )
}

fn report(line: &str) {
    let mut stderr = io::stderr().lock();
    let _ = write!(stderr, "\r\n[ghost] {line}\r\n");
    let _ = stderr.flush();
}

fn echo(text: &str) {
    let mut stderr = io::stderr().lock();
    let _ = stderr.write_all(text.as_bytes());
    let _ = stderr.flush();
}

/// Runs the console until `quit`, end of input, or session teardown.
pub async fn run(handle: &SessionHandle) -> Result<(), CliError> {
    let _raw = RawModeGuard::new(io::stdin().is_terminal());
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    let mut chunker = Utf8Chunker::new();
    let mut console = ConsoleInput::new();
    let mut notifier = Notifier::new(handle.snapshot());
    let mut updates = handle.subscribe();

    loop {
        tokio::select! {
            read = stdin.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!(target: "ghost_lab::terminal", "stdin closed");
                    return Ok(());
                }
                let text = chunker.push(&buf[..n]);
                for action in console.feed(&text) {
                    if !perform(handle, action).await? {
                        return Ok(());
                    }
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot = updates.borrow_and_update().clone();
                for notice in notifier.observe(&snapshot) {
                    report(&notice);
                }
                if snapshot.disposed {
                    return Ok(());
                }
            }
        }
    }
}

/// Returns false when the console should stop.
async fn perform(handle: &SessionHandle, action: ConsoleAction) -> Result<bool, CliError> {
    match action {
        ConsoleAction::Input(data) => handle.input(data)?,
        ConsoleAction::Compose(draft) => handle.compose(draft)?,
        ConsoleAction::Echo(text) => echo(&text),
        ConsoleAction::Chat(text) => {
            if !handle.send_chat(text).await? {
                report("chat not sent: empty message or no open connection");
            }
        }
        ConsoleAction::Effect(name) => match handle.broadcast_command(name).await {
            Ok(()) => {}
            Err(SessionError::InvalidCommand(name)) => report(&format!("unknown effect {name:?}")),
            Err(err) => return Err(err.into()),
        },
        ConsoleAction::Boot => match handle.boot().await {
            Ok(true) => report("booting engine..."),
            Ok(false) => report("engine already booting or online"),
            Err(SessionError::EngineBoot(err)) => report(&err.to_string()),
            Err(err) => return Err(err.into()),
        },
        ConsoleAction::Status { json: false } => report(&status_line(&handle.snapshot())),
        ConsoleAction::Status { json: true } => match serde_json::to_string_pretty(&handle.snapshot()) {
            Ok(json) => report(&json.replace('\n', "\r\n")),
            Err(err) => report(&format!("failed to render status: {err}")),
        },
        ConsoleAction::Log => {
            for entry in &handle.snapshot().log {
                report(&entry.to_string());
            }
        }
        ConsoleAction::Close => {
            let closed = handle.disconnect().await?;
            report(&format!("closed {closed} link(s)"));
        }
        ConsoleAction::Help => report(HELP),
        ConsoleAction::Unknown(line) => report(&format!("unknown command {line:?}; try help")),
        ConsoleAction::Quit => return Ok(false),
    }
    Ok(true)
}
