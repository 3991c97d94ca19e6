use super::{Engine, EngineError, ProcessHandle, ProcessInput};
use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use bytes::Bytes;
use crossterm::terminal;
use parking_lot::Mutex;
use portable_pty::{ChildKiller, CommandBuilder, PtyPair, PtySize, native_pty_system};
use std::env;
use std::io::{self, IsTerminal, Read, Write};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const READ_BUFFER: usize = 4096;

/// Runs a command inside a local pseudo-terminal.
#[derive(Clone, Debug)]
pub struct PtyEngine {
    command: Vec<String>,
    size: Option<(u16, u16)>,
}

impl PtyEngine {
    /// Empty `command` launches the user's shell.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            size: None,
        }
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.size = Some((cols, rows));
        self
    }
}

#[async_trait]
impl Engine for PtyEngine {
    async fn boot(&self) -> Result<ProcessHandle, EngineError> {
        let command = self.command.clone();
        let size = self.size.map(pty_size).unwrap_or_else(detect_pty_size);
        tokio::task::spawn_blocking(move || spawn_pty(&command, size))
            .await
            .map_err(|err| EngineError::Boot(err.to_string()))?
            .map_err(|err| EngineError::Boot(format!("{err:#}")))
    }
}

struct PtyInput {
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl ProcessInput for PtyInput {
    fn write(&self, chunk: &[u8]) -> Result<(), EngineError> {
        let mut writer = self.writer.lock();
        writer.write_all(chunk)?;
        writer.flush()?;
        Ok(())
    }
}

impl Drop for PtyInput {
    fn drop(&mut self) {
        if let Err(err) = self.killer.lock().kill() {
            trace!(target: "ghost_lab::engine", error = %err, "pty child already gone");
        }
    }
}

fn spawn_pty(command: &[String], size: PtySize) -> AnyResult<ProcessHandle> {
    let pty_system = native_pty_system();
    let PtyPair { master, slave } = pty_system.openpty(size).context("open pty")?;
    let mut child = slave
        .spawn_command(build_command(command))
        .context("spawn engine command")?;
    drop(slave);

    let mut reader = master.try_clone_reader().context("clone pty reader")?;
    let writer = master.take_writer().context("take pty writer")?;
    let killer = child.clone_killer();
    let (tx, rx) = mpsc::unbounded_channel();

    thread::Builder::new()
        .name("ghost-pty-reader".into())
        .spawn(move || {
            // the master must outlive the reader or the slave sees a hangup
            let _master = master;
            let mut buf = [0u8; READ_BUFFER];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(target: "ghost_lab::engine", error = %err, "pty read ended");
                        break;
                    }
                }
            }
            match child.wait() {
                Ok(status) => debug!(target: "ghost_lab::engine", ?status, "engine process exited"),
                Err(err) => warn!(target: "ghost_lab::engine", error = %err, "failed to reap engine process"),
            }
        })
        .context("spawn pty reader thread")?;

    Ok(ProcessHandle {
        stdin: Box::new(PtyInput {
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
        }),
        output: rx,
    })
}

fn pty_size((cols, rows): (u16, u16)) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn detect_pty_size() -> PtySize {
    if io::stdout().is_terminal() {
        if let Ok((cols, rows)) = terminal::size() {
            if cols > 0 && rows > 0 {
                return pty_size((cols, rows));
            }
        }
    }
    pty_size((80, 24))
}

pub fn default_shell() -> String {
    if let Ok(shell) = env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }
    for shell in ["/bin/bash", "/bin/zsh", "/bin/sh"] {
        if std::path::Path::new(shell).exists() {
            return shell.to_string();
        }
    }
    "/bin/sh".to_string()
}

fn build_command(command: &[String]) -> CommandBuilder {
    let mut builder = match command.split_first() {
        Some((program, args)) => {
            let mut builder = CommandBuilder::new(program);
            builder.args(args);
            builder
        }
        None => CommandBuilder::new(default_shell()),
    };
    builder.env("TERM", "xterm-256color");
    if let Ok(cwd) = env::current_dir() {
        builder.cwd(cwd);
    }
    builder
}
