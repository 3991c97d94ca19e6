use crate::engine::{EngineError, EngineState, ProcessInput};
use crate::protocol::{Envelope, ProtocolError};
use crate::transport::PeerLink;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

const BACKSPACE: &str = "\x7f";
const CARRIAGE_RETURN: &str = "\r";

/// Surface that renders terminal output. Rendering itself is out of scope;
/// only the bytes that reach it matter here.
pub trait TerminalDisplay: Send + Sync {
    fn write(&self, chunk: &str);

    /// A remote trigger fired; displays may flash, shake, or ignore it.
    fn show_effect(&self, _name: &str) {}
}

impl<F> TerminalDisplay for F
where
    F: Fn(&str) + Send + Sync,
{
    fn write(&self, chunk: &str) {
        (self)(chunk)
    }
}

/// Where a local keystroke chunk goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRoute {
    /// Written into the attached engine's stdin.
    Engine,
    /// Forwarded to the host as `term_in`.
    Remote(Envelope),
    /// Nobody to drive; echoed locally so the silence is visible.
    LocalEcho(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub skipped: usize,
}

/// Running totals of engine output fanned out to guests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub chunks: u64,
    pub sent: u64,
    pub skipped: u64,
}

impl RelayStats {
    pub fn record(&mut self, report: BroadcastReport) {
        self.chunks += 1;
        self.sent += report.sent as u64;
        self.skipped += report.skipped as u64;
    }
}

pub struct TerminalRelay {
    engine_state: EngineState,
    stdin: Option<Box<dyn ProcessInput>>,
    offline_prompt: String,
}

impl TerminalRelay {
    pub fn new(offline_prompt: impl Into<String>) -> Self {
        Self {
            engine_state: EngineState::Offline,
            stdin: None,
            offline_prompt: offline_prompt.into(),
        }
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine_state
    }

    /// True while this session runs the engine and acts as host.
    pub fn is_hosting(&self) -> bool {
        self.stdin.is_some()
    }

    /// Claims the single boot slot. Returns false if a boot is pending or
    /// an engine is already online.
    pub fn begin_boot(&mut self) -> bool {
        if self.engine_state != EngineState::Offline {
            return false;
        }
        self.engine_state = EngineState::Booting;
        true
    }

    /// Attaches a booted engine. Rejected (and returned) unless a boot is pending.
    pub fn attach(
        &mut self,
        stdin: Box<dyn ProcessInput>,
    ) -> Result<(), Box<dyn ProcessInput>> {
        if self.engine_state != EngineState::Booting {
            return Err(stdin);
        }
        self.stdin = Some(stdin);
        self.engine_state = EngineState::Online;
        Ok(())
    }

    pub fn boot_failed(&mut self) {
        self.stdin = None;
        self.engine_state = EngineState::Offline;
    }

    /// Engine exited or is being torn down; dropping stdin stops the process.
    pub fn detach(&mut self) {
        self.stdin = None;
        self.engine_state = EngineState::Offline;
    }

    pub fn route_input(&self, data: &str, remote_open: bool) -> InputRoute {
        if self.stdin.is_some() {
            InputRoute::Engine
        } else if remote_open {
            InputRoute::Remote(Envelope::TerminalIn {
                data: data.to_string(),
            })
        } else {
            InputRoute::LocalEcho(self.local_echo(data))
        }
    }

    pub fn write_engine(&self, data: &str) -> Result<(), EngineError> {
        match self.stdin.as_ref() {
            Some(stdin) => stdin.write(data.as_bytes()),
            None => Err(EngineError::InputClosed),
        }
    }

    /// `term_out` from a remote host. Returns the chunk to render verbatim,
    /// or `None` when this session hosts its own engine.
    pub fn on_terminal_out(&self, data: String) -> Option<String> {
        if self.is_hosting() {
            debug!(target: "ghost_lab::relay", bytes = data.len(), "ignoring term_out while hosting");
            return None;
        }
        Some(data)
    }

    /// `term_in` from a guest. Returns whether it reached the engine.
    pub fn on_terminal_in(&self, data: &str) -> Result<bool, EngineError> {
        if !self.is_hosting() {
            trace!(target: "ghost_lab::relay", bytes = data.len(), "term_in dropped: no engine attached");
            return Ok(false);
        }
        self.write_engine(data)?;
        Ok(true)
    }

    fn local_echo(&self, data: &str) -> String {
        match data {
            CARRIAGE_RETURN => format!("\r\n{}", self.offline_prompt),
            BACKSPACE => "\u{8} \u{8}".to_string(),
            other => other.to_string(),
        }
    }
}

/// Sends one engine output chunk to every link in `links`.
pub fn broadcast_output(
    chunk: &str,
    links: &[Arc<dyn PeerLink>],
) -> Result<BroadcastReport, ProtocolError> {
    broadcast(
        &Envelope::TerminalOut {
            data: chunk.to_string(),
        },
        links,
    )
}

/// Fans `envelope` out to `links`.
///
/// The payload is encoded once so every peer receives identical bytes.
/// `links` is a snapshot taken before sending; links that closed since are
/// skipped rather than written to.
pub fn broadcast(
    envelope: &Envelope,
    links: &[Arc<dyn PeerLink>],
) -> Result<BroadcastReport, ProtocolError> {
    let payload = envelope.encode()?;
    let mut report = BroadcastReport::default();
    for link in links {
        if !link.is_open() {
            report.skipped += 1;
            continue;
        }
        match link.send(payload.clone()) {
            Ok(()) => report.sent += 1,
            Err(err) => {
                debug!(
                    target: "ghost_lab::relay",
                    remote = %link.remote_id(),
                    kind = envelope.kind().wire_name(),
                    error = %err,
                    "send failed"
                );
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::link_pair;
    use crate::transport::{LinkEvent, LinkHandle, PeerId};
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, Box<dyn ProcessInput>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        let input = move |chunk: &[u8]| {
            sink.lock().extend_from_slice(chunk);
            Ok::<(), EngineError>(())
        };
        (written, Box::new(input))
    }

    fn guests(count: usize) -> (Vec<Arc<dyn PeerLink>>, Vec<LinkHandle>) {
        (0..count)
            .map(|idx| link_pair(PeerId::from("host"), PeerId::new(format!("guest-{idx}"))))
            .map(|(local, remote)| (local.link, remote))
            .unzip()
    }

    #[test]
    fn boot_slot_is_claimed_once() {
        let mut relay = TerminalRelay::new("$ ");
        assert!(relay.begin_boot());
        assert!(!relay.begin_boot());
        assert_eq!(relay.engine_state(), EngineState::Booting);

        let (_, stdin) = recorder();
        assert!(relay.attach(stdin).is_ok());
        assert_eq!(relay.engine_state(), EngineState::Online);
        assert!(!relay.begin_boot());

        relay.detach();
        assert_eq!(relay.engine_state(), EngineState::Offline);
        assert!(relay.begin_boot());
        relay.boot_failed();
        assert_eq!(relay.engine_state(), EngineState::Offline);
    }

    #[test]
    fn attach_without_pending_boot_is_rejected() {
        let mut relay = TerminalRelay::new("$ ");
        let (_, stdin) = recorder();
        assert!(relay.attach(stdin).is_err());
        assert!(!relay.is_hosting());
    }

    #[test]
    fn input_routing_prefers_engine_then_remote_then_echo() {
        let mut relay = TerminalRelay::new("ghost@offline:~$ ");
        assert_eq!(
            relay.route_input("\r", false),
            InputRoute::LocalEcho("\r\nghost@offline:~$ ".into())
        );
        assert_eq!(
            relay.route_input("\x7f", false),
            InputRoute::LocalEcho("\u{8} \u{8}".into())
        );
        assert_eq!(relay.route_input("a", false), InputRoute::LocalEcho("a".into()));
        assert_eq!(
            relay.route_input("ls", true),
            InputRoute::Remote(Envelope::TerminalIn { data: "ls".into() })
        );

        let (written, stdin) = recorder();
        relay.begin_boot();
        relay.attach(stdin).ok();
        assert_eq!(relay.route_input("ls", true), InputRoute::Engine);
        relay.write_engine("ls\r").unwrap();
        assert_eq!(written.lock().as_slice(), b"ls\r");
    }

    #[test]
    fn term_in_reaches_engine_only_when_hosting() {
        let mut relay = TerminalRelay::new("$ ");
        assert!(!relay.on_terminal_in("whoami\r").unwrap());
        assert_eq!(relay.on_terminal_out("out".into()), Some("out".into()));

        let (written, stdin) = recorder();
        relay.begin_boot();
        relay.attach(stdin).ok();
        assert!(relay.on_terminal_in("whoami\r").unwrap());
        assert_eq!(written.lock().as_slice(), b"whoami\r");
        assert_eq!(relay.on_terminal_out("foreign".into()), None);
    }

    #[tokio::test]
    async fn broadcast_sends_identical_payload_to_every_open_link() {
        let (links, mut remotes) = guests(3);
        let report = broadcast_output("hello\n", &links).unwrap();
        assert_eq!(report, BroadcastReport { sent: 3, skipped: 0 });

        let mut payloads = Vec::new();
        for remote in &mut remotes {
            match remote.events.recv().await {
                Some(LinkEvent::Data(bytes)) => payloads.push(bytes),
                other => panic!("unexpected event {other:?}"),
            }
            assert!(remote.events.try_recv().is_err());
        }
        assert!(payloads.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(
            Envelope::decode(&payloads[0]).unwrap(),
            Envelope::TerminalOut { data: "hello\n".into() }
        );
    }

    #[tokio::test]
    async fn broadcast_skips_links_closed_after_snapshot() {
        let (links, mut remotes) = guests(2);
        links[1].close();
        let report = broadcast_output("x", &links).unwrap();
        assert_eq!(report, BroadcastReport { sent: 1, skipped: 1 });
        assert!(matches!(remotes[0].events.recv().await, Some(LinkEvent::Data(_))));
        assert_eq!(remotes[1].events.recv().await, Some(LinkEvent::Closed));
    }

    #[test]
    fn relay_stats_accumulate_reports() {
        let mut stats = RelayStats::default();
        stats.record(BroadcastReport { sent: 2, skipped: 0 });
        stats.record(BroadcastReport { sent: 1, skipped: 1 });
        assert_eq!(stats, RelayStats { chunks: 2, sent: 3, skipped: 1 });
    }
}
