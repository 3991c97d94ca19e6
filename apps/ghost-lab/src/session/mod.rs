//! The session object: identity, connection lifecycle, relay channels and
//! the operator log, mutated only by the driver task in [`driver`].

pub mod driver;
pub mod identity;
pub mod lifecycle;
pub mod log;

pub use driver::SessionHandle;
pub use identity::{AllocationError, SessionIdentity};
pub use lifecycle::{
    Connection, ConnectionId, ConnectionInfo, ConnectionLifecycle, Direction, NegotiationError,
    SessionStatus,
};
pub use log::{LogCategory, LogEntry, SessionLog};

use crate::config::SessionConfig;
use crate::engine::{Engine, EngineError, EngineState, ProcessHandle, Utf8Chunker};
use crate::protocol::{Channel, Envelope};
use crate::relay::{
    ChatMessage, EffectCatalog, InputRoute, PresenceChannel, RelayStats, RemoteTriggerChannel,
    TerminalDisplay, TerminalRelay, broadcast, broadcast_output,
};
use crate::telemetry::logging::hexdump;
use crate::transport::{LinkEvent, LinkHandle, PeerId, ProviderEvent, TransportError, TransportProvider};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    EngineBoot(#[from] EngineError),
    #[error("unknown effect {0:?}")]
    InvalidCommand(String),
    #[error("session disposed")]
    Disposed,
}

/// Completions posted back to the session by its background tasks.
pub enum SessionEvent {
    IdentityResolved(Result<SessionIdentity, AllocationError>),
    Incoming(LinkHandle),
    ProviderError(TransportError),
    OutboundResolved {
        remote: PeerId,
        result: Result<LinkHandle, NegotiationError>,
    },
    LinkData {
        connection: ConnectionId,
        payload: Bytes,
    },
    LinkClosed {
        connection: ConnectionId,
    },
    EngineBooted {
        generation: u64,
        result: Result<ProcessHandle, EngineError>,
    },
    EngineOutput {
        generation: u64,
        chunk: String,
    },
    EngineExited {
        generation: u64,
    },
}

/// Read-only view published after every state change.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionSnapshot {
    pub identity: Option<SessionIdentity>,
    pub status: SessionStatus,
    pub engine: EngineState,
    pub connections: Vec<ConnectionInfo>,
    pub messages: Vec<ChatMessage>,
    /// Remotes currently showing a typing indicator.
    pub typing: Vec<PeerId>,
    pub local_typing: bool,
    pub effects: Vec<String>,
    pub relayed: RelayStats,
    pub log: Vec<LogEntry>,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub allocation_error: Option<AllocationError>,
    pub disposed: bool,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.identity.as_ref().map(|identity| &identity.peer_id)
    }
}

pub type ConnectReply = oneshot::Sender<Result<(), SessionError>>;

pub struct Session {
    config: SessionConfig,
    identity: Option<SessionIdentity>,
    allocation_error: Option<AllocationError>,
    lifecycle: ConnectionLifecycle,
    relay: TerminalRelay,
    presence: PresenceChannel,
    triggers: RemoteTriggerChannel,
    log: SessionLog,
    provider: Arc<dyn TransportProvider>,
    engine: Arc<dyn Engine>,
    display: Arc<dyn TerminalDisplay>,
    events: UnboundedSender<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
    pending_connect: Option<ConnectReply>,
    resolved_connects: Vec<(ConnectReply, Result<(), SessionError>)>,
    engine_generation: u64,
    relayed: RelayStats,
    last_error: Option<String>,
    disposed: bool,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn TransportProvider>,
        engine: Arc<dyn Engine>,
        display: Arc<dyn TerminalDisplay>,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            identity: None,
            allocation_error: None,
            lifecycle: ConnectionLifecycle::new(),
            relay: TerminalRelay::new(config.offline_prompt.clone()),
            presence: PresenceChannel::new(config.typing_idle, config.typing_timeout),
            triggers: RemoteTriggerChannel::new(EffectCatalog::builtin(config.effect_duration)),
            log: SessionLog::new(config.log_capacity),
            provider,
            engine,
            display,
            events,
            tasks: Vec::new(),
            pending_connect: None,
            resolved_connects: Vec::new(),
            engine_generation: 0,
            relayed: RelayStats::default(),
            last_error: None,
            disposed: false,
            config,
        }
    }

    /// Starts identity allocation and the inbound-link pump.
    pub fn start(&mut self) {
        match self.provider.take_events() {
            Some(mut provider_events) => {
                let events = self.events.clone();
                self.spawn(async move {
                    while let Some(event) = provider_events.recv().await {
                        let event = match event {
                            ProviderEvent::Incoming(link) => SessionEvent::Incoming(link),
                            ProviderEvent::Error(err) => SessionEvent::ProviderError(err),
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                });
            }
            None => {
                warn!(target: "ghost_lab::session", "provider events already claimed; inbound links will not be seen");
            }
        }

        let provider = self.provider.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = SessionIdentity::allocate(provider.as_ref()).await;
            let _ = events.send(SessionEvent::IdentityResolved(result));
        });
    }

    pub fn status(&self) -> &SessionStatus {
        self.lifecycle.status()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identity: self.identity.clone(),
            status: self.lifecycle.status().clone(),
            engine: self.relay.engine_state(),
            connections: self.lifecycle.infos(),
            messages: self.presence.messages().to_vec(),
            typing: self.presence.typing_peers(),
            local_typing: self.presence.is_local_typing(),
            effects: self.triggers.active_effects(),
            relayed: self.relayed,
            log: self.log.to_vec(),
            last_error: self.last_error.clone(),
            allocation_error: self.allocation_error.clone(),
            disposed: self.disposed,
        }
    }

    /// Connect attempts that finished since the last call, with their replies.
    /// Replies are held back so callers can publish state before answering.
    pub fn take_connect_replies(&mut self) -> Vec<(ConnectReply, Result<(), SessionError>)> {
        std::mem::take(&mut self.resolved_connects)
    }

    /// Starts an outbound connection; `reply` is answered once it opens or fails.
    pub fn connect(&mut self, remote: PeerId, reply: ConnectReply) {
        if self.disposed {
            self.resolved_connects.push((reply, Err(SessionError::Disposed)));
            return;
        }
        let hosting = self.relay.engine_state() != EngineState::Offline;
        if let Err(err) = self.lifecycle.begin_connect(&remote, hosting) {
            debug!(target: "ghost_lab::session", %remote, error = %err, "connect rejected");
            self.resolved_connects.push((reply, Err(err.into())));
            return;
        }
        self.log.record(
            LogCategory::Lifecycle,
            format!("[SYNC] Dialing {}...", remote.short(8)),
        );
        self.pending_connect = Some(reply);

        let provider = self.provider.clone();
        let events = self.events.clone();
        let limit = self.config.connect_timeout;
        self.spawn(async move {
            let attempt = provider.connect(&remote);
            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result.map_err(NegotiationError::from),
                    Err(_) => Err(NegotiationError::Timeout {
                        remote: remote.clone(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    }),
                },
                None => attempt.await.map_err(NegotiationError::from),
            };
            let _ = events.send(SessionEvent::OutboundResolved { remote, result });
        });
    }

    pub fn close(&mut self, connection: ConnectionId) -> bool {
        let Some(closed) = self.lifecycle.close(connection) else {
            return false;
        };
        self.presence.forget_peer(&closed.remote);
        self.log.record(
            LogCategory::Lifecycle,
            format!("[SYNC] Closed link with {}", closed.remote.short(6)),
        );
        true
    }

    /// Closes every open connection; returns how many were closed.
    pub fn disconnect(&mut self) -> usize {
        let closed = self.lifecycle.close_all();
        for connection in &closed {
            self.presence.forget_peer(&connection.remote);
        }
        if !closed.is_empty() {
            self.log.record(
                LogCategory::Lifecycle,
                format!("[SYNC] Closed {} link(s)", closed.len()),
            );
        }
        closed.len()
    }

    /// Boots the engine unless one is already booting or online.
    /// Returns whether a new boot started.
    pub fn boot(&mut self) -> Result<bool, SessionError> {
        if self.disposed {
            return Err(SessionError::Disposed);
        }
        if self.lifecycle.has_outbound() || self.lifecycle.pending_remote().is_some() {
            return Err(EngineError::GuestSession.into());
        }
        if !self.relay.begin_boot() {
            return Ok(false);
        }
        self.engine_generation += 1;
        let generation = self.engine_generation;
        self.log.record(LogCategory::Engine, "[ENGINE] Booting local engine...");

        let engine = self.engine.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let result = engine.boot().await;
            let _ = events.send(SessionEvent::EngineBooted { generation, result });
        });
        Ok(true)
    }

    /// A chunk of local keystrokes.
    pub fn input(&mut self, data: &str) {
        let host = self.lifecycle.outbound_link();
        match self.relay.route_input(data, host.is_some()) {
            InputRoute::Engine => {
                if let Err(err) = self.relay.write_engine(data) {
                    warn!(target: "ghost_lab::session", error = %err, "engine input failed");
                }
            }
            InputRoute::Remote(envelope) => {
                if let Some(link) = host {
                    if let Err(err) = broadcast(&envelope, &[link]) {
                        warn!(target: "ghost_lab::session", error = %err, "term_in encode failed");
                    }
                }
            }
            InputRoute::LocalEcho(echo) => self.display.write(&echo),
        }
    }

    pub fn compose(&mut self, buffer: &str, now: Instant) {
        if let Some(signal) = self.presence.update_compose(buffer, now) {
            self.fan_out(&signal);
        }
    }

    /// Returns whether a chat message was sent.
    pub fn send_chat(&mut self, text: &str, now: Instant) -> bool {
        let connected = !self.lifecycle.open_links().is_empty();
        let Some(envelope) = self.presence.send_chat(text, connected, OffsetDateTime::now_utc())
        else {
            return false;
        };
        self.fan_out(&envelope);
        // sending ends the compose burst
        self.compose("", now);
        true
    }

    /// Applies `name` locally and triggers it on every connected peer.
    pub fn broadcast_command(&mut self, name: &str, now: Instant) -> Result<(), SessionError> {
        let Some(envelope) = self.triggers.broadcast(name, now) else {
            return Err(SessionError::InvalidCommand(name.to_string()));
        };
        self.display.show_effect(name);
        self.log
            .record(LogCategory::Command, format!("[CMD] Broadcast: {name}"));
        self.fan_out(&envelope);
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.presence.next_deadline(), self.triggers.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll_timers(&mut self, now: Instant) {
        let tick = self.presence.poll(now);
        if let Some(signal) = tick.outbound {
            self.fan_out(&signal);
        }
        for peer in tick.cleared {
            trace!(target: "ghost_lab::presence", %peer, "typing indicator timed out");
        }
        for effect in self.triggers.poll(now) {
            trace!(target: "ghost_lab::trigger", effect = %effect, "effect finished");
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent, now: Instant) {
        if self.disposed {
            self.discard(event);
            return;
        }
        match event {
            SessionEvent::IdentityResolved(result) => self.on_identity(result),
            SessionEvent::Incoming(link) => self.on_incoming(link),
            SessionEvent::ProviderError(err) => {
                warn!(target: "ghost_lab::transport", error = %err, "transport provider error");
                self.last_error = Some(err.to_string());
            }
            SessionEvent::OutboundResolved { remote, result } => self.on_outbound(remote, result),
            SessionEvent::LinkData {
                connection,
                payload,
            } => self.on_link_data(connection, payload, now),
            SessionEvent::LinkClosed { connection } => {
                if let Some(closed) = self.lifecycle.close(connection) {
                    self.presence.forget_peer(&closed.remote);
                    self.log.record(
                        LogCategory::Lifecycle,
                        format!("[OFFLINE] Connection signal lost ({}).", closed.remote.short(6)),
                    );
                }
            }
            SessionEvent::EngineBooted { generation, result } => self.on_engine_booted(generation, result),
            SessionEvent::EngineOutput { generation, chunk } => {
                if generation == self.engine_generation && self.relay.is_hosting() {
                    self.display.write(&chunk);
                    match broadcast_output(&chunk, &self.lifecycle.open_links()) {
                        Ok(report) => {
                            self.relayed.record(report);
                            trace!(
                                target: "ghost_lab::relay",
                                sent = report.sent,
                                skipped = report.skipped,
                                bytes = chunk.len(),
                                "term_out broadcast"
                            );
                        }
                        Err(err) => warn!(target: "ghost_lab::relay", error = %err, "term_out encode failed"),
                    }
                }
            }
            SessionEvent::EngineExited { generation } => {
                if generation == self.engine_generation && self.relay.engine_state() == EngineState::Online {
                    self.relay.detach();
                    self.log.record(LogCategory::Engine, "[ENGINE] Local engine exited");
                }
            }
        }
    }

    /// Tears the session down: links, engine, timers and the provider
    /// registration. Safe to call more than once.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.lifecycle.close_all();
        self.relay.detach();
        self.triggers.clear();
        self.presence.update_compose("", Instant::now());
        self.reply_connect(Err(SessionError::Disposed));
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.provider.shutdown().await;
        debug!(target: "ghost_lab::session", "session disposed");
    }

    fn on_identity(&mut self, result: Result<SessionIdentity, AllocationError>) {
        match result {
            Ok(identity) => {
                if self.lifecycle.identity_allocated(identity.peer_id.clone()) {
                    self.log.record(
                        LogCategory::Identity,
                        format!("[GHOST_IDENTITY] Established as: {}...", identity.peer_id.short(8)),
                    );
                    self.identity = Some(identity);
                }
            }
            Err(err) => {
                self.log.record(
                    LogCategory::Identity,
                    format!("[GHOST_IDENTITY] Allocation failed: {err}"),
                );
                self.lifecycle.allocation_failed(err.to_string());
                self.last_error = Some(err.to_string());
                self.allocation_error = Some(err);
            }
        }
    }

    fn on_incoming(&mut self, handle: LinkHandle) {
        let LinkHandle { link, events } = handle;
        let remote = link.remote_id().clone();
        self.log.record(
            LogCategory::Inbound,
            format!("[INCOMING] Request from {}", remote.short(8)),
        );
        match self.lifecycle.accept_inbound(link) {
            Ok(connection) => {
                self.spawn_reader(connection, events);
                self.log.record(
                    LogCategory::Lifecycle,
                    format!("[SYNC] Fully synchronized with {}", remote.short(6)),
                );
            }
            Err(link) => {
                link.close();
                self.log.record(
                    LogCategory::Inbound,
                    format!(
                        "[INCOMING] Refused {}: session is {}",
                        remote.short(8),
                        self.lifecycle.status().label()
                    ),
                );
            }
        }
    }

    fn on_outbound(&mut self, remote: PeerId, result: Result<LinkHandle, NegotiationError>) {
        match result {
            Ok(LinkHandle { link, events }) => match self.lifecycle.outbound_opened(&remote, link.clone()) {
                Some(connection) => {
                    self.spawn_reader(connection, events);
                    self.log.record(
                        LogCategory::Lifecycle,
                        format!("[SYNC] Fully synchronized with {}", remote.short(6)),
                    );
                    self.reply_connect(Ok(()));
                }
                None => link.close(),
            },
            Err(err) => {
                if !self.lifecycle.outbound_failed(&remote, &err) {
                    return;
                }
                self.log.record(
                    LogCategory::Lifecycle,
                    format!("[OFFLINE] Link to {} failed: {err}", remote.short(8)),
                );
                self.last_error = Some(err.to_string());
                self.reply_connect(Err(err.into()));
            }
        }
    }

    fn on_engine_booted(&mut self, generation: u64, result: Result<ProcessHandle, EngineError>) {
        if generation != self.engine_generation {
            return;
        }
        match result {
            Ok(ProcessHandle { stdin, output }) => {
                if self.relay.attach(stdin).is_err() {
                    debug!(target: "ghost_lab::engine", "boot finished after the slot was released");
                    return;
                }
                self.spawn_engine_pump(generation, output);
                self.log.record(LogCategory::Engine, "[ENGINE] Local engine booted");
            }
            Err(err) => {
                self.relay.boot_failed();
                self.log
                    .record(LogCategory::Engine, format!("[ENGINE] Boot failed: {err}"));
                self.last_error = Some(err.to_string());
            }
        }
    }

    fn on_link_data(&mut self, connection: ConnectionId, payload: Bytes, now: Instant) {
        let Some((remote, direction)) = self
            .lifecycle
            .get(connection)
            .map(|conn| (conn.remote.clone(), conn.direction))
        else {
            trace!(target: "ghost_lab::session", %connection, "data for a closed connection");
            return;
        };
        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: "ghost_lab::protocol", %remote, error = %err, "dropping envelope");
                trace!(target: "ghost_lab::protocol", "payload:\n{}", hexdump(&payload));
                self.log.record(
                    LogCategory::Protocol,
                    format!("[PROTOCOL] Dropped envelope from {}: {err}", remote.short(8)),
                );
                return;
            }
        };
        match envelope.kind().channel() {
            Channel::Terminal => self.dispatch_terminal(direction, envelope),
            Channel::Presence => self.dispatch_presence(remote, envelope, now),
            Channel::Trigger => self.dispatch_trigger(envelope, now),
        }
    }

    fn dispatch_terminal(&mut self, direction: Direction, envelope: Envelope) {
        match (envelope, direction) {
            (Envelope::TerminalOut { data }, Direction::Outbound) => {
                if let Some(chunk) = self.relay.on_terminal_out(data) {
                    self.display.write(&chunk);
                }
            }
            (Envelope::TerminalIn { data }, Direction::Inbound) => {
                if let Err(err) = self.relay.on_terminal_in(&data) {
                    warn!(target: "ghost_lab::relay", error = %err, "guest input lost");
                }
            }
            (envelope, direction) => {
                debug!(
                    target: "ghost_lab::relay",
                    kind = envelope.kind().wire_name(),
                    ?direction,
                    "terminal envelope from the wrong side ignored"
                );
            }
        }
    }

    fn dispatch_presence(&mut self, remote: PeerId, envelope: Envelope, now: Instant) {
        match envelope {
            Envelope::Chat { text } => {
                self.presence.on_chat(remote, text, OffsetDateTime::now_utc());
            }
            Envelope::Typing { active } => self.presence.on_typing(remote, active, now),
            _ => {}
        }
    }

    fn dispatch_trigger(&mut self, envelope: Envelope, now: Instant) {
        let Envelope::Command { name } = envelope else {
            return;
        };
        if self.triggers.on_command(&name, now) {
            self.display.show_effect(&name);
            self.log
                .record(LogCategory::Command, format!("[CMD] Remote execution: {name}"));
        }
    }

    fn fan_out(&self, envelope: &Envelope) {
        match broadcast(envelope, &self.lifecycle.open_links()) {
            Ok(report) => trace!(
                target: "ghost_lab::session",
                kind = envelope.kind().wire_name(),
                sent = report.sent,
                "fan-out"
            ),
            Err(err) => warn!(target: "ghost_lab::session", error = %err, "fan-out encode failed"),
        }
    }

    fn reply_connect(&mut self, result: Result<(), SessionError>) {
        if let Some(reply) = self.pending_connect.take() {
            self.resolved_connects.push((reply, result));
        }
    }

    fn spawn_reader(&mut self, connection: ConnectionId, mut link_events: UnboundedReceiver<LinkEvent>) {
        let events = self.events.clone();
        self.spawn(async move {
            while let Some(event) = link_events.recv().await {
                match event {
                    LinkEvent::Data(payload) => {
                        if events
                            .send(SessionEvent::LinkData {
                                connection,
                                payload,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    LinkEvent::Closed => break,
                }
            }
            let _ = events.send(SessionEvent::LinkClosed { connection });
        });
    }

    fn spawn_engine_pump(&mut self, generation: u64, mut output: UnboundedReceiver<Bytes>) {
        let events = self.events.clone();
        self.spawn(async move {
            let mut chunker = Utf8Chunker::new();
            while let Some(bytes) = output.recv().await {
                let chunk = chunker.push(&bytes);
                if chunk.is_empty() {
                    continue;
                }
                if events
                    .send(SessionEvent::EngineOutput { generation, chunk })
                    .is_err()
                {
                    return;
                }
            }
            let chunk = chunker.finish();
            if !chunk.is_empty() {
                let _ = events.send(SessionEvent::EngineOutput { generation, chunk });
            }
            let _ = events.send(SessionEvent::EngineExited { generation });
        });
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(task));
    }

    fn discard(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Incoming(handle) => handle.link.close(),
            SessionEvent::OutboundResolved {
                result: Ok(handle), ..
            } => handle.link.close(),
            _ => {}
        }
    }
}
