use super::{ConnectionId, Session, SessionError, SessionEvent, SessionIdentity, SessionSnapshot};
use crate::config::SessionConfig;
use crate::engine::Engine;
use crate::relay::TerminalDisplay;
use crate::transport::{PeerId, TransportProvider};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

enum SessionCommand {
    Connect {
        remote: PeerId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Close {
        connection: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<usize>,
    },
    Boot {
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    Input(String),
    Compose(String),
    SendChat {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    BroadcastCommand {
        name: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running session.
///
/// Every call is forwarded to the driver task that owns the [`Session`];
/// state is observed through [`SessionSnapshot`]s.
#[derive(Clone)]
pub struct SessionHandle {
    commands: UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Spawns the driver on the current runtime and starts identity allocation.
    pub fn spawn(
        config: SessionConfig,
        provider: Arc<dyn TransportProvider>,
        engine: Arc<dyn Engine>,
        display: Arc<dyn TerminalDisplay>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let session = Session::new(config, provider, engine, display, events_tx);
        let (state_tx, state_rx) = watch::channel(session.snapshot());
        tokio::spawn(drive(session, commands_rx, events_rx, state_tx));
        Self {
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Waits for the identity, or the reason it could not be allocated.
    pub async fn ready(&self) -> Result<SessionIdentity, SessionError> {
        let snapshot = self
            .wait_for(|s| s.identity.is_some() || s.allocation_error.is_some() || s.disposed)
            .await?;
        if snapshot.disposed {
            return Err(SessionError::Disposed);
        }
        if let Some(identity) = snapshot.identity {
            return Ok(identity);
        }
        match snapshot.allocation_error {
            Some(err) => Err(err.into()),
            None => Err(SessionError::Disposed),
        }
    }

    /// Resolves once the connection is open, or with the negotiation failure.
    pub async fn connect(&self, remote: impl Into<PeerId>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Connect {
            remote: remote.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Disposed)?
    }

    pub async fn close(&self, connection: ConnectionId) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Close { connection, reply })?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    /// Closes every open connection.
    pub async fn disconnect(&self) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Disconnect { reply })?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    /// `Ok(false)` when an engine is already booting or online.
    pub async fn boot(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Boot { reply })?;
        rx.await.map_err(|_| SessionError::Disposed)?
    }

    pub fn input(&self, data: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::Input(data.into()))
    }

    /// Reports the current compose buffer for typing presence.
    pub fn compose(&self, buffer: impl Into<String>) -> Result<(), SessionError> {
        self.send(SessionCommand::Compose(buffer.into()))
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SendChat {
            text: text.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    pub async fn broadcast_command(&self, name: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::BroadcastCommand {
            name: name.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Disposed)?
    }

    /// Idempotent; resolves once teardown finished.
    pub async fn dispose(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::Dispose { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Waits until `predicate` holds for the published snapshot.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SessionSnapshot, SessionError>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| SessionError::Disposed)?;
        Ok(snapshot.clone())
    }

    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Disposed)
    }
}

/// Reply held back until the snapshot reflecting the command is published.
type Deferred = Box<dyn FnOnce() + Send>;

fn deferred<T: Send + 'static>(reply: oneshot::Sender<T>, value: T) -> Option<Deferred> {
    Some(Box::new(move || {
        let _ = reply.send(value);
    }))
}

async fn drive(
    mut session: Session,
    mut commands: UnboundedReceiver<SessionCommand>,
    mut events: UnboundedReceiver<SessionEvent>,
    state: watch::Sender<SessionSnapshot>,
) {
    session.start();
    loop {
        let deadline = session.next_deadline();
        let mut pending = None;
        let mut stop = false;
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Dispose { reply }) => {
                    session.dispose().await;
                    pending = deferred(reply, ());
                    stop = true;
                }
                Some(command) => pending = apply(&mut session, command),
                None => {
                    session.dispose().await;
                    stop = true;
                }
            },
            Some(event) = events.recv() => session.handle_event(event, Instant::now()),
            _ = sleep_until(deadline) => session.poll_timers(Instant::now()),
        }
        state.send_replace(session.snapshot());
        if let Some(reply) = pending {
            reply();
        }
        for (reply, result) in session.take_connect_replies() {
            let _ = reply.send(result);
        }
        if stop {
            break;
        }
    }
    debug!(target: "ghost_lab::session", "session driver stopped");
}

fn apply(session: &mut Session, command: SessionCommand) -> Option<Deferred> {
    let now = Instant::now();
    match command {
        SessionCommand::Connect { remote, reply } => {
            session.connect(remote, reply);
            None
        }
        SessionCommand::Close { connection, reply } => deferred(reply, session.close(connection)),
        SessionCommand::Disconnect { reply } => deferred(reply, session.disconnect()),
        SessionCommand::Boot { reply } => deferred(reply, session.boot()),
        SessionCommand::Input(data) => {
            session.input(&data);
            None
        }
        SessionCommand::Compose(buffer) => {
            session.compose(&buffer, now);
            None
        }
        SessionCommand::SendChat { text, reply } => deferred(reply, session.send_chat(&text, now)),
        SessionCommand::BroadcastCommand { name, reply } => {
            deferred(reply, session.broadcast_command(&name, now))
        }
        SessionCommand::Dispose { reply } => deferred(reply, ()),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, ProcessHandle};
    use crate::session::SessionStatus;
    use crate::transport::memory::MemoryBroker;
    use async_trait::async_trait;

    struct NoEngine;

    #[async_trait]
    impl Engine for NoEngine {
        async fn boot(&self) -> Result<ProcessHandle, EngineError> {
            Err(EngineError::Boot("no engine in this test".into()))
        }
    }

    fn spawn(broker: &MemoryBroker, id: &str) -> SessionHandle {
        SessionHandle::spawn(
            SessionConfig::default(),
            Arc::new(broker.provider_with_identity(id)),
            Arc::new(NoEngine),
            Arc::new(|_: &str| {}),
        )
    }

    #[tokio::test]
    async fn ready_resolves_with_identity() {
        let broker = MemoryBroker::new();
        let handle = spawn(&broker, "A1");
        let identity = handle.ready().await.unwrap();
        assert_eq!(identity.peer_id, PeerId::from("A1"));
        assert_eq!(handle.snapshot().status, SessionStatus::Ready);
        assert!(handle.snapshot().log[0].message.starts_with("[GHOST_IDENTITY] Established as: A1"));
    }

    #[tokio::test]
    async fn failed_boot_reverts_to_offline() {
        let broker = MemoryBroker::new();
        let handle = spawn(&broker, "A1");
        handle.ready().await.unwrap();
        assert!(handle.boot().await.unwrap());
        let snapshot = handle
            .wait_for(|s| s.last_error.is_some())
            .await
            .unwrap();
        assert_eq!(snapshot.engine, crate::engine::EngineState::Offline);
        assert!(snapshot.log.iter().any(|e| e.message.starts_with("[ENGINE] Boot failed")));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_rejects_later_calls() {
        let broker = MemoryBroker::new();
        let handle = spawn(&broker, "A1");
        handle.ready().await.unwrap();
        handle.dispose().await;
        handle.dispose().await;
        assert!(!broker.is_registered(&PeerId::from("A1")));
        assert!(handle.snapshot().disposed);
        assert!(matches!(handle.boot().await, Err(SessionError::Disposed)));
        assert!(matches!(handle.ready().await, Err(SessionError::Disposed)));
    }

    #[tokio::test]
    async fn unknown_effect_is_rejected() {
        let broker = MemoryBroker::new();
        let handle = spawn(&broker, "A1");
        handle.ready().await.unwrap();
        assert!(matches!(
            handle.broadcast_command("self_destruct").await,
            Err(SessionError::InvalidCommand(_))
        ));
        handle.broadcast_command("flash").await.unwrap();
        assert_eq!(handle.snapshot().effects, vec!["flash".to_string()]);
    }
}
