use crate::transport::{PeerId, PeerLink, TransportError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Initializing,
    Ready,
    Connecting { remote: PeerId },
    Connected,
    Error { reason: String },
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Ready => "ready",
            SessionStatus::Connecting { .. } => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Error { .. } => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SessionStatus::Error { .. })
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Connecting { remote } => write!(f, "connecting to {remote}"),
            SessionStatus::Error { reason } => write!(f, "error: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// A guest dialled us.
    Inbound,
    /// We dialled a host.
    Outbound,
}

/// One open channel to a remote peer. Closed exactly once, then discarded.
pub struct Connection {
    pub id: ConnectionId,
    pub remote: PeerId,
    pub direction: Direction,
    pub link: Arc<dyn PeerLink>,
}

impl Connection {
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote: self.remote.clone(),
            direction: self.direction,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("open", &self.link.is_open())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: PeerId,
    pub direction: Direction,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("remote identifier is empty")]
    EmptyRemoteId,
    #[error("cannot connect to our own identifier")]
    SelfConnect,
    #[error("cannot connect while {0}")]
    NotReady(&'static str),
    #[error("a session running its own engine cannot join another host")]
    HostingEngine,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no answer from {remote} within {timeout_ms}ms")]
    Timeout { remote: PeerId, timeout_ms: u64 },
}

impl NegotiationError {
    /// Failures that invalidate the local identity move the session to `Error`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NegotiationError::Transport(err) if err.is_fatal())
    }
}

/// Connection status state machine plus the active connection set.
///
/// `Connected` holds exactly when the set is non-empty; every transition
/// that touches the set re-derives the status.
pub struct ConnectionLifecycle {
    status: SessionStatus,
    local: Option<PeerId>,
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Initializing,
            local: None,
            connections: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    pub fn identity_allocated(&mut self, id: PeerId) -> bool {
        if self.status != SessionStatus::Initializing {
            return false;
        }
        self.local = Some(id);
        self.status = SessionStatus::Ready;
        true
    }

    pub fn allocation_failed(&mut self, reason: impl Into<String>) {
        if self.status == SessionStatus::Initializing {
            self.status = SessionStatus::Error {
                reason: reason.into(),
            };
        }
    }

    pub fn begin_connect(
        &mut self,
        remote: &PeerId,
        hosting_engine: bool,
    ) -> Result<(), NegotiationError> {
        if remote.is_empty() {
            return Err(NegotiationError::EmptyRemoteId);
        }
        if self.local.as_ref() == Some(remote) {
            return Err(NegotiationError::SelfConnect);
        }
        if self.status != SessionStatus::Ready {
            return Err(NegotiationError::NotReady(self.status.label()));
        }
        if hosting_engine {
            return Err(NegotiationError::HostingEngine);
        }
        self.status = SessionStatus::Connecting {
            remote: remote.clone(),
        };
        Ok(())
    }

    pub fn pending_remote(&self) -> Option<&PeerId> {
        match &self.status {
            SessionStatus::Connecting { remote } => Some(remote),
            _ => None,
        }
    }

    /// The dial to `remote` succeeded. `None` if that attempt is no longer
    /// pending; the caller must then close the link.
    pub fn outbound_opened(
        &mut self,
        remote: &PeerId,
        link: Arc<dyn PeerLink>,
    ) -> Option<ConnectionId> {
        if self.pending_remote() != Some(remote) {
            debug!(target: "ghost_lab::session", %remote, "outbound link arrived for a stale attempt");
            return None;
        }
        Some(self.insert(remote.clone(), Direction::Outbound, link))
    }

    /// The dial to `remote` failed; returns to `Ready` or, for identity-level
    /// failures, to `Error`. Returns false for stale attempts.
    pub fn outbound_failed(&mut self, remote: &PeerId, err: &NegotiationError) -> bool {
        if self.pending_remote() != Some(remote) {
            return false;
        }
        self.status = if err.is_fatal() {
            SessionStatus::Error {
                reason: err.to_string(),
            }
        } else {
            self.derived_status()
        };
        true
    }

    /// Registers an inbound link. Accepted only while `Ready` or `Connected`,
    /// and never while this session is itself a guest of another host.
    pub fn accept_inbound(&mut self, link: Arc<dyn PeerLink>) -> Result<ConnectionId, Arc<dyn PeerLink>> {
        let accepting = matches!(self.status, SessionStatus::Ready | SessionStatus::Connected);
        if !accepting || self.has_outbound() {
            return Err(link);
        }
        let remote = link.remote_id().clone();
        Ok(self.insert(remote, Direction::Inbound, link))
    }

    /// Removes one connection and closes its link.
    pub fn close(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        connection.link.close();
        if self.status == SessionStatus::Connected {
            self.status = self.derived_status();
        }
        Some(connection)
    }

    pub fn close_all(&mut self) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.close(id)).collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn infos(&self) -> Vec<ConnectionInfo> {
        self.connections.values().map(Connection::info).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of links that are open right now, for fan-out.
    pub fn open_links(&self) -> Vec<Arc<dyn PeerLink>> {
        self.connections
            .values()
            .filter(|conn| conn.link.is_open())
            .map(|conn| conn.link.clone())
            .collect()
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound_link().is_some()
    }

    /// Link to the host this session joined, if any.
    pub fn outbound_link(&self) -> Option<Arc<dyn PeerLink>> {
        self.connections
            .values()
            .find(|conn| conn.direction == Direction::Outbound && conn.link.is_open())
            .map(|conn| conn.link.clone())
    }

    fn insert(&mut self, remote: PeerId, direction: Direction, link: Arc<dyn PeerLink>) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                remote,
                direction,
                link,
            },
        );
        self.status = SessionStatus::Connected;
        id
    }

    fn derived_status(&self) -> SessionStatus {
        if self.connections.is_empty() {
            SessionStatus::Ready
        } else {
            SessionStatus::Connected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::link_pair;

    fn ready(local: &str) -> ConnectionLifecycle {
        let mut lifecycle = ConnectionLifecycle::new();
        assert!(lifecycle.identity_allocated(PeerId::from(local)));
        lifecycle
    }

    fn link(local: &str, remote: &str) -> Arc<dyn PeerLink> {
        link_pair(PeerId::from(local), PeerId::from(remote)).0.link
    }

    #[test]
    fn connect_rejects_empty_and_self() {
        let mut lifecycle = ready("A1");
        assert_eq!(
            lifecycle.begin_connect(&PeerId::from(""), false),
            Err(NegotiationError::EmptyRemoteId)
        );
        assert_eq!(
            lifecycle.begin_connect(&PeerId::from("A1"), false),
            Err(NegotiationError::SelfConnect)
        );
        assert_eq!(lifecycle.status(), &SessionStatus::Ready);
    }

    #[test]
    fn connect_requires_ready_and_no_engine() {
        let mut lifecycle = ConnectionLifecycle::new();
        assert_eq!(
            lifecycle.begin_connect(&PeerId::from("A1"), false),
            Err(NegotiationError::NotReady("initializing"))
        );
        lifecycle.identity_allocated(PeerId::from("B1"));
        assert_eq!(
            lifecycle.begin_connect(&PeerId::from("A1"), true),
            Err(NegotiationError::HostingEngine)
        );
        lifecycle.begin_connect(&PeerId::from("A1"), false).unwrap();
        assert_eq!(
            lifecycle.begin_connect(&PeerId::from("C1"), false),
            Err(NegotiationError::NotReady("connecting"))
        );
    }

    #[test]
    fn outbound_success_then_close_returns_to_ready() {
        let mut lifecycle = ready("B1");
        let host = PeerId::from("A1");
        lifecycle.begin_connect(&host, false).unwrap();
        let id = lifecycle.outbound_opened(&host, link("B1", "A1")).unwrap();
        assert_eq!(lifecycle.status(), &SessionStatus::Connected);
        assert!(lifecycle.has_outbound());

        let closed = lifecycle.close(id).unwrap();
        assert!(!closed.link.is_open());
        assert_eq!(lifecycle.status(), &SessionStatus::Ready);
        assert!(lifecycle.close(id).is_none());
    }

    #[test]
    fn recoverable_failure_returns_to_ready_fatal_goes_to_error() {
        let mut lifecycle = ready("B1");
        let host = PeerId::from("A1");
        lifecycle.begin_connect(&host, false).unwrap();
        let unreachable = NegotiationError::Transport(TransportError::PeerUnavailable("A1".into()));
        assert!(lifecycle.outbound_failed(&host, &unreachable));
        assert_eq!(lifecycle.status(), &SessionStatus::Ready);

        lifecycle.begin_connect(&host, false).unwrap();
        let taken = NegotiationError::Transport(TransportError::IdentityTaken("B1".into()));
        assert!(lifecycle.outbound_failed(&host, &taken));
        assert!(lifecycle.status().is_error());
        assert_eq!(
            lifecycle.begin_connect(&host, false),
            Err(NegotiationError::NotReady("error"))
        );
    }

    #[test]
    fn stale_outbound_results_are_ignored() {
        let mut lifecycle = ready("B1");
        assert!(lifecycle.outbound_opened(&PeerId::from("A1"), link("B1", "A1")).is_none());
        assert!(!lifecycle.outbound_failed(&PeerId::from("A1"), &NegotiationError::EmptyRemoteId));
        assert_eq!(lifecycle.status(), &SessionStatus::Ready);
    }

    #[test]
    fn host_accepts_many_guests_and_tracks_emptiness() {
        let mut lifecycle = ready("A1");
        let c = lifecycle.accept_inbound(link("A1", "C1")).ok().unwrap();
        let d = lifecycle.accept_inbound(link("A1", "D1")).ok().unwrap();
        assert_eq!(lifecycle.len(), 2);
        assert_eq!(lifecycle.open_links().len(), 2);
        assert!(!lifecycle.has_outbound());

        lifecycle.close(c);
        assert_eq!(lifecycle.status(), &SessionStatus::Connected);
        lifecycle.close(d);
        assert_eq!(lifecycle.status(), &SessionStatus::Ready);
    }

    #[test]
    fn inbound_rejected_while_connecting_or_joined() {
        let mut lifecycle = ready("B1");
        let host = PeerId::from("A1");
        lifecycle.begin_connect(&host, false).unwrap();
        assert!(lifecycle.accept_inbound(link("B1", "X1")).is_err());

        lifecycle.outbound_opened(&host, link("B1", "A1")).unwrap();
        assert!(lifecycle.accept_inbound(link("B1", "X1")).is_err());
        assert_eq!(lifecycle.len(), 1);
    }

    #[test]
    fn close_all_empties_the_set() {
        let mut lifecycle = ready("A1");
        lifecycle.accept_inbound(link("A1", "C1")).ok();
        lifecycle.accept_inbound(link("A1", "D1")).ok();
        let closed = lifecycle.close_all();
        assert_eq!(closed.len(), 2);
        assert!(lifecycle.is_empty());
        assert_eq!(lifecycle.status(), &SessionStatus::Ready);
    }

    #[test]
    fn allocation_failure_is_terminal() {
        let mut lifecycle = ConnectionLifecycle::new();
        lifecycle.allocation_failed("broker offline");
        assert_eq!(
            lifecycle.status(),
            &SessionStatus::Error { reason: "broker offline".into() }
        );
        assert!(!lifecycle.identity_allocated(PeerId::from("A1")));
    }
}
