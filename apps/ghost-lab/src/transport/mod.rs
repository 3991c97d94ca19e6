use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

pub mod memory;
pub mod tcp;

/// Rendezvous identifier assigned by a transport provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Leading `len` characters, for log lines.
    pub fn short(&self, len: usize) -> &str {
        match self.0.char_indices().nth(len) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    PeerUnavailable(String),
    #[error("identifier already taken: {0}")]
    IdentityTaken(String),
    #[error("rendezvous unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("invalid peer identifier: {0}")]
    InvalidPeerId(String),
    #[error("connection closed")]
    Closed,
    #[error("transport io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Errors that invalidate the local identity rather than a single attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::IdentityTaken(_) | TransportError::BrokerUnavailable(_)
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Data(Bytes),
    Closed,
}

/// Sending half of one open channel to a remote peer.
///
/// Delivery is ordered and reliable per link; `send` never blocks.
pub trait PeerLink: Send + Sync {
    fn remote_id(&self) -> &PeerId;
    fn send(&self, payload: Bytes) -> Result<(), TransportError>;
    fn is_open(&self) -> bool;
    /// Closes both directions. Idempotent; the first call emits
    /// [`LinkEvent::Closed`] on the local event stream.
    fn close(&self);
}

pub struct LinkHandle {
    pub link: Arc<dyn PeerLink>,
    pub events: UnboundedReceiver<LinkEvent>,
}

impl LinkHandle {
    pub fn new(link: Arc<dyn PeerLink>, events: UnboundedReceiver<LinkEvent>) -> Self {
        Self { link, events }
    }

    pub fn remote_id(&self) -> &PeerId {
        self.link.remote_id()
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("remote_id", self.link.remote_id())
            .field("open", &self.link.is_open())
            .finish()
    }
}

#[derive(Debug)]
pub enum ProviderEvent {
    Incoming(LinkHandle),
    Error(TransportError),
}

#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Obtains the local rendezvous identifier. Repeated calls return the same id.
    async fn allocate_identity(&self) -> Result<PeerId, TransportError>;

    async fn connect(&self, remote: &PeerId) -> Result<LinkHandle, TransportError>;

    /// Inbound connections and provider-level failures. Only the first caller
    /// receives the stream.
    fn take_events(&self) -> Option<UnboundedReceiver<ProviderEvent>>;

    async fn shutdown(&self) {}
}
