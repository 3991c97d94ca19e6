//! In-process rendezvous used by tests and embedded demos.

use super::{LinkEvent, LinkHandle, PeerId, PeerLink, ProviderEvent, TransportError, TransportProvider};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct MemoryBroker {
    peers: Arc<Mutex<HashMap<PeerId, UnboundedSender<ProviderEvent>>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that asks for a random identifier.
    pub fn provider(&self) -> MemoryProvider {
        MemoryProvider::new(self.clone(), None)
    }

    /// Provider that asks for a specific identifier.
    pub fn provider_with_identity(&self, id: impl Into<String>) -> MemoryProvider {
        MemoryProvider::new(self.clone(), Some(PeerId::new(id)))
    }

    /// Simulates a broker outage; allocations fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.peers.lock().contains_key(id)
    }

    fn register(&self, id: PeerId, tx: UnboundedSender<ProviderEvent>) -> Result<(), TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::BrokerUnavailable(
                "memory broker offline".into(),
            ));
        }
        let mut peers = self.peers.lock();
        if peers.contains_key(&id) {
            return Err(TransportError::IdentityTaken(id.to_string()));
        }
        peers.insert(id, tx);
        Ok(())
    }

    fn unregister(&self, id: &PeerId) {
        self.peers.lock().remove(id);
    }

    fn lookup(&self, id: &PeerId) -> Option<UnboundedSender<ProviderEvent>> {
        self.peers.lock().get(id).cloned()
    }
}

pub struct MemoryProvider {
    broker: MemoryBroker,
    requested: Option<PeerId>,
    identity: Mutex<Option<PeerId>>,
    events_tx: UnboundedSender<ProviderEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<ProviderEvent>>>,
}

impl MemoryProvider {
    fn new(broker: MemoryBroker, requested: Option<PeerId>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            requested,
            identity: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn identity(&self) -> Option<PeerId> {
        self.identity.lock().clone()
    }
}

#[async_trait]
impl TransportProvider for MemoryProvider {
    async fn allocate_identity(&self) -> Result<PeerId, TransportError> {
        let mut identity = self.identity.lock();
        if let Some(existing) = identity.as_ref() {
            return Ok(existing.clone());
        }
        let id = self
            .requested
            .clone()
            .unwrap_or_else(|| PeerId::new(format!("ghost-{}", Uuid::new_v4().simple())));
        self.broker.register(id.clone(), self.events_tx.clone())?;
        debug!(target: "ghost_lab::transport", peer_id = %id, "memory identity registered");
        *identity = Some(id.clone());
        Ok(id)
    }

    async fn connect(&self, remote: &PeerId) -> Result<LinkHandle, TransportError> {
        let local = self
            .identity()
            .ok_or_else(|| TransportError::Refused("local identity not allocated".into()))?;
        let remote_tx = self
            .broker
            .lookup(remote)
            .ok_or_else(|| TransportError::PeerUnavailable(remote.to_string()))?;
        let (local_side, remote_side) = link_pair(local, remote.clone());
        if remote_tx.send(ProviderEvent::Incoming(remote_side)).is_err() {
            local_side.link.close();
            return Err(TransportError::PeerUnavailable(remote.to_string()));
        }
        Ok(local_side)
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ProviderEvent>> {
        self.events_rx.lock().take()
    }

    async fn shutdown(&self) {
        if let Some(id) = self.identity.lock().take() {
            self.broker.unregister(&id);
        }
    }
}

struct MemoryLink {
    remote: PeerId,
    outbound: UnboundedSender<LinkEvent>,
    local: UnboundedSender<LinkEvent>,
    open: Arc<AtomicBool>,
}

impl PeerLink for MemoryLink {
    fn remote_id(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(LinkEvent::Data(payload))
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(LinkEvent::Closed);
            let _ = self.local.send(LinkEvent::Closed);
        }
    }
}

/// Two connected link ends: the first is held by `a` and talks to `b`.
pub fn link_pair(a: PeerId, b: PeerId) -> (LinkHandle, LinkHandle) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));
    let a_side = MemoryLink {
        remote: b,
        outbound: b_tx.clone(),
        local: a_tx.clone(),
        open: open.clone(),
    };
    let b_side = MemoryLink {
        remote: a,
        outbound: a_tx,
        local: b_tx,
        open,
    };
    (
        LinkHandle::new(Arc::new(a_side), a_rx),
        LinkHandle::new(Arc::new(b_side), b_rx),
    )
}
