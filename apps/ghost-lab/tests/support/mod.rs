#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use ghost_lab::config::SessionConfig;
use ghost_lab::engine::{Engine, EngineError, ProcessHandle};
use ghost_lab::relay::TerminalDisplay;
use ghost_lab::session::SessionHandle;
use ghost_lab::transport::memory::{MemoryBroker, MemoryProvider};
use ghost_lab::transport::{LinkHandle, PeerId, ProviderEvent, TransportError, TransportProvider};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Engine whose output is driven by the test. In echo mode every stdin
/// chunk is written straight back to the output stream.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    inner: Arc<Mutex<ScriptedState>>,
}

#[derive(Default)]
struct ScriptedState {
    echo: bool,
    boots: usize,
    input: Vec<u8>,
    output: Option<UnboundedSender<Bytes>>,
}

impl ScriptedEngine {
    pub fn echo() -> Self {
        let engine = Self::default();
        engine.inner.lock().echo = true;
        engine
    }

    pub fn boots(&self) -> usize {
        self.inner.lock().boots
    }

    pub fn input(&self) -> Vec<u8> {
        self.inner.lock().input.clone()
    }

    /// Pushes bytes out of the running process as if it printed them.
    pub fn emit(&self, bytes: &[u8]) -> bool {
        match self.inner.lock().output.as_ref() {
            Some(tx) => tx.send(Bytes::copy_from_slice(bytes)).is_ok(),
            None => false,
        }
    }

    /// Ends the output stream as if the process exited. Echo engines keep
    /// the stream open through their stdin.
    pub fn exit(&self) {
        self.inner.lock().output = None;
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn boot(&self) -> Result<ProcessHandle, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let echo = {
            let mut state = self.inner.lock();
            state.boots += 1;
            let echo = state.echo.then(|| tx.clone());
            state.output = Some(tx);
            echo
        };
        let inner = self.inner.clone();
        let stdin = move |chunk: &[u8]| -> Result<(), EngineError> {
            inner.lock().input.extend_from_slice(chunk);
            if let Some(tx) = echo.as_ref() {
                tx.send(Bytes::copy_from_slice(chunk))
                    .map_err(|_| EngineError::InputClosed)?;
            }
            Ok(())
        };
        Ok(ProcessHandle {
            stdin: Box::new(stdin),
            output: rx,
        })
    }
}

/// Collects everything a session renders.
#[derive(Clone, Default)]
pub struct RecordingDisplay {
    written: Arc<Mutex<String>>,
    effects: Arc<Mutex<Vec<String>>>,
}

impl RecordingDisplay {
    pub fn written(&self) -> String {
        self.written.lock().clone()
    }

    pub fn effects(&self) -> Vec<String> {
        self.effects.lock().clone()
    }
}

impl TerminalDisplay for RecordingDisplay {
    fn write(&self, chunk: &str) {
        self.written.lock().push_str(chunk);
    }

    fn show_effect(&self, name: &str) {
        self.effects.lock().push(name.to_string());
    }
}

/// Allocates identities through the broker but never completes a dial.
pub struct StallingProvider {
    inner: MemoryProvider,
}

impl StallingProvider {
    pub fn new(broker: &MemoryBroker, id: &str) -> Self {
        Self {
            inner: broker.provider_with_identity(id),
        }
    }
}

#[async_trait]
impl TransportProvider for StallingProvider {
    async fn allocate_identity(&self) -> Result<PeerId, TransportError> {
        self.inner.allocate_identity().await
    }

    async fn connect(&self, _remote: &PeerId) -> Result<LinkHandle, TransportError> {
        std::future::pending().await
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ProviderEvent>> {
        self.inner.take_events()
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

pub struct Peer {
    pub handle: SessionHandle,
    pub engine: ScriptedEngine,
    pub display: RecordingDisplay,
}

pub fn spawn_peer(broker: &MemoryBroker, id: &str) -> Peer {
    spawn_peer_with(broker, id, ScriptedEngine::default(), SessionConfig::default())
}

pub fn spawn_peer_with(
    broker: &MemoryBroker,
    id: &str,
    engine: ScriptedEngine,
    config: SessionConfig,
) -> Peer {
    let display = RecordingDisplay::default();
    let handle = SessionHandle::spawn(
        config,
        Arc::new(broker.provider_with_identity(id)),
        Arc::new(engine.clone()),
        Arc::new(display.clone()),
    );
    Peer {
        handle,
        engine,
        display,
    }
}

/// Polls `check` until it holds; the surrounding test timeout bounds the wait.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    while !check() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
