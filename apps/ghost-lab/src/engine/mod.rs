use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

pub mod pty;

pub use pty::PtyEngine;

/// Whether a local process engine is attached. Only meaningful on the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Offline,
    Booting,
    Online,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Offline => "offline",
            EngineState::Booting => "booting",
            EngineState::Online => "online",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine failed to start: {0}")]
    Boot(String),
    #[error("engine input closed")]
    InputClosed,
    #[error("engine io error: {0}")]
    Io(#[from] io::Error),
    #[error("a session joined to a host cannot run its own engine")]
    GuestSession,
}

/// Writable stdin of a running process.
pub trait ProcessInput: Send + Sync {
    fn write(&self, chunk: &[u8]) -> Result<(), EngineError>;
}

impl<F> ProcessInput for F
where
    F: Fn(&[u8]) -> Result<(), EngineError> + Send + Sync,
{
    fn write(&self, chunk: &[u8]) -> Result<(), EngineError> {
        (self)(chunk)
    }
}

/// A booted process: stdin plus its merged stdout/stderr stream.
/// `output` ends when the process exits; dropping `stdin` stops the process.
pub struct ProcessHandle {
    pub stdin: Box<dyn ProcessInput>,
    pub output: UnboundedReceiver<Bytes>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn boot(&self) -> Result<ProcessHandle, EngineError>;
}

/// Turns a byte stream into text without splitting multi-byte characters
/// across chunk boundaries. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let tail = rest.to_vec();
        self.pending = tail;
        out
    }

    /// Flushes a dangling partial sequence at end of stream.
    pub fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }
}
