//! Direct peer transport over TCP.
//!
//! The listener doubles as the rendezvous: the identity `<token>@<host:port>`
//! carries everything a guest needs to dial the host. A one-line JSON hello
//! names the token the guest expects; listeners refuse any other token so a
//! stale identifier never lands on a different session that reused the port.
//! After the hello every line is one envelope. Lines are raw bytes capped at
//! a maximum frame size; decoding is left to the session.

use super::{LinkEvent, LinkHandle, PeerId, PeerLink, ProviderEvent, TransportError, TransportProvider};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_MAX_FRAME: usize = 4 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const TOKEN_LEN: usize = 12;

/// Largest envelope line accepted from a peer; longer lines are dropped.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;
pub const MAX_FRAME_ENV: &str = "GHOST_MAX_FRAME_BYTES";
const MIN_MAX_FRAME: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Handshake {
    Hello { from: String, to: String },
    Accepted,
    Refused { reason: String },
}

struct Bound {
    id: PeerId,
    accept_task: JoinHandle<()>,
}

pub struct TcpProvider {
    listen: SocketAddr,
    advertise: Option<String>,
    max_frame: usize,
    bound: Mutex<Option<Bound>>,
    events_tx: UnboundedSender<ProviderEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<ProviderEvent>>>,
}

impl TcpProvider {
    pub fn new(listen: SocketAddr) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            listen,
            advertise: None,
            max_frame: max_frame_from_env(),
            bound: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Host name placed in the identity instead of the bound address.
    pub fn with_advertised_host(mut self, host: Option<String>) -> Self {
        self.advertise = host.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes.max(1);
        self
    }

    fn identity(&self) -> Option<PeerId> {
        self.bound.lock().as_ref().map(|bound| bound.id.clone())
    }

    fn advertised_addr(&self, local: SocketAddr) -> String {
        match self.advertise.as_deref() {
            Some(host) => format!("{host}:{}", local.port()),
            None if local.ip().is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port()).to_string()
            }
            None => local.to_string(),
        }
    }
}

fn max_frame_from_env() -> usize {
    match env::var(MAX_FRAME_ENV) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(bytes) => bytes.max(MIN_MAX_FRAME),
            Err(err) => {
                warn!(target: "ghost_lab::transport", value = %raw, error = %err, "ignoring {MAX_FRAME_ENV}");
                DEFAULT_MAX_FRAME
            }
        },
        Err(_) => DEFAULT_MAX_FRAME,
    }
}

/// Splits `<token>@<host:port>`.
pub fn parse_identity(id: &PeerId) -> Result<(&str, &str), TransportError> {
    let (token, addr) = id
        .as_str()
        .split_once('@')
        .ok_or_else(|| TransportError::InvalidPeerId(id.to_string()))?;
    if token.is_empty() || addr.is_empty() {
        return Err(TransportError::InvalidPeerId(id.to_string()));
    }
    Ok((token, addr))
}

#[async_trait]
impl TransportProvider for TcpProvider {
    async fn allocate_identity(&self) -> Result<PeerId, TransportError> {
        if let Some(id) = self.identity() {
            return Ok(id);
        }
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|err| TransportError::BrokerUnavailable(format!("bind {}: {err}", self.listen)))?;
        let local = listener.local_addr()?;
        let token: String = Uuid::new_v4().simple().to_string()[..TOKEN_LEN].to_string();
        let id = PeerId::new(format!("{token}@{}", self.advertised_addr(local)));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            id.clone(),
            token,
            self.events_tx.clone(),
            self.max_frame,
        ));
        info!(target: "ghost_lab::transport", peer_id = %id, listen = %local, "tcp identity bound");
        let mut bound = self.bound.lock();
        if let Some(existing) = bound.as_ref() {
            // lost a race with a concurrent allocation
            accept_task.abort();
            return Ok(existing.id.clone());
        }
        *bound = Some(Bound {
            id: id.clone(),
            accept_task,
        });
        Ok(id)
    }

    async fn connect(&self, remote: &PeerId) -> Result<LinkHandle, TransportError> {
        let local = self
            .identity()
            .ok_or_else(|| TransportError::Refused("local identity not allocated".into()))?;
        let (token, addr) = parse_identity(remote)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| TransportError::PeerUnavailable(format!("{addr}: {err}")))?;
        stream.set_nodelay(true).ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, HANDSHAKE_MAX_FRAME);

        write_frame(
            &mut write_half,
            &Handshake::Hello {
                from: local.to_string(),
                to: token.to_string(),
            },
        )
        .await?;
        let reply = read_handshake(&mut reader).await?;
        match reply {
            Handshake::Accepted => {
                debug!(target: "ghost_lab::transport", remote = %remote, "tcp hello accepted");
                reader.set_max_frame(self.max_frame);
                Ok(spawn_link(remote.clone(), reader, write_half))
            }
            Handshake::Refused { reason } => Err(TransportError::Refused(reason)),
            Handshake::Hello { .. } => Err(TransportError::Refused("unexpected hello".into())),
        }
    }

    fn take_events(&self) -> Option<UnboundedReceiver<ProviderEvent>> {
        self.events_rx.lock().take()
    }

    async fn shutdown(&self) {
        if let Some(bound) = self.bound.lock().take() {
            bound.accept_task.abort();
            debug!(target: "ghost_lab::transport", peer_id = %bound.id, "tcp listener stopped");
        }
    }
}

/// Source of inbound sockets for [`accept_loop`].
#[async_trait]
trait Accept: Send + 'static {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(&*self).await
    }
}

/// Accept errors (fd exhaustion, aborted handshakes) are reported and
/// retried after a pause; the listener stays up until the task is aborted.
async fn accept_loop<L: Accept>(
    mut listener: L,
    local: PeerId,
    token: String,
    events: UnboundedSender<ProviderEvent>,
    max_frame: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                trace!(target: "ghost_lab::transport", %addr, "tcp connection accepted");
                let token = token.clone();
                let events = events.clone();
                let local = local.clone();
                tokio::spawn(async move {
                    match answer_hello(stream, &local, &token, max_frame).await {
                        Ok(handle) => {
                            let _ = events.send(ProviderEvent::Incoming(handle));
                        }
                        Err(err) => {
                            debug!(target: "ghost_lab::transport", %addr, error = %err, "inbound hello rejected");
                        }
                    }
                });
            }
            Err(err) => {
                warn!(target: "ghost_lab::transport", error = %err, "tcp accept failed; retrying");
                if events.send(ProviderEvent::Error(err.into())).is_err() {
                    break;
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn answer_hello(
    stream: TcpStream,
    local: &PeerId,
    token: &str,
    max_frame: usize,
) -> Result<LinkHandle, TransportError> {
    stream.set_nodelay(true).ok();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, HANDSHAKE_MAX_FRAME);
    let Handshake::Hello { from, to } = read_handshake(&mut reader).await? else {
        return Err(TransportError::Refused("expected hello".into()));
    };
    if to != token {
        let reason = format!("identifier {to} is not hosted here");
        write_frame(&mut write_half, &Handshake::Refused { reason: reason.clone() }).await?;
        return Err(TransportError::Refused(reason));
    }
    let remote = PeerId::new(from);
    if remote.is_empty() || &remote == local {
        write_frame(
            &mut write_half,
            &Handshake::Refused {
                reason: "invalid caller identity".into(),
            },
        )
        .await?;
        return Err(TransportError::InvalidPeerId(remote.to_string()));
    }
    write_frame(&mut write_half, &Handshake::Accepted).await?;
    reader.set_max_frame(max_frame);
    Ok(spawn_link(remote, reader, write_half))
}

enum Frame {
    Line(Vec<u8>),
    /// A line over the limit, consumed without being kept. Carries its length.
    Oversized(usize),
}

/// Newline-delimited byte frames with a size cap.
struct FrameReader {
    inner: BufReader<OwnedReadHalf>,
    max_frame: usize,
}

impl FrameReader {
    fn new(read_half: OwnedReadHalf, max_frame: usize) -> Self {
        Self {
            inner: BufReader::new(read_half),
            max_frame,
        }
    }

    fn set_max_frame(&mut self, max_frame: usize) {
        self.max_frame = max_frame;
    }

    /// Next frame without its newline; `None` at end of stream. A trailing
    /// unterminated fragment is discarded.
    async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut frame = Vec::new();
        let mut oversized: Option<usize> = None;
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }
            let newline = available.iter().position(|byte| *byte == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            match oversized.as_mut() {
                Some(len) => *len += chunk.len(),
                None if frame.len() + chunk.len() > self.max_frame => {
                    oversized = Some(frame.len() + chunk.len());
                    frame = Vec::new();
                }
                None => frame.extend_from_slice(chunk),
            }
            let used = newline.map_or(available.len(), |at| at + 1);
            self.inner.consume(used);
            if newline.is_some() {
                return Ok(Some(match oversized {
                    Some(len) => Frame::Oversized(len),
                    None => Frame::Line(frame),
                }));
            }
        }
    }
}

async fn read_handshake(reader: &mut FrameReader) -> Result<Handshake, TransportError> {
    let frame = timeout(HANDSHAKE_TIMEOUT, reader.next_frame())
        .await
        .map_err(|_| TransportError::PeerUnavailable("handshake timed out".into()))??
        .ok_or(TransportError::Closed)?;
    match frame {
        Frame::Line(line) => serde_json::from_slice(&line)
            .map_err(|err| TransportError::Refused(format!("bad handshake: {err}"))),
        Frame::Oversized(len) => Err(TransportError::Refused(format!(
            "handshake frame of {len} bytes exceeds {HANDSHAKE_MAX_FRAME}"
        ))),
    }
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &Handshake,
) -> Result<(), TransportError> {
    let mut line = serde_json::to_vec(frame).map_err(|err| TransportError::Io(err.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

struct TcpLink {
    remote: PeerId,
    outbound: Mutex<Option<UnboundedSender<Bytes>>>,
    events: UnboundedSender<LinkEvent>,
    open: Arc<AtomicBool>,
}

impl PeerLink for TcpLink {
    fn remote_id(&self) -> &PeerId {
        &self.remote
    }

    fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(payload).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            // dropping the sender lets the writer flush and shut the socket down
            self.outbound.lock().take();
            let _ = self.events.send(LinkEvent::Closed);
        }
    }
}

fn spawn_link(
    remote: PeerId,
    mut reader: FrameReader,
    mut write_half: OwnedWriteHalf,
) -> LinkHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let open = Arc::new(AtomicBool::new(true));

    tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            if write_half.write_all(&payload).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    {
        let events = events_tx.clone();
        let open = open.clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            loop {
                match reader.next_frame().await {
                    Ok(Some(Frame::Line(line))) => {
                        if line.is_empty() {
                            continue;
                        }
                        if events.send(LinkEvent::Data(Bytes::from(line))).is_err() {
                            break;
                        }
                    }
                    Ok(Some(Frame::Oversized(len))) => {
                        warn!(
                            target: "ghost_lab::transport",
                            remote = %remote,
                            bytes = len,
                            limit = reader.max_frame,
                            "dropping oversized frame"
                        );
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(target: "ghost_lab::transport", remote = %remote, error = %err, "tcp read failed");
                        break;
                    }
                }
            }
            if open.swap(false, Ordering::SeqCst) {
                let _ = events.send(LinkEvent::Closed);
            }
        });
    }

    let link = TcpLink {
        remote,
        outbound: Mutex::new(Some(out_tx)),
        events: events_tx,
        open,
    };
    LinkHandle::new(Arc::new(link), events_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> TcpProvider {
        TcpProvider::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    #[test]
    fn identity_parsing() {
        let id = PeerId::from("abc123@127.0.0.1:7000");
        assert_eq!(parse_identity(&id).unwrap(), ("abc123", "127.0.0.1:7000"));
        assert!(parse_identity(&PeerId::from("no-at-sign")).is_err());
        assert!(parse_identity(&PeerId::from("@127.0.0.1:1")).is_err());
    }

    #[tokio::test]
    async fn hello_exchange_opens_a_bidirectional_link() {
        let host = loopback();
        let guest = loopback();
        let host_id = host.allocate_identity().await.unwrap();
        let guest_id = guest.allocate_identity().await.unwrap();
        assert_eq!(host.allocate_identity().await.unwrap(), host_id);
        let mut host_events = host.take_events().unwrap();

        let mut outbound = guest.connect(&host_id).await.unwrap();
        let ProviderEvent::Incoming(mut inbound) = host_events.recv().await.unwrap() else {
            panic!("expected inbound link");
        };
        assert_eq!(inbound.remote_id(), &guest_id);

        outbound
            .link
            .send(Bytes::from_static(br#"{"type":"term_in","data":"ls\r"}"#))
            .unwrap();
        assert_eq!(
            inbound.events.recv().await,
            Some(LinkEvent::Data(Bytes::from_static(br#"{"type":"term_in","data":"ls\r"}"#)))
        );

        inbound.link.close();
        assert_eq!(inbound.events.recv().await, Some(LinkEvent::Closed));
        assert_eq!(outbound.events.recv().await, Some(LinkEvent::Closed));
        assert!(!outbound.link.is_open());
    }

    #[tokio::test]
    async fn wrong_token_is_refused() {
        let host = loopback();
        let guest = loopback();
        let host_id = host.allocate_identity().await.unwrap();
        guest.allocate_identity().await.unwrap();
        let (_, addr) = parse_identity(&host_id).unwrap();
        let forged = PeerId::new(format!("deadbeef0000@{addr}"));
        assert!(matches!(
            guest.connect(&forged).await,
            Err(TransportError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn connect_requires_local_identity() {
        let guest = loopback();
        assert!(matches!(
            guest.connect(&PeerId::from("tok@127.0.0.1:9")).await,
            Err(TransportError::Refused(_))
        ));
    }

    /// Dials `addr` by hand, completes the hello and hands back both halves.
    async fn raw_guest(addr: &str, token: &str) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_frame(
            &mut write_half,
            &Handshake::Hello {
                from: "raw0000@127.0.0.1:1".into(),
                to: token.into(),
            },
        )
        .await
        .unwrap();
        let mut reader = BufReader::new(read_half);
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        assert_eq!(reply.trim_end(), r#"{"type":"accepted"}"#);
        (reader, write_half)
    }

    async fn hosted(host: &TcpProvider) -> (PeerId, UnboundedReceiver<ProviderEvent>) {
        let id = host.allocate_identity().await.unwrap();
        (id, host.take_events().unwrap())
    }

    #[tokio::test]
    async fn non_utf8_frame_is_passed_up_and_link_stays_open() {
        let host = loopback();
        let (host_id, mut host_events) = hosted(&host).await;
        let (token, addr) = parse_identity(&host_id).unwrap();
        let (_reader, mut writer) = raw_guest(addr, token).await;
        let Some(ProviderEvent::Incoming(mut inbound)) = host_events.recv().await else {
            panic!("expected inbound link");
        };

        writer
            .write_all(b"\xff\xfe garbage\n{\"type\":\"chat\",\"text\":\"hi\"}\n")
            .await
            .unwrap();
        assert_eq!(
            inbound.events.recv().await,
            Some(LinkEvent::Data(Bytes::from_static(b"\xff\xfe garbage")))
        );
        assert_eq!(
            inbound.events.recv().await,
            Some(LinkEvent::Data(Bytes::from_static(br#"{"type":"chat","text":"hi"}"#)))
        );
        assert!(inbound.link.is_open());
    }

    #[tokio::test]
    async fn oversized_frames_are_dropped_without_closing() {
        let host = loopback().with_max_frame(1024);
        let (host_id, mut host_events) = hosted(&host).await;
        let (token, addr) = parse_identity(&host_id).unwrap();
        let (_reader, mut writer) = raw_guest(addr, token).await;
        let Some(ProviderEvent::Incoming(mut inbound)) = host_events.recv().await else {
            panic!("expected inbound link");
        };

        let mut burst = vec![b'a'; 64 * 1024];
        burst.push(b'\n');
        burst.extend_from_slice(b"{\"type\":\"cmd\",\"cmd\":\"flash\"}\n");
        writer.write_all(&burst).await.unwrap();

        assert_eq!(
            inbound.events.recv().await,
            Some(LinkEvent::Data(Bytes::from_static(br#"{"type":"cmd","cmd":"flash"}"#)))
        );
        assert!(inbound.link.is_open());
    }

    #[tokio::test]
    async fn oversized_hello_is_refused() {
        let host = loopback();
        let (host_id, mut host_events) = hosted(&host).await;
        let (_, addr) = parse_identity(&host_id).unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut hello = vec![b'x'; HANDSHAKE_MAX_FRAME * 2];
        hello.push(b'\n');
        stream.write_all(&hello).await.unwrap();

        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_secs(5), tokio::io::AsyncReadExt::read(&mut stream, &mut buf))
            .await
            .expect("host should hang up");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(host_events.try_recv().is_err());
    }

    struct FlakyListener {
        inner: TcpListener,
        failures: usize,
    }

    #[async_trait]
    impl Accept for FlakyListener {
        async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("too many open files"));
            }
            self.inner.accept().await
        }
    }

    #[tokio::test]
    async fn accept_errors_are_reported_and_the_listener_keeps_going() {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let task = tokio::spawn(accept_loop(
            FlakyListener {
                inner: listener,
                failures: 2,
            },
            PeerId::new(format!("tok@{addr}")),
            "tok".into(),
            events_tx,
            DEFAULT_MAX_FRAME,
        ));

        assert!(matches!(events.recv().await, Some(ProviderEvent::Error(TransportError::Io(_)))));
        assert!(matches!(events.recv().await, Some(ProviderEvent::Error(TransportError::Io(_)))));
        let (_reader, _writer) = raw_guest(&addr, "tok").await;
        assert!(matches!(events.recv().await, Some(ProviderEvent::Incoming(_))));
        task.abort();
    }
}
