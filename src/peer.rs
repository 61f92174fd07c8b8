//! # Peers
//!
//! A [`Peer`] owns one established [`Link`] for its whole lifetime and
//! multiplexes it into 65536 frame ports.
//!
//! ## Handshake
//!
//! Both sides write a u32-BE length-prefixed [`PeerInit`] and read the
//! other's. The received host certificate chain must verify and must carry a
//! parent (the profile certificate); the peer's HostID is derived from the
//! host certificate key and the announced discriminator.
//!
//! ## Ports
//!
//! | Range | Use |
//! |-------|-----|
//! | 0 | network binding handshakes |
//! | 1 | broker traffic |
//! | 2..1000 | reserved |
//! | 1000.. | per-network links, handed out by [`Peer::reserve_port`] |
//!
//! ## Tasks
//!
//! - writer: drains the outbound frame queue into the link
//! - pump ([`Peer::run`]): reads frames and dispatches each to its port's
//!   handler in receive order

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::certificate::{verify_certificate, Certificate, CertificateError};
use crate::frame::{Frame, FrameReader, FrameWriter};
use crate::identity::{HostId, PublicKey};
use crate::link::Link;
use crate::messages::{deserialize_bounded, serialize, PeerInit, PROTOCOL_VERSION};
use crate::protocols::FrameHandler;

/// Ports below this value are assigned statically.
pub const RESERVED_PORT_COUNT: u16 = 1000;
pub const NETWORK_INIT_PORT: u16 = 0;
pub const NETWORK_BROKER_PORT: u16 = 1;

/// Largest handshake message accepted.
const MAX_PEER_INIT_SIZE: usize = 64 * 1024;
const WRITE_QUEUE_DEPTH: usize = 256;
const CHANNEL_DEPTH: usize = 64;
const PORT_RESERVE_ATTEMPTS: usize = 1024;

// ============================================================================
// Handshake
// ============================================================================

#[derive(Debug)]
pub enum HandshakeError {
    Io(std::io::Error),
    Decode(String),
    UnsupportedVersion(u32),
    Certificate(CertificateError),
    /// Host certificate was not issued under a profile certificate.
    MissingProfile,
    Timeout,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::Io(e) => write!(f, "handshake i/o error: {}", e),
            HandshakeError::Decode(e) => write!(f, "malformed peer init: {}", e),
            HandshakeError::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            HandshakeError::Certificate(e) => write!(f, "peer certificate invalid: {}", e),
            HandshakeError::MissingProfile => write!(f, "peer certificate has no profile parent"),
            HandshakeError::Timeout => write!(f, "handshake timed out"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<std::io::Error> for HandshakeError {
    fn from(e: std::io::Error) -> Self {
        HandshakeError::Io(e)
    }
}

async fn exchange_init(
    link: &mut Box<dyn Link>,
    local: &PeerInit,
) -> Result<PeerInit, HandshakeError> {
    let bytes = serialize(local).map_err(|e| HandshakeError::Decode(e.to_string()))?;
    let len = u32::try_from(bytes.len()).map_err(|_| HandshakeError::Decode("init too large".into()))?;
    link.write_all(&len.to_be_bytes()).await?;
    link.write_all(&bytes).await?;
    link.flush().await?;

    let mut len_buf = [0u8; 4];
    link.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PEER_INIT_SIZE {
        return Err(HandshakeError::Decode(format!("init of {} bytes", len)));
    }
    let mut buf = vec![0u8; len];
    link.read_exact(&mut buf).await?;
    deserialize_bounded(&buf).map_err(|e| HandshakeError::Decode(e.to_string()))
}

fn check_remote_init(init: &PeerInit) -> Result<(), HandshakeError> {
    if init.protocol_version != PROTOCOL_VERSION {
        return Err(HandshakeError::UnsupportedVersion(init.protocol_version));
    }
    if init.certificate.parent().is_none() {
        return Err(HandshakeError::MissingProfile);
    }
    verify_certificate(&init.certificate).map_err(HandshakeError::Certificate)
}

// ============================================================================
// Peer
// ============================================================================

pub struct Peer {
    host_id: HostId,
    certificate: Certificate,
    mtu: usize,
    handlers: RwLock<HashMap<u16, Arc<dyn FrameHandler>>>,
    reserved_ports: Mutex<HashSet<u16>>,
    writer_tx: mpsc::Sender<Frame>,
    reader: Mutex<Option<ReadHalf<Box<dyn Link>>>>,
    closed_tx: watch::Sender<bool>,
    unhandled_frames: AtomicU64,
    handler_errors: AtomicU64,
}

impl Peer {
    /// Run the handshake over `link` and start its writer task. The frame pump
    /// starts with [`Peer::run`].
    pub async fn handshake(
        mut link: Box<dyn Link>,
        certificate: &Certificate,
        discriminator: u16,
        timeout: Duration,
    ) -> Result<Arc<Peer>, HandshakeError> {
        let local = PeerInit {
            protocol_version: PROTOCOL_VERSION,
            certificate: certificate.clone(),
            discriminator,
        };
        let remote = tokio::time::timeout(timeout, exchange_init(&mut link, &local))
            .await
            .map_err(|_| HandshakeError::Timeout)??;
        check_remote_init(&remote)?;

        let host_id = HostId::from_key(&remote.certificate.key, remote.discriminator);
        let mtu = link.mtu();
        let (read_half, write_half) = tokio::io::split(link);
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(write_frames(host_id, write_half, writer_rx, closed_rx));

        Ok(Arc::new(Peer {
            host_id,
            certificate: remote.certificate,
            mtu,
            handlers: RwLock::new(HashMap::new()),
            reserved_ports: Mutex::new(HashSet::new()),
            writer_tx,
            reader: Mutex::new(Some(read_half)),
            closed_tx,
            unhandled_frames: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
        }))
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    /// Host certificate chain presented during the handshake.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Key that signs this peer's message trailers.
    pub fn host_key(&self) -> PublicKey {
        self.certificate.key
    }

    /// Profile key the host certificate was issued by.
    pub fn profile_key(&self) -> Option<PublicKey> {
        self.certificate.parent().map(|p| p.key)
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn unhandled_frames(&self) -> u64 {
        self.unhandled_frames.load(Ordering::Relaxed)
    }

    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    pub fn set_handler(&self, port: u16, handler: Arc<dyn FrameHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port, handler);
    }

    pub fn remove_handler(&self, port: u16) -> Option<Arc<dyn FrameHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port)
    }

    pub fn handler(&self, port: u16) -> Option<Arc<dyn FrameHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&port)
            .cloned()
    }

    /// Reserve a random unused port at or above [`RESERVED_PORT_COUNT`].
    pub fn reserve_port(&self) -> Result<u16> {
        let mut reserved = self
            .reserved_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut rng = rand::thread_rng();
        for _ in 0..PORT_RESERVE_ATTEMPTS {
            let port = rng.gen_range(RESERVED_PORT_COUNT..=u16::MAX);
            if reserved.insert(port) {
                return Ok(port);
            }
        }
        Err(anyhow!("no free port on peer {}", self.host_id))
    }

    #[cfg(test)]
    pub(crate) fn reserve_all_ports(&self) {
        self.reserved_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(RESERVED_PORT_COUNT..=u16::MAX);
    }

    pub fn release_port(&self, port: u16) {
        self.reserved_ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }

    pub fn frame_writer(&self, port: u16) -> FrameWriter {
        FrameWriter::new(port, self.writer_tx.clone(), self.mtu)
    }

    /// Install a handler turning `port` into a byte stream.
    pub fn channel(&self, port: u16) -> (FrameReader, FrameWriter) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.set_handler(port, Arc::new(ChannelHandler { tx }));
        (FrameReader::new(rx), self.frame_writer(port))
    }

    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once the peer is closed.
    pub async fn done(&self) {
        let mut rx = self.closed_tx.subscribe();
        // Sender lives in self, so wait_for only fails if we are dropped.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Pump frames until the link fails or the peer is closed. May only be
    /// called once; later calls return immediately.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut reader) = reader else {
            return Err(anyhow!("peer {} already running", self.host_id));
        };

        let mut closed_rx = self.closed_tx.subscribe();
        let result = loop {
            if *closed_rx.borrow_and_update() {
                break Ok(());
            }
            tokio::select! {
                frame = Frame::read_from(&mut reader) => match frame {
                    Ok(frame) => self.dispatch(frame).await,
                    Err(e) => break Err(e),
                },
                _ = closed_rx.changed() => {}
            }
        };

        self.clear_handlers();
        self.close();
        result
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        let port = frame.port;
        match self.handler(port) {
            Some(handler) => {
                if let Err(e) = handler.handle_frame(self, frame).await {
                    self.handler_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(host = %self.host_id, port, error = %e, "frame handler failed");
                }
            }
            None => {
                self.unhandled_frames.fetch_add(1, Ordering::Relaxed);
                trace!(host = %self.host_id, port, "dropping frame for unhandled port");
            }
        }
    }

    fn clear_handlers(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("host_id", &self.host_id)
            .field("mtu", &self.mtu)
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}

async fn write_frames(
    host_id: HostId,
    mut link: WriteHalf<Box<dyn Link>>,
    mut rx: mpsc::Receiver<Frame>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = frame.write_to(&mut link).await {
                    debug!(host = %host_id, error = %e, "link write failed");
                    break;
                }
                if rx.is_empty() {
                    if let Err(e) = link.flush().await {
                        debug!(host = %host_id, error = %e, "link flush failed");
                        break;
                    }
                }
            }
            _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => break,
        }
    }
    let _ = link.shutdown().await;
}

/// Feeds the frame bodies of one port into a [`FrameReader`].
struct ChannelHandler {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl FrameHandler for ChannelHandler {
    async fn handle_frame(&self, _peer: &Arc<Peer>, frame: Frame) -> Result<()> {
        self.tx
            .send(frame.body)
            .await
            .map_err(|_| anyhow!("channel reader dropped"))
    }
}
