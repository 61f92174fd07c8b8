//! # Links
//!
//! A [`Link`] is an authenticated, ordered byte stream to one physical peer.
//! Real deployments back it with WebSocket or WebRTC data channels; this
//! module ships the in-memory variants used by tests and the demo binary:
//!
//! - [`MemoryLink`] / [`memory_link_pair`]: two connected ends over
//!   `tokio::io::duplex`.
//! - [`MemoryTransport`]: a [`MediatedDialer`] that pairs the two sides of a
//!   mediation through a shared [`MemorySwitchboard`]. The initiator parks one
//!   end of a fresh pair under a random token and sends the token as its
//!   offer; the responder claims the end named by the offer and echoes it as
//!   the answer. Both trickle one ICE candidate and the terminator; memory
//!   links need no remote candidates, so neither side waits for them.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tracing::debug;

use crate::crypto::random_u64;
use crate::protocols::{MediatedDialer, Signaling};

/// Typical path MTU of the physical transports.
pub const DEFAULT_MTU: usize = 1500;

/// Bytes buffered in each direction of a memory link.
const MEMORY_LINK_BUFFER: usize = 256 * 1024;

const MEMORY_ICE_CANDIDATE: &[u8] = b"memory";

pub trait Link: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Largest frame (header included) the link carries in one piece.
    fn mtu(&self) -> usize;
}

#[derive(Debug)]
pub struct MemoryLink {
    stream: DuplexStream,
    mtu: usize,
}

pub fn memory_link_pair(mtu: usize) -> (MemoryLink, MemoryLink) {
    let (a, b) = tokio::io::duplex(MEMORY_LINK_BUFFER);
    (MemoryLink { stream: a, mtu }, MemoryLink { stream: b, mtu })
}

impl Link for MemoryLink {
    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl AsyncRead for MemoryLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

// ============================================================================
// In-memory mediated dialing
// ============================================================================

/// Parked link ends awaiting their responder, keyed by offer token.
#[derive(Default)]
pub struct MemorySwitchboard {
    parked: Mutex<HashMap<u64, MemoryLink>>,
}

impl MemorySwitchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn park(&self, token: u64, end: MemoryLink) {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, end);
    }

    fn claim(&self, token: u64) -> Option<MemoryLink> {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token)
    }

    pub fn parked(&self) -> usize {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct Parked<'a> {
    switchboard: &'a MemorySwitchboard,
    token: u64,
    armed: bool,
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.switchboard.claim(self.token);
        }
    }
}

pub struct MemoryTransport {
    switchboard: Arc<MemorySwitchboard>,
    mtu: usize,
    unreachable: AtomicBool,
}

impl MemoryTransport {
    pub fn new(switchboard: Arc<MemorySwitchboard>) -> Self {
        Self {
            switchboard,
            mtu: DEFAULT_MTU,
            unreachable: AtomicBool::new(false),
        }
    }

    /// An unreachable transport cannot initiate connections; it can still
    /// answer offers.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::Acquire)
    }

    async fn initiate(&self, signaling: &dyn Signaling) -> Result<Box<dyn Link>> {
        if self.is_unreachable() {
            bail!("transport cannot initiate connections");
        }

        let token = random_u64()?;
        let (local, remote) = memory_link_pair(self.mtu);
        self.switchboard.park(token, remote);
        // Unclaimed ends are taken back even if this future is dropped.
        let mut parked = Parked {
            switchboard: &self.switchboard,
            token,
            armed: true,
        };

        signaling.send_offer(token.to_be_bytes().to_vec()).await?;
        signaling
            .send_ice_candidate(Some(MEMORY_ICE_CANDIDATE.to_vec()))
            .await?;
        signaling.send_ice_candidate(None).await?;
        let answer = signaling.get_answer().await?;
        if answer != token.to_be_bytes() {
            bail!("answer does not match offer");
        }

        parked.armed = false;
        Ok(Box::new(local))
    }

    async fn respond(&self, signaling: &dyn Signaling, offer: Vec<u8>) -> Result<Box<dyn Link>> {
        let token: [u8; 8] = offer
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("malformed memory offer"))?;
        let end = self
            .switchboard
            .claim(u64::from_be_bytes(token))
            .ok_or_else(|| anyhow!("no parked link for offer"))?;

        signaling.send_answer(offer).await?;
        signaling
            .send_ice_candidate(Some(MEMORY_ICE_CANDIDATE.to_vec()))
            .await?;
        signaling.send_ice_candidate(None).await?;
        Ok(Box::new(end))
    }
}

#[async_trait]
impl MediatedDialer for MemoryTransport {
    async fn dial(&self, signaling: Arc<dyn Signaling>) -> Result<Box<dyn Link>> {
        debug!(host = %signaling.remote_host_id(), "memory transport dialing");
        match signaling.get_offer().await? {
            None => self.initiate(signaling.as_ref()).await,
            Some(offer) => self.respond(signaling.as_ref(), offer).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::HostId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

    #[tokio::test]
    async fn memory_pair_is_connected() {
        let (mut a, mut b) = memory_link_pair(1200);
        assert_eq!(a.mtu(), 1200);
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    /// Direct in-process signaling between two dial attempts.
    struct PipeSignaling {
        offer: Option<Vec<u8>>,
        outbound: mpsc::UnboundedSender<(&'static str, Option<Vec<u8>>)>,
        answer: AsyncMutex<watch::Receiver<Option<Vec<u8>>>>,
        candidates: AsyncMutex<mpsc::UnboundedReceiver<Option<Vec<u8>>>>,
    }

    #[async_trait]
    impl Signaling for PipeSignaling {
        fn remote_host_id(&self) -> HostId {
            HostId::from_bytes([0; 20])
        }
        async fn get_offer(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.offer.clone())
        }
        async fn get_answer(&self) -> Result<Vec<u8>> {
            let mut rx = self.answer.lock().await;
            let answer = rx.wait_for(|a| a.is_some()).await?;
            Ok(answer.clone().unwrap_or_default())
        }
        async fn next_ice_candidate(&self) -> Option<Vec<u8>> {
            self.candidates.lock().await.recv().await.flatten()
        }
        async fn send_offer(&self, offer: Vec<u8>) -> Result<()> {
            self.outbound.send(("offer", Some(offer)))?;
            Ok(())
        }
        async fn send_answer(&self, answer: Vec<u8>) -> Result<()> {
            self.outbound.send(("answer", Some(answer)))?;
            Ok(())
        }
        async fn send_ice_candidate(&self, candidate: Option<Vec<u8>>) -> Result<()> {
            self.outbound.send(("ice", candidate))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn transports_pair_through_switchboard() {
        let switchboard = MemorySwitchboard::new();
        let initiator = MemoryTransport::new(switchboard.clone());
        let responder = MemoryTransport::new(switchboard.clone());

        let (init_out, mut init_sent) = mpsc::unbounded_channel();
        let (answer_tx, answer_rx) = watch::channel(None);
        let (cand_tx, cand_rx) = mpsc::unbounded_channel();
        let init_sig = Arc::new(PipeSignaling {
            offer: None,
            outbound: init_out,
            answer: AsyncMutex::new(answer_rx),
            candidates: AsyncMutex::new(cand_rx),
        });

        let dial = tokio::spawn(async move { initiator.dial(init_sig).await });

        let (_, offer) = init_sent.recv().await.unwrap();
        let (resp_out, mut resp_sent) = mpsc::unbounded_channel();
        let (_unused_tx, unused_rx) = watch::channel(None);
        let (_c_tx, c_rx) = mpsc::unbounded_channel();
        let resp_sig = Arc::new(PipeSignaling {
            offer: offer.clone(),
            outbound: resp_out,
            answer: AsyncMutex::new(unused_rx),
            candidates: AsyncMutex::new(c_rx),
        });
        let mut resp_link = responder.dial(resp_sig).await.unwrap();

        while let Ok((kind, data)) = resp_sent.try_recv() {
            match kind {
                "answer" => answer_tx.send_replace(data),
                _ => {
                    cand_tx.send(data).unwrap();
                    None
                }
            };
        }
        drop(cand_tx);

        let mut init_link = dial.await.unwrap().unwrap();
        init_link.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        resp_link.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(switchboard.parked(), 0);
    }

    #[tokio::test]
    async fn unreachable_transport_cannot_initiate() {
        let transport = MemoryTransport::new(MemorySwitchboard::new());
        transport.set_unreachable(true);

        let (out, _sent) = mpsc::unbounded_channel();
        let (_a, answer_rx) = watch::channel(None);
        let (_c, cand_rx) = mpsc::unbounded_channel();
        let sig = Arc::new(PipeSignaling {
            offer: None,
            outbound: out,
            answer: AsyncMutex::new(answer_rx),
            candidates: AsyncMutex::new(cand_rx),
        });
        assert!(transport.dial(sig).await.is_err());
    }
}
