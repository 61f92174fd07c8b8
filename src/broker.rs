//! # Network Brokers
//!
//! A [`Broker`] discovers which logical networks two peers share without
//! revealing the others. Bootstrap creates one per peer over the broker port
//! and feeds it the local network keys; the broker reports the intersection
//! on one side of the exchange.
//!
//! ## Rounds
//!
//! Each `init` queues one set of local parameters and sends an `Init`. Each
//! `Init` received from the peer consumes one queued set, so the k-th local
//! round always pairs with the k-th remote round. When the peer's `Init`
//! arrives with nothing queued the broker emits
//! [`BrokerEvent::InitRequired`] and waits up to the broker timeout.
//!
//! The side with the greater `(key count, discriminator)` sends; the other
//! receives and learns the shared keys.
//!
//! ## HashBroker
//!
//! The bundled [`HashBroker`] sends keyed BLAKE3 digests of its keys under a
//! fresh random salt. It hides non-shared keys from a passive observer of the
//! link but not from the peer itself (which can test guesses), so it suits
//! tests and trusted deployments; private set intersection plugs in through
//! the same traits.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::frame::{FrameReader, FrameWriter};
use crate::identity::PublicKey;
use crate::messages::{deserialize_bounded, serialize, BrokerMessage, MAX_DESERIALIZE_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Network keys shared with the peer.
    Keys(Vec<PublicKey>),
    /// The peer started a round; call [`Broker::init`].
    InitRequired,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn init(&self, discriminator: u16, keys: Vec<PublicKey>) -> Result<()>;

    /// Next event; `None` once the broker stopped. Cancel safe.
    async fn next_event(&mut self) -> Option<BrokerEvent>;

    fn close(&self);
}

pub trait BrokerFactory: Send + Sync {
    fn new_broker(&self, reader: FrameReader, writer: FrameWriter) -> Result<Box<dyn Broker>>;
}

// ============================================================================
// HashBroker
// ============================================================================

#[derive(Debug, Clone)]
struct LocalParams {
    discriminator: u16,
    keys: Vec<PublicKey>,
}

pub struct HashBrokerFactory {
    timeout: Duration,
}

impl HashBrokerFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl BrokerFactory for HashBrokerFactory {
    fn new_broker(&self, reader: FrameReader, writer: FrameWriter) -> Result<Box<dyn Broker>> {
        Ok(Box::new(HashBroker::new(reader, writer, self.timeout)))
    }
}

pub struct HashBroker {
    writer: Arc<Mutex<FrameWriter>>,
    params_tx: mpsc::UnboundedSender<LocalParams>,
    events_rx: mpsc::Receiver<BrokerEvent>,
    task: JoinHandle<()>,
}

impl HashBroker {
    pub fn new(reader: FrameReader, writer: FrameWriter, timeout: Duration) -> Self {
        let writer = Arc::new(Mutex::new(writer));
        let (params_tx, params_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(8);

        let session = BrokerSession {
            reader,
            writer: writer.clone(),
            params_rx,
            events_tx,
            timeout,
            pending_inits: VecDeque::new(),
        };
        let task = tokio::spawn(async move {
            if let Err(e) = session.run().await {
                debug!(error = %e, "broker stopped");
            }
        });

        Self {
            writer,
            params_tx,
            events_rx,
            task,
        }
    }
}

#[async_trait]
impl Broker for HashBroker {
    async fn init(&self, discriminator: u16, keys: Vec<PublicKey>) -> Result<()> {
        let key_count = u32::try_from(keys.len()).map_err(|_| anyhow!("too many network keys"))?;
        self.params_tx
            .send(LocalParams { discriminator, keys })
            .map_err(|_| anyhow!("broker closed"))?;
        let body = serialize(&BrokerMessage::Init {
            key_count,
            discriminator,
        })?;
        self.writer.lock().await.write_message(&body).await
    }

    async fn next_event(&mut self) -> Option<BrokerEvent> {
        self.events_rx.recv().await
    }

    fn close(&self) {
        self.task.abort();
    }
}

impl Drop for HashBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Shared-key digest under `salt`.
fn key_digest(salt: &[u8; 32], key: &PublicKey) -> [u8; 32] {
    *blake3::keyed_hash(salt, key).as_bytes()
}

/// Role rule: the greater `(key count, discriminator)` sends.
fn is_sender(local: (u32, u16), remote: (u32, u16)) -> bool {
    local > remote
}

struct BrokerSession {
    reader: FrameReader,
    writer: Arc<Mutex<FrameWriter>>,
    params_rx: mpsc::UnboundedReceiver<LocalParams>,
    events_tx: mpsc::Sender<BrokerEvent>,
    timeout: Duration,
    /// Remote inits read while waiting for digests.
    pending_inits: VecDeque<(u32, u16)>,
}

impl BrokerSession {
    async fn read(&mut self) -> Result<BrokerMessage> {
        let bytes = self.reader.read_message(MAX_DESERIALIZE_SIZE as usize).await?;
        Ok(deserialize_bounded(&bytes)?)
    }

    async fn run(mut self) -> Result<()> {
        loop {
            let remote = match self.pending_inits.pop_front() {
                Some(init) => init,
                None => match self.read().await? {
                    BrokerMessage::Init {
                        key_count,
                        discriminator,
                    } => (key_count, discriminator),
                    BrokerMessage::Digests { .. } => bail!("digests outside a round"),
                },
            };
            let local = self.local_params().await?;
            let local_count = local.keys.len() as u32;

            if is_sender((local_count, local.discriminator), remote) {
                self.send_digests(&local.keys).await?;
            } else {
                let shared = self.receive_digests(&local.keys).await?;
                debug!(shared = shared.len(), "broker round complete");
                if self.events_tx.send(BrokerEvent::Keys(shared)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn local_params(&mut self) -> Result<LocalParams> {
        match self.params_rx.try_recv() {
            Ok(params) => return Ok(params),
            Err(mpsc::error::TryRecvError::Disconnected) => bail!("broker closed"),
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        self.events_tx
            .send(BrokerEvent::InitRequired)
            .await
            .map_err(|_| anyhow!("broker closed"))?;
        match tokio::time::timeout(self.timeout, self.params_rx.recv()).await {
            Ok(Some(params)) => Ok(params),
            Ok(None) => bail!("broker closed"),
            Err(_) => {
                warn!("timed out waiting for local broker init");
                bail!("broker init timed out")
            }
        }
    }

    async fn send_digests(&mut self, keys: &[PublicKey]) -> Result<()> {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        let digests = keys.iter().map(|k| key_digest(&salt, k)).collect();
        let body = serialize(&BrokerMessage::Digests { salt, digests })?;
        self.writer.lock().await.write_message(&body).await
    }

    async fn receive_digests(&mut self, keys: &[PublicKey]) -> Result<Vec<PublicKey>> {
        loop {
            match self.read().await? {
                BrokerMessage::Init {
                    key_count,
                    discriminator,
                } => self.pending_inits.push_back((key_count, discriminator)),
                BrokerMessage::Digests { salt, digests } => {
                    let remote: HashSet<[u8; 32]> = digests.into_iter().collect();
                    return Ok(keys
                        .iter()
                        .filter(|k| remote.contains(&key_digest(&salt, k)))
                        .copied()
                        .collect());
                }
            }
        }
    }
}
