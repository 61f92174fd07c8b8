//! # Peer Exchange
//!
//! Establishes direct links between members of a network that are not yet
//! linked, carrying the connection signaling (offer, answer, ICE candidates)
//! as network messages on [`PEER_EXCHANGE_PORT`].
//!
//! ```text
//! initiator                                   responder
//!    │ ── MediationOffer ──────────────────────► │  (or Rejection when full)
//!    │ ◄───────────────────── MediationAnswer ── │
//!    │ ◄── MediationIceCandidate ──────────────► │
//! ```
//!
//! When an initiator cannot dial at all it sends a `CallbackRequest`, asking
//! the remote host to initiate instead.
//!
//! Each dial attempt owns a [`Mediator`]; at most one mediator per remote
//! host is live. When both hosts start at once, each receives the other's
//! offer while its own mediation is in progress; the offer wins only if its
//! mediation ID is greater than the local one, so exactly one attempt
//! survives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use crate::crypto::random_u64;
use crate::host::Host;
use crate::identity::HostId;
use crate::message::Message;
use crate::messages::{deserialize_bounded, serialize, PeerExchangeMessage};
use crate::network::{Network, PEER_EXCHANGE_PORT};
use crate::protocols::{MessageHandler, Signaling};

/// Candidate indices are tracked in a 64-bit mask.
const MAX_ICE_CANDIDATES: u64 = 64;

async fn send(network: &Weak<Network>, dst: HostId, msg: &PeerExchangeMessage) -> Result<()> {
    let network = network
        .upgrade()
        .ok_or_else(|| anyhow!("peer exchange network closed"))?;
    let body = serialize(msg)?;
    network
        .send(dst, PEER_EXCHANGE_PORT, PEER_EXCHANGE_PORT, body)
        .await
}

// ============================================================================
// Mediator
// ============================================================================

#[derive(Debug, Default)]
struct IceState {
    received: u64,
    /// Index of the terminating nil candidate, once seen.
    terminator: Option<u64>,
}

/// Signaling state of one dial attempt with one remote host.
pub struct Mediator {
    remote: HostId,
    network: Weak<Network>,
    mediation_id: u64,
    initiator: bool,
    remote_mediation_id: AtomicU64,
    remote_description: watch::Sender<Option<Vec<u8>>>,
    closed: watch::Sender<bool>,
    next_ice_index: AtomicU64,
    ice: StdMutex<IceState>,
    ice_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    ice_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Mediator {
    fn new(
        remote: HostId,
        network: Weak<Network>,
        remote_mediation_id: u64,
        offer: Option<Vec<u8>>,
    ) -> Result<Arc<Self>> {
        let (ice_tx, ice_rx) = mpsc::channel(MAX_ICE_CANDIDATES as usize);
        let initiator = offer.is_none();
        Ok(Arc::new(Self {
            remote,
            network,
            mediation_id: random_u64()?,
            initiator,
            remote_mediation_id: AtomicU64::new(remote_mediation_id),
            remote_description: watch::channel(offer).0,
            closed: watch::channel(false).0,
            next_ice_index: AtomicU64::new(0),
            ice: StdMutex::new(IceState::default()),
            ice_tx: StdMutex::new(Some(ice_tx)),
            ice_rx: Mutex::new(ice_rx),
        }))
    }

    /// Mediator for a dial this host initiates.
    pub fn initiator(remote: HostId, network: Weak<Network>) -> Result<Arc<Self>> {
        Self::new(remote, network, 0, None)
    }

    /// Mediator answering `offer` from `remote`.
    pub fn from_offer(
        remote: HostId,
        network: Weak<Network>,
        remote_mediation_id: u64,
        offer: Vec<u8>,
    ) -> Result<Arc<Self>> {
        Self::new(remote, network, remote_mediation_id, Some(offer))
    }

    pub fn mediation_id(&self) -> u64 {
        self.mediation_id
    }

    pub fn remote_mediation_id(&self) -> u64 {
        self.remote_mediation_id.load(Ordering::Acquire)
    }

    /// True for a responder, which was created from the remote offer.
    pub fn has_offer(&self) -> bool {
        !self.initiator
    }

    /// Record the remote answer. The first answer wins.
    pub fn set_answer(&self, remote_mediation_id: u64, answer: Vec<u8>) -> Result<()> {
        if remote_mediation_id == 0 {
            bail!("remote mediation id must be non-zero");
        }
        if answer.is_empty() {
            bail!("remote description empty");
        }
        self.remote_description.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            self.remote_mediation_id
                .store(remote_mediation_id, Ordering::Release);
            *current = Some(answer);
            true
        });
        Ok(())
    }

    /// Accept remote candidate `index`; `None` terminates the list. Returns
    /// true once every candidate before the terminator arrived.
    pub fn add_ice_candidate(&self, index: u64, candidate: Option<Vec<u8>>) -> Result<bool> {
        if index >= MAX_ICE_CANDIDATES {
            bail!("ice candidate index {} out of range", index);
        }
        let mut ice = self.ice.lock().unwrap_or_else(PoisonError::into_inner);
        let mask = 1u64 << index;
        match candidate {
            None => ice.terminator = Some(index),
            Some(candidate) if ice.received & mask == 0 => {
                ice.received |= mask;
                if let Some(tx) = self
                    .ice_tx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                {
                    let _ = tx.try_send(candidate);
                }
            }
            Some(_) => {}
        }

        let complete = ice
            .terminator
            .is_some_and(|n| ice.received == (1u64 << n) - 1);
        if complete {
            self.ice_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        Ok(complete)
    }

    async fn remote_description(&self) -> Result<Vec<u8>> {
        let mut description = self.remote_description.subscribe();
        let mut closed = self.closed.subscribe();
        tokio::select! {
            result = description.wait_for(Option::is_some) => {
                let value = result.map_err(|_| anyhow!("mediator dropped"))?;
                value.clone().ok_or_else(|| anyhow!("remote description missing"))
            }
            _ = closed.wait_for(|c| *c) => Err(anyhow!("mediator closed")),
        }
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
        self.ice_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

#[async_trait]
impl Signaling for Mediator {
    fn remote_host_id(&self) -> HostId {
        self.remote
    }

    async fn get_offer(&self) -> Result<Option<Vec<u8>>> {
        if self.initiator {
            return Ok(None);
        }
        self.remote_description().await.map(Some)
    }

    async fn get_answer(&self) -> Result<Vec<u8>> {
        self.remote_description().await
    }

    async fn next_ice_candidate(&self) -> Option<Vec<u8>> {
        let mut rx = self.ice_rx.lock().await;
        tokio::select! {
            candidate = rx.recv() => candidate,
            _ = self.closed() => None,
        }
    }

    async fn send_offer(&self, offer: Vec<u8>) -> Result<()> {
        let msg = PeerExchangeMessage::MediationOffer {
            mediation_id: self.mediation_id,
            data: offer,
        };
        send(&self.network, self.remote, &msg).await
    }

    async fn send_answer(&self, answer: Vec<u8>) -> Result<()> {
        let msg = PeerExchangeMessage::MediationAnswer {
            mediation_id: self.mediation_id,
            data: answer,
        };
        send(&self.network, self.remote, &msg).await
    }

    async fn send_ice_candidate(&self, candidate: Option<Vec<u8>>) -> Result<()> {
        let index = self.next_ice_index.fetch_add(1, Ordering::Relaxed);
        self.remote_description().await?;
        let msg = PeerExchangeMessage::MediationIceCandidate {
            mediation_id: self.mediation_id,
            index,
            data: candidate,
        };
        send(&self.network, self.remote, &msg).await
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("remote", &self.remote)
            .field("mediation_id", &self.mediation_id)
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PeerExchange
// ============================================================================

pub struct PeerExchange {
    me: Weak<PeerExchange>,
    network: Weak<Network>,
    host: Arc<Host>,
    dial_timeout: Duration,
    mediators: StdMutex<HashMap<HostId, Arc<Mediator>>>,
}

impl PeerExchange {
    pub fn new(network: &Arc<Network>, dial_timeout: Duration) -> Arc<Self> {
        let host = network.host().clone();
        let network = Arc::downgrade(network);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            network,
            host,
            dial_timeout,
            mediators: StdMutex::new(HashMap::new()),
        })
    }

    fn mediators(&self) -> std::sync::MutexGuard<'_, HashMap<HostId, Arc<Mediator>>> {
        self.mediators.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mediator_count(&self) -> usize {
        self.mediators().len()
    }

    pub fn mediator(&self, host_id: &HostId) -> Option<Arc<Mediator>> {
        self.mediators().get(host_id).cloned()
    }

    async fn allow_new_peer(&self) -> bool {
        let max = self.host.max_peers();
        max == 0 || self.host.peer_count().await + self.mediator_count() < max
    }

    /// Start linking to `host_id` unless already linked or mediating.
    pub async fn connect(&self, host_id: HostId) -> Result<()> {
        if host_id == self.host.id() || self.host.has_peer(&host_id).await {
            return Ok(());
        }
        if self.mediators().contains_key(&host_id) {
            return Ok(());
        }
        let mediator = Mediator::initiator(host_id, self.network.clone())?;
        let Some(me) = self.me.upgrade() else {
            bail!("peer exchange closed");
        };
        tokio::spawn(async move {
            if let Err(e) = me.dial(mediator).await {
                debug!(host = %host_id, error = %e, "dial failed, requesting callback");
                if let Err(e) = send(&me.network, host_id, &PeerExchangeMessage::CallbackRequest).await {
                    debug!(host = %host_id, error = %e, "callback request failed");
                }
            }
        });
        Ok(())
    }

    fn spawn_dial(&self, mediator: Arc<Mediator>) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let remote = mediator.remote_host_id();
            if let Err(e) = me.dial(mediator).await {
                debug!(host = %remote, error = %e, "mediated dial failed");
            }
        });
    }

    async fn dial(&self, mediator: Arc<Mediator>) -> Result<()> {
        let remote = mediator.remote_host_id();
        if self.host.has_peer(&remote).await {
            bail!("already linked to {}", remote);
        }

        {
            let mut mediators = self.mediators();
            if let Some(existing) = mediators.get(&remote) {
                let replaces = mediator.has_offer()
                    && mediator.remote_mediation_id() > existing.mediation_id();
                if !replaces {
                    bail!("mediation with {} in progress", remote);
                }
                existing.close();
            }
            mediators.insert(remote, mediator.clone());
        }
        debug!(host = %remote, mediation_id = mediator.mediation_id(), "dialing");

        let signaling: Arc<dyn Signaling> = mediator.clone();
        let result = tokio::select! {
            dialed = tokio::time::timeout(self.dial_timeout, self.host.dial(signaling)) => match dialed {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(anyhow!("dial timed out")),
            },
            _ = mediator.closed() => Err(anyhow!("mediation closed")),
        };

        mediator.close();
        self.remove(&mediator);
        result
    }

    fn remove(&self, mediator: &Arc<Mediator>) {
        let mut mediators = self.mediators();
        let remote = mediator.remote_host_id();
        if mediators
            .get(&remote)
            .is_some_and(|current| Arc::ptr_eq(current, mediator))
        {
            mediators.remove(&remote);
        }
    }

    /// Close every mediation in progress.
    pub fn close(&self) {
        for (_, mediator) in self.mediators().drain() {
            mediator.close();
        }
    }

    async fn handle_offer(&self, origin: HostId, mediation_id: u64, data: Vec<u8>) -> Result<()> {
        if !self.allow_new_peer().await {
            debug!(host = %origin, "rejecting offer");
            return send(&self.network, origin, &PeerExchangeMessage::Rejection { mediation_id }).await;
        }
        let mediator = Mediator::from_offer(origin, self.network.clone(), mediation_id, data)?;
        self.spawn_dial(mediator);
        Ok(())
    }

    fn handle_ice_candidate(&self, origin: HostId, mediation_id: u64, index: u64, data: Option<Vec<u8>>) -> Result<()> {
        let mediator = self
            .mediator(&origin)
            .filter(|m| m.remote_mediation_id() == mediation_id)
            .ok_or_else(|| anyhow!("no mediation with {} for ice candidate", origin))?;
        if mediator.add_ice_candidate(index, data)? {
            self.remove(&mediator);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for PeerExchange {
    async fn handle_message(&self, msg: &Message) -> Result<bool> {
        if msg.header.dst_id != self.host.id() {
            return Ok(true);
        }
        let origin = msg
            .src_host_id()
            .ok_or_else(|| anyhow!("peer exchange message without origin"))?;

        match deserialize_bounded(&msg.body)? {
            PeerExchangeMessage::MediationOffer { mediation_id, data } => {
                self.handle_offer(origin, mediation_id, data).await?;
            }
            PeerExchangeMessage::MediationAnswer { mediation_id, data } => {
                let mediator = self
                    .mediator(&origin)
                    .ok_or_else(|| anyhow!("no mediation with {} for answer", origin))?;
                mediator.set_answer(mediation_id, data)?;
            }
            PeerExchangeMessage::MediationIceCandidate {
                mediation_id,
                index,
                data,
            } => self.handle_ice_candidate(origin, mediation_id, index, data)?,
            PeerExchangeMessage::CallbackRequest => {
                if self.allow_new_peer().await {
                    self.spawn_dial(Mediator::initiator(origin, self.network.clone())?);
                }
            }
            PeerExchangeMessage::Rejection { mediation_id } => {
                if let Some(mediator) = self
                    .mediator(&origin)
                    .filter(|m| m.mediation_id() == mediation_id)
                {
                    debug!(host = %origin, mediation_id, "offer rejected");
                    mediator.close();
                    self.remove(&mediator);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mediator(offer: Option<Vec<u8>>) -> Arc<Mediator> {
        let remote = HostId::from_bytes([4; 20]);
        match offer {
            None => Mediator::initiator(remote, Weak::new()).unwrap(),
            Some(offer) => Mediator::from_offer(remote, Weak::new(), 99, offer).unwrap(),
        }
    }

    #[tokio::test]
    async fn first_answer_wins() {
        let m = mediator(None);
        assert!(m.set_answer(0, b"x".to_vec()).is_err());
        assert!(m.set_answer(5, Vec::new()).is_err());

        m.set_answer(5, b"first".to_vec()).unwrap();
        m.set_answer(6, b"second".to_vec()).unwrap();
        assert_eq!(m.get_answer().await.unwrap(), b"first");
        assert_eq!(m.remote_mediation_id(), 5);
    }

    #[tokio::test]
    async fn responder_offer_is_its_remote_description() {
        let m = mediator(Some(b"offer".to_vec()));
        assert!(m.has_offer());
        assert_eq!(m.get_offer().await.unwrap(), Some(b"offer".to_vec()));
        assert_eq!(mediator(None).get_offer().await.unwrap(), None);
    }

    #[tokio::test]
    async fn ice_candidates_complete_in_any_order() {
        let m = mediator(Some(b"offer".to_vec()));
        assert!(!m.add_ice_candidate(2, None).unwrap());
        assert!(!m.add_ice_candidate(1, Some(b"b".to_vec())).unwrap());
        // Duplicates are ignored.
        assert!(!m.add_ice_candidate(1, Some(b"b".to_vec())).unwrap());
        assert!(m.add_ice_candidate(0, Some(b"a".to_vec())).unwrap());

        let mut seen = Vec::new();
        while let Some(c) = m.next_ice_candidate().await {
            seen.push(c);
        }
        assert_eq!(seen, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn empty_candidate_list_completes_immediately() {
        let m = mediator(Some(b"offer".to_vec()));
        assert!(m.add_ice_candidate(0, None).unwrap());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let m = mediator(None);
        assert!(m.add_ice_candidate(64, Some(vec![1])).is_err());
        assert!(m.add_ice_candidate(63, Some(vec![1])).is_ok());
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let m = mediator(None);
        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.get_answer().await })
        };
        m.close();
        assert!(waiter.await.unwrap().is_err());
        assert!(m.next_ice_candidate().await.is_none());
    }
}
