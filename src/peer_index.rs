//! # Peer Index
//!
//! Finds hosts serving a topic. A host publishes `(hash, host key, HostID,
//! port)` under `hash = BLAKE3(key ‖ salt)`, signed with its host key; a
//! search returns the records under that hash whose HostIDs are nearest the
//! searcher.
//!
//! Records under one hash are kept per publishing host, so the store key
//! carries the publisher's HostID as a suffix.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::crypto::verify_signature;
use crate::hash_table::record_hash;
use crate::identity::{HostId, Keypair, PublicKey};
use crate::message::Message;
use crate::messages::{deserialize_bounded, serialize, PeerIndexMessage, PeerIndexRecord};
use crate::network::{Network, PEER_INDEX_PORT};
use crate::protocols::MessageHandler;
use crate::store::{
    PendingReplies, Publication, Publisher, RecordRejection, RequestRegistry, Store, StoredRecord,
};

pub type PeerIndexStore = Store<PeerIndexRecord>;

fn signed_payload(hash: &[u8; 32], key: &PublicKey, host_id: &HostId, port: u32, timestamp: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 32 + 20 + 4 + 8);
    payload.extend_from_slice(hash);
    payload.extend_from_slice(key);
    payload.extend_from_slice(host_id.as_bytes());
    payload.extend_from_slice(&port.to_be_bytes());
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload
}

impl PeerIndexRecord {
    pub fn signed(host_key: &Keypair, host_id: HostId, hash: [u8; 32], port: u32, timestamp: u64) -> Self {
        let key = host_key.public_key_bytes();
        let signature = host_key
            .sign(&signed_payload(&hash, &key, &host_id, port, timestamp))
            .to_bytes()
            .to_vec();
        Self {
            hash,
            key,
            host_id,
            port,
            timestamp,
            signature,
        }
    }
}

impl StoredRecord for PeerIndexRecord {
    fn record_hash(&self) -> [u8; 32] {
        self.hash
    }

    fn suffix(&self) -> Option<HostId> {
        Some(self.host_id)
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn verify(&self) -> Result<(), RecordRejection> {
        if !self.host_id.matches_key(&self.key) {
            return Err(RecordRejection::HostIdMismatch);
        }
        if self.port > u32::from(u16::MAX) {
            return Err(RecordRejection::PortOutOfRange);
        }
        let payload = signed_payload(&self.hash, &self.key, &self.host_id, self.port, self.timestamp);
        verify_signature(&self.key, &payload, &self.signature)
            .map_err(|_| RecordRejection::InvalidSignature)
    }
}

/// A host found by [`PeerIndex::search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIndexHost {
    pub timestamp: u64,
    pub host_id: HostId,
    pub port: u16,
}

pub struct PeerIndex {
    network: Weak<Network>,
    host_id: HostId,
    host_key: Keypair,
    instance: u32,
    store: PeerIndexStore,
    config: DhtConfig,
    requests: Arc<RequestRegistry<Vec<PeerIndexRecord>>>,
}

impl PeerIndex {
    pub fn new(network: &Arc<Network>, store: PeerIndexStore, instance: u32, config: DhtConfig) -> Arc<Self> {
        Arc::new(Self {
            network: Arc::downgrade(network),
            host_id: network.host_id(),
            host_key: network.host().key().clone(),
            instance,
            store,
            config,
            requests: RequestRegistry::new(),
        })
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    fn network(&self) -> Result<Arc<Network>> {
        self.network
            .upgrade()
            .ok_or_else(|| anyhow!("peer index network closed"))
    }

    /// Advertise this host on `port` under `(key, salt)`.
    pub fn publish(&self, key: &PublicKey, salt: &[u8], port: u16) -> PeerIndexPublisher {
        let hash = record_hash(key, salt);
        let host_key = self.host_key.clone();
        let host_id = self.host_id;

        let publisher = Publisher::spawn(
            self.network.clone(),
            HostId::from_hash(&hash),
            PEER_INDEX_PORT,
            self.config.publish_interval,
            move |publication, timestamp| {
                let record = PeerIndexRecord::signed(&host_key, host_id, hash, port as u32, timestamp);
                let msg = match publication {
                    Publication::Publish => PeerIndexMessage::Publish(record),
                    Publication::Unpublish => PeerIndexMessage::Unpublish(record),
                };
                Ok(serialize(&msg)?)
            },
        );
        PeerIndexPublisher { publisher }
    }

    /// Look for hosts published under `(key, salt)`.
    pub async fn search(&self, key: &PublicKey, salt: &[u8], timeout: Duration) -> Result<PeerIndexSearchReceiver> {
        let network = self.network()?;
        let hash = record_hash(key, salt);
        let pending = self.requests.register(timeout)?;
        let body = serialize(&PeerIndexMessage::SearchRequest {
            request_id: pending.id(),
            hash,
        })?;
        network
            .send(HostId::from_hash(&hash), PEER_INDEX_PORT, PEER_INDEX_PORT, body)
            .await?;
        Ok(PeerIndexSearchReceiver {
            hash,
            pending,
            buffered: VecDeque::new(),
            seen: HashSet::new(),
        })
    }
}

#[async_trait]
impl MessageHandler for PeerIndex {
    async fn handle_message(&self, msg: &Message) -> Result<bool> {
        let decoded: PeerIndexMessage = deserialize_bounded(&msg.body)?;
        match decoded {
            PeerIndexMessage::Publish(record) => {
                if self.store.insert(self.instance, record).await? {
                    trace!(host = %self.host_id, "peer index record stored");
                }
            }
            PeerIndexMessage::Unpublish(record) => {
                self.store.remove(self.instance, record).await?;
            }
            PeerIndexMessage::SearchRequest { request_id, hash } => {
                let origin = msg.src_host_id().unwrap_or(self.host_id);
                let records = self.store.closest(self.instance, hash, origin).await?;
                if !records.is_empty() {
                    let body = serialize(&PeerIndexMessage::SearchResponse { request_id, records })?;
                    if let Err(e) = self.network()?.send(origin, PEER_INDEX_PORT, PEER_INDEX_PORT, body).await {
                        debug!(host = %self.host_id, error = %e, "peer index reply failed");
                    }
                }
            }
            PeerIndexMessage::SearchResponse { request_id, records } => {
                let mut valid = Vec::with_capacity(records.len());
                for record in records {
                    match self.store.insert(self.instance, record.clone()).await {
                        Ok(_) => valid.push(record),
                        Err(e) => debug!(host = %self.host_id, error = %e, "dropping search result"),
                    }
                }
                if !valid.is_empty() {
                    self.requests.deliver(request_id, valid);
                }
            }
        }
        Ok(true)
    }
}

/// Keeps this host advertised; see [`PeerIndex::publish`].
pub struct PeerIndexPublisher {
    publisher: Publisher,
}

impl PeerIndexPublisher {
    pub async fn close(self) {
        self.publisher.close().await;
    }
}

/// Hosts answering one [`PeerIndex::search`], each reported once.
pub struct PeerIndexSearchReceiver {
    hash: [u8; 32],
    pending: PendingReplies<Vec<PeerIndexRecord>>,
    buffered: VecDeque<PeerIndexRecord>,
    seen: HashSet<(HostId, u16)>,
}

impl PeerIndexSearchReceiver {
    pub async fn recv(&mut self) -> Option<PeerIndexHost> {
        loop {
            while let Some(record) = self.buffered.pop_front() {
                if record.hash != self.hash {
                    continue;
                }
                let Ok(port) = u16::try_from(record.port) else {
                    continue;
                };
                if self.seen.insert((record.host_id, port)) {
                    return Some(PeerIndexHost {
                        timestamp: record.timestamp,
                        host_id: record.host_id,
                        port,
                    });
                }
            }
            self.buffered.extend(self.pending.recv().await?);
        }
    }

    pub fn close(&mut self) {
        self.pending.close();
        self.buffered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{issue_membership, Certificate, KEY_USAGE_SIGN};
    use crate::config::Config;
    use crate::host::Host;
    use crate::identity::now_ms;

    const HOUR: Duration = Duration::from_secs(3600);

    fn standalone_index(config: DhtConfig) -> (Arc<Network>, Arc<PeerIndex>) {
        let ca = Keypair::generate();
        let root = Certificate::self_signed(&ca, KEY_USAGE_SIGN, "network", HOUR);
        let profile = Keypair::generate();
        let cert = issue_membership(&ca, &root, &profile, HOUR).unwrap();
        let host = Host::new(profile, HOUR, Duration::from_secs(5), None).unwrap();
        let network = Network::new(host, cert, &Config::default());
        let store = PeerIndexStore::spawn(network.host_id(), &config);
        let index = PeerIndex::new(&network, store, 1, config);
        (network, index)
    }

    #[test]
    fn record_host_id_must_match_key() {
        let host = Keypair::generate();
        let hash = [5u8; 32];
        let good = PeerIndexRecord::signed(&host, host.host_id(7), hash, 1234, 1);
        assert!(good.verify().is_ok());

        let other = Keypair::generate();
        let spoofed = PeerIndexRecord::signed(&host, other.host_id(7), hash, 1234, 1);
        assert_eq!(spoofed.verify(), Err(RecordRejection::HostIdMismatch));
    }

    #[test]
    fn port_is_covered_by_signature() {
        let host = Keypair::generate();
        let mut record = PeerIndexRecord::signed(&host, host.host_id(1), [1; 32], 80, 1);
        record.port = 81;
        assert_eq!(record.verify(), Err(RecordRejection::InvalidSignature));
    }

    #[test]
    fn port_must_fit_sixteen_bits() {
        let host = Keypair::generate();
        let record = PeerIndexRecord::signed(&host, host.host_id(1), [1; 32], 70_000, 1);
        assert_eq!(record.verify(), Err(RecordRejection::PortOutOfRange));
    }

    #[tokio::test]
    async fn search_response_delivers_only_stored_records() {
        let config = DhtConfig::default();
        let (_network, index) = standalone_index(config.clone());
        let hash = [4u8; 32];
        let now = now_ms();
        let stale_ts = now - config.max_record_age.as_millis() as u64 - 60_000;

        let fresh_host = Keypair::generate();
        let fresh = PeerIndexRecord::signed(&fresh_host, fresh_host.host_id(0), hash, 4000, now);
        let stale_host = Keypair::generate();
        let stale = PeerIndexRecord::signed(&stale_host, stale_host.host_id(0), hash, 4001, stale_ts);
        let wide_host = Keypair::generate();
        let wide = PeerIndexRecord::signed(&wide_host, wide_host.host_id(0), hash, 70_000, now);

        let mut pending = index.requests.register(Duration::from_millis(500)).unwrap();
        let body = serialize(&PeerIndexMessage::SearchResponse {
            request_id: pending.id(),
            records: vec![stale, fresh.clone(), wide],
        })
        .unwrap();
        let msg = Message::new(index.host_id, PEER_INDEX_PORT, PEER_INDEX_PORT, 0, body).unwrap();
        assert!(index.handle_message(&msg).await.unwrap());

        assert_eq!(pending.recv().await, Some(vec![fresh.clone()]));
        assert_eq!(index.store.closest(1, hash, index.host_id).await.unwrap(), vec![fresh]);
    }

    #[tokio::test]
    async fn expired_search_response_is_not_delivered() {
        let config = DhtConfig::default();
        let (_network, index) = standalone_index(config.clone());
        let host = Keypair::generate();
        let stale_ts = now_ms() - config.max_record_age.as_millis() as u64 - 60_000;
        let stale = PeerIndexRecord::signed(&host, host.host_id(0), [4; 32], 4000, stale_ts);

        let mut pending = index.requests.register(Duration::from_millis(200)).unwrap();
        let body = serialize(&PeerIndexMessage::SearchResponse {
            request_id: pending.id(),
            records: vec![stale],
        })
        .unwrap();
        let msg = Message::new(index.host_id, PEER_INDEX_PORT, PEER_INDEX_PORT, 0, body).unwrap();
        assert!(index.handle_message(&msg).await.unwrap());
        assert_eq!(pending.recv().await, None);
    }

    #[tokio::test]
    async fn store_answers_closest_hosts_to_origin() {
        let config = DhtConfig {
            search_response_size: 2,
            ..DhtConfig::default()
        };
        let store = PeerIndexStore::spawn(HostId::from_bytes([0; 20]), &config);
        let hash = [9u8; 32];
        let now = now_ms();
        let hosts: Vec<Keypair> = (0..4).map(|_| Keypair::generate()).collect();
        for host in &hosts {
            let record = PeerIndexRecord::signed(host, host.host_id(0), hash, 4000, now);
            assert!(store.insert(1, record).await.unwrap());
        }

        let origin = hosts[2].host_id(0);
        let found = store.closest(1, hash, origin).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].host_id, origin);
    }
}
