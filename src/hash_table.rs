//! # Hash Table
//!
//! Replicated key/value records signed by their publisher.
//!
//! A record is addressed by `BLAKE3(key ‖ salt)`; its first 20 bytes are the
//! kademlia target the record is routed toward. Every host on the path runs
//! the handler, so records replicate along the route and a `GetRequest` is
//! answered by the first host that holds a copy.
//!
//! | Message | Handling |
//! |---------|----------|
//! | `Publish` | verify, store if newer |
//! | `Unpublish` | verify, delete if strictly newer |
//! | `GetRequest` | reply with the stored record to the request origin |
//! | `GetResponse` | verify, store, deliver to the pending request |

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::crypto::verify_signature;
use crate::identity::{HostId, Keypair, PublicKey};
use crate::message::Message;
use crate::messages::{deserialize_bounded, serialize, HashTableMessage, HashTableRecord};
use crate::network::{Network, HASH_TABLE_PORT};
use crate::protocols::MessageHandler;
use crate::store::{
    PendingReplies, Publication, Publisher, RecordRejection, RequestRegistry, Store, StoredRecord,
};

pub type HashTableStore = Store<HashTableRecord>;

pub fn record_hash(key: &PublicKey, salt: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key);
    hasher.update(salt);
    *hasher.finalize().as_bytes()
}

fn signed_payload(key: &PublicKey, salt: &[u8], value: &[u8], timestamp: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + salt.len() + value.len() + 8);
    payload.extend_from_slice(key);
    payload.extend_from_slice(salt);
    payload.extend_from_slice(value);
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload
}

impl HashTableRecord {
    /// Sign `value` under `keypair` at `timestamp`.
    pub fn signed(keypair: &Keypair, salt: &[u8], value: Vec<u8>, timestamp: u64) -> Self {
        let key = keypair.public_key_bytes();
        let signature = keypair
            .sign(&signed_payload(&key, salt, &value, timestamp))
            .to_bytes()
            .to_vec();
        Self {
            key,
            salt: salt.to_vec(),
            value,
            timestamp,
            signature,
        }
    }
}

impl StoredRecord for HashTableRecord {
    fn record_hash(&self) -> [u8; 32] {
        record_hash(&self.key, &self.salt)
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn verify(&self) -> Result<(), RecordRejection> {
        let payload = signed_payload(&self.key, &self.salt, &self.value, self.timestamp);
        verify_signature(&self.key, &payload, &self.signature)
            .map_err(|_| RecordRejection::InvalidSignature)
    }
}

/// A value found by [`HashTable::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTableValue {
    pub timestamp: u64,
    pub value: Vec<u8>,
}

pub struct HashTable {
    network: Weak<Network>,
    host_id: HostId,
    instance: u32,
    store: HashTableStore,
    config: DhtConfig,
    requests: Arc<RequestRegistry<HashTableRecord>>,
}

impl HashTable {
    pub fn new(network: &Arc<Network>, store: HashTableStore, instance: u32, config: DhtConfig) -> Arc<Self> {
        Arc::new(Self {
            network: Arc::downgrade(network),
            host_id: network.host_id(),
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
            .ok_or_else(|| anyhow!("hash table network closed"))
    }

    /// Publish `value` under `(keypair, salt)` every publish interval until
    /// the returned publisher is closed or dropped.
    pub fn set(&self, keypair: &Keypair, salt: &[u8], value: Vec<u8>) -> HashTablePublisher {
        let key = keypair.public_key_bytes();
        let target = HostId::from_hash(&record_hash(&key, salt));
        let (value_tx, value_rx) = watch::channel(value);
        let keypair = keypair.clone();
        let salt = salt.to_vec();

        let publisher = Publisher::spawn(
            self.network.clone(),
            target,
            HASH_TABLE_PORT,
            self.config.publish_interval,
            move |publication, timestamp| {
                let value = value_rx.borrow().clone();
                let record = HashTableRecord::signed(&keypair, &salt, value, timestamp);
                let msg = match publication {
                    Publication::Publish => HashTableMessage::Publish(record),
                    Publication::Unpublish => HashTableMessage::Unpublish(record),
                };
                Ok(serialize(&msg)?)
            },
        );
        HashTablePublisher {
            value_tx,
            publisher,
        }
    }

    /// Ask the network for the record under `(key, salt)`.
    pub async fn get(&self, key: &PublicKey, salt: &[u8], timeout: Duration) -> Result<HashTableGetReceiver> {
        let network = self.network()?;
        let hash = record_hash(key, salt);
        let pending = self.requests.register(timeout)?;
        let body = serialize(&HashTableMessage::GetRequest {
            request_id: pending.id(),
            hash,
        })?;
        network
            .send(HostId::from_hash(&hash), HASH_TABLE_PORT, HASH_TABLE_PORT, body)
            .await?;
        Ok(HashTableGetReceiver { hash, pending })
    }

    async fn reply(&self, origin: HostId, request_id: u64, record: HashTableRecord) -> Result<()> {
        let body = serialize(&HashTableMessage::GetResponse { request_id, record })?;
        self.network()?
            .send(origin, HASH_TABLE_PORT, HASH_TABLE_PORT, body)
            .await
    }
}

#[async_trait]
impl MessageHandler for HashTable {
    async fn handle_message(&self, msg: &Message) -> Result<bool> {
        let decoded: HashTableMessage = deserialize_bounded(&msg.body)?;
        match decoded {
            HashTableMessage::Publish(record) => {
                if self.store.insert(self.instance, record).await? {
                    trace!(host = %self.host_id, "hash table record stored");
                }
            }
            HashTableMessage::Unpublish(record) => {
                if self.store.remove(self.instance, record).await? {
                    trace!(host = %self.host_id, "hash table record removed");
                }
            }
            HashTableMessage::GetRequest { request_id, hash } => {
                if let Some(record) = self.store.get(self.instance, hash, None).await? {
                    let origin = msg.src_host_id().unwrap_or(self.host_id);
                    if let Err(e) = self.reply(origin, request_id, record).await {
                        debug!(host = %self.host_id, error = %e, "hash table reply failed");
                    }
                }
            }
            HashTableMessage::GetResponse { request_id, record } => {
                self.store.insert(self.instance, record.clone()).await?;
                self.requests.deliver(request_id, record);
            }
        }
        Ok(true)
    }
}

/// Keeps a record published; see [`HashTable::set`].
pub struct HashTablePublisher {
    value_tx: watch::Sender<Vec<u8>>,
    publisher: Publisher,
}

impl HashTablePublisher {
    /// Replace the value sent by the next publish.
    pub fn update(&self, value: Vec<u8>) {
        self.value_tx.send_replace(value);
    }

    pub async fn close(self) {
        self.publisher.close().await;
    }
}

/// Values answering one [`HashTable::get`].
pub struct HashTableGetReceiver {
    hash: [u8; 32],
    pending: PendingReplies<HashTableRecord>,
}

impl HashTableGetReceiver {
    /// Next value, or `None` once the request timed out or was closed.
    pub async fn recv(&mut self) -> Option<HashTableValue> {
        loop {
            let record = self.pending.recv().await?;
            if StoredRecord::record_hash(&record) == self.hash {
                return Some(HashTableValue {
                    timestamp: record.timestamp,
                    value: record.value,
                });
            }
        }
    }

    pub fn close(&mut self) {
        self.pending.close();
    }
}
