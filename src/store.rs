//! # DHT Record Stores
//!
//! Shared machinery of the hash table and peer index services:
//!
//! - [`RecordStore`]: the local record map with monotonic replacement,
//!   capacity eviction and wheel-based expiry
//! - [`Store`]: actor handle serializing access to a [`RecordStore`]
//! - [`RequestRegistry`] / [`PendingReplies`]: request IDs awaiting replies
//! - [`Publisher`]: periodic publish task that unpublishes when stopped
//!
//! ## Keys
//!
//! ```text
//! (local HostID XOR hash[..20]) ‖ instance (u32 BE) ‖ suffix (HostID, optional)
//! ```
//!
//! Ordering by this key keeps records nearest the local host first, so the
//! largest key is the first evicted when the store is full. The instance ID
//! namespaces one logical network's records inside a store shared by all of
//! them.
//!
//! All times are unix milliseconds.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::crypto::random_u64;
use crate::identity::{distance_cmp, now_ms, HostId, HOST_ID_LEN};
use crate::network::Network;
use crate::queue::TimeoutQueue;

const COMMAND_QUEUE_DEPTH: usize = 256;
const REPLY_QUEUE_DEPTH: usize = 64;
/// Slot width of the pending-request wheel.
const REQUEST_WHEEL_INTERVAL_MS: u64 = 100;
const REQUEST_WHEEL_SPAN_MS: u64 = 60_000;

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRejection {
    InvalidSignature,
    /// Record HostID is not derived from the record key.
    HostIdMismatch,
    /// Advertised port does not fit in 16 bits.
    PortOutOfRange,
    /// Record is older than the store's maximum age.
    Expired,
}

impl std::fmt::Display for RecordRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordRejection::InvalidSignature => write!(f, "record signature invalid"),
            RecordRejection::HostIdMismatch => write!(f, "record host ID does not match its key"),
            RecordRejection::PortOutOfRange => write!(f, "record port out of range"),
            RecordRejection::Expired => write!(f, "record expired"),
        }
    }
}

impl std::error::Error for RecordRejection {}

/// A signed, timestamped DHT record.
pub trait StoredRecord: Clone + Send + 'static {
    /// Hash naming the record; its first 20 bytes are the kademlia target.
    fn record_hash(&self) -> [u8; 32];

    /// Separates several records under one hash.
    fn suffix(&self) -> Option<HostId> {
        None
    }

    fn timestamp(&self) -> u64;

    fn verify(&self) -> Result<(), RecordRejection>;
}

// ============================================================================
// RecordStore
// ============================================================================

#[derive(Debug)]
pub struct RecordStore<R> {
    local_id: HostId,
    records: BTreeMap<Vec<u8>, R>,
    expiry: TimeoutQueue<(Vec<u8>, u64)>,
    max_records: usize,
    max_age: u64,
}

impl<R: StoredRecord> RecordStore<R> {
    pub fn new(local_id: HostId, config: &DhtConfig, now: u64) -> Self {
        let max_age = config.max_record_age.as_millis() as u64;
        Self {
            local_id,
            records: BTreeMap::new(),
            expiry: TimeoutQueue::new(config.discard_interval.as_millis() as u64, max_age, now),
            max_records: config.max_records,
            max_age,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn prefix(&self, instance: u32, hash: &[u8; 32]) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 * HOST_ID_LEN + 4);
        let local = self.local_id.as_bytes();
        key.extend(local.iter().zip(&hash[..HOST_ID_LEN]).map(|(a, b)| a ^ b));
        key.extend_from_slice(&instance.to_be_bytes());
        key
    }

    fn key(&self, instance: u32, hash: &[u8; 32], suffix: Option<HostId>) -> Vec<u8> {
        let mut key = self.prefix(instance, hash);
        if let Some(suffix) = suffix {
            key.extend_from_slice(suffix.as_bytes());
        }
        key
    }

    fn is_fresh(&self, timestamp: u64, now: u64) -> bool {
        timestamp.saturating_add(self.max_age) > now
    }

    /// Store `record` unless an equal or newer one is present. Returns whether
    /// the store changed.
    pub fn insert(&mut self, instance: u32, record: R, now: u64) -> Result<bool, RecordRejection> {
        record.verify()?;
        let timestamp = record.timestamp();
        if !self.is_fresh(timestamp, now) {
            return Err(RecordRejection::Expired);
        }

        let key = self.key(instance, &record.record_hash(), record.suffix());
        if let Some(existing) = self.records.get(&key) {
            if existing.timestamp() >= timestamp {
                return Ok(false);
            }
        }
        self.records.insert(key.clone(), record);
        self.expiry.push((key.clone(), timestamp), timestamp.saturating_add(self.max_age));

        if self.records.len() > self.max_records {
            if let Some((evicted, _)) = self.records.pop_last() {
                if evicted == key {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Delete the stored counterpart of `record` if `record` is strictly newer.
    pub fn remove(&mut self, instance: u32, record: &R) -> Result<bool, RecordRejection> {
        record.verify()?;
        let key = self.key(instance, &record.record_hash(), record.suffix());
        match self.records.get(&key) {
            Some(existing) if existing.timestamp() < record.timestamp() => {
                self.records.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn get(&self, instance: u32, hash: &[u8; 32], suffix: Option<HostId>, now: u64) -> Option<R> {
        self.records
            .get(&self.key(instance, hash, suffix))
            .filter(|r| self.is_fresh(r.timestamp(), now))
            .cloned()
    }

    /// Every live record stored under `hash`.
    pub fn all(&self, instance: u32, hash: &[u8; 32], now: u64) -> Vec<R> {
        let prefix = self.prefix(instance, hash);
        self.records
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, r)| r)
            .filter(|r| self.is_fresh(r.timestamp(), now))
            .cloned()
            .collect()
    }

    /// Up to `n` live records under `hash` whose suffix is nearest `origin`.
    pub fn closest(&self, instance: u32, hash: &[u8; 32], origin: &HostId, n: usize, now: u64) -> Vec<R> {
        let mut records = self.all(instance, hash, now);
        records.sort_by(|a, b| {
            let da = a.suffix().map(|id| id.xor_distance(origin));
            let db = b.suffix().map(|id| id.xor_distance(origin));
            match (da, db) {
                (Some(da), Some(db)) => distance_cmp(&da, &db),
                (a, b) => a.is_some().cmp(&b.is_some()).reverse(),
            }
        });
        records.truncate(n);
        records
    }

    /// Drop records whose age passed `max_record_age`. Returns how many went.
    pub fn expire(&mut self, now: u64) -> usize {
        let mut removed = 0;
        for (key, timestamp) in self.expiry.advance(now) {
            let current = self.records.get(&key).map(StoredRecord::timestamp);
            if current == Some(timestamp) {
                self.records.remove(&key);
                removed += 1;
            }
        }
        removed
    }
}

// ============================================================================
// Store actor
// ============================================================================

enum Command<R> {
    Insert(u32, R, oneshot::Sender<Result<bool, RecordRejection>>),
    Remove(u32, R, oneshot::Sender<Result<bool, RecordRejection>>),
    Get(u32, [u8; 32], Option<HostId>, oneshot::Sender<Option<R>>),
    Closest(u32, [u8; 32], HostId, oneshot::Sender<Vec<R>>),
    Len(oneshot::Sender<usize>),
    Quit,
}

/// Cloneable handle to a record store owned by its own task.
pub struct Store<R> {
    cmd_tx: mpsc::Sender<Command<R>>,
}

impl<R> Clone for Store<R> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

struct StoreActor<R> {
    store: RecordStore<R>,
    search_response_size: usize,
    discard_interval: Duration,
    cmd_rx: mpsc::Receiver<Command<R>>,
}

impl<R: StoredRecord> Store<R> {
    pub fn spawn(local_id: HostId, config: &DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let actor = StoreActor {
            store: RecordStore::new(local_id, config, now_ms()),
            search_response_size: config.search_response_size,
            discard_interval: config.discard_interval,
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command<R>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| anyhow!("record store actor closed"))?;
        rx.await.map_err(|_| anyhow!("record store actor closed"))
    }

    pub async fn insert(&self, instance: u32, record: R) -> Result<bool> {
        Ok(self.request(|tx| Command::Insert(instance, record, tx)).await??)
    }

    pub async fn remove(&self, instance: u32, record: R) -> Result<bool> {
        Ok(self.request(|tx| Command::Remove(instance, record, tx)).await??)
    }

    pub async fn get(&self, instance: u32, hash: [u8; 32], suffix: Option<HostId>) -> Result<Option<R>> {
        self.request(|tx| Command::Get(instance, hash, suffix, tx)).await
    }

    /// Records under `hash` nearest `origin`, at most `search_response_size`.
    pub async fn closest(&self, instance: u32, hash: [u8; 32], origin: HostId) -> Result<Vec<R>> {
        self.request(|tx| Command::Closest(instance, hash, origin, tx)).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.request(Command::Len).await
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<R: StoredRecord> StoreActor<R> {
    async fn run(mut self) {
        let mut discard = tokio::time::interval(self.discard_interval);
        discard.tick().await;
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.handle(cmd) {
                        break;
                    }
                }
                _ = discard.tick() => {
                    let removed = self.store.expire(now_ms());
                    if removed > 0 {
                        debug!(removed, remaining = self.store.len(), "expired DHT records");
                    }
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command<R>) -> bool {
        let now = now_ms();
        match cmd {
            Command::Insert(instance, record, reply) => {
                let _ = reply.send(self.store.insert(instance, record, now));
            }
            Command::Remove(instance, record, reply) => {
                let _ = reply.send(self.store.remove(instance, &record));
            }
            Command::Get(instance, hash, suffix, reply) => {
                let _ = reply.send(self.store.get(instance, &hash, suffix, now));
            }
            Command::Closest(instance, hash, origin, reply) => {
                let records = self
                    .store
                    .closest(instance, &hash, &origin, self.search_response_size, now);
                let _ = reply.send(records);
            }
            Command::Len(reply) => {
                let _ = reply.send(self.store.len());
            }
            Command::Quit => return false,
        }
        true
    }
}

// ============================================================================
// Pending requests
// ============================================================================

struct Registry<T> {
    pending: HashMap<u64, mpsc::Sender<T>>,
    expiry: TimeoutQueue<u64>,
}

/// Request IDs awaiting replies, each live until its deadline.
pub struct RequestRegistry<T> {
    inner: Mutex<Registry<T>>,
}

impl<T> RequestRegistry<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Registry {
                pending: HashMap::new(),
                expiry: TimeoutQueue::new(REQUEST_WHEEL_INTERVAL_MS, REQUEST_WHEEL_SPAN_MS, now_ms()),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(registry: &mut Registry<T>, now: u64) {
        for id in registry.expiry.advance(now) {
            registry.pending.remove(&id);
        }
    }

    /// Register a fresh random request ID for `timeout`.
    pub fn register(self: &Arc<Self>, timeout: Duration) -> Result<PendingReplies<T>> {
        let (tx, rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        let now = now_ms();
        let mut registry = self.lock();
        Self::sweep(&mut registry, now);
        let id = loop {
            let id = random_u64()?;
            if !registry.pending.contains_key(&id) {
                break id;
            }
        };
        registry.pending.insert(id, tx);
        registry
            .expiry
            .push(id, now.saturating_add(timeout.as_millis() as u64));
        drop(registry);

        Ok(PendingReplies {
            id,
            rx,
            deadline: Instant::now() + timeout,
            registry: Arc::downgrade(self),
        })
    }

    /// Hand `reply` to request `id`. Unknown or expired IDs discard it.
    pub fn deliver(&self, id: u64, reply: T) -> bool {
        let mut registry = self.lock();
        Self::sweep(&mut registry, now_ms());
        match registry.pending.get(&id) {
            Some(tx) => tx.try_send(reply).is_ok(),
            None => {
                trace!(request_id = id, "reply for unknown request");
                false
            }
        }
    }

    pub fn remove(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}

/// Replies to one registered request; deregisters on close or drop.
pub struct PendingReplies<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    deadline: Instant,
    registry: Weak<RequestRegistry<T>>,
}

impl<T> PendingReplies<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next reply, or `None` once the deadline passed or the request closed.
    pub async fn recv(&mut self) -> Option<T> {
        tokio::time::timeout_at(self.deadline, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn close(&mut self) {
        self.rx.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl<T> Drop for PendingReplies<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

// ============================================================================
// Publisher
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publication {
    Publish,
    Unpublish,
}

/// Periodically sends a record toward its target. Stopping it (by `close`
/// or drop) sends one unpublish with a newer timestamp.
pub struct Publisher {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Publisher {
    /// `encode` builds the message body for a publication at a timestamp.
    pub fn spawn<F>(
        network: Weak<Network>,
        target: HostId,
        port: u16,
        interval: Duration,
        mut encode: F,
    ) -> Self
    where
        F: FnMut(Publication, u64) -> Result<Vec<u8>> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut last = 0u64;
            let mut stamp = move || {
                last = now_ms().max(last + 1);
                last
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        send(&network, target, port, encode(Publication::Publish, stamp())).await;
                    }
                    _ = &mut stop_rx => break,
                }
            }
            send(&network, target, port, encode(Publication::Unpublish, stamp())).await;
        });
        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Stop publishing and wait for the unpublish to be sent.
    pub async fn close(mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn send(network: &Weak<Network>, target: HostId, port: u16, body: Result<Vec<u8>>) {
    let Some(network) = network.upgrade() else {
        return;
    };
    let result = match body {
        Ok(body) => network.send(target, port, port, body).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(port, target = %target, error = %e, "publication failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestRecord {
        hash: [u8; 32],
        owner: Option<HostId>,
        timestamp: u64,
        valid: bool,
    }

    impl StoredRecord for TestRecord {
        fn record_hash(&self) -> [u8; 32] {
            self.hash
        }
        fn suffix(&self) -> Option<HostId> {
            self.owner
        }
        fn timestamp(&self) -> u64 {
            self.timestamp
        }
        fn verify(&self) -> Result<(), RecordRejection> {
            if self.valid {
                Ok(())
            } else {
                Err(RecordRejection::InvalidSignature)
            }
        }
    }

    const NOW: u64 = 10_000_000;

    fn config(max_records: usize) -> DhtConfig {
        DhtConfig {
            max_records,
            max_record_age: Duration::from_secs(60),
            discard_interval: Duration::from_secs(1),
            ..DhtConfig::default()
        }
    }

    fn record(hash: u8, timestamp: u64) -> TestRecord {
        TestRecord {
            hash: [hash; 32],
            owner: None,
            timestamp,
            valid: true,
        }
    }

    fn store(max_records: usize) -> RecordStore<TestRecord> {
        RecordStore::new(HostId::from_bytes([0; 20]), &config(max_records), NOW)
    }

    #[test]
    fn older_or_equal_timestamps_never_overwrite() {
        let mut s = store(10);
        assert_eq!(s.insert(1, record(1, NOW), NOW), Ok(true));
        assert_eq!(s.insert(1, record(1, NOW), NOW), Ok(false));
        assert_eq!(s.insert(1, record(1, NOW - 1), NOW), Ok(false));
        assert_eq!(s.insert(1, record(1, NOW + 1), NOW), Ok(true));
        assert_eq!(s.get(1, &[1; 32], None, NOW).unwrap().timestamp, NOW + 1);
    }

    #[test]
    fn invalid_and_expired_records_are_rejected() {
        let mut s = store(10);
        let mut forged = record(1, NOW);
        forged.valid = false;
        assert_eq!(s.insert(1, forged, NOW), Err(RecordRejection::InvalidSignature));
        assert_eq!(
            s.insert(1, record(2, NOW - 60_000), NOW),
            Err(RecordRejection::Expired)
        );
        assert!(s.is_empty());
    }

    #[test]
    fn instances_are_separate_namespaces() {
        let mut s = store(10);
        s.insert(1, record(1, NOW), NOW).unwrap();
        assert!(s.get(2, &[1; 32], None, NOW).is_none());
    }

    #[test]
    fn remove_requires_strictly_newer_timestamp() {
        let mut s = store(10);
        s.insert(1, record(1, NOW), NOW).unwrap();
        assert_eq!(s.remove(1, &record(1, NOW)), Ok(false));
        assert_eq!(s.remove(1, &record(1, NOW + 1)), Ok(true));
        assert!(s.get(1, &[1; 32], None, NOW).is_none());
    }

    #[test]
    fn full_store_evicts_farthest_record() {
        let mut s = store(2);
        // Local ID is zero, so the hash byte is the distance.
        s.insert(1, record(0x01, NOW), NOW).unwrap();
        s.insert(1, record(0x80, NOW), NOW).unwrap();
        assert_eq!(s.insert(1, record(0x02, NOW), NOW), Ok(true));
        assert_eq!(s.len(), 2);
        assert!(s.get(1, &[0x80; 32], None, NOW).is_none());
        // A farther newcomer is itself the eviction victim.
        assert_eq!(s.insert(1, record(0xF0, NOW), NOW), Ok(false));
    }

    #[test]
    fn records_expire_after_max_age() {
        let mut s = store(10);
        s.insert(1, record(1, NOW), NOW).unwrap();
        assert!(s.get(1, &[1; 32], None, NOW + 59_000).is_some());
        assert!(s.get(1, &[1; 32], None, NOW + 60_000).is_none());
        assert_eq!(s.expire(NOW + 62_000), 1);
        assert!(s.is_empty());
    }

    #[test]
    fn refreshed_records_survive_stale_expiry_entries() {
        let mut s = store(10);
        s.insert(1, record(1, NOW), NOW).unwrap();
        s.insert(1, record(1, NOW + 30_000), NOW + 30_000).unwrap();
        assert_eq!(s.expire(NOW + 62_000), 0);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn closest_orders_by_distance_to_origin() {
        let mut s = store(10);
        for owner in [0x10u8, 0x01, 0x40, 0x02] {
            let mut r = record(7, NOW);
            r.owner = Some(HostId::from_bytes([owner; 20]));
            s.insert(1, r, NOW).unwrap();
        }
        let origin = HostId::from_bytes([0x00; 20]);
        let owners: Vec<u8> = s
            .closest(1, &[7; 32], &origin, 3, NOW)
            .iter()
            .map(|r| r.owner.unwrap().as_bytes()[0])
            .collect();
        assert_eq!(owners, vec![0x01, 0x02, 0x10]);
    }

    #[tokio::test]
    async fn actor_serves_commands() {
        let store: Store<TestRecord> = Store::spawn(HostId::from_bytes([0; 20]), &config(10));
        let now = now_ms();
        assert!(store.insert(3, record(5, now)).await.unwrap());
        assert!(store.get(3, [5; 32], None).await.unwrap().is_some());
        assert_eq!(store.len().await.unwrap(), 1);

        store.close().await;
        tokio::task::yield_now().await;
        assert!(store.len().await.is_err());
    }

    #[tokio::test]
    async fn registry_delivers_until_closed() {
        let registry: Arc<RequestRegistry<u32>> = RequestRegistry::new();
        let mut pending = registry.register(Duration::from_secs(5)).unwrap();
        assert!(registry.deliver(pending.id(), 7));
        assert_eq!(pending.recv().await, Some(7));

        let id = pending.id();
        pending.close();
        assert!(!registry.deliver(id, 8));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn registry_recv_times_out() {
        let registry: Arc<RequestRegistry<u32>> = RequestRegistry::new();
        let mut pending = registry.register(Duration::from_millis(20)).unwrap();
        assert_eq!(pending.recv().await, None);
        drop(pending);
        assert!(registry.is_empty());
    }
}
