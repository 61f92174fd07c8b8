//! Overlay tunables.
//!
//! Defaults follow the values the protocol was deployed with; every field can
//! be overridden before constructing a [`Node`](crate::node::Node).

use std::time::Duration;

use anyhow::{bail, Result};

/// Kademlia bucket size for network links.
pub const DEFAULT_LINK_BUCKET_SIZE: usize = 20;
/// Hops after which a relayed message is dropped.
pub const DEFAULT_MAX_MESSAGE_HOPS: usize = 5;
/// Links a relay fans out to on the first hop.
pub const DEFAULT_MAX_MESSAGE_REPLICAS: usize = 5;
pub const DEFAULT_RECENT_MESSAGE_IDS: usize = 1024;
pub const DEFAULT_RECENT_MESSAGE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_NEXT_HOP_CACHE_SIZE: usize = 4096;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HOST_CERT_VALIDITY: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_BROKER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);
/// 0 disables the limit.
pub const DEFAULT_MAX_PEERS: usize = 0;

pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_DISCARD_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RECORD_AGE: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_RECORDS: usize = 5120;
pub const DEFAULT_SEARCH_RESPONSE_SIZE: usize = 5;

/// Settings of one DHT service (hash table or peer index).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtConfig {
    pub publish_interval: Duration,
    pub discard_interval: Duration,
    pub max_record_age: Duration,
    pub max_records: usize,
    /// Records returned per peer index search response.
    pub search_response_size: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            discard_interval: DEFAULT_DISCARD_INTERVAL,
            max_record_age: DEFAULT_MAX_RECORD_AGE,
            max_records: DEFAULT_MAX_RECORDS,
            search_response_size: DEFAULT_SEARCH_RESPONSE_SIZE,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.publish_interval.is_zero() || self.discard_interval.is_zero() {
            bail!("DHT intervals must be non-zero");
        }
        if self.max_record_age.as_secs() == 0 {
            bail!("max_record_age must be at least one second");
        }
        if self.max_records == 0 {
            bail!("max_records must be non-zero");
        }
        if self.search_response_size == 0 {
            bail!("search_response_size must be non-zero");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub link_bucket_size: usize,
    pub max_message_hops: usize,
    pub max_message_replicas: usize,
    pub recent_message_ids: usize,
    pub recent_message_ttl: Duration,
    pub next_hop_cache_size: usize,
    pub handshake_timeout: Duration,
    pub host_cert_validity: Duration,
    pub broker_timeout: Duration,
    pub dial_timeout: Duration,
    pub max_peers: usize,
    pub hash_table: DhtConfig,
    pub peer_index: DhtConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link_bucket_size: DEFAULT_LINK_BUCKET_SIZE,
            max_message_hops: DEFAULT_MAX_MESSAGE_HOPS,
            max_message_replicas: DEFAULT_MAX_MESSAGE_REPLICAS,
            recent_message_ids: DEFAULT_RECENT_MESSAGE_IDS,
            recent_message_ttl: DEFAULT_RECENT_MESSAGE_TTL,
            next_hop_cache_size: DEFAULT_NEXT_HOP_CACHE_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            host_cert_validity: DEFAULT_HOST_CERT_VALIDITY,
            broker_timeout: DEFAULT_BROKER_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_peers: DEFAULT_MAX_PEERS,
            hash_table: DhtConfig::default(),
            peer_index: DhtConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.link_bucket_size == 0 {
            bail!("link_bucket_size must be non-zero");
        }
        if self.max_message_hops == 0 {
            bail!("max_message_hops must be non-zero");
        }
        if self.max_message_replicas == 0 {
            bail!("max_message_replicas must be non-zero");
        }
        if self.recent_message_ids == 0 || self.recent_message_ttl.is_zero() {
            bail!("recent message cache must be non-empty");
        }
        if self.next_hop_cache_size == 0 {
            bail!("next_hop_cache_size must be non-zero");
        }
        if self.handshake_timeout.is_zero()
            || self.broker_timeout.is_zero()
            || self.dial_timeout.is_zero()
        {
            bail!("timeouts must be non-zero");
        }
        if self.host_cert_validity.as_secs() == 0 {
            bail!("host_cert_validity must be at least one second");
        }
        self.hash_table.validate()?;
        self.peer_index.validate()?;
        Ok(())
    }
}
