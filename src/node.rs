//! # High-Level Node API
//!
//! A [`Node`] is the main entry point of the overlay. It owns the [`Host`],
//! the arena of joined logical networks, the DHT record stores shared by
//! every network, and the event registries.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::new(profile, Config::default(), broker_factory, Some(dialer))?;
//!
//! // Join a network with a membership certificate issued by its CA
//! let services = node.add_network(membership).await?;
//!
//! // Links handed to the node are bound to every shared network
//! node.add_link(Box::new(link)).await?;
//!
//! // Publish a record and read it back
//! let publisher = services.hash_table.set(&profile, b"salt", b"value".to_vec());
//! let mut values = services.hash_table.get(&key, b"salt", timeout).await?;
//! ```
//!
//! ## Services per network
//!
//! | Port | Service |
//! |------|---------|
//! | [`HASH_TABLE_PORT`] | [`HashTable`] |
//! | [`PEER_INDEX_PORT`] | [`PeerIndex`] |
//! | [`PEER_EXCHANGE_PORT`] | [`PeerExchange`] |

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bootstrap::Bootstrap;
use crate::broker::BrokerFactory;
use crate::certificate::{verify_certificate, Certificate};
use crate::config::Config;
use crate::crypto::random_u32;
use crate::event::{NetworkEvent, Observers, PeerNetworkEvent};
use crate::hash_table::{HashTable, HashTableStore};
use crate::host::Host;
use crate::identity::{key_label, Keypair, PublicKey};
use crate::link::Link;
use crate::network::{Network, HASH_TABLE_PORT, PEER_EXCHANGE_PORT, PEER_INDEX_PORT};
use crate::peer::Peer;
use crate::peer_exchange::PeerExchange;
use crate::peer_index::{PeerIndex, PeerIndexStore};
use crate::protocols::MediatedDialer;

/// A joined network and the services running on it.
#[derive(Clone)]
pub struct NetworkServices {
    pub network: Arc<Network>,
    pub hash_table: Arc<HashTable>,
    pub peer_index: Arc<PeerIndex>,
    pub peer_exchange: Arc<PeerExchange>,
}

pub struct Node {
    host: Arc<Host>,
    config: Config,
    broker_factory: Arc<dyn BrokerFactory>,
    hash_table_store: HashTableStore,
    peer_index_store: PeerIndexStore,
    networks: RwLock<HashMap<PublicKey, NetworkServices>>,
    network_events: Observers<NetworkEvent>,
    peer_network_events: Observers<PeerNetworkEvent>,
}

impl Node {
    /// Create a node for `profile`. Must be called inside a tokio runtime.
    ///
    /// `dialer` opens the direct links peer exchange negotiates; without one
    /// links can only be added with [`Node::add_link`].
    pub fn new(
        profile: Keypair,
        config: Config,
        broker_factory: Arc<dyn BrokerFactory>,
        dialer: Option<Arc<dyn MediatedDialer>>,
    ) -> Result<Arc<Self>> {
        config.validate().context("invalid overlay config")?;

        let host = Host::new(
            profile,
            config.host_cert_validity,
            config.handshake_timeout,
            dialer,
        )?;
        host.set_max_peers(config.max_peers);

        let node = Arc::new(Self {
            hash_table_store: HashTableStore::spawn(host.id(), &config.hash_table),
            peer_index_store: PeerIndexStore::spawn(host.id(), &config.peer_index),
            host,
            config,
            broker_factory,
            networks: RwLock::new(HashMap::new()),
            network_events: Observers::new(),
            peer_network_events: Observers::new(),
        });
        node.host.add_peer_handler(Arc::new(Bootstrap {
            node: Arc::downgrade(&node),
        }));

        info!(host = %node.host.id(), "node started");
        Ok(node)
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn broker_factory(&self) -> &Arc<dyn BrokerFactory> {
        &self.broker_factory
    }

    pub(crate) fn network_events(&self) -> &Observers<NetworkEvent> {
        &self.network_events
    }

    pub(crate) fn peer_network_events(&self) -> &Observers<PeerNetworkEvent> {
        &self.peer_network_events
    }

    /// Authenticate `link` and bind the networks shared with its peer.
    pub async fn add_link(&self, link: Box<dyn Link>) -> Result<Arc<Peer>> {
        self.host.add_link(link).await
    }

    // ========================================================================
    // Networks
    // ========================================================================

    /// Join the network `membership` was issued for.
    pub async fn add_network(&self, membership: Certificate) -> Result<NetworkServices> {
        verify_certificate(&membership).context("invalid membership certificate")?;
        if membership.key != self.host.profile_key() {
            bail!("membership certificate was not issued to this profile");
        }
        let key = membership.root().key;
        if self.arena().contains_key(&key) {
            bail!("already a member of network {}", key_label(&key));
        }

        let network = Network::new(self.host.clone(), membership, &self.config);
        let (hash_table_instance, peer_index_instance) = self.instance_ids()?;
        let hash_table = HashTable::new(
            &network,
            self.hash_table_store.clone(),
            hash_table_instance,
            self.config.hash_table.clone(),
        );
        let peer_index = PeerIndex::new(
            &network,
            self.peer_index_store.clone(),
            peer_index_instance,
            self.config.peer_index.clone(),
        );
        let peer_exchange = PeerExchange::new(&network, self.config.dial_timeout);

        network.set_handler(HASH_TABLE_PORT, hash_table.clone()).await;
        network.set_handler(PEER_INDEX_PORT, peer_index.clone()).await;
        network.set_handler(PEER_EXCHANGE_PORT, peer_exchange.clone()).await;

        let services = NetworkServices {
            network,
            hash_table,
            peer_index,
            peer_exchange,
        };

        let duplicate = {
            let mut networks = self.networks.write().unwrap_or_else(PoisonError::into_inner);
            if networks.contains_key(&key) {
                true
            } else {
                networks.insert(key, services.clone());
                false
            }
        };
        if duplicate {
            services.network.close().await;
            bail!("already a member of network {}", key_label(&key));
        }

        info!(host = %self.host.id(), network = %key_label(&key), "network added");
        self.network_events.emit(NetworkEvent::Added { key });
        Ok(services)
    }

    /// Leave the network with root `key`, dropping its links.
    pub async fn remove_network(&self, key: &PublicKey) -> Result<()> {
        let services = self
            .networks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .ok_or_else(|| anyhow!("not a member of network {}", key_label(key)))?;

        services.peer_exchange.close();
        let links = services.network.close().await;
        info!(host = %self.host.id(), network = %key_label(key), links = links.len(), "network removed");
        self.network_events.emit(NetworkEvent::Removed { key: *key });
        Ok(())
    }

    fn arena(&self) -> RwLockReadGuard<'_, HashMap<PublicKey, NetworkServices>> {
        self.networks.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn network(&self, key: &PublicKey) -> Option<NetworkServices> {
        self.arena().get(key).cloned()
    }

    pub fn networks(&self) -> Vec<NetworkServices> {
        self.arena().values().cloned().collect()
    }

    pub fn network_keys(&self) -> Vec<PublicKey> {
        self.arena().keys().copied().collect()
    }

    /// Fresh instance IDs for the two DHT services of a new network, unused
    /// by any joined network.
    fn instance_ids(&self) -> Result<(u32, u32)> {
        let mut used: HashSet<u32> = self
            .arena()
            .values()
            .flat_map(|s| [s.hash_table.instance(), s.peer_index.instance()])
            .collect();
        let mut fresh = || -> Result<u32> {
            loop {
                let id = random_u32()?;
                if used.insert(id) {
                    return Ok(id);
                }
            }
        };
        let hash_table = fresh()?;
        Ok((hash_table, fresh()?))
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Networks joined or left from now on. Pass the handle to
    /// [`Node::unsubscribe_networks`] to stop.
    pub fn subscribe_networks(&self) -> (u64, mpsc::Receiver<NetworkEvent>) {
        self.network_events.subscribe()
    }

    pub fn unsubscribe_networks(&self, handle: u64) {
        self.network_events.unsubscribe(handle);
    }

    /// Peers bound to or unbound from a network from now on.
    pub fn subscribe_peer_networks(&self) -> (u64, mpsc::Receiver<PeerNetworkEvent>) {
        self.peer_network_events.subscribe()
    }

    pub fn unsubscribe_peer_networks(&self, handle: u64) {
        self.peer_network_events.unsubscribe(handle);
    }

    /// Leave every network, close every peer and stop the record stores.
    pub async fn close(&self) {
        for key in self.network_keys() {
            if let Err(e) = self.remove_network(&key).await {
                debug!(host = %self.host.id(), error = %e, "network already removed");
            }
        }
        self.host.close().await;
        self.hash_table_store.close().await;
        self.peer_index_store.close().await;
        info!(host = %self.host.id(), "node closed");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("host", &self.host.id())
            .field("networks", &self.network_keys().len())
            .finish_non_exhaustive()
    }
}
