//! # Bootstrap
//!
//! Binds logical networks to each new peer.
//!
//! Every peer gets a [`BootstrapSession`] speaking on two peer ports:
//!
//! | Port | Traffic |
//! |------|---------|
//! | [`NETWORK_INIT_PORT`] | [`NetworkBindings`] requests and replies |
//! | [`NETWORK_BROKER_PORT`] | the [`Broker`] finding the shared network keys |
//!
//! ```text
//! broker Keys ──► reserve ports ──► bindings ────────► check, link, reply
//!                                                            │
//!           link each accepted binding ◄── reply bindings ◄──┘
//! ```
//!
//! The side that learns the shared keys requests; the other only answers.
//! Both sides may request at once (rounds restart whenever a network is
//! added), so requests are answered even while a reply is awaited. A request
//! for a network with a request of our own in flight is answered with the
//! port already offered, which leaves both sides with matching links.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::broker::{Broker, BrokerEvent};
use crate::certificate::verify_certificate;
use crate::event::{NetworkEvent, PeerNetworkEvent};
use crate::frame::{FrameReader, FrameWriter, MAX_CHANNEL_MESSAGE};
use crate::identity::{key_label, HostId, PublicKey};
use crate::messages::{deserialize_bounded, serialize, NetworkBinding, NetworkBindings};
use crate::network::Network;
use crate::node::Node;
use crate::peer::{Peer, NETWORK_BROKER_PORT, NETWORK_INIT_PORT, RESERVED_PORT_COUNT};
use crate::protocols::PeerHandler;

/// Installed on the host by [`Node`]; starts a session per peer.
pub(crate) struct Bootstrap {
    pub(crate) node: Weak<Node>,
}

#[async_trait]
impl PeerHandler for Bootstrap {
    async fn handle_peer(&self, peer: Arc<Peer>) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        match BootstrapSession::new(&node, peer.clone()) {
            Ok(session) => {
                tokio::spawn(session.run());
            }
            Err(e) => {
                warn!(host = %node.host().id(), peer = %peer.host_id(), error = %e, "bootstrap not started");
                peer.remove_handler(NETWORK_INIT_PORT);
                peer.remove_handler(NETWORK_BROKER_PORT);
            }
        }
    }
}

struct BootstrapSession {
    node: Weak<Node>,
    host_id: HostId,
    peer: Arc<Peer>,
    reader: FrameReader,
    writer: FrameWriter,
    broker: Box<dyn Broker>,
    discriminator: u16,
    timeout: Duration,
    subscription: u64,
    networks_rx: mpsc::Receiver<NetworkEvent>,
    /// Local peer port of each bound network.
    links: HashMap<PublicKey, u16>,
    /// Ports offered by the request in flight.
    offered: HashMap<PublicKey, u16>,
}

impl BootstrapSession {
    fn new(node: &Arc<Node>, peer: Arc<Peer>) -> Result<Self> {
        let (reader, writer) = peer.channel(NETWORK_INIT_PORT);
        let (broker_reader, broker_writer) = peer.channel(NETWORK_BROKER_PORT);
        let broker = node
            .broker_factory()
            .new_broker(broker_reader, broker_writer)?;
        let host_id = node.host().id();
        let (subscription, networks_rx) = node.subscribe_networks();

        Ok(Self {
            node: Arc::downgrade(node),
            host_id,
            discriminator: (peer.host_id() < host_id) as u16,
            peer,
            reader,
            writer,
            broker,
            timeout: node.config().broker_timeout,
            subscription,
            networks_rx,
            links: HashMap::new(),
            offered: HashMap::new(),
        })
    }

    fn node(&self) -> Result<Arc<Node>> {
        self.node.upgrade().ok_or_else(|| anyhow!("node closed"))
    }

    async fn run(mut self) {
        let peer_id = self.peer.host_id();
        if let Err(e) = self.init_broker().await {
            debug!(host = %self.host_id, peer = %peer_id, error = %e, "broker init failed");
        }

        loop {
            tokio::select! {
                event = self.broker.next_event() => match event {
                    Some(BrokerEvent::Keys(keys)) => {
                        if let Err(e) = self.request_bindings(keys).await {
                            warn!(host = %self.host_id, peer = %peer_id, error = %e, "network binding failed");
                        }
                    }
                    Some(BrokerEvent::InitRequired) => {
                        if let Err(e) = self.init_broker().await {
                            debug!(host = %self.host_id, peer = %peer_id, error = %e, "broker init failed");
                            break;
                        }
                    }
                    None => {
                        debug!(host = %self.host_id, peer = %peer_id, "broker stopped");
                        break;
                    }
                },
                message = self.reader.read_message(MAX_CHANNEL_MESSAGE) => match message {
                    Ok(bytes) => {
                        if let Err(e) = self.handle_bindings(&bytes).await {
                            debug!(host = %self.host_id, peer = %peer_id, error = %e, "bindings dropped");
                        }
                    }
                    Err(_) => break,
                },
                event = self.networks_rx.recv() => match event {
                    Some(NetworkEvent::Added { .. }) => {
                        if let Err(e) = self.init_broker().await {
                            debug!(host = %self.host_id, peer = %peer_id, error = %e, "broker init failed");
                            break;
                        }
                    }
                    Some(NetworkEvent::Removed { key }) => self.forget(key),
                    None => break,
                },
                _ = self.peer.done() => break,
            }
        }

        self.shutdown().await;
    }

    async fn init_broker(&mut self) -> Result<()> {
        let keys = self.node()?.network_keys();
        trace!(host = %self.host_id, peer = %self.peer.host_id(), networks = keys.len(), "broker init");
        self.broker.init(self.discriminator, keys).await
    }

    async fn send(&mut self, is_reply: bool, bindings: Vec<NetworkBinding>) -> Result<()> {
        let body = serialize(&NetworkBindings { is_reply, bindings })?;
        self.writer.write_message(&body).await
    }

    /// Offer a port for every shared network not bound yet and link the
    /// networks the peer accepts.
    async fn request_bindings(&mut self, keys: Vec<PublicKey>) -> Result<()> {
        let node = self.node()?;
        let mut bindings = Vec::new();
        for key in keys {
            if self.links.contains_key(&key) {
                continue;
            }
            let Some(services) = node.network(&key) else {
                continue;
            };
            let port = match self.peer.reserve_port() {
                Ok(port) => port,
                Err(e) => {
                    warn!(host = %self.host_id, error = %e, "no peer port for network binding");
                    break;
                }
            };
            self.offered.insert(key, port);
            bindings.push(NetworkBinding {
                port: u32::from(port),
                certificate: services.network.certificate().clone(),
            });
        }
        if bindings.is_empty() {
            return Ok(());
        }
        debug!(host = %self.host_id, peer = %self.peer.host_id(), networks = bindings.len(), "requesting network bindings");

        let result = match self.send(false, bindings).await {
            Ok(()) => match tokio::time::timeout(self.timeout, self.await_reply()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("timed out waiting for network bindings")),
            },
            Err(e) => Err(e),
        };
        if let Ok(reply) = &result {
            for binding in &reply.bindings {
                self.accept_reply(&node, binding).await;
            }
        }

        for (_, port) in self.offered.drain() {
            self.peer.release_port(port);
        }
        result.map(|_| ())
    }

    /// Read until the reply arrives, answering the peer's own requests.
    async fn await_reply(&mut self) -> Result<NetworkBindings> {
        loop {
            let bytes = self.reader.read_message(MAX_CHANNEL_MESSAGE).await?;
            let message: NetworkBindings = deserialize_bounded(&bytes)?;
            if message.is_reply {
                return Ok(message);
            }
            self.answer(message).await?;
        }
    }

    async fn handle_bindings(&mut self, bytes: &[u8]) -> Result<()> {
        let message: NetworkBindings = deserialize_bounded(bytes)?;
        if message.is_reply {
            bail!("unsolicited bindings reply");
        }
        self.answer(message).await
    }

    async fn answer(&mut self, request: NetworkBindings) -> Result<()> {
        let node = self.node()?;
        let mut answers = Vec::new();
        for binding in &request.bindings {
            let network = match self.check_binding(&node, binding) {
                Ok(network) => network,
                Err(e) => {
                    warn!(host = %self.host_id, peer = %self.peer.host_id(), error = %e, "network binding rejected");
                    continue;
                }
            };
            let key = network.key();
            let local_port = match self.offered.remove(&key) {
                Some(port) => port,
                None => {
                    if self.links.contains_key(&key) {
                        self.unlink(&network, key).await;
                    }
                    match self.peer.reserve_port() {
                        Ok(port) => port,
                        Err(e) => {
                            warn!(host = %self.host_id, peer = %self.peer.host_id(), error = %e, "no peer port for network binding");
                            continue;
                        }
                    }
                }
            };
            if self.link(&network, local_port, binding.port as u16).await {
                answers.push(NetworkBinding {
                    port: u32::from(local_port),
                    certificate: network.certificate().clone(),
                });
            }
        }
        self.send(true, answers).await
    }

    async fn accept_reply(&mut self, node: &Arc<Node>, binding: &NetworkBinding) {
        let key = binding.certificate.root().key;
        let Some(local_port) = self.offered.remove(&key) else {
            trace!(host = %self.host_id, network = %key_label(&key), "binding already settled");
            return;
        };
        match self.check_binding(node, binding) {
            Ok(network) => {
                self.link(&network, local_port, binding.port as u16).await;
            }
            Err(e) => {
                warn!(host = %self.host_id, peer = %self.peer.host_id(), error = %e, "network binding rejected");
                self.peer.release_port(local_port);
            }
        }
    }

    fn check_binding(&self, node: &Node, binding: &NetworkBinding) -> Result<Arc<Network>> {
        verify_certificate(&binding.certificate)?;
        if Some(binding.certificate.key) != self.peer.profile_key() {
            bail!("membership certificate not issued to the peer's profile");
        }
        let key = binding.certificate.root().key;
        let services = node
            .network(&key)
            .ok_or_else(|| anyhow!("not a member of network {}", key_label(&key)))?;
        if services.network.key() != key {
            bail!("network root mismatch");
        }
        if binding.port < u32::from(RESERVED_PORT_COUNT) || binding.port > u32::from(u16::MAX) {
            bail!("binding port {} out of range", binding.port);
        }
        Ok(services.network)
    }

    /// Route `network` over the peer. Releases `local_port` when the network
    /// has no room for the link.
    async fn link(&mut self, network: &Arc<Network>, local_port: u16, remote_port: u16) -> bool {
        let key = network.key();
        let peer_id = self.peer.host_id();
        match network.add_link(&self.peer, local_port, remote_port).await {
            Ok(true) => {
                self.links.insert(key, local_port);
                if let Ok(node) = self.node() {
                    node.peer_network_events()
                        .emit(PeerNetworkEvent::Added { key, host_id: peer_id });
                }
                debug!(host = %self.host_id, peer = %peer_id, network = %key_label(&key), "network bound");
                true
            }
            Ok(false) => {
                debug!(host = %self.host_id, peer = %peer_id, network = %key_label(&key), "network has no room for peer");
                self.peer.release_port(local_port);
                false
            }
            Err(e) => {
                warn!(host = %self.host_id, peer = %peer_id, error = %e, "network link failed");
                self.peer.release_port(local_port);
                false
            }
        }
    }

    async fn unlink(&mut self, network: &Network, key: PublicKey) {
        let peer_id = self.peer.host_id();
        network.remove_link(&peer_id).await;
        self.forget(key);
    }

    fn forget(&mut self, key: PublicKey) {
        if self.links.remove(&key).is_none() {
            return;
        }
        if let Ok(node) = self.node() {
            node.peer_network_events().emit(PeerNetworkEvent::Removed {
                key,
                host_id: self.peer.host_id(),
            });
        }
    }

    async fn shutdown(mut self) {
        let peer_id = self.peer.host_id();
        self.broker.close();
        self.peer.remove_handler(NETWORK_INIT_PORT);
        self.peer.remove_handler(NETWORK_BROKER_PORT);
        for (_, port) in self.offered.drain() {
            self.peer.release_port(port);
        }

        let Ok(node) = self.node() else {
            return;
        };
        node.network_events().unsubscribe(self.subscription);
        let keys: Vec<PublicKey> = self.links.keys().copied().collect();
        for key in keys {
            if let Some(services) = node.network(&key) {
                services.network.remove_link(&peer_id).await;
            }
            self.forget(key);
        }
        debug!(host = %self.host_id, peer = %peer_id, "bootstrap finished");
    }
}
