//! # Network
//!
//! One logical network: a kademlia-routed message bus over the links this
//! host shares with other members.
//!
//! ## Routing
//!
//! Every relay appends its trailer and forwards toward the links nearest the
//! destination:
//!
//! 1. addressed to this host: dispatch to the port handler, never relay
//! 2. reserved port (< 1000): the handler decides whether to keep relaying
//! 3. already relayed by this host, or out of hops: drop
//! 4. otherwise fan out to up to `max(1, replicas - hops)` links, or only the
//!    destination link when it is known
//!
//! Inbound frames must end with a trailer signed by the peer that delivered
//! them. The trailer chain also yields next-hop hints: a host seen `n` hops
//! behind a peer is reachable through that peer.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

use crate::certificate::Certificate;
use crate::config::Config;
use crate::frame::{Frame, FrameWriter, WireError, MAX_FRAME_BODY};
use crate::host::Host;
use crate::identity::{key_label, now_ms, HostId, PublicKey};
use crate::kbucket::{BucketEntry, InsertOutcome, KBucket};
use crate::message::{Message, MessageId, MESSAGE_HEADER_LEN, TRAILER_LEN};
use crate::peer::{Peer, RESERVED_PORT_COUNT};
use crate::protocols::{FrameHandler, MessageHandler};
use crate::queue::DiscardQueue;

pub const HASH_TABLE_PORT: u16 = 10;
pub const PEER_INDEX_PORT: u16 = 11;
pub const PEER_EXCHANGE_PORT: u16 = 12;

const PORT_RESERVE_ATTEMPTS: usize = 1024;

/// Routing edge to one member: frames go out through `writer`, frames from it
/// arrive on `local_port` of the shared peer.
#[derive(Clone, Debug)]
pub struct NetworkLink {
    pub host_id: HostId,
    pub local_port: u16,
    pub writer: FrameWriter,
}

impl BucketEntry for NetworkLink {
    fn host_id(&self) -> HostId {
        self.host_id
    }
}

struct NetworkState {
    links: KBucket<NetworkLink>,
    handlers: HashMap<u16, Arc<dyn MessageHandler>>,
    reservations: HashSet<u16>,
}

pub struct Network {
    host: Arc<Host>,
    host_id: HostId,
    key: PublicKey,
    certificate: Certificate,
    max_hops: usize,
    replicas: usize,
    seq: AtomicU16,
    state: Mutex<NetworkState>,
    recent: StdMutex<DiscardQueue<MessageId>>,
    next_hop: StdMutex<LruCache<HostId, (HostId, usize)>>,
    closed_tx: watch::Sender<bool>,
}

impl Network {
    /// `certificate` is this host's membership certificate; the network key is
    /// its root key.
    pub fn new(host: Arc<Host>, certificate: Certificate, config: &Config) -> Arc<Self> {
        let host_id = host.id();
        let key = certificate.root().key;
        let cache_size = NonZeroUsize::new(config.next_hop_cache_size).unwrap_or(NonZeroUsize::MIN);
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            host,
            host_id,
            key,
            certificate,
            max_hops: config.max_message_hops,
            replicas: config.max_message_replicas,
            seq: AtomicU16::new(0),
            state: Mutex::new(NetworkState {
                links: KBucket::new(host_id, config.link_bucket_size),
                handlers: HashMap::new(),
                reservations: HashSet::new(),
            }),
            recent: StdMutex::new(DiscardQueue::new(
                config.recent_message_ids,
                config.recent_message_ttl.as_millis() as u64,
                now_ms(),
            )),
            next_hop: StdMutex::new(LruCache::new(cache_size)),
            closed_tx,
        })
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    // ========================================================================
    // Ports
    // ========================================================================

    /// Install `handler` on `port`, reserving the port.
    pub async fn set_handler(&self, port: u16, handler: Arc<dyn MessageHandler>) {
        let mut state = self.state.lock().await;
        state.reservations.insert(port);
        state.handlers.insert(port, handler);
    }

    pub async fn remove_handler(&self, port: u16) -> Option<Arc<dyn MessageHandler>> {
        let mut state = self.state.lock().await;
        state.reservations.remove(&port);
        state.handlers.remove(&port)
    }

    pub async fn handler(&self, port: u16) -> Option<Arc<dyn MessageHandler>> {
        self.state.lock().await.handlers.get(&port).cloned()
    }

    /// Reserve a random unused port at or above [`RESERVED_PORT_COUNT`].
    pub async fn reserve_port(&self) -> Result<u16> {
        let mut state = self.state.lock().await;
        let mut rng = rand::thread_rng();
        for _ in 0..PORT_RESERVE_ATTEMPTS {
            let port = rng.gen_range(RESERVED_PORT_COUNT..=u16::MAX);
            if state.reservations.insert(port) {
                return Ok(port);
            }
        }
        Err(anyhow!("no free port in network {}", key_label(&self.key)))
    }

    pub async fn release_port(&self, port: u16) {
        self.state.lock().await.reservations.remove(&port);
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Route this network over `peer`: frames from it arrive on `local_port`,
    /// frames to it go to its `remote_port`. Returns false when the routing
    /// table has no room or the peer is already linked.
    pub async fn add_link(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        local_port: u16,
        remote_port: u16,
    ) -> Result<bool> {
        if self.is_closed() {
            bail!("network {} is closed", key_label(&self.key));
        }
        let link = NetworkLink {
            host_id: peer.host_id(),
            local_port,
            writer: peer.frame_writer(remote_port),
        };
        peer.set_handler(
            local_port,
            Arc::new(LinkFrameHandler {
                network: Arc::downgrade(self),
            }),
        );

        let outcome = self.state.lock().await.links.insert(link);
        match outcome {
            InsertOutcome::Inserted => {}
            InsertOutcome::Replaced(evicted) => {
                debug!(
                    network = %key_label(&self.key),
                    evicted = %evicted.host_id,
                    "link evicted by nearer peer"
                );
                self.detach(evicted).await;
            }
            InsertOutcome::Full | InsertOutcome::Duplicate => {
                peer.remove_handler(local_port);
                return Ok(false);
            }
        }
        debug!(network = %key_label(&self.key), peer = %peer.host_id(), local_port, remote_port, "link added");
        Ok(true)
    }

    pub async fn remove_link(&self, host_id: &HostId) -> Option<NetworkLink> {
        let link = self.state.lock().await.links.remove(host_id)?;
        self.detach(link.clone()).await;
        debug!(network = %key_label(&self.key), peer = %host_id, "link removed");
        Some(link)
    }

    pub async fn has_link(&self, host_id: &HostId) -> bool {
        self.state.lock().await.links.contains(host_id)
    }

    pub async fn link_count(&self) -> usize {
        self.state.lock().await.links.len()
    }

    pub async fn link_ids(&self) -> Vec<HostId> {
        self.state
            .lock()
            .await
            .links
            .iter()
            .map(|l| l.host_id)
            .collect()
    }

    /// Uninstall a link's peer handler and free its peer port.
    async fn detach(&self, mut link: NetworkLink) {
        link.writer.close();
        if let Some(peer) = self.host.peer(&link.host_id).await {
            peer.remove_handler(link.local_port);
            peer.release_port(link.local_port);
        }
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Largest body that still fits one frame on every link after
    /// `max_message_hops` trailers.
    pub async fn max_body_len(&self) -> usize {
        let frame = self
            .state
            .lock()
            .await
            .links
            .iter()
            .map(|l| l.writer.capacity())
            .fold(MAX_FRAME_BODY, usize::min);
        frame.saturating_sub(MESSAGE_HEADER_LEN + self.max_hops * TRAILER_LEN)
    }

    /// Send `body` from `src_port` to `dst_port` on `dst`.
    pub async fn send(&self, dst: HostId, dst_port: u16, src_port: u16, body: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            bail!("network {} is closed", key_label(&self.key));
        }
        let max = self.max_body_len().await;
        if body.len() > max {
            return Err(WireError::BodyTooLarge { len: body.len(), max }.into());
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let msg = Message::new(dst, dst_port, src_port, seq, body).context("invalid message")?;
        self.handle_message(msg).await
    }

    /// Frame arriving from a linked peer.
    pub async fn handle_frame(&self, peer: &Arc<Peer>, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let msg = Message::unmarshal(&frame.body)?;
        let last = msg
            .trailers
            .last()
            .ok_or_else(|| anyhow!("unsigned message from {}", peer.host_id()))?;
        if last.host_id != peer.host_id() {
            bail!("last trailer {} does not name sender {}", last.host_id, peer.host_id());
        }
        msg.verify_trailer(msg.hops() - 1, &peer.host_key())
            .map_err(|e| anyhow!("trailer from {} rejected: {}", peer.host_id(), e))?;

        self.record_hints(&msg);

        if let Some(id) = msg.id() {
            let fresh = self
                .recent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, now_ms());
            if !fresh {
                trace!(network = %key_label(&self.key), seq = id.seq, origin = %id.origin, "duplicate message");
                return Ok(());
            }
        }

        self.handle_message(msg).await
    }

    pub async fn handle_message(&self, msg: Message) -> Result<()> {
        let port = msg.header.dst_port;

        if msg.header.dst_id == self.host_id {
            match self.handler(port).await {
                Some(handler) => {
                    if let Err(e) = handler.handle_message(&msg).await {
                        debug!(network = %key_label(&self.key), port, error = %e, "message handler failed");
                    }
                }
                None => trace!(network = %key_label(&self.key), port, "no handler for local message"),
            }
            return Ok(());
        }

        if port < RESERVED_PORT_COUNT {
            if let Some(handler) = self.handler(port).await {
                match handler.handle_message(&msg).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(e) => {
                        debug!(network = %key_label(&self.key), port, error = %e, "dropping message");
                        return Ok(());
                    }
                }
            }
        }

        if msg.trailers_contain(&self.host_id) || msg.hops() >= self.max_hops {
            trace!(network = %key_label(&self.key), hops = msg.hops(), "message not relayed");
            return Ok(());
        }

        self.send_message(&msg).await;
        Ok(())
    }

    async fn send_message(&self, msg: &Message) {
        let dst = msg.header.dst_id;
        let hops = msg.hops();
        let bytes = msg.marshal(self.host.key(), &self.host_id);

        let hint = self.next_hop_for(&dst);
        let targets = {
            let state = self.state.lock().await;
            let mut links = state.links.closest(&dst, 2 * self.replicas);
            if links.first().is_some_and(|l| l.host_id == dst) {
                links.truncate(1);
            } else if let Some(via) = hint {
                if let Some(pos) = links.iter().position(|l| l.host_id == via) {
                    let link = links.remove(pos);
                    links.insert(0, link);
                } else if let Some(link) = state.links.get(&via) {
                    links.insert(0, link.clone());
                }
            }
            links
        };

        let limit = self.replicas.saturating_sub(hops).max(1);
        let mut written = 0;
        for link in targets {
            if msg.trailers_contain(&link.host_id) {
                continue;
            }
            if let Err(e) = link.writer.write_frame(&bytes).await {
                debug!(network = %key_label(&self.key), peer = %link.host_id, error = %e, "link write failed");
                continue;
            }
            trace!(network = %key_label(&self.key), dst = %dst, via = %link.host_id, "message relayed");
            written += 1;
            if link.host_id == dst || written >= limit {
                break;
            }
        }
    }

    fn record_hints(&self, msg: &Message) {
        let Some((last, earlier)) = msg.trailers.split_last() else {
            return;
        };
        let mut cache = self.next_hop.lock().unwrap_or_else(PoisonError::into_inner);
        for (i, trailer) in earlier.iter().enumerate() {
            if trailer.host_id == self.host_id {
                continue;
            }
            let distance = earlier.len() - i;
            let keep = match cache.peek(&trailer.host_id) {
                Some(&(via, known)) => distance < known || via == last.host_id,
                None => true,
            };
            if keep {
                cache.put(trailer.host_id, (last.host_id, distance));
            }
        }
    }

    fn next_hop_for(&self, dst: &HostId) -> Option<HostId> {
        self.next_hop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dst)
            .map(|&(via, _)| via)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop every link and handler. Returns the links that were removed.
    pub async fn close(&self) -> Vec<NetworkLink> {
        self.closed_tx.send_replace(true);
        let links = {
            let mut state = self.state.lock().await;
            state.handlers.clear();
            state.reservations.clear();
            state.links.clear()
        };
        for link in &links {
            self.detach(link.clone()).await;
        }
        debug!(network = %key_label(&self.key), links = links.len(), "network closed");
        links
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once the network is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("key", &key_label(&self.key))
            .field("host_id", &self.host_id)
            .finish_non_exhaustive()
    }
}

/// Installed on the peer port of each network link.
struct LinkFrameHandler {
    network: Weak<Network>,
}

#[async_trait]
impl FrameHandler for LinkFrameHandler {
    async fn handle_frame(&self, peer: &Arc<Peer>, frame: Frame) -> Result<()> {
        match self.network.upgrade() {
            Some(network) => network.handle_frame(peer, frame).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{issue_membership, KEY_USAGE_SIGN};
    use crate::identity::Keypair;
    use crate::link::memory_link_pair;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const HOUR: Duration = Duration::from_secs(3600);
    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Member {
        host: Arc<Host>,
        network: Arc<Network>,
    }

    fn members(count: usize) -> Vec<Member> {
        let ca = Keypair::generate();
        let root = Certificate::self_signed(&ca, KEY_USAGE_SIGN, "network", HOUR);
        let config = Config::default();
        (0..count)
            .map(|_| {
                let profile = Keypair::generate();
                let cert = issue_membership(&ca, &root, &profile, HOUR).unwrap();
                let host = Host::new(profile, HOUR, TIMEOUT, None).unwrap();
                let network = Network::new(host.clone(), cert, &config);
                Member { host, network }
            })
            .collect()
    }

    async fn connect(a: &Member, b: &Member) {
        let (la, lb) = memory_link_pair(1500);
        let (pa, pb) = tokio::join!(a.host.add_link(Box::new(la)), b.host.add_link(Box::new(lb)));
        let (pa, pb) = (pa.unwrap(), pb.unwrap());
        let port_a = pa.reserve_port().unwrap();
        let port_b = pb.reserve_port().unwrap();
        assert!(a.network.add_link(&pa, port_a, port_b).await.unwrap());
        assert!(b.network.add_link(&pb, port_b, port_a).await.unwrap());
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Message>,
        forward: bool,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, msg: &Message) -> Result<bool> {
            let _ = self.tx.send(msg.clone());
            Ok(self.forward)
        }
    }

    fn recorder(forward: bool) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { tx, forward }), rx)
    }

    #[tokio::test]
    async fn local_destination_is_dispatched() {
        let nodes = members(1);
        let (handler, mut rx) = recorder(true);
        nodes[0].network.set_handler(2000, handler).await;

        let me = nodes[0].network.host_id();
        nodes[0].network.send(me, 2000, 3000, b"hi".to_vec()).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.body, b"hi");
        assert_eq!(msg.header.src_port, 3000);
        assert_eq!(msg.hops(), 0);
    }

    #[tokio::test]
    async fn line_relay_appends_one_trailer_per_hop() {
        let nodes = members(3);
        connect(&nodes[0], &nodes[1]).await;
        connect(&nodes[1], &nodes[2]).await;

        let (handler, mut rx) = recorder(true);
        nodes[2].network.set_handler(2000, handler).await;

        let dst = nodes[2].network.host_id();
        nodes[0].network.send(dst, 2000, 2000, b"hello".to_vec()).await.unwrap();

        let msg = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        let chain: Vec<_> = msg.trailers.iter().map(|t| t.host_id).collect();
        assert_eq!(chain, vec![nodes[0].host.id(), nodes[1].host.id()]);
        assert!(msg.verify_trailer(0, &nodes[0].host.key().public_key_bytes()).is_ok());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reserved_port_handler_can_stop_relay() {
        let nodes = members(3);
        connect(&nodes[0], &nodes[1]).await;
        connect(&nodes[1], &nodes[2]).await;

        let (relay, mut relay_rx) = recorder(false);
        nodes[1].network.set_handler(HASH_TABLE_PORT, relay).await;
        let (sink, mut sink_rx) = recorder(true);
        nodes[2].network.set_handler(HASH_TABLE_PORT, sink).await;

        let dst = nodes[2].network.host_id();
        nodes[0].network.send(dst, HASH_TABLE_PORT, HASH_TABLE_PORT, vec![1]).await.unwrap();

        tokio::time::timeout(TIMEOUT, relay_rx.recv()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let nodes = members(1);
        let body = vec![0u8; MAX_FRAME_BODY - MESSAGE_HEADER_LEN];
        let dst = HostId::from_bytes([9; 20]);
        assert!(nodes[0].network.send(dst, 2000, 2000, body).await.is_err());
    }

    #[tokio::test]
    async fn body_larger_than_link_mtu_is_rejected() {
        let nodes = members(2);
        connect(&nodes[0], &nodes[1]).await;
        let (handler, mut rx) = recorder(true);
        nodes[1].network.set_handler(2000, handler).await;
        let dst = nodes[1].network.host_id();

        let max = nodes[0].network.max_body_len().await;
        assert_eq!(max, 1500 - 4 - MESSAGE_HEADER_LEN - 5 * TRAILER_LEN);

        let err = nodes[0]
            .network
            .send(dst, 2000, 2000, vec![7u8; 4000])
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<WireError>(),
            Some(&WireError::BodyTooLarge { len: 4000, max })
        );

        nodes[0].network.send(dst, 2000, 2000, vec![7u8; max]).await.unwrap();
        let msg = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg.body.len(), max);
    }

    #[tokio::test]
    async fn close_removes_links_and_handlers() {
        let nodes = members(2);
        connect(&nodes[0], &nodes[1]).await;
        let (handler, _rx) = recorder(true);
        nodes[0].network.set_handler(2000, handler).await;

        let removed = nodes[0].network.close().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(nodes[0].network.link_count().await, 0);
        assert!(nodes[0].network.handler(2000).await.is_none());
        assert!(nodes[0].network.is_closed());
        tokio::time::timeout(TIMEOUT, nodes[0].network.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn reserved_ports_skip_installed_handlers() {
        let nodes = members(1);
        let (handler, _rx) = recorder(true);
        nodes[0].network.set_handler(4242, handler).await;
        for _ in 0..100 {
            let port = nodes[0].network.reserve_port().await.unwrap();
            assert!(port >= RESERVED_PORT_COUNT);
            assert_ne!(port, 4242);
        }
    }
}
