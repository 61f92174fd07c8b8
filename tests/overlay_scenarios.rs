//! Integration tests for routing, DHT services, bootstrap and peer exchange.
//!
//! Every scenario runs in-process: hosts are joined with in-memory links and
//! dial each other through a shared in-memory switchboard.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test overlay_scenarios -- --nocapture

use std::collections::HashSet;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use overlay::{
    issue_membership, memory_link_pair, Certificate, Config, DhtConfig, HashBrokerFactory, HostId,
    Keypair, MediatedDialer, MemorySwitchboard, MemoryTransport, Message, MessageHandler,
    NetworkServices, Node, PeerNetworkEvent, PublicKey, KEY_USAGE_SIGN,
};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};

/// One-time tracing initialization
static INIT: Once = Once::new();

/// Use RUST_LOG=debug or RUST_LOG=trace for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("warn")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const HOUR: Duration = Duration::from_secs(3600);
const APP_PORT: u16 = 2000;

// ============================================================================
// Harness
// ============================================================================

struct Authority {
    ca: Keypair,
    root: Certificate,
}

impl Authority {
    fn new() -> Self {
        let ca = Keypair::generate();
        let root = Certificate::self_signed(&ca, KEY_USAGE_SIGN, "network", HOUR);
        Self { ca, root }
    }

    fn key(&self) -> PublicKey {
        self.ca.public_key_bytes()
    }

    fn membership(&self, profile: &Keypair) -> Certificate {
        issue_membership(&self.ca, &self.root, profile, HOUR).expect("membership")
    }
}

struct Member {
    profile: Keypair,
    node: Arc<Node>,
    transport: Arc<MemoryTransport>,
}

impl Member {
    fn new(switchboard: &Arc<MemorySwitchboard>, config: Config) -> Self {
        let profile = Keypair::generate();
        let transport = Arc::new(MemoryTransport::new(switchboard.clone()));
        let dialer: Arc<dyn MediatedDialer> = transport.clone();
        let brokers = Arc::new(HashBrokerFactory::new(config.broker_timeout));
        let node = Node::new(profile.clone(), config, brokers, Some(dialer)).expect("node");
        Self {
            profile,
            node,
            transport,
        }
    }

    fn id(&self) -> HostId {
        self.node.host().id()
    }

    async fn join(&self, authority: &Authority) -> NetworkServices {
        self.node
            .add_network(authority.membership(&self.profile))
            .await
            .expect("join network")
    }

    fn services(&self, authority: &Authority) -> NetworkServices {
        self.node.network(&authority.key()).expect("member of network")
    }
}

fn test_config() -> Config {
    Config {
        broker_timeout: Duration::from_secs(5),
        dial_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

async fn link(a: &Member, b: &Member) {
    let (la, lb) = memory_link_pair(1500);
    let (pa, pb) = tokio::join!(a.node.add_link(Box::new(la)), b.node.add_link(Box::new(lb)));
    pa.expect("link a");
    pb.expect("link b");
}

async fn wait_for_links(services: &NetworkServices, count: usize) {
    timeout(TEST_TIMEOUT, async {
        while services.network.link_count().await < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("network links not bound in time");
}

async fn wait_for_peer(member: &Member, id: HostId) -> bool {
    timeout(TEST_TIMEOUT, async {
        while !member.node.host().has_peer(&id).await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// `count` members of one network, linked in a line and bound.
async fn line(authority: &Authority, count: usize, config: Config) -> Vec<Member> {
    let switchboard = MemorySwitchboard::new();
    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let member = Member::new(&switchboard, config.clone());
        member.join(authority).await;
        members.push(member);
    }
    for pair in members.windows(2) {
        link(&pair[0], &pair[1]).await;
    }
    for (i, member) in members.iter().enumerate() {
        let expected = if i == 0 || i == count - 1 { 1 } else { 2 };
        wait_for_links(&member.services(authority), expected).await;
    }
    members
}

struct Recorder {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle_message(&self, msg: &Message) -> Result<bool> {
        let _ = self.tx.send(msg.clone());
        Ok(true)
    }
}

async fn record_port(services: &NetworkServices) -> mpsc::UnboundedReceiver<Message> {
    let (tx, rx) = mpsc::unbounded_channel();
    services.network.set_handler(APP_PORT, Arc::new(Recorder { tx })).await;
    rx
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn line_routing_signs_every_hop_and_delivers_once() {
    init_tracing();
    let authority = Authority::new();
    let members = line(&authority, 3, test_config()).await;
    let mut rx = record_port(&members[2].services(&authority)).await;

    members[0]
        .services(&authority)
        .network
        .send(members[2].id(), APP_PORT, APP_PORT, b"over the line".to_vec())
        .await
        .unwrap();

    let msg = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let chain: Vec<HostId> = msg.trailers.iter().map(|t| t.host_id).collect();
    assert_eq!(chain, vec![members[0].id(), members[1].id()]);
    assert_eq!(msg.src_host_id(), Some(members[0].id()));
    assert_eq!(msg.body, b"over the line");

    sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err(), "message delivered twice");
}

#[tokio::test]
async fn messages_stop_at_the_hop_bound() {
    init_tracing();
    let authority = Authority::new();
    let config = Config {
        max_message_hops: 5,
        ..test_config()
    };
    let members = line(&authority, 7, config).await;
    let mut sixth = record_port(&members[5].services(&authority)).await;
    let mut seventh = record_port(&members[6].services(&authority)).await;
    let origin = members[0].services(&authority);

    // Five hops reach the sixth host.
    origin
        .network
        .send(members[5].id(), APP_PORT, APP_PORT, b"five".to_vec())
        .await
        .unwrap();
    let msg = timeout(TEST_TIMEOUT, sixth.recv()).await.unwrap().unwrap();
    assert_eq!(msg.hops(), 5);

    // The seventh is one hop too far.
    origin
        .network
        .send(members[6].id(), APP_PORT, APP_PORT, b"six".to_vec())
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(seventh.try_recv().is_err());
}

// ============================================================================
// DHT
// ============================================================================

#[tokio::test]
async fn hash_table_value_crosses_the_line() {
    init_tracing();
    let authority = Authority::new();
    let members = line(&authority, 3, test_config()).await;
    let publisher_key = members[0].profile.public_key_bytes();

    let publisher = members[0]
        .services(&authority)
        .hash_table
        .set(&members[0].profile, b"salt", b"value".to_vec());

    let reader = members[2].services(&authority);
    let found = timeout(TEST_TIMEOUT, async {
        loop {
            let mut values = reader
                .hash_table
                .get(&publisher_key, b"salt", Duration::from_millis(300))
                .await
                .unwrap();
            if let Some(value) = values.recv().await {
                return value;
            }
        }
    })
    .await
    .expect("value not found");
    assert_eq!(found.value, b"value");

    publisher.close().await;
}

#[tokio::test]
async fn peer_index_finds_published_host() {
    init_tracing();
    let authority = Authority::new();
    let members = line(&authority, 3, test_config()).await;
    let topic = Keypair::generate().public_key_bytes();

    let publisher = members[0]
        .services(&authority)
        .peer_index
        .publish(&topic, b"service", 4242);

    let searcher = members[2].services(&authority);
    let host = timeout(TEST_TIMEOUT, async {
        loop {
            let mut hosts = searcher
                .peer_index
                .search(&topic, b"service", Duration::from_millis(300))
                .await
                .unwrap();
            if let Some(host) = hosts.recv().await {
                return host;
            }
        }
    })
    .await
    .expect("host not found");
    assert_eq!(host.host_id, members[0].id());
    assert_eq!(host.port, 4242);

    publisher.close().await;
}

#[tokio::test]
async fn expired_records_are_not_found() {
    init_tracing();
    let max_age = Duration::from_secs(2);
    let dht = DhtConfig {
        max_record_age: max_age,
        discard_interval: Duration::from_millis(100),
        publish_interval: HOUR,
        ..DhtConfig::default()
    };
    let config = Config {
        hash_table: dht.clone(),
        peer_index: dht,
        ..test_config()
    };
    let authority = Authority::new();
    let members = line(&authority, 3, config).await;
    let owner = members[0].services(&authority);
    let reader = members[2].services(&authority);
    let key = members[0].profile.public_key_bytes();
    let topic = Keypair::generate().public_key_bytes();

    let published = Instant::now();
    let value = owner
        .hash_table
        .set(&members[0].profile, b"salt", b"short-lived".to_vec());
    let host = owner.peer_index.publish(&topic, b"service", 4242);

    // Both are reachable while fresh.
    timeout(max_age, async {
        loop {
            let mut values = reader
                .hash_table
                .get(&key, b"salt", Duration::from_millis(200))
                .await
                .unwrap();
            if values.recv().await.is_some() {
                break;
            }
        }
        loop {
            let mut hosts = reader
                .peer_index
                .search(&topic, b"service", Duration::from_millis(200))
                .await
                .unwrap();
            if hosts.recv().await.is_some() {
                break;
            }
        }
    })
    .await
    .expect("records not found before expiry");

    sleep_until(published + max_age + Duration::from_millis(500)).await;

    let mut values = reader
        .hash_table
        .get(&key, b"salt", Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(values.recv().await, None);
    let mut hosts = reader
        .peer_index
        .search(&topic, b"service", Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(hosts.recv().await, None);

    value.close().await;
    host.close().await;
}

// ============================================================================
// Bootstrap
// ============================================================================

#[tokio::test]
async fn bootstrap_binds_exactly_the_shared_networks() {
    init_tracing();
    let (na, nb, nc, nd) = (
        Authority::new(),
        Authority::new(),
        Authority::new(),
        Authority::new(),
    );
    let switchboard = MemorySwitchboard::new();
    let left = Member::new(&switchboard, test_config());
    let right = Member::new(&switchboard, test_config());
    for authority in [&na, &nb, &nc] {
        left.join(authority).await;
    }
    for authority in [&na, &nc, &nd] {
        right.join(authority).await;
    }
    let (_, mut left_events) = left.node.subscribe_peer_networks();
    let (_, mut right_events) = right.node.subscribe_peer_networks();

    link(&left, &right).await;

    let expected: HashSet<PublicKey> = [na.key(), nc.key()].into_iter().collect();
    for (events, remote) in [(&mut left_events, right.id()), (&mut right_events, left.id())] {
        let mut bound = HashSet::new();
        while bound.len() < 2 {
            match timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap() {
                PeerNetworkEvent::Added { key, host_id } => {
                    assert_eq!(host_id, remote);
                    bound.insert(key);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(bound, expected);
    }

    assert!(left.services(&na).network.has_link(&right.id()).await);
    assert!(right.services(&nc).network.has_link(&left.id()).await);
    assert_eq!(left.services(&nb).network.link_count().await, 0);
    assert_eq!(right.services(&nd).network.link_count().await, 0);

    left.node.remove_network(&na.key()).await.unwrap();
    let removed = timeout(TEST_TIMEOUT, left_events.recv()).await.unwrap().unwrap();
    assert_eq!(
        removed,
        PeerNetworkEvent::Removed {
            key: na.key(),
            host_id: right.id()
        }
    );
}

#[tokio::test]
async fn network_added_later_is_bound_to_existing_peers() {
    init_tracing();
    let (first, second) = (Authority::new(), Authority::new());
    let members = line(&first, 2, test_config()).await;

    let left = members[0].join(&second).await;
    let right = members[1].join(&second).await;
    wait_for_links(&left, 1).await;
    wait_for_links(&right, 1).await;
    assert!(left.network.has_link(&members[1].id()).await);
}

#[tokio::test]
async fn closing_a_peer_unbinds_its_networks() {
    init_tracing();
    let authority = Authority::new();
    let members = line(&authority, 2, test_config()).await;
    let (_, mut events) = members[0].node.subscribe_peer_networks();

    members[1].node.close().await;
    let event = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        PeerNetworkEvent::Removed {
            key: authority.key(),
            host_id: members[1].id()
        }
    );
    assert_eq!(members[0].services(&authority).network.link_count().await, 0);
}

// ============================================================================
// Peer Exchange
// ============================================================================

#[tokio::test]
async fn peer_exchange_links_distant_members() {
    init_tracing();
    let authority = Authority::new();
    let members = line(&authority, 3, test_config()).await;

    members[2]
        .services(&authority)
        .peer_exchange
        .connect(members[0].id())
        .await
        .unwrap();

    assert!(wait_for_peer(&members[2], members[0].id()).await);
    assert!(wait_for_peer(&members[0], members[2].id()).await);
    // The new link is bound to the network as well.
    wait_for_links(&members[0].services(&authority), 2).await;
}

#[tokio::test]
async fn unreachable_member_is_called_back() {
    init_tracing();
    let authority = Authority::new();
    let members = line(&authority, 3, test_config()).await;
    members[2].transport.set_unreachable(true);

    members[2]
        .services(&authority)
        .peer_exchange
        .connect(members[0].id())
        .await
        .unwrap();

    assert!(wait_for_peer(&members[2], members[0].id()).await);
    assert!(wait_for_peer(&members[0], members[2].id()).await);
}

#[tokio::test]
async fn full_member_rejects_offers() {
    init_tracing();
    let authority = Authority::new();
    let members = line(&authority, 3, test_config()).await;
    members[0].node.host().set_max_peers(1);

    members[2]
        .services(&authority)
        .peer_exchange
        .connect(members[0].id())
        .await
        .unwrap();

    sleep(Duration::from_millis(500)).await;
    assert!(!members[2].node.host().has_peer(&members[0].id()).await);
    assert_eq!(members[0].node.host().peer_count().await, 1);
    assert_eq!(members[2].services(&authority).peer_exchange.mediator_count(), 0);
}
