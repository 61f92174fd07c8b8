//! Overlay demo: a line of in-memory hosts sharing one logical network.
//!
//! Hosts are linked in a line, bind the network over every link, publish a
//! hash table record from one end, read it from the other, and finally let
//! peer exchange link the two ends directly.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::{self, Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use overlay::{
    issue_membership, memory_link_pair, Certificate, Config, HashBrokerFactory, Keypair,
    MediatedDialer, MemorySwitchboard, MemoryTransport, NetworkServices, Node, KEY_USAGE_SIGN,
};

#[derive(Parser, Debug)]
#[command(name = "overlay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hosts in the line.
    #[arg(short = 'n', long, default_value = "5")]
    hosts: usize,

    #[arg(long, default_value = "5")]
    max_hops: usize,

    #[arg(long, default_value = "5")]
    replicas: usize,

    /// Seconds to wait for bindings, lookups and dials.
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    #[arg(long, default_value = "1500")]
    mtu: usize,
}

struct Member {
    profile: Keypair,
    node: Arc<Node>,
    services: NetworkServices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.hosts < 2 {
        bail!("at least two hosts are needed");
    }
    let timeout = Duration::from_secs(args.timeout);
    let config = Config {
        max_message_hops: args.max_hops,
        max_message_replicas: args.replicas,
        broker_timeout: timeout,
        dial_timeout: timeout,
        ..Config::default()
    };

    let ca = Keypair::generate();
    let root = Certificate::self_signed(&ca, KEY_USAGE_SIGN, "demo network", Duration::from_secs(3600));
    let switchboard = MemorySwitchboard::new();
    let brokers = Arc::new(HashBrokerFactory::new(config.broker_timeout));

    let mut members = Vec::with_capacity(args.hosts);
    for _ in 0..args.hosts {
        let profile = Keypair::generate();
        let dialer: Arc<dyn MediatedDialer> = Arc::new(MemoryTransport::new(switchboard.clone()));
        let node = Node::new(profile.clone(), config.clone(), brokers.clone(), Some(dialer))?;
        let membership = issue_membership(&ca, &root, &profile, Duration::from_secs(3600))?;
        let services = node.add_network(membership).await?;
        info!(host = %node.host().id(), "member ready");
        members.push(Member {
            profile,
            node,
            services,
        });
    }

    for pair in members.windows(2) {
        let (a, b) = memory_link_pair(args.mtu);
        let (la, lb) = tokio::join!(pair[0].node.add_link(Box::new(a)), pair[1].node.add_link(Box::new(b)));
        la.context("link failed")?;
        lb.context("link failed")?;
    }

    let deadline = Instant::now() + timeout;
    for (i, member) in members.iter().enumerate() {
        let expected = if i == 0 || i == members.len() - 1 { 1 } else { 2 };
        while member.services.network.link_count().await < expected {
            if Instant::now() > deadline {
                bail!("network links not bound in time");
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
    info!(hosts = members.len(), "line bound");

    let first = &members[0];
    let last = &members[members.len() - 1];
    let salt = b"demo";
    let publisher = first
        .services
        .hash_table
        .set(&first.profile, salt, b"hello from the first host".to_vec());
    time::sleep(Duration::from_millis(200)).await;

    let mut values = last
        .services
        .hash_table
        .get(&first.profile.public_key_bytes(), salt, timeout)
        .await?;
    match values.recv().await {
        Some(value) => info!(
            timestamp = value.timestamp,
            value = %String::from_utf8_lossy(&value.value),
            "record found"
        ),
        None => warn!("record not found"),
    }
    publisher.close().await;

    last.services.peer_exchange.connect(first.node.host().id()).await?;
    let deadline = Instant::now() + timeout;
    while !last.node.host().has_peer(&first.node.host().id()).await {
        if Instant::now() > deadline {
            warn!("peer exchange did not link the ends of the line");
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    info!(
        peers = last.node.host().peer_count().await,
        "last host peers after exchange"
    );

    for member in &members {
        member.node.close().await;
    }
    Ok(())
}
