//! # Overlay - Peer-to-Peer Network Overlay
//!
//! Overlay multiplexes private logical networks over a shared set of
//! authenticated links:
//!
//! - **Links**: each physical link carries many ports; each joined network
//!   binds its own port pair on every link shared with another member
//! - **Routing**: messages are routed kademlia-style through the members'
//!   links, each hop appending a signed trailer
//! - **DHT**: a signed key/value hash table and a peer index replicated along
//!   the routing paths
//! - **Peer Exchange**: members negotiate direct links over the overlay
//!
//! ## Architecture
//!
//! ```text
//!   Node ── Host ── Peer (one per Link) ── ports
//!     │               │
//!     │               └── Bootstrap: Broker finds shared networks, binds ports
//!     └── Network (one per membership) ── HashTable / PeerIndex / PeerExchange
//! ```
//!
//! Record stores are actors shared by every network of a node; networks,
//! peers and their handlers live in arenas keyed by network key and HostID.
//!
//! ## Security Model
//!
//! - Every link is authenticated with a host certificate chained to the
//!   peer's profile key
//! - Network membership is a certificate chained to the network's root key
//! - Every relay signs the message it forwards; the last signature is
//!   checked against the peer that delivered it
//! - DHT records are signed by their publisher and never replaced by an
//!   equal or older copy
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API owning hosts, networks and stores |
//! | `identity` | Keypairs and HostIDs |
//! | `crypto` | Signatures and random identifiers |
//! | `certificate` | Certificate chains and membership issuance |
//! | `frame` | Frame codec and per-port byte streams |
//! | `message` | Routed message codec with signed trailers |
//! | `messages` | Serialization types for the control protocols |
//! | `kbucket` | XOR-metric routing table |
//! | `queue` | Time wheels expiring records and requests |
//! | `link` | Link trait and in-memory transports |
//! | `peer` | Handshake and per-link frame pump |
//! | `host` | Identity and the peer arena |
//! | `network` | Per-network routing |
//! | `store` | Record store actor, request registry, publishers |
//! | `hash_table` | Signed key/value records |
//! | `peer_index` | Hosts advertised under a topic |
//! | `broker` | Shared network discovery |
//! | `bootstrap` | Network binding per peer |
//! | `peer_exchange` | Overlay-routed connection signaling |
//! | `event` | Event subscriptions |
//! | `config` | Tunables |
//! | `protocols` | Collaborator traits |

mod bootstrap;
mod broker;
mod certificate;
mod config;
mod crypto;
mod event;
mod frame;
mod hash_table;
mod host;
mod identity;
mod kbucket;
mod link;
mod message;
mod messages;
mod network;
mod node;
mod peer;
mod peer_exchange;
mod peer_index;
mod protocols;
mod queue;
mod store;

pub use broker::{Broker, BrokerEvent, BrokerFactory, HashBroker, HashBrokerFactory};
pub use certificate::{
    issue_membership, sign_request, verify_certificate, Certificate, CertificateError,
    CertificateRequest, KEY_USAGE_PEER, KEY_USAGE_SIGN,
};
pub use config::{Config, DhtConfig};
pub use event::{NetworkEvent, PeerNetworkEvent};
pub use frame::{Frame, FrameReader, FrameWriter, WireError};
pub use hash_table::{HashTable, HashTableGetReceiver, HashTablePublisher, HashTableValue};
pub use host::Host;
pub use identity::{HostId, Keypair, PublicKey};
pub use kbucket::{BucketEntry, InsertOutcome, KBucket};
pub use link::{memory_link_pair, Link, MemoryLink, MemorySwitchboard, MemoryTransport};
pub use message::{Message, MessageHeader, MessageId, Trailer};
pub use network::{Network, NetworkLink, HASH_TABLE_PORT, PEER_EXCHANGE_PORT, PEER_INDEX_PORT};
pub use node::{NetworkServices, Node};
pub use peer::{HandshakeError, Peer, NETWORK_BROKER_PORT, NETWORK_INIT_PORT, RESERVED_PORT_COUNT};
pub use peer_exchange::{Mediator, PeerExchange};
pub use peer_index::{PeerIndex, PeerIndexHost, PeerIndexPublisher, PeerIndexSearchReceiver};
pub use protocols::{FrameHandler, MediatedDialer, MessageHandler, PeerHandler, Signaling};
pub use queue::{DiscardQueue, TimeoutQueue};
