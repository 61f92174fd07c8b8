//! Collaborator trait definitions for the overlay.
//!
//! Each layer exposes a trait for the component plugged into it, defined here
//! separately from the implementations so layers depend on traits, not on
//! each other.
//!
//! | Seam | Trait | Implemented by |
//! |------|-------|----------------|
//! | Peer port | [`FrameHandler`] | `Network`, peer channels |
//! | Network port | [`MessageHandler`] | `HashTable`, `PeerIndex`, `PeerExchange`, applications |
//! | New peer | [`PeerHandler`] | bootstrap |
//! | Dial | [`MediatedDialer`] | physical transports, `MemoryTransport` |
//! | Signaling | [`Signaling`] | `Mediator` |

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::frame::Frame;
use crate::identity::HostId;
use crate::link::Link;
use crate::message::Message;
use crate::peer::Peer;

/// Receives the frames arriving on one peer port.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Called in receive order from the peer's frame pump. Errors are logged
    /// and counted by the peer; they never close the link.
    async fn handle_frame(&self, peer: &Arc<Peer>, frame: Frame) -> Result<()>;
}

/// Receives the messages routed to one network port.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Returns whether the network should keep relaying the message. Only
    /// consulted for messages on reserved ports that are not addressed to
    /// this host; an error drops the message.
    async fn handle_message(&self, msg: &Message) -> Result<bool>;
}

/// Notified once per established peer, before its frame pump starts.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn handle_peer(&self, peer: Arc<Peer>);
}

/// Out-of-band signaling for one dial attempt.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Host being dialed or dialing us.
    fn remote_host_id(&self) -> HostId;

    /// Remote offer for responders; `None` for the initiating side.
    async fn get_offer(&self) -> Result<Option<Vec<u8>>>;

    /// Waits for the remote answer (or returns the offer for responders).
    async fn get_answer(&self) -> Result<Vec<u8>>;

    /// Next remote ICE candidate; `None` once every candidate was delivered
    /// or the mediation closed.
    async fn next_ice_candidate(&self) -> Option<Vec<u8>>;

    async fn send_offer(&self, offer: Vec<u8>) -> Result<()>;

    async fn send_answer(&self, answer: Vec<u8>) -> Result<()>;

    /// `None` terminates the local candidate list.
    async fn send_ice_candidate(&self, candidate: Option<Vec<u8>>) -> Result<()>;
}

/// Produces a Link to a remote host using overlay-routed signaling.
#[async_trait]
pub trait MediatedDialer: Send + Sync {
    async fn dial(&self, signaling: Arc<dyn Signaling>) -> Result<Box<dyn Link>>;
}
