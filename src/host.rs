//! # Host
//!
//! Owns this node's identity and the arena of live [`Peer`]s.
//!
//! ## Identity
//!
//! - profile key: long-lived, supplied by the caller
//! - host key: generated per run, certified by the profile key
//! - HostID: derived from the host key and a random discriminator
//!
//! ## Link lifecycle
//!
//! ```text
//! add_link ──► handshake ──► dedupe ──► PeerHandlers ──► pump task
//!                                                          │
//!                              remove + close ◄────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::certificate::{
    sign_request, Certificate, CertificateRequest, KEY_USAGE_PEER, KEY_USAGE_SIGN,
};
use crate::identity::{random_discriminator, HostId, Keypair, PublicKey};
use crate::link::Link;
use crate::peer::Peer;
use crate::protocols::{MediatedDialer, PeerHandler, Signaling};

pub struct Host {
    profile: Keypair,
    key: Keypair,
    discriminator: u16,
    id: HostId,
    certificate: Certificate,
    handshake_timeout: Duration,
    peers: RwLock<HashMap<HostId, Arc<Peer>>>,
    handlers: StdRwLock<Vec<Arc<dyn PeerHandler>>>,
    max_peers: AtomicUsize,
    dialer: Option<Arc<dyn MediatedDialer>>,
}

impl Host {
    pub fn new(
        profile: Keypair,
        cert_validity: Duration,
        handshake_timeout: Duration,
        dialer: Option<Arc<dyn MediatedDialer>>,
    ) -> Result<Arc<Self>> {
        let key = Keypair::generate();
        let discriminator = random_discriminator();
        let id = key.host_id(discriminator);

        let profile_cert = Certificate::self_signed(
            &profile,
            KEY_USAGE_SIGN | KEY_USAGE_PEER,
            "profile",
            cert_validity,
        );
        let request = CertificateRequest::new(&key, KEY_USAGE_PEER, "host");
        let certificate = sign_request(&request, cert_validity, &profile)
            .context("failed to issue host certificate")?
            .with_parent(profile_cert);

        info!(host = %id, "host identity created");
        Ok(Arc::new(Self {
            profile,
            key,
            discriminator,
            id,
            certificate,
            handshake_timeout,
            peers: RwLock::new(HashMap::new()),
            handlers: StdRwLock::new(Vec::new()),
            max_peers: AtomicUsize::new(0),
            dialer,
        }))
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn discriminator(&self) -> u16 {
        self.discriminator
    }

    /// Key signing message trailers.
    pub fn key(&self) -> &Keypair {
        &self.key
    }

    pub fn profile(&self) -> &Keypair {
        &self.profile
    }

    pub fn profile_key(&self) -> PublicKey {
        self.profile.public_key_bytes()
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn add_peer_handler(&self, handler: Arc<dyn PeerHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub async fn has_peer(&self, id: &HostId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn peer(&self, id: &HostId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// 0 disables the limit.
    pub fn set_max_peers(&self, max: usize) {
        self.max_peers.store(max, Ordering::Relaxed);
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers.load(Ordering::Relaxed)
    }

    /// Authenticate `link` and start serving it.
    pub async fn add_link(self: &Arc<Self>, link: Box<dyn Link>) -> Result<Arc<Peer>> {
        let peer = Peer::handshake(link, &self.certificate, self.discriminator, self.handshake_timeout)
            .await
            .map_err(|e| anyhow!("handshake failed: {}", e))?;
        let peer_id = peer.host_id();

        if peer_id == self.id {
            peer.close();
            bail!("refusing link to self");
        }

        {
            let mut peers = self.peers.write().await;
            if peers.contains_key(&peer_id) {
                drop(peers);
                peer.close();
                bail!("already linked to {}", peer_id);
            }
            peers.insert(peer_id, peer.clone());
        }
        debug!(host = %self.id, peer = %peer_id, "peer added");

        let handlers: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler.handle_peer(peer.clone()).await;
        }

        let host = self.clone();
        let pumped = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = pumped.run().await {
                debug!(host = %host.id, peer = %peer_id, error = %e, "peer link closed");
            }
            host.remove_peer(&pumped).await;
        });

        Ok(peer)
    }

    async fn remove_peer(&self, peer: &Arc<Peer>) {
        let mut peers = self.peers.write().await;
        if peers
            .get(&peer.host_id())
            .is_some_and(|current| Arc::ptr_eq(current, peer))
        {
            peers.remove(&peer.host_id());
        }
        drop(peers);
        peer.close();
        debug!(host = %self.id, peer = %peer.host_id(), "peer removed");
    }

    /// Establish a link through the configured dialer.
    pub async fn dial(self: &Arc<Self>, signaling: Arc<dyn Signaling>) -> Result<Arc<Peer>> {
        let dialer = self
            .dialer
            .as_ref()
            .ok_or_else(|| anyhow!("no dialer configured"))?;
        let remote = signaling.remote_host_id();
        let link = dialer.dial(signaling).await?;
        match self.add_link(link).await {
            Ok(peer) => Ok(peer),
            Err(e) => {
                warn!(host = %self.id, peer = %remote, error = %e, "dialed link rejected");
                Err(e)
            }
        }
    }

    pub async fn close(&self) {
        let peers: Vec<_> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close();
        }
        info!(host = %self.id, "host closed");
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("max_peers", &self.max_peers())
            .finish_non_exhaustive()
    }
}
