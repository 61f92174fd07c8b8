//! # Host Identity
//!
//! This module defines the identity types shared by every layer of the overlay:
//!
//! - [`Keypair`]: Ed25519 signing keypair (profile keys, host keys, network CAs)
//! - [`HostId`]: 160-bit kademlia identifier of one running host
//!
//! ## HostID Layout
//!
//! ```text
//! +--------------------------------------+-------------------+
//! | public key bytes [0..18]             | discriminator (BE)|
//! +--------------------------------------+-------------------+
//!   18 bytes                               2 bytes
//! ```
//!
//! The discriminator is random per host so two hosts sharing a key prefix
//! still land on distinct IDs. The HostID is the XOR-metric distance key used
//! by [`crate::kbucket::KBucket`] and by DHT replica selection.
//!
//! ## Invariants
//!
//! - `HostId::from_bytes(b).as_bytes() == b`
//! - XOR distance is symmetric and zero only for equal IDs
//! - A HostID derived from a key always satisfies `matches_key(key)`

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of a HostID in bytes (160 bits).
pub const HOST_ID_LEN: usize = 20;

/// Number of public key bytes embedded in a HostID.
const HOST_ID_KEY_PREFIX_LEN: usize = 18;

/// Raw Ed25519 public key bytes.
pub type PublicKey = [u8; 32];

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns current time as seconds since Unix epoch.
/// Record timestamps and certificate validity windows use this resolution.
#[inline]
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Short hex label of a public key for log fields.
pub fn key_label(key: &PublicKey) -> String {
    hex::encode(&key[..8])
}

/// Random 16-bit HostID discriminator.
pub fn random_discriminator() -> u16 {
    (OsRng.next_u32() & 0xFFFF) as u16
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> PublicKey {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// HostID for this key with the given discriminator.
    pub fn host_id(&self, discriminator: u16) -> HostId {
        HostId::from_key(&self.public_key_bytes(), discriminator)
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(&self.public_key_bytes()[..8]))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId([u8; HOST_ID_LEN]);

impl HostId {
    #[inline]
    pub fn from_bytes(bytes: [u8; HOST_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a HostID from a slice, returning `None` unless it is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HOST_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Derive the HostID of a key: leading 18 key bytes followed by the
    /// big-endian discriminator.
    pub fn from_key(key: &PublicKey, discriminator: u16) -> Self {
        let mut id = [0u8; HOST_ID_LEN];
        id[..HOST_ID_KEY_PREFIX_LEN].copy_from_slice(&key[..HOST_ID_KEY_PREFIX_LEN]);
        id[HOST_ID_KEY_PREFIX_LEN..].copy_from_slice(&discriminator.to_be_bytes());
        Self(id)
    }

    /// Kademlia target for a hash: its leading 20 bytes.
    pub fn from_hash(hash: &[u8; 32]) -> Self {
        let mut id = [0u8; HOST_ID_LEN];
        id.copy_from_slice(&hash[..HOST_ID_LEN]);
        Self(id)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HOST_ID_LEN] {
        &self.0
    }

    pub fn discriminator(&self) -> u16 {
        u16::from_be_bytes([self.0[HOST_ID_KEY_PREFIX_LEN], self.0[HOST_ID_KEY_PREFIX_LEN + 1]])
    }

    /// True when this ID carries the key prefix of `key`.
    pub fn matches_key(&self, key: &PublicKey) -> bool {
        self.0[..HOST_ID_KEY_PREFIX_LEN] == key[..HOST_ID_KEY_PREFIX_LEN]
    }

    #[inline]
    pub fn xor_distance(&self, other: &HostId) -> [u8; HOST_ID_LEN] {
        let mut out = [0u8; HOST_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

/// Compare two XOR distances; `Less` means `a` is closer.
#[inline]
pub fn distance_cmp(a: &[u8; HOST_ID_LEN], b: &[u8; HOST_ID_LEN]) -> Ordering {
    for i in 0..HOST_ID_LEN {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl std::fmt::Debug for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; HOST_ID_LEN]> for HostId {
    fn from(bytes: [u8; HOST_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for HostId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
