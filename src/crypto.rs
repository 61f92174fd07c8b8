//! # Signature Primitives
//!
//! Ed25519 signing and verification helpers shared by the wire format, the
//! certificate chain and the DHT records.
//!
//! Two flavours exist:
//!
//! - **Domain-separated** ([`sign_with_domain`] / [`verify_with_domain`]):
//!   certificates and certificate requests, whose encodings are private to
//!   this crate.
//! - **Raw** ([`verify_signature`]): message trailers and DHT records, whose
//!   signed byte layouts are fixed by the wire format and shared with other
//!   implementations.
//!
//! Verification always uses `verify_strict` (rejects small-order keys and
//! non-canonical signatures).

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Keypair, PublicKey};

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain separation prefix for certificate signatures.
pub const CERTIFICATE_SIGNATURE_DOMAIN: &[u8] = b"overlay-certificate-v1:";

/// Domain separation prefix for certificate request (proof of possession) signatures.
pub const CERTIFICATE_REQUEST_SIGNATURE_DOMAIN: &[u8] = b"overlay-csr-v1:";

// ============================================================================
// Signature Helpers
// ============================================================================

/// Sign data with domain separation. Returns the 64-byte signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    verify_signature(key, &prefixed, signature)
}

/// Verify a raw Ed25519 signature over `data`.
pub fn verify_signature(key: &PublicKey, data: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key =
        VerifyingKey::from_bytes(key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(data, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Random 64-bit identifier (request IDs, mediation IDs).
/// Zero is never returned so it can mean "unset" on the wire.
pub fn random_u64() -> anyhow::Result<u64> {
    loop {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| anyhow::anyhow!("failed to generate random id: {}", e))?;
        let value = u64::from_be_bytes(bytes);
        if value != 0 {
            return Ok(value);
        }
    }
}

/// Random non-zero 32-bit identifier (DHT instance namespaces).
pub fn random_u32() -> anyhow::Result<u32> {
    loop {
        let mut bytes = [0u8; 4];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| anyhow::anyhow!("failed to generate random id: {}", e))?;
        let value = u32::from_be_bytes(bytes);
        if value != 0 {
            return Ok(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_signature_round_trip() {
        let keypair = Keypair::generate();
        let key = keypair.public_key_bytes();
        let sig = sign_with_domain(&keypair, CERTIFICATE_SIGNATURE_DOMAIN, b"data");

        assert!(verify_with_domain(&key, CERTIFICATE_SIGNATURE_DOMAIN, b"data", &sig).is_ok());
        assert_eq!(
            verify_with_domain(&key, CERTIFICATE_REQUEST_SIGNATURE_DOMAIN, b"data", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn raw_signature_rejects_bad_input() {
        let keypair = Keypair::generate();
        let key = keypair.public_key_bytes();
        let sig = keypair.sign(b"data").to_bytes();

        assert!(verify_signature(&key, b"data", &sig).is_ok());
        assert_eq!(verify_signature(&key, b"data", &[]), Err(SignatureError::Missing));
        assert_eq!(
            verify_signature(&key, b"data", &sig[..10]),
            Err(SignatureError::InvalidLength)
        );
        assert_eq!(
            verify_signature(&key, b"tampered", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn random_ids_are_non_zero() {
        for _ in 0..32 {
            assert_ne!(random_u64().unwrap(), 0);
            assert_ne!(random_u32().unwrap(), 0);
        }
    }
}
