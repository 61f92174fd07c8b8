//! # Certificate Chains
//!
//! Minimal PKI used for peer authentication and network membership.
//!
//! | Certificate | Key | Issuer | Parent |
//! |-------------|-----|--------|--------|
//! | Profile | profile key | self | none |
//! | Host | per-run host key | profile key | profile certificate |
//! | Network root | network CA key | self | none |
//! | Membership | profile key | network CA | network root |
//!
//! A chain is valid when every certificate is signed by its parent's key (the
//! root by its own key), every issuer carries [`KEY_USAGE_SIGN`] and every
//! certificate is inside its validity window. The network key of a membership
//! certificate is the public key of its root.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::crypto::{
    sign_with_domain, verify_with_domain, SignatureError, CERTIFICATE_REQUEST_SIGNATURE_DOMAIN,
    CERTIFICATE_SIGNATURE_DOMAIN,
};
use crate::identity::{now_secs, Keypair, PublicKey};

/// Key may issue certificates.
pub const KEY_USAGE_SIGN: u32 = 1 << 0;
/// Key identifies a peer (host or member).
pub const KEY_USAGE_PEER: u32 = 1 << 1;

/// Longest chain accepted by [`verify_certificate`].
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Tolerated clock skew when checking `not_before`.
const CLOCK_SKEW_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    /// A signature in the chain did not verify.
    Signature(SignatureError),
    /// Certificate is past `not_after`.
    Expired { not_after: u64, now: u64 },
    /// Certificate is before `not_before`.
    NotYetValid { not_before: u64, now: u64 },
    /// An issuing certificate lacks the SIGN usage.
    IssuerCannotSign,
    /// Chain exceeds [`MAX_CHAIN_DEPTH`].
    ChainTooLong,
}

impl std::fmt::Display for CertificateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateError::Signature(e) => write!(f, "certificate signature invalid: {}", e),
            CertificateError::Expired { not_after, now } => {
                write!(f, "certificate expired at {} (now {})", not_after, now)
            }
            CertificateError::NotYetValid { not_before, now } => {
                write!(f, "certificate not valid before {} (now {})", not_before, now)
            }
            CertificateError::IssuerCannotSign => write!(f, "issuer certificate lacks sign usage"),
            CertificateError::ChainTooLong => write!(f, "certificate chain too long"),
        }
    }
}

impl std::error::Error for CertificateError {}

/// Proof-of-possession request for a certificate over `key`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub key: PublicKey,
    pub key_usage: u32,
    pub subject: String,
    pub signature: Vec<u8>,
}

impl CertificateRequest {
    pub fn new(keypair: &Keypair, key_usage: u32, subject: impl Into<String>) -> Self {
        let key = keypair.public_key_bytes();
        let subject = subject.into();
        let payload = Self::signed_payload(&key, key_usage, &subject);
        let signature = sign_with_domain(keypair, CERTIFICATE_REQUEST_SIGNATURE_DOMAIN, &payload);
        Self {
            key,
            key_usage,
            subject,
            signature,
        }
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        let payload = Self::signed_payload(&self.key, self.key_usage, &self.subject);
        verify_with_domain(
            &self.key,
            CERTIFICATE_REQUEST_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    fn signed_payload(key: &PublicKey, key_usage: u32, subject: &str) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + 4 + subject.len());
        payload.extend_from_slice(key);
        payload.extend_from_slice(&key_usage.to_be_bytes());
        payload.extend_from_slice(subject.as_bytes());
        payload
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub key: PublicKey,
    pub key_usage: u32,
    pub subject: String,
    pub not_before: u64,
    pub not_after: u64,
    pub signature: Vec<u8>,
    pub parent: Option<Box<Certificate>>,
}

impl Certificate {
    /// Issue a self-signed certificate (profile or network root).
    pub fn self_signed(
        keypair: &Keypair,
        key_usage: u32,
        subject: impl Into<String>,
        validity: Duration,
    ) -> Self {
        let now = now_secs();
        let mut cert = Self {
            key: keypair.public_key_bytes(),
            key_usage,
            subject: subject.into(),
            not_before: now,
            not_after: now.saturating_add(validity.as_secs()),
            signature: Vec::new(),
            parent: None,
        };
        cert.signature = sign_with_domain(keypair, CERTIFICATE_SIGNATURE_DOMAIN, &cert.signed_payload());
        cert
    }

    /// Attach the issuer's certificate as parent.
    pub fn with_parent(mut self, parent: Certificate) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Top of the chain.
    pub fn root(&self) -> &Certificate {
        let mut cert = self;
        while let Some(parent) = cert.parent.as_deref() {
            cert = parent;
        }
        cert
    }

    pub fn parent(&self) -> Option<&Certificate> {
        self.parent.as_deref()
    }

    pub fn has_usage(&self, usage: u32) -> bool {
        self.key_usage & usage == usage
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + 4 + 16 + self.subject.len());
        payload.extend_from_slice(&self.key);
        payload.extend_from_slice(&self.key_usage.to_be_bytes());
        payload.extend_from_slice(&self.not_before.to_be_bytes());
        payload.extend_from_slice(&self.not_after.to_be_bytes());
        payload.extend_from_slice(self.subject.as_bytes());
        payload
    }
}

/// Sign a certificate request with `issuer`. The caller attaches the issuer's
/// own certificate with [`Certificate::with_parent`].
pub fn sign_request(
    request: &CertificateRequest,
    validity: Duration,
    issuer: &Keypair,
) -> Result<Certificate> {
    request
        .verify()
        .map_err(|e| anyhow!("certificate request proof invalid: {}", e))?;

    let now = now_secs();
    let mut cert = Certificate {
        key: request.key,
        key_usage: request.key_usage,
        subject: request.subject.clone(),
        not_before: now,
        not_after: now.saturating_add(validity.as_secs()),
        signature: Vec::new(),
        parent: None,
    };
    cert.signature = sign_with_domain(issuer, CERTIFICATE_SIGNATURE_DOMAIN, &cert.signed_payload());
    Ok(cert)
}

/// Verify a chain against the current time.
pub fn verify_certificate(cert: &Certificate) -> Result<(), CertificateError> {
    verify_certificate_at(cert, now_secs())
}

pub fn verify_certificate_at(cert: &Certificate, now: u64) -> Result<(), CertificateError> {
    let mut current = cert;
    for _ in 0..MAX_CHAIN_DEPTH {
        if now > current.not_after {
            return Err(CertificateError::Expired {
                not_after: current.not_after,
                now,
            });
        }
        if now.saturating_add(CLOCK_SKEW_SECS) < current.not_before {
            return Err(CertificateError::NotYetValid {
                not_before: current.not_before,
                now,
            });
        }

        let issuer_key = match current.parent.as_deref() {
            Some(parent) => {
                if !parent.has_usage(KEY_USAGE_SIGN) {
                    return Err(CertificateError::IssuerCannotSign);
                }
                parent.key
            }
            None => current.key,
        };

        verify_with_domain(
            &issuer_key,
            CERTIFICATE_SIGNATURE_DOMAIN,
            &current.signed_payload(),
            &current.signature,
        )
        .map_err(CertificateError::Signature)?;

        match current.parent.as_deref() {
            Some(parent) => current = parent,
            None => return Ok(()),
        }
    }
    Err(CertificateError::ChainTooLong)
}

/// Issue a membership certificate for `member` under a network CA.
pub fn issue_membership(
    ca: &Keypair,
    root: &Certificate,
    member: &Keypair,
    validity: Duration,
) -> Result<Certificate> {
    let request = CertificateRequest::new(member, KEY_USAGE_PEER, "member");
    Ok(sign_request(&request, validity, ca)?.with_parent(root.clone()))
}
