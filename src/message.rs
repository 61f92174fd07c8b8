//! # Routed Messages
//!
//! A [`Message`] is the unit routed through a logical network. It travels as
//! the body of one frame:
//!
//! ```text
//! +--------+----------+----------+-------+----------+----------+-------------+
//! | dst ID | dst port | src port |  seq  |  length  |   body   |  trailers   |
//! +--------+----------+----------+-------+----------+----------+-------------+
//!   20 B      2 B        2 B       2 B      2 B       length B   84 B each
//! ```
//!
//! Each hop appends one trailer = (relayer HostID, Ed25519 signature). The
//! signature covers everything before it: header, body, every earlier trailer
//! and the relayer's own HostID. Trailer 0 therefore names and authenticates
//! the original sender, and `trailers.len()` is the number of hops traversed.

use crate::crypto::{verify_signature, SignatureError, SIGNATURE_LEN};
use crate::frame::WireError;
use crate::identity::{HostId, Keypair, PublicKey, HOST_ID_LEN};

pub const MESSAGE_HEADER_LEN: usize = 28;
pub const TRAILER_LEN: usize = HOST_ID_LEN + SIGNATURE_LEN;

/// Largest body a message can carry.
pub const MAX_MESSAGE_BODY: usize = u16::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub dst_id: HostId,
    pub dst_port: u16,
    pub src_port: u16,
    pub seq: u16,
    pub length: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trailer {
    pub host_id: HostId,
    pub signature: [u8; SIGNATURE_LEN],
}

/// Identifies a message across every path it takes: (sequence, origin).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub seq: u16,
    pub origin: HostId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: Vec<u8>,
    pub trailers: Vec<Trailer>,
}

impl Message {
    /// A fresh, unsigned message.
    pub fn new(
        dst_id: HostId,
        dst_port: u16,
        src_port: u16,
        seq: u16,
        body: Vec<u8>,
    ) -> Result<Self, WireError> {
        let length = u16::try_from(body.len()).map_err(|_| WireError::BodyTooLarge {
            len: body.len(),
            max: MAX_MESSAGE_BODY,
        })?;
        Ok(Self {
            header: MessageHeader {
                dst_id,
                dst_port,
                src_port,
                seq,
                length,
            },
            body,
            trailers: Vec::new(),
        })
    }

    /// Number of hops traversed.
    pub fn hops(&self) -> usize {
        self.trailers.len()
    }

    /// The original sender, if the message has been signed at least once.
    pub fn src_host_id(&self) -> Option<HostId> {
        self.trailers.first().map(|t| t.host_id)
    }

    pub fn id(&self) -> Option<MessageId> {
        self.src_host_id().map(|origin| MessageId {
            seq: self.header.seq,
            origin,
        })
    }

    pub fn trailers_contain(&self, host_id: &HostId) -> bool {
        self.trailers.iter().any(|t| &t.host_id == host_id)
    }

    /// Encoded size once `extra_trailers` more hops have signed it.
    pub fn encoded_len(&self, extra_trailers: usize) -> usize {
        MESSAGE_HEADER_LEN + self.body.len() + (self.trailers.len() + extra_trailers) * TRAILER_LEN
    }

    /// Encode with one more trailer signed by `key` on behalf of `host_id`.
    pub fn marshal(&self, key: &Keypair, host_id: &HostId) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len(1));
        self.write_signed_prefix(&mut out, self.trailers.len());
        out.extend_from_slice(host_id.as_bytes());
        let signature = key.sign(&out).to_bytes();
        out.extend_from_slice(&signature);
        out
    }

    /// Append a trailer in place; equivalent to `unmarshal(marshal(..))`.
    pub fn sign(&mut self, key: &Keypair, host_id: &HostId) {
        let mut prefix = Vec::with_capacity(self.encoded_len(1));
        self.write_signed_prefix(&mut prefix, self.trailers.len());
        prefix.extend_from_slice(host_id.as_bytes());
        self.trailers.push(Trailer {
            host_id: *host_id,
            signature: key.sign(&prefix).to_bytes(),
        });
    }

    pub fn unmarshal(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < MESSAGE_HEADER_LEN {
            return Err(WireError::BufferTooSmall {
                needed: MESSAGE_HEADER_LEN,
                available: buf.len(),
            });
        }
        let mut dst = [0u8; HOST_ID_LEN];
        dst.copy_from_slice(&buf[..HOST_ID_LEN]);
        let field = |offset: usize| u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let header = MessageHeader {
            dst_id: HostId::from_bytes(dst),
            dst_port: field(20),
            src_port: field(22),
            seq: field(24),
            length: field(26),
        };

        let body_end = MESSAGE_HEADER_LEN + header.length as usize;
        if buf.len() < body_end {
            return Err(WireError::LengthMismatch {
                declared: header.length as usize,
                actual: buf.len() - MESSAGE_HEADER_LEN,
            });
        }
        let body = buf[MESSAGE_HEADER_LEN..body_end].to_vec();

        let trailer_bytes = &buf[body_end..];
        if trailer_bytes.len() % TRAILER_LEN != 0 {
            return Err(WireError::TrailerMisaligned {
                remaining: trailer_bytes.len() % TRAILER_LEN,
            });
        }
        let trailers = trailer_bytes
            .chunks_exact(TRAILER_LEN)
            .map(|chunk| {
                let mut id = [0u8; HOST_ID_LEN];
                id.copy_from_slice(&chunk[..HOST_ID_LEN]);
                let mut signature = [0u8; SIGNATURE_LEN];
                signature.copy_from_slice(&chunk[HOST_ID_LEN..]);
                Trailer {
                    host_id: HostId::from_bytes(id),
                    signature,
                }
            })
            .collect();

        Ok(Self {
            header,
            body,
            trailers,
        })
    }

    /// Check the signature of trailer `index` against `key`.
    pub fn verify_trailer(&self, index: usize, key: &PublicKey) -> Result<(), SignatureError> {
        let trailer = self.trailers.get(index).ok_or(SignatureError::Missing)?;
        let mut prefix = Vec::with_capacity(MESSAGE_HEADER_LEN + self.body.len() + (index + 1) * TRAILER_LEN);
        self.write_signed_prefix(&mut prefix, index);
        prefix.extend_from_slice(trailer.host_id.as_bytes());
        verify_signature(key, &prefix, &trailer.signature)
    }

    /// header ‖ body ‖ trailers[..trailer_count]
    fn write_signed_prefix(&self, out: &mut Vec<u8>, trailer_count: usize) {
        out.extend_from_slice(self.header.dst_id.as_bytes());
        out.extend_from_slice(&self.header.dst_port.to_be_bytes());
        out.extend_from_slice(&self.header.src_port.to_be_bytes());
        out.extend_from_slice(&self.header.seq.to_be_bytes());
        out.extend_from_slice(&self.header.length.to_be_bytes());
        out.extend_from_slice(&self.body);
        for trailer in &self.trailers[..trailer_count] {
            out.extend_from_slice(trailer.host_id.as_bytes());
            out.extend_from_slice(&trailer.signature);
        }
    }
}
