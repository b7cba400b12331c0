//! Challenge/answer message layout
//!
//! The relay opens every connection by writing a raw 32-byte nonce. The
//! peer answers with a single framed message: a 1-byte role tag, an
//! optional 1-byte group id, and a 64-byte Ed25519 signature over the
//! nonce. Both the 65-byte and 66-byte forms are accepted; the short form
//! implies group 0.

use thiserror::Error;

/// Length of the challenge nonce written by the relay.
pub const NONCE_LEN: usize = 32;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Role tag announcing an upstream (client-facing) half.
pub const ROLE_TAG_UP: u8 = 1;

/// Role tag announcing a downstream (target-facing) half.
pub const ROLE_TAG_DOWN: u8 = 2;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid answer length {0}, expected 65 or 66")]
    BadLength(usize),
}

/// Parsed challenge answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeAnswer {
    pub role_tag: u8,
    pub group_id: u8,
    pub signature: [u8; SIGNATURE_LEN],
}

impl ChallengeAnswer {
    pub fn new(role_tag: u8, group_id: u8, signature: [u8; SIGNATURE_LEN]) -> Self {
        Self {
            role_tag,
            group_id,
            signature,
        }
    }

    /// Encode as the framed-message payload.
    ///
    /// Group 0 emits the 65-byte backward-compatible form without the group
    /// byte; any other group emits the 66-byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + SIGNATURE_LEN);
        out.push(self.role_tag);
        if self.group_id != 0 {
            out.push(self.group_id);
        }
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decode a framed-message payload, accepting both forms.
    pub fn decode(payload: &[u8]) -> Result<Self, HandshakeError> {
        let (group_id, sig_bytes) = match payload.len() {
            len if len == 1 + SIGNATURE_LEN => (0, &payload[1..]),
            len if len == 2 + SIGNATURE_LEN => (payload[1], &payload[2..]),
            len => return Err(HandshakeError::BadLength(len)),
        };

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(sig_bytes);

        Ok(Self {
            role_tag: payload[0],
            group_id,
            signature,
        })
    }
}
