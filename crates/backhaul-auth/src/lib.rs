//! Ed25519 challenge/response identity
//!
//! The relay proves nothing about itself beyond its TLS certificate;
//! satellites prove themselves by signing a fresh 32-byte nonce with a
//! shared deployment signing key. This crate holds both sides of that
//! exchange plus the raw key-file loading.

use backhaul_proto::{NONCE_LEN, SIGNATURE_LEN};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid key length {0}, expected 32 raw bytes")]
    BadKeyLength(usize),

    #[error("invalid verifying key: {0}")]
    BadKey(ed25519_dalek::SignatureError),

    #[error("challenge signature verification failed")]
    Unauthenticated,
}

/// Generate a fresh challenge nonce. Never reused across connections.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Satellite-side signer over challenge nonces.
#[derive(Clone)]
pub struct ChallengeSigner {
    key: SigningKey,
}

impl ChallengeSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Load from a raw 32-byte seed file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let seed: [u8; 32] = read_key_bytes(path.as_ref())?;
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }

    pub fn sign(&self, nonce: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.key.sign(nonce).to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

/// Relay-side verifier of challenge answers.
#[derive(Clone)]
pub struct ChallengeVerifier {
    key: VerifyingKey,
}

impl ChallengeVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Load from a raw 32-byte public key file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let raw: [u8; 32] = read_key_bytes(path.as_ref())?;
        let key = VerifyingKey::from_bytes(&raw).map_err(AuthError::BadKey)?;
        Ok(Self::new(key))
    }

    pub fn verify(&self, nonce: &[u8], signature: &[u8; SIGNATURE_LEN]) -> Result<(), AuthError> {
        let signature = Signature::from_bytes(signature);
        self.key
            .verify(nonce, &signature)
            .map_err(|_| AuthError::Unauthenticated)
    }
}

fn read_key_bytes(path: &Path) -> Result<[u8; 32], AuthError> {
    let raw = std::fs::read(path).map_err(|source| AuthError::KeyFile {
        path: path.display().to_string(),
        source,
    })?;

    raw.try_into()
        .map_err(|raw: Vec<u8>| AuthError::BadKeyLength(raw.len()))
}
