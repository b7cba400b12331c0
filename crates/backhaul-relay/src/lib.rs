//! Public rendezvous server
//!
//! Terminates TLS, authenticates each peer with an Ed25519
//! challenge/response, classifies it as an upstream or downstream half and
//! hands it to the broker for pairing and splicing.

pub mod server;

pub use server::{RelayConfig, RelayServer, RelayServerError, DRAIN_DEADLINE};
