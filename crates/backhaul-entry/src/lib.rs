//! Entry-point satellite
//!
//! Runs near the public clients: accepts plaintext TCP on the listener
//! addresses derived from the route table, attaches the encoded destination
//! to each accepted connection and pairs it with one of the authenticated
//! halves the keep-dialer keeps parked at the relay.

pub mod server;

pub use server::{EntryPointConfig, EntryPointServer, EntryPointError};
