//! Rendezvous broker
//!
//! The heart of the relay and both satellites: authenticated
//! half-connections are admitted to a broker, paired FIFO by role, group
//! and optional match token, and then spliced byte-for-byte until either
//! side closes. Each process owns exactly one broker; satellites additionally
//! observe it to drive their keep-dialing pools.

pub mod broker;
pub mod half;
pub mod splice;

pub use broker::{Admission, Broker, BrokerError, BrokerObserver, PeerLink};
pub use half::{HalfInfo, Role, Status};
pub use splice::{splice, ConnSpec, SpliceError, CHUNK_SIZE};
