//! Wire-level protocol definitions
//!
//! This crate defines the byte-level protocol spoken between the relay and
//! its satellites: the length-prefixed framing used for the handshake, the
//! challenge/answer message layout, and the fixed-width route blob that
//! carries a destination address across the relay.

pub mod frame;
pub mod handshake;
pub mod route;

pub use frame::{write_frame, FrameError, FramedReader};
pub use handshake::{ChallengeAnswer, HandshakeError, NONCE_LEN, ROLE_TAG_DOWN, ROLE_TAG_UP, SIGNATURE_LEN};
pub use route::{decode_route, encode_route, RouteBlobError, ROUTE_BLOB_LEN};
