//! Fixed-width route blob codec
//!
//! A route blob is exactly 18 bytes: a 16-byte IP address followed by a
//! 2-byte big-endian port. IPv4 addresses occupy the low 4 bytes with the
//! high 12 bytes zero; anything else is interpreted as IPv6.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Encoded size of a route blob.
pub const ROUTE_BLOB_LEN: usize = 18;

#[derive(Debug, Error)]
pub enum RouteBlobError {
    #[error("invalid route blob length {0}, expected {ROUTE_BLOB_LEN}")]
    BadLength(usize),
}

/// Encode a destination address as an 18-byte route blob.
pub fn encode_route(ip: IpAddr, port: u16) -> [u8; ROUTE_BLOB_LEN] {
    let mut blob = [0u8; ROUTE_BLOB_LEN];
    match ip {
        IpAddr::V4(v4) => blob[12..16].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => blob[..16].copy_from_slice(&v6.octets()),
    }
    blob[16..].copy_from_slice(&port.to_be_bytes());
    blob
}

/// Decode an 18-byte route blob back into a destination address.
pub fn decode_route(blob: &[u8]) -> Result<(IpAddr, u16), RouteBlobError> {
    if blob.len() != ROUTE_BLOB_LEN {
        return Err(RouteBlobError::BadLength(blob.len()));
    }

    let ip = if blob[..12].iter().all(|&b| b == 0) {
        IpAddr::V4(Ipv4Addr::new(blob[12], blob[13], blob[14], blob[15]))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&blob[..16]);
        IpAddr::V6(Ipv6Addr::from(octets))
    };

    let port = u16::from_be_bytes([blob[16], blob[17]]);
    Ok((ip, port))
}
