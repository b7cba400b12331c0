//! Reverse-proxy satellite
//!
//! Runs inside the private network. Keeps authenticated halves parked at
//! the relay; when one receives a route payload it dials the named target
//! and joins the target connection back through the local broker, matched
//! to the requesting half by the route bytes.

pub mod server;

pub use server::{ReverseProxyConfig, ReverseProxyServer, ReverseProxyError};
