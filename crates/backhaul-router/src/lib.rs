//! Entry-point routing rules
//!
//! A route maps a local listener address to a destination behind the
//! reverse proxy. Rules are given as colon-separated strings:
//!
//! - `P:P`     — listen on `*:P1`, forward to `127.0.0.1:P2`
//! - `H:P:P`   — listen on `H:P1`, forward to `127.0.0.1:P2`
//! - `P:H:P`   — listen on `*:P1`, forward to `H:P2`
//! - `H:P:H:P` — listen on `H1:P1`, forward to `H2:P2`
//!
//! A first token that is a decimal port selects the port-first reading.
//! Destination hosts are resolved to concrete addresses once, at parse
//! time, because the route blob carries a raw IP.

use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid route '{0}': expected P:P, H:P:P, P:H:P or H:P:H:P")]
    BadSyntax(String),

    #[error("invalid port '{0}'")]
    BadPort(String),

    #[error("cannot resolve destination host '{0}'")]
    Unresolvable(String),
}

/// Source-side host selector. `*` matches any bind address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Any,
    Named(String),
}

impl HostPattern {
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Any => true,
            HostPattern::Named(name) => name == host,
        }
    }

    /// The address this pattern binds a listener to.
    pub fn bind_host(&self) -> &str {
        match self {
            HostPattern::Any => "0.0.0.0",
            HostPattern::Named(name) => name,
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Any => write!(f, "*"),
            HostPattern::Named(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRule {
    pub src_host: HostPattern,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_host, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Ordered route rules with linear first-match lookup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// Parse and resolve a list of route strings. Order is preserved.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self, RouteError> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let rule = parse_rule(spec.as_ref())?;
            debug!("route registered: {}", rule);
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    /// First rule matching `(host, port)`, in insertion order.
    pub fn lookup(&self, host: &str, port: u16) -> Option<&RouteRule> {
        self.rules
            .iter()
            .find(|rule| rule.src_port == port && rule.src_host.matches(host))
    }

    /// Distinct `(src_host, src_port)` pairs, one listener each.
    pub fn listen_addrs(&self) -> Vec<(HostPattern, u16)> {
        let mut addrs: Vec<(HostPattern, u16)> = Vec::new();
        for rule in &self.rules {
            let key = (rule.src_host.clone(), rule.src_port);
            if !addrs.contains(&key) {
                addrs.push(key);
            }
        }
        addrs
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_rule(spec: &str) -> Result<RouteRule, RouteError> {
    let tokens: Vec<&str> = spec.split(':').collect();

    let (src_host, src_port, dst_host, dst_port) = match tokens.as_slice() {
        [p1, p2] => (HostPattern::Any, parse_port(p1)?, "127.0.0.1", parse_port(p2)?),
        [first, mid, last] => {
            if is_port(first) {
                (HostPattern::Any, parse_port(first)?, *mid, parse_port(last)?)
            } else {
                (
                    HostPattern::Named(first.to_string()),
                    parse_port(mid)?,
                    "127.0.0.1",
                    parse_port(last)?,
                )
            }
        }
        [h1, p1, h2, p2] => (
            host_pattern(h1),
            parse_port(p1)?,
            *h2,
            parse_port(p2)?,
        ),
        _ => return Err(RouteError::BadSyntax(spec.to_string())),
    };

    Ok(RouteRule {
        src_host,
        src_port,
        dst_ip: resolve_host(dst_host)?,
        dst_port,
    })
}

fn host_pattern(token: &str) -> HostPattern {
    if token == "*" {
        HostPattern::Any
    } else {
        HostPattern::Named(token.to_string())
    }
}

fn is_port(token: &str) -> bool {
    parse_port(token).is_ok()
}

fn parse_port(token: &str) -> Result<u16, RouteError> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RouteError::BadPort(token.to_string()));
    }
    token
        .parse()
        .map_err(|_| RouteError::BadPort(token.to_string()))
}

fn resolve_host(host: &str) -> Result<IpAddr, RouteError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    (host, 0)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| RouteError::Unresolvable(host.to_string()))
}
