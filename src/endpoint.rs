//! Connection endpoints and their native socket-address form.
//!
//! An [`Endpoint`] is what the rest of the crate reasons about; a
//! [`SockAddr`] is what the intercepted socket APIs hand us and expect back.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use socket2::SockAddr;

use crate::error::{HookError, Result};

/// Connection target: an IPv4 or IPv6 socket address, or a domain name and
/// port that only the proxy resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Endpoint {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Domain { host: String, port: u16 },
}

impl Endpoint {
    /// Create a domain endpoint.
    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Domain {
            host: host.into(),
            port,
        }
    }

    /// Convert a native socket address. Families other than IPv4/IPv6 yield `None`.
    pub fn from_native(addr: &SockAddr) -> Option<Self> {
        addr.as_socket().map(Self::from)
    }

    /// Build the native socket address. Domain endpoints have no native form.
    pub fn to_native(&self) -> Option<SockAddr> {
        self.socket_addr().map(SockAddr::from)
    }

    /// The IP socket address, if this is not a domain endpoint.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::V4(v4) => Some(SocketAddr::V4(*v4)),
            Endpoint::V6(v6) => Some(SocketAddr::V6(*v6)),
            Endpoint::Domain { .. } => None,
        }
    }

    /// An IPv4-mapped IPv6 endpoint as the IPv4 endpoint it stands for.
    /// Everything else is returned unchanged.
    pub fn unmapped(self) -> Self {
        match self {
            Endpoint::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => Endpoint::V4(SocketAddrV4::new(v4, v6.port())),
                None => Endpoint::V6(v6),
            },
            other => other,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::V4(v4) => v4.port(),
            Endpoint::V6(v6) => v6.port(),
            Endpoint::Domain { port, .. } => *port,
        }
    }

    /// Whether the endpoint refers to this host.
    ///
    /// Domain endpoints are only local when spelled `localhost`; anything
    /// else is left for the proxy to resolve.
    pub fn is_loopback(&self) -> bool {
        match self {
            Endpoint::V4(v4) => v4.ip().is_loopback(),
            Endpoint::V6(v6) => is_loopback_v6(v6.ip()),
            Endpoint::Domain { host, .. } => host.eq_ignore_ascii_case("localhost"),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Endpoint::V4(v4),
            SocketAddr::V6(v6) => Endpoint::V6(v6),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4(v4) => write!(f, "{}", v4),
            Endpoint::V6(v6) => write!(f, "[{}]:{}", v6.ip(), v6.port()),
            Endpoint::Domain { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = HookError;

    /// Parse `a.b.c.d:port`, `[v6]:port` or `host:port`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| HookError::InvalidEndpoint(format!("missing port in '{}'", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| HookError::InvalidEndpoint(format!("invalid port in '{}'", s)))?;

        if host.is_empty() || host.contains(':') || host.contains('[') {
            return Err(HookError::InvalidEndpoint(format!("invalid host in '{}'", s)));
        }
        Ok(Endpoint::domain(host, port))
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl TryFrom<String> for Endpoint {
    type Error = HookError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Loopback test on a native address: 127.0.0.0/8, `::1`, and the
/// IPv4-mapped form of 127.0.0.0/8.
pub fn is_loopback(addr: &SockAddr) -> bool {
    match addr.as_socket() {
        Some(SocketAddr::V4(v4)) => v4.ip().is_loopback(),
        Some(SocketAddr::V6(v6)) => is_loopback_v6(v6.ip()),
        None => false,
    }
}

/// Family, address bytes and port equality of two native addresses.
pub fn same_address(a: &SockAddr, b: &SockAddr) -> bool {
    match (a.as_socket(), b.as_socket()) {
        (Some(SocketAddr::V4(x)), Some(SocketAddr::V4(y))) => x.ip() == y.ip() && x.port() == y.port(),
        (Some(SocketAddr::V6(x)), Some(SocketAddr::V6(y))) => x.ip() == y.ip() && x.port() == y.port(),
        _ => false,
    }
}

/// Parse a literal IP host, accepting bracketed IPv6.
pub(crate) fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse().ok()
}

/// Build an IP endpoint from a bare address and port.
pub(crate) fn ip_endpoint(ip: IpAddr, port: u16) -> Endpoint {
    match ip {
        IpAddr::V4(v4) => Endpoint::V4(SocketAddrV4::new(v4, port)),
        IpAddr::V6(v6) => Endpoint::V6(SocketAddrV6::new(v6, port, 0, 0)),
    }
}

fn is_loopback_v6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback() || ip.to_ipv4_mapped().is_some_and(|v4: Ipv4Addr| v4.is_loopback())
}
