//! Tunnel target addresses.
//!
//! The target declaration carries a plain `host:port` string. IPv6 literals
//! are bracketed (`[::1]:443`) so the port separator stays unambiguous.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Destination the relay connects to on the client's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    /// Create a target from a host name or IP literal and a port.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.is_empty() {
            return Err(Error::handshake("target host is empty"));
        }
        if port == 0 {
            return Err(Error::handshake("target port must be non-zero"));
        }
        if bare.contains(':') && bare.parse::<Ipv6Addr>().is_err() {
            return Err(Error::handshake(format!("invalid target host: {}", host)));
        }
        Ok(Self {
            host: bare.to_string(),
            port,
        })
    }

    /// Parse a `host:port` declaration.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| Error::handshake("unterminated IPv6 literal"))?;
            if host.parse::<Ipv6Addr>().is_err() {
                return Err(Error::handshake(format!("invalid IPv6 literal: {}", host)));
            }
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| Error::handshake("missing ':' separator"))?;
            (host, port)
        } else {
            let (host, port) = s
                .rsplit_once(':')
                .ok_or_else(|| Error::handshake("missing ':' separator"))?;
            if host.contains(':') {
                return Err(Error::handshake("IPv6 targets must be bracketed"));
            }
            (host, port)
        };

        let port: u16 = port
            .parse()
            .map_err(|_| Error::handshake(format!("non-numeric port: {:?}", port)))?;
        Self::new(host, port)
    }

    /// Target for an IPv4 address.
    pub fn from_ipv4(ip: Ipv4Addr, port: u16) -> Result<Self> {
        Self::new(ip.to_string(), port)
    }

    /// Target for an IPv6 address.
    pub fn from_ipv6(ip: Ipv6Addr, port: u16) -> Result<Self> {
        Self::new(ip.to_string(), port)
    }

    /// Host name or IP literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for TargetAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
