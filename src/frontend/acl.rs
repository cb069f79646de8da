//! Source address access control.
//!
//! Rules are checked in order and the first rule whose network contains the
//! client address decides. When nothing matches, the list's default applies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// What to do with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

/// Returned when a connection is rejected by the access rules.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection from {0} denied by access rules")]
pub struct AccessDenied(pub IpAddr);

/// Error parsing a rule source.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkParseError {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid prefix length in '{0}'")]
    InvalidPrefix(String),
}

/// A network an access rule applies to.
///
/// Addresses are stored already masked, so `10.1.2.3/8` and `10.0.0.0/8`
/// describe the same network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Network {
    /// Matches every source address.
    Any,
    V4 { addr: u32, mask: u32 },
    V6 { addr: u128, mask: u128 },
}

impl Network {
    /// Build a network from an address and a prefix length.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, NetworkParseError> {
        match addr {
            IpAddr::V4(v4) => {
                if prefix_len > 32 {
                    return Err(NetworkParseError::InvalidPrefix(format!("{addr}/{prefix_len}")));
                }
                let mask = if prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(prefix_len))
                };
                Ok(Network::V4 {
                    addr: u32::from(v4) & mask,
                    mask,
                })
            }
            IpAddr::V6(v6) => {
                if prefix_len > 128 {
                    return Err(NetworkParseError::InvalidPrefix(format!("{addr}/{prefix_len}")));
                }
                let mask = if prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(prefix_len))
                };
                Ok(Network::V6 {
                    addr: u128::from(v6) & mask,
                    mask,
                })
            }
        }
    }

    /// Check whether `ip` falls inside this network.
    ///
    /// IPv4-mapped IPv6 clients (`::ffff:a.b.c.d`) are matched against IPv4
    /// rules, which is what dual-stack listeners hand us.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, normalize(ip)) {
            (Network::Any, _) => true,
            (Network::V4 { addr, mask }, IpAddr::V4(v4)) => u32::from(v4) & mask == *addr,
            (Network::V6 { addr, mask }, IpAddr::V6(v6)) => u128::from(v6) & mask == *addr,
            _ => false,
        }
    }
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

impl FromStr for Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "all" {
            return Ok(Network::Any);
        }

        let (addr_str, prefix) = match s.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (s, None),
        };

        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| NetworkParseError::InvalidAddress(s.to_string()))?;

        let prefix_len = match prefix {
            Some(len) => len
                .parse::<u8>()
                .map_err(|_| NetworkParseError::InvalidPrefix(s.to_string()))?,
            None if addr.is_ipv4() => 32,
            None => 128,
        };

        Network::new(addr, prefix_len)
    }
}

impl TryFrom<String> for Network {
    type Error = NetworkParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Network> for String {
    fn from(network: Network) -> Self {
        network.to_string()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Any => f.write_str("all"),
            Network::V4 { addr, mask } => {
                write!(f, "{}/{}", Ipv4Addr::from(*addr), mask.count_ones())
            }
            Network::V6 { addr, mask } => {
                write!(f, "{}/{}", Ipv6Addr::from(*addr), mask.count_ones())
            }
        }
    }
}

/// A single allow/deny rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessRule {
    pub action: Action,
    pub source: Network,
}

impl AccessRule {
    pub fn allow(source: Network) -> Self {
        Self {
            action: Action::Allow,
            source,
        }
    }

    pub fn deny(source: Network) -> Self {
        Self {
            action: Action::Deny,
            source,
        }
    }
}

/// Ordered rule list with a fallback action.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AccessList {
    /// Action when no rule matches
    #[serde(default = "default_action")]
    pub default: Action,

    /// Rules, first match wins
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

fn default_action() -> Action {
    Action::Deny
}

impl AccessList {
    /// Create a rule list with an explicit fallback action.
    pub fn new(rules: Vec<AccessRule>, default: Action) -> Self {
        Self { default, rules }
    }

    /// A list that lets every client through. Used when a frontend has no
    /// `access` block at all.
    pub fn allow_all() -> Self {
        Self::new(Vec::new(), Action::Allow)
    }

    /// Decide what to do with a connection from `source`.
    pub fn evaluate(&self, source: IpAddr) -> Action {
        self.rules
            .iter()
            .find(|rule| rule.source.contains(source))
            .map(|rule| rule.action)
            .unwrap_or(self.default)
    }

    /// Like [`evaluate`](Self::evaluate), as a `Result`.
    pub fn check(&self, source: IpAddr) -> Result<(), AccessDenied> {
        match self.evaluate(source) {
            Action::Allow => Ok(()),
            Action::Deny => Err(AccessDenied(source)),
        }
    }
}
