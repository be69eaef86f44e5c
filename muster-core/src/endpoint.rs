use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MembershipError;

/// Network-reachable address of a cluster member.
///
/// Equality and ordering are defined over `(host, port)`, which makes the
/// type usable as a ring key and as a map key throughout the protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or literal IP address.
    pub host: String,
    /// Listen port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint from a host string and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Creates an endpoint from a resolved socket address.
    #[must_use]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MembershipError::Configuration(format!("invalid endpoint '{s}'")))?;
        if host.is_empty() {
            return Err(MembershipError::Configuration(format!(
                "invalid endpoint '{s}': empty host"
            )));
        }
        let port = port.parse::<u16>().map_err(|err| {
            MembershipError::Configuration(format!("invalid endpoint '{s}': {err}"))
        })?;
        Ok(Self::new(host, port))
    }
}

/// Opaque 128-bit identifier a joining node assigns to itself.
///
/// Uniqueness within a configuration is a protocol invariant; identifiers
/// once admitted are remembered for the lifetime of the process to reject
/// replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Mints a fresh random identifier for a joining node.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing identifier (used by tests and wire decoding).
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Raw 128-bit value, used when folding identifiers into digests.
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0.as_u128()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Immutable application-supplied key/value tags attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(std::collections::BTreeMap<String, String>);

impl Metadata {
    /// Empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tag, returning self for builder-style chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Looks up a tag value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// True when no tags are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn endpoint_parses_host_and_port() {
        let endpoint: Endpoint = "10.0.0.7:5872".parse().unwrap();
        assert_eq!(endpoint.host, "10.0.0.7");
        assert_eq!(endpoint.port, 5872);
        assert_eq!(endpoint.to_string(), "10.0.0.7:5872");
    }

    #[test]
    fn endpoint_rejects_missing_port() {
        assert!("just-a-host".parse::<Endpoint>().is_err());
        assert!(":9000".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn node_ids_are_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_ne!(a, b);
    }
}
