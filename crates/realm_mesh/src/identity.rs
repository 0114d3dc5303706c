//! Node identity.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A random 128-bit node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new random node ID (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Who this node is on the mesh: its id and the endpoint peers should dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    /// `host:port` advertised in handshakes.
    pub endpoint: String,
}

impl NodeIdentity {
    pub fn new(node_id: NodeId, endpoint: impl Into<String>) -> Self {
        Self {
            node_id,
            endpoint: endpoint.into(),
        }
    }
}

/// Split a `host:port` endpoint, validating the port.
pub fn split_endpoint(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host, port))
}

/// The endpoint to record for a peer that advertised `advertised` over a
/// transport whose remote end is `observed`.
///
/// A wildcard host, or a loopback host seen from a non-loopback address, is
/// replaced by the observed IP with the advertised port. Anything else is
/// kept as advertised.
pub fn reachable_endpoint(advertised: &str, observed: SocketAddr) -> String {
    let Some((host, port)) = split_endpoint(advertised) else {
        return advertised.to_string();
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let substitute = match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => true,
        Ok(ip) if ip.is_loopback() => !observed.ip().is_loopback(),
        _ => false,
    };

    if substitute {
        SocketAddr::new(observed.ip(), port).to_string()
    } else {
        advertised.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
