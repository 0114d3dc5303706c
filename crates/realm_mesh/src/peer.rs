//! Peer registry: known peers and the live transport mapped to each.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::NodeId;
use crate::message::PeerEndpoint;
use crate::transport::{Direction, PeerConnection};

/// Result of [`PeerRegistry::adopt`].
#[derive(Debug)]
pub enum Adoption {
    /// The transport is now mapped for the peer. Any transport it replaced
    /// is returned for the caller to close.
    Adopted { replaced: Option<PeerConnection> },
    /// A live transport to the peer is kept instead; close the offered one.
    Declined,
}

/// Whether a `candidate` transport should replace the live `current` one
/// between `local` and `remote`.
///
/// Both ends reach the same answer: the transport dialed by the lower node
/// id wins. Between two transports opened the same way, the mapped one stays.
pub fn prefers(local: NodeId, remote: NodeId, candidate: Direction, current: Direction) -> bool {
    if candidate == current {
        return false;
    }
    let dialed_by_lower = if local < remote {
        Direction::Outbound
    } else {
        Direction::Inbound
    };
    candidate == dialed_by_lower
}

/// What this node knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The peer's node id.
    pub node_id: NodeId,
    /// Endpoint the peer advertised in its handshake.
    pub endpoint: String,
    /// Last time we heard from this peer.
    pub last_seen: DateTime<Utc>,
    /// Whether the peer is currently considered reachable.
    pub online: bool,
    /// When the current session was established.
    pub connected_at: DateTime<Utc>,
}

/// Registry of all known peers plus the transport mapped to each.
///
/// Records are never removed: a peer that goes away is only marked offline.
/// At most one transport is mapped per peer id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<NodeId, PeerRecord>,
    connections: HashMap<NodeId, PeerConnection>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer after a handshake.
    pub fn upsert_online(&mut self, node_id: NodeId, endpoint: &str, now: DateTime<Utc>) {
        let record = self.peers.entry(node_id).or_insert_with(|| PeerRecord {
            node_id,
            endpoint: endpoint.to_string(),
            last_seen: now,
            online: true,
            connected_at: now,
        });
        if record.endpoint != endpoint {
            record.endpoint = endpoint.to_string();
        }
        record.last_seen = now;
        record.online = true;
        record.connected_at = now;
    }

    /// Refresh `last_seen` for a known peer. Returns `false` if unknown.
    pub fn touch(&mut self, node_id: &NodeId, now: DateTime<Utc>) -> bool {
        match self.peers.get_mut(node_id) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Mark a known peer online.
    pub fn mark_online(&mut self, node_id: &NodeId) {
        if let Some(record) = self.peers.get_mut(node_id) {
            record.online = true;
        }
    }

    /// Mark a peer offline without touching its transport mapping.
    pub fn mark_offline(&mut self, node_id: &NodeId) {
        if let Some(record) = self.peers.get_mut(node_id) {
            record.online = false;
        }
    }

    /// Map `conn` as the transport for `node_id`.
    ///
    /// Returns the transport it replaced, if that was a different one. The
    /// caller is responsible for closing it.
    pub fn attach(&mut self, node_id: NodeId, conn: PeerConnection) -> Option<PeerConnection> {
        let conn_id = conn.conn_id();
        self.connections
            .insert(node_id, conn)
            .filter(|previous| previous.conn_id() != conn_id)
    }

    /// Offer `conn` as the transport to `node_id` after a handshake.
    ///
    /// Adopted when no live transport is mapped for the peer, or when `conn`
    /// wins the [`prefers`] tie-break against it. `local` is this node's id.
    pub fn adopt(&mut self, local: NodeId, node_id: NodeId, conn: PeerConnection) -> Adoption {
        if let Some(current) = self.connections.get(&node_id) {
            let contested = current.conn_id() != conn.conn_id() && !current.is_closed();
            if contested && !prefers(local, node_id, conn.direction(), current.direction()) {
                return Adoption::Declined;
            }
        }
        Adoption::Adopted {
            replaced: self.attach(node_id, conn),
        }
    }

    /// Remove the mapping for `node_id` only if it still refers to `conn_id`.
    pub fn detach_if(&mut self, node_id: &NodeId, conn_id: u64) -> bool {
        match self.connections.get(node_id) {
            Some(conn) if conn.conn_id() == conn_id => {
                self.connections.remove(node_id);
                true
            }
            _ => false,
        }
    }

    /// The transport mapped for `node_id`, if any.
    pub fn connection(&self, node_id: &NodeId) -> Option<&PeerConnection> {
        self.connections.get(node_id)
    }

    /// Every mapped transport with its peer id.
    pub fn connections(&self) -> impl Iterator<Item = (&NodeId, &PeerConnection)> {
        self.connections.iter()
    }

    /// Get a peer record by id.
    pub fn get_peer(&self, node_id: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(node_id)
    }

    /// Whether a record exists for `node_id`.
    pub fn is_known(&self, node_id: &NodeId) -> bool {
        self.peers.contains_key(node_id)
    }

    /// Online peers as `{nodeId, endpoint}` pairs, skipping `exclude`.
    pub fn online_endpoints(&self, exclude: &NodeId) -> Vec<PeerEndpoint> {
        self.peers
            .values()
            .filter(|p| p.online && &p.node_id != exclude)
            .map(|p| PeerEndpoint {
                node_id: p.node_id,
                endpoint: p.endpoint.clone(),
            })
            .collect()
    }

    /// List all known peers regardless of state.
    pub fn list_all(&self) -> Vec<&PeerRecord> {
        self.peers.values().collect()
    }

    /// Mark every online peer not seen since `cutoff` offline and unmap its
    /// transport. Returns the evicted peers with their transports (if any),
    /// which the caller should close.
    pub fn evict_stale(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Vec<(NodeId, Option<PeerConnection>)> {
        let stale: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| p.online && p.last_seen < cutoff)
            .map(|p| p.node_id)
            .collect();

        stale
            .into_iter()
            .map(|node_id| {
                self.mark_offline(&node_id);
                let conn = self.connections.remove(&node_id);
                (node_id, conn)
            })
            .collect()
    }

    /// Unmap every transport and return them.
    pub fn take_all_connections(&mut self) -> Vec<PeerConnection> {
        self.connections.drain().map(|(_, conn)| conn).collect()
    }

    /// Mark every peer offline.
    pub fn mark_all_offline(&mut self) {
        for record in self.peers.values_mut() {
            record.online = false;
        }
    }

    /// Number of peers with a mapped transport.
    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of online peers.
    pub fn online_count(&self) -> usize {
        self.peers.values().filter(|p| p.online).count()
    }

    /// Total number of known peers.
    pub fn total_count(&self) -> usize {
        self.peers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
