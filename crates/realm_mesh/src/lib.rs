//! Realm Mesh: peer-to-peer replication over raw TCP.
//!
//! Independently run nodes find each other, keep a gossip mesh of live
//! transports, and periodically reconcile their copies of the shared
//! business collections held in a [`realm_store::ReplicaStore`].
//!
//! # Architecture
//!
//! - **Transport**: TCP with 4-byte big-endian length-prefixed JSON frames.
//! - **Handshake**: HELLO / HELLO_ACK, then a PEER_LIST so the mesh fills in.
//! - **Routing**: every message id is processed once; application messages
//!   are flooded with a decrementing ttl and delivered to registered handlers.
//! - **Liveness**: heartbeats plus a cleanup pass that marks silent peers
//!   offline and trims the dedup cache.
//! - **Sync**: snapshots of the store exchanged as SYNC_PACKAGE messages and
//!   merged first-write-wins.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use realm_mesh::{MeshConfig, MeshNode, SyncCoordinator};
//! use realm_store::MemoryStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = MeshNode::new(MeshConfig::default());
//! node.start(5001).await?;
//! node.connect_to_peer("10.0.0.7:5001").await?;
//!
//! let sync = Arc::new(SyncCoordinator::new(node.clone(), Arc::new(MemoryStore::new())));
//! sync.attach().await;
//! sync.request_sync(None).await?;
//!
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod liveness;
pub mod logging;
pub mod message;
pub mod node;
pub mod peer;
pub mod router;
pub mod sync;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{MeshConfig, SyncConfig};
pub use error::MeshError;
pub use identity::{NodeId, NodeIdentity};
pub use liveness::CleanupReport;
pub use message::{DEFAULT_TTL, Envelope, MessageKind};
pub use node::MeshNode;
pub use peer::{PeerRecord, PeerRegistry};
pub use router::{MessageHandler, handler};
pub use sync::{ApplyOutcome, RejectReason, SyncCoordinator, SyncError, SyncPackage};
