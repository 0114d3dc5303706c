//! Snapshot exchange between nodes.
//!
//! A [`SyncCoordinator`] turns the local [`ReplicaStore`] into a
//! [`SyncPackage`] and merges packages received from other nodes. Merging is
//! insert-if-absent inside one storage transaction: rows already present
//! locally are left untouched, so the first copy of a row to arrive wins.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use realm_store::{
    Account, ComputeNode, EntityKind, EntityRecord, LedgerEntry, Offer, Pool, PoolMember,
    ReplicaStore, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::MeshError;
use crate::identity::NodeId;
use crate::message::{Envelope, MessageKind};
use crate::node::MeshNode;
use crate::router::handler;

/// Errors from building or applying snapshots.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The store failed; any partial merge was rolled back.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The blocking storage task panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The request could not be put on the mesh.
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Payload of SYNC_REQUEST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    /// Ledger rows created after this instant are wanted; `None` asks for all.
    pub since: Option<DateTime<Utc>>,
    pub requester_id: NodeId,
}

/// The only operation snapshots carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOperation {
    Upsert,
}

/// One row in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEntity<T> {
    pub entity: T,
    pub modified_at: DateTime<Utc>,
    pub operation: SyncOperation,
}

impl<T> SyncEntity<T> {
    fn upsert(entity: T, modified_at: DateTime<Utc>) -> Self {
        Self {
            entity,
            modified_at,
            operation: SyncOperation::Upsert,
        }
    }
}

/// A snapshot of the replicated collections as seen by one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPackage {
    pub timestamp: DateTime<Utc>,
    pub source_node_id: NodeId,
    pub version: u64,
    #[serde(default)]
    pub users: Vec<SyncEntity<Account>>,
    #[serde(default)]
    pub pools: Vec<SyncEntity<Pool>>,
    #[serde(default)]
    pub pool_members: Vec<SyncEntity<PoolMember>>,
    #[serde(default)]
    pub ledger_entries: Vec<SyncEntity<LedgerEntry>>,
    #[serde(default)]
    pub offers: Vec<SyncEntity<Offer>>,
    #[serde(default)]
    pub nodes: Vec<SyncEntity<ComputeNode>>,
}

impl SyncPackage {
    /// An empty package stamped with `source`.
    pub fn empty(source_node_id: NodeId, version: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            source_node_id,
            version,
            users: Vec::new(),
            pools: Vec::new(),
            pool_members: Vec::new(),
            ledger_entries: Vec::new(),
            offers: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Add a row to the list for its kind.
    pub fn push(&mut self, record: EntityRecord, modified_at: DateTime<Utc>) {
        match record {
            EntityRecord::Account(e) => self.users.push(SyncEntity::upsert(e, modified_at)),
            EntityRecord::Pool(e) => self.pools.push(SyncEntity::upsert(e, modified_at)),
            EntityRecord::PoolMember(e) => {
                self.pool_members.push(SyncEntity::upsert(e, modified_at))
            }
            EntityRecord::LedgerEntry(e) => {
                self.ledger_entries.push(SyncEntity::upsert(e, modified_at))
            }
            EntityRecord::Offer(e) => self.offers.push(SyncEntity::upsert(e, modified_at)),
            EntityRecord::ComputeNode(e) => self.nodes.push(SyncEntity::upsert(e, modified_at)),
        }
    }

    /// Every row, in collection order.
    pub fn into_records(self) -> Vec<EntityRecord> {
        let mut records = Vec::with_capacity(self.entity_count());
        records.extend(self.users.into_iter().map(|s| s.entity.into()));
        records.extend(self.pools.into_iter().map(|s| s.entity.into()));
        records.extend(self.pool_members.into_iter().map(|s| s.entity.into()));
        records.extend(self.ledger_entries.into_iter().map(|s| s.entity.into()));
        records.extend(self.offers.into_iter().map(|s| s.entity.into()));
        records.extend(self.nodes.into_iter().map(|s| s.entity.into()));
        records
    }

    /// Total number of rows across all collections.
    pub fn entity_count(&self) -> usize {
        self.users.len()
            + self.pools.len()
            + self.pool_members.len()
            + self.ledger_entries.len()
            + self.offers.len()
            + self.nodes.len()
    }
}

/// Why a package was ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The package came from this node.
    SelfOrigin,
    /// The serialized package exceeds the configured limit.
    Oversize { size: usize, max: usize },
    /// The serialized package could not be decoded.
    Malformed(String),
}

/// Result of offering a package to [`SyncCoordinator::apply_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The merge committed.
    Applied { inserted: usize, skipped: usize },
    /// The package was ignored without touching the store.
    Rejected(RejectReason),
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Builds and merges snapshots for one node.
pub struct SyncCoordinator {
    node: MeshNode,
    store: Arc<dyn ReplicaStore>,
    config: SyncConfig,
    version: AtomicU64,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl SyncCoordinator {
    pub fn new(node: MeshNode, store: Arc<dyn ReplicaStore>) -> Self {
        let config = node.config().sync.clone();
        Self {
            node,
            store,
            config,
            version: AtomicU64::new(0),
            last_sync: Mutex::new(None),
        }
    }

    /// Timestamp of the last package merged, if any.
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock()
    }

    /// Ask the mesh for a snapshot. `None` uses the last-sync marker.
    ///
    /// Fire-and-forget: returns how many transports the request was queued on.
    pub async fn request_sync(&self, since: Option<DateTime<Utc>>) -> Result<usize, SyncError> {
        let payload = SyncRequestPayload {
            since: since.or_else(|| self.last_sync_time()),
            requester_id: self.node.node_id(),
        };
        let envelope = Envelope::with_json(self.node.node_id(), MessageKind::SyncRequest, &payload)?
            .with_ttl(self.node.config().default_ttl);
        let sent = self.node.broadcast(envelope).await?;
        debug!("SYNC_REQUEST (since {:?}) sent to {sent} peers", payload.since);
        Ok(sent)
    }

    /// Snapshot the local store.
    ///
    /// Ledger rows are limited to those created after `since`; every other
    /// collection is included in full.
    pub async fn build_snapshot(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncPackage, SyncError> {
        let store = Arc::clone(&self.store);
        let rows = tokio::task::spawn_blocking(move || -> realm_store::Result<Vec<EntityRecord>> {
            let mut rows = Vec::new();
            for kind in EntityKind::ALL {
                let mut batch = match since {
                    Some(since) if kind.has_creation_time() => {
                        store.enumerate_since(kind, since)?
                    }
                    _ => store.enumerate_all(kind)?,
                };
                rows.append(&mut batch);
            }
            Ok(rows)
        })
        .await??;

        let now = Utc::now();
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let mut package = SyncPackage::empty(self.node.node_id(), version, now);
        for record in rows {
            let modified_at = record.created_at().unwrap_or(now);
            package.push(record, modified_at);
        }

        debug!(
            "Built snapshot v{version} with {} rows (since {since:?})",
            package.entity_count()
        );
        Ok(package)
    }

    /// [`build_snapshot`](Self::build_snapshot), serialized to JSON.
    pub async fn get_sync_package(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, SyncError> {
        let package = self.build_snapshot(since).await?;
        Ok(serde_json::to_string(&package)?)
    }

    /// Merge a package into the local store.
    ///
    /// Packages from this node or larger than the configured limit are
    /// rejected without touching the store. A storage failure rolls back the
    /// whole merge and is returned.
    pub async fn apply_snapshot(&self, package: SyncPackage) -> Result<ApplyOutcome, SyncError> {
        if package.source_node_id == self.node.node_id() {
            debug!("Ignoring our own snapshot v{}", package.version);
            return Ok(ApplyOutcome::Rejected(RejectReason::SelfOrigin));
        }

        let size = serde_json::to_vec(&package)?.len();
        if let Some(reason) = self.oversize(size) {
            return Ok(ApplyOutcome::Rejected(reason));
        }

        self.merge(package).await
    }

    /// Decode a serialized package and merge it.
    ///
    /// Oversize input is rejected before decoding; undecodable input is
    /// rejected as malformed rather than returned as an error.
    pub async fn apply_sync_package(&self, serialized: &str) -> Result<ApplyOutcome, SyncError> {
        if let Some(reason) = self.oversize(serialized.len()) {
            return Ok(ApplyOutcome::Rejected(reason));
        }

        let package: SyncPackage = match serde_json::from_str(serialized) {
            Ok(package) => package,
            Err(e) => {
                debug!("Dropping undecodable sync package: {e}");
                return Ok(ApplyOutcome::Rejected(RejectReason::Malformed(e.to_string())));
            }
        };

        if package.source_node_id == self.node.node_id() {
            debug!("Ignoring our own snapshot v{}", package.version);
            return Ok(ApplyOutcome::Rejected(RejectReason::SelfOrigin));
        }

        self.merge(package).await
    }

    fn oversize(&self, size: usize) -> Option<RejectReason> {
        let max = self.config.max_package_bytes;
        if size > max {
            warn!("Ignoring sync package of {size} bytes (limit {max})");
            Some(RejectReason::Oversize { size, max })
        } else {
            None
        }
    }

    async fn merge(&self, package: SyncPackage) -> Result<ApplyOutcome, SyncError> {
        let source = package.source_node_id;
        let version = package.version;
        let timestamp = package.timestamp;
        let records = package.into_records();
        let store = Arc::clone(&self.store);

        let (inserted, skipped) =
            tokio::task::spawn_blocking(move || -> realm_store::Result<(usize, usize)> {
                let mut inserted = 0;
                let mut skipped = 0;
                store.transaction(&mut |tx| {
                    inserted = 0;
                    skipped = 0;
                    for record in &records {
                        if tx.find_by_id(record.kind(), record.id())?.is_some() {
                            skipped += 1;
                            continue;
                        }
                        tx.insert(record)?;
                        inserted += 1;
                    }
                    Ok(())
                })?;
                Ok((inserted, skipped))
            })
            .await??;

        {
            let mut last_sync = self.last_sync.lock();
            if last_sync.is_none_or(|current| timestamp > current) {
                *last_sync = Some(timestamp);
            }
        }

        info!("Merged snapshot v{version} from {source}: {inserted} new, {skipped} already present");
        Ok(ApplyOutcome::Applied { inserted, skipped })
    }

    /// Register SYNC_REQUEST and SYNC_PACKAGE handlers on the node.
    ///
    /// A request from another node is answered by broadcasting a
    /// SYNC_PACKAGE built with the requested `since`; a received package is
    /// merged. Failures are logged only.
    pub async fn attach(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.node
            .on_message(
                MessageKind::SyncRequest,
                handler(move |envelope| {
                    let weak = weak.clone();
                    async move {
                        if let Some(coordinator) = weak.upgrade() {
                            tokio::spawn(async move { coordinator.answer_request(envelope).await });
                        }
                    }
                }),
            )
            .await;

        let weak = Arc::downgrade(self);
        self.node
            .on_message(
                MessageKind::SyncPackage,
                handler(move |envelope| {
                    let weak = weak.clone();
                    async move {
                        if let Some(coordinator) = weak.upgrade() {
                            tokio::spawn(async move { coordinator.receive_package(envelope).await });
                        }
                    }
                }),
            )
            .await;
    }

    async fn answer_request(&self, envelope: Envelope) {
        let request: SyncRequestPayload = match envelope.parse_payload() {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed SYNC_REQUEST from {}: {e}", envelope.from_node_id);
                return;
            }
        };
        if request.requester_id == self.node.node_id() {
            return;
        }

        let result = async {
            let serialized = self.get_sync_package(request.since).await?;
            let reply = Envelope::new(self.node.node_id(), MessageKind::SyncPackage, serialized)
                .with_ttl(self.node.config().default_ttl);
            Ok::<usize, SyncError>(self.node.broadcast(reply).await?)
        }
        .await;

        match result {
            Ok(sent) => debug!(
                "Answered SYNC_REQUEST from {} on {sent} transports",
                request.requester_id
            ),
            Err(e) => warn!(
                "Failed to answer SYNC_REQUEST from {}: {e}",
                request.requester_id
            ),
        }
    }

    async fn receive_package(&self, envelope: Envelope) {
        match self.apply_sync_package(&envelope.payload).await {
            Ok(ApplyOutcome::Applied { .. }) => {}
            Ok(ApplyOutcome::Rejected(reason)) => {
                debug!("Sync package from {} rejected: {reason:?}", envelope.from_node_id)
            }
            Err(e) => warn!(
                "Failed to apply sync package from {}: {e}",
                envelope.from_node_id
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
