//! The storage interface consumed by the replication layer.
//!
//! Methods are synchronous; async callers are expected to run them on a
//! blocking thread. Implementations must be safe to share across threads.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entity::{EntityKind, EntityRecord};
use crate::error::Result;

/// Operations available inside a [`ReplicaStore::transaction`] scope.
pub trait StoreTransaction {
    /// Look up a row by kind and id, seeing this transaction's own writes.
    fn find_by_id(&mut self, kind: EntityKind, id: Uuid) -> Result<Option<EntityRecord>>;

    /// Insert a new row. Fails with `DuplicateId` if the id is taken.
    fn insert(&mut self, record: &EntityRecord) -> Result<()>;
}

/// A store holding the local copy of every replicated collection.
pub trait ReplicaStore: Send + Sync {
    /// Every row of one kind.
    fn enumerate_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>>;

    /// Rows of one kind created strictly after `since`.
    ///
    /// Kinds without a creation timestamp return every row.
    fn enumerate_since(&self, kind: EntityKind, since: DateTime<Utc>) -> Result<Vec<EntityRecord>>;

    /// Look up a single row.
    fn find_by_id(&self, kind: EntityKind, id: Uuid) -> Result<Option<EntityRecord>>;

    /// Insert a single row outside any explicit transaction.
    fn insert(&self, record: &EntityRecord) -> Result<()>;

    /// Run `work` atomically. Commits if it returns `Ok`, rolls back every
    /// write made through the transaction if it returns `Err`, and passes
    /// the error through.
    fn transaction(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreTransaction) -> Result<()>,
    ) -> Result<()>;

    /// Number of rows of one kind.
    fn count(&self, kind: EntityKind) -> Result<usize> {
        Ok(self.enumerate_all(kind)?.len())
    }
}
