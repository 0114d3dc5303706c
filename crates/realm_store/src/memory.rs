//! In-memory store, used by tests and by nodes that do not persist.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::entity::{EntityKind, EntityRecord};
use crate::error::{Result, StoreError};
use crate::traits::{ReplicaStore, StoreTransaction};

type Tables = HashMap<EntityKind, BTreeMap<Uuid, EntityRecord>>;

/// A [`ReplicaStore`] backed by ordered maps behind a mutex.
///
/// Transactions run against a private copy of the tables which replaces the
/// live tables only when the work succeeds.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = EntityRecord>) -> Result<Self> {
        let store = Self::new();
        for record in records {
            store.insert(&record)?;
        }
        Ok(store)
    }
}

fn insert_into(tables: &mut Tables, record: &EntityRecord) -> Result<()> {
    let table = tables.entry(record.kind()).or_default();
    if table.contains_key(&record.id()) {
        return Err(StoreError::DuplicateId {
            kind: record.kind(),
            id: record.id(),
        });
    }
    table.insert(record.id(), record.clone());
    Ok(())
}

struct MemoryTransaction<'a> {
    staged: &'a mut Tables,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn find_by_id(&mut self, kind: EntityKind, id: Uuid) -> Result<Option<EntityRecord>> {
        Ok(self.staged.get(&kind).and_then(|t| t.get(&id)).cloned())
    }

    fn insert(&mut self, record: &EntityRecord) -> Result<()> {
        insert_into(self.staged, record)
    }
}

impl ReplicaStore for MemoryStore {
    fn enumerate_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .get(&kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    fn enumerate_since(&self, kind: EntityKind, since: DateTime<Utc>) -> Result<Vec<EntityRecord>> {
        let tables = self.tables.lock();
        Ok(tables
            .get(&kind)
            .map(|t| {
                t.values()
                    .filter(|r| r.created_at().is_none_or(|ts| ts > since))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn find_by_id(&self, kind: EntityKind, id: Uuid) -> Result<Option<EntityRecord>> {
        let tables = self.tables.lock();
        Ok(tables.get(&kind).and_then(|t| t.get(&id)).cloned())
    }

    fn insert(&self, record: &EntityRecord) -> Result<()> {
        let mut tables = self.tables.lock();
        insert_into(&mut tables, record)
    }

    fn transaction(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreTransaction) -> Result<()>,
    ) -> Result<()> {
        // Held for the whole scope so concurrent transactions serialize.
        let mut tables = self.tables.lock();
        let mut staged = tables.clone();

        let mut txn = MemoryTransaction { staged: &mut staged };
        work(&mut txn)?;

        *tables = staged;
        Ok(())
    }

    fn count(&self, kind: EntityKind) -> Result<usize> {
        Ok(self.tables.lock().get(&kind).map_or(0, |t| t.len()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Account, AccountRole, LedgerEntry, TransactionStatus};
    use chrono::Duration;

    fn account(name: &str) -> EntityRecord {
        EntityRecord::Account(Account {
            id: Uuid::new_v4(),
            username: name.to_string(),
            password_hash: String::new(),
            role: AccountRole::Member,
            is_global_admin: false,
        })
    }

    fn ledger_at(created_at: DateTime<Utc>) -> EntityRecord {
        EntityRecord::LedgerEntry(LedgerEntry {
            id: Uuid::new_v4(),
            pool_id: Uuid::new_v4(),
            from_account_id: Uuid::new_v4(),
            to_account_id: Uuid::new_v4(),
            amount_minor: 10,
            memo: String::new(),
            created_at,
            status: TransactionStatus::Completed,
        })
    }

    #[test]
    fn test_insert_and_find() {
        let store = MemoryStore::new();
        let rec = account("ada");
        store.insert(&rec).unwrap();

        let found = store.find_by_id(EntityKind::Account, rec.id()).unwrap();
        assert_eq!(found, Some(rec));
        assert_eq!(store.count(EntityKind::Account).unwrap(), 1);
        assert_eq!(store.count(EntityKind::Pool).unwrap(), 0);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let rec = account("ada");
        store.insert(&rec).unwrap();

        match store.insert(&rec) {
            Err(StoreError::DuplicateId { kind, id }) => {
                assert_eq!(kind, EntityKind::Account);
                assert_eq!(id, rec.id());
            }
            other => panic!("Expected DuplicateId, got {other:?}"),
        }
    }

    #[test]
    fn test_enumerate_since_filters_ledger_only() {
        let cutoff = Utc::now();
        let store = MemoryStore::with_records(vec![
            ledger_at(cutoff - Duration::minutes(5)),
            ledger_at(cutoff),
            ledger_at(cutoff + Duration::minutes(5)),
            account("a"),
            account("b"),
        ])
        .unwrap();

        let ledger = store.enumerate_since(EntityKind::LedgerEntry, cutoff).unwrap();
        assert_eq!(ledger.len(), 1);

        let accounts = store.enumerate_since(EntityKind::Account, cutoff).unwrap();
        assert_eq!(accounts.len(), 2);
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let store = MemoryStore::new();
        let a = account("a");
        let b = account("b");

        store
            .transaction(&mut |txn| {
                txn.insert(&a)?;
                assert!(txn.find_by_id(EntityKind::Account, a.id())?.is_some());
                txn.insert(&b)
            })
            .unwrap();

        assert_eq!(store.count(EntityKind::Account).unwrap(), 2);
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let existing = account("existing");
        let store = MemoryStore::with_records(vec![existing.clone()]).unwrap();
        let fresh = account("fresh");

        let result = store.transaction(&mut |txn| {
            txn.insert(&fresh)?;
            txn.insert(&existing)
        });

        assert!(matches!(result, Err(StoreError::DuplicateId { .. })));
        assert_eq!(store.count(EntityKind::Account).unwrap(), 1);
        assert!(store
            .find_by_id(EntityKind::Account, fresh.id())
            .unwrap()
            .is_none());
    }
}
