//! SQLite-backed store.
//!
//! All kinds share one table keyed by `(kind, id)`. Entity bodies are stored
//! as JSON; the creation time, when a kind has one, is stored alongside in
//! microseconds so time filters run in SQL.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tracing::info;
use uuid::Uuid;

use crate::entity::{EntityKind, EntityRecord};
use crate::error::{Result, StoreError};
use crate::traits::{ReplicaStore, StoreTransaction};

/// A [`ReplicaStore`] persisted in a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::init_schema(&conn)?;
        info!("Replica store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS replicated_entities (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                created_at_us INTEGER,
                body TEXT NOT NULL,
                stored_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (kind, id)
            );

            CREATE INDEX IF NOT EXISTS idx_replicated_entities_created
                ON replicated_entities(kind, created_at_us);
            ",
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers shared by the store and its transactions
// ---------------------------------------------------------------------------

fn decode_row(kind: EntityKind, id: &str, body: &str) -> Result<EntityRecord> {
    let record = EntityRecord::from_json(kind, body)?;
    if record.id().to_string() != id {
        return Err(StoreError::InvalidData(format!(
            "{kind} row {id} holds body for {}",
            record.id()
        )));
    }
    Ok(record)
}

fn query_kind(conn: &Connection, kind: EntityKind, since: Option<DateTime<Utc>>) -> Result<Vec<EntityRecord>> {
    let rows: Vec<(String, String)> = match since {
        Some(ts) => {
            let mut stmt = conn.prepare(
                "SELECT id, body FROM replicated_entities
                 WHERE kind = ?1 AND (created_at_us IS NULL OR created_at_us > ?2)
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![kind.as_str(), ts.timestamp_micros()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, body FROM replicated_entities WHERE kind = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![kind.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            rows
        }
    };

    rows.iter()
        .map(|(id, body)| decode_row(kind, id, body))
        .collect()
}

fn find_row(conn: &Connection, kind: EntityKind, id: Uuid) -> Result<Option<EntityRecord>> {
    let id_str = id.to_string();
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM replicated_entities WHERE kind = ?1 AND id = ?2",
            params![kind.as_str(), id_str],
            |row| row.get(0),
        )
        .optional()?;

    body.map(|b| decode_row(kind, &id_str, &b)).transpose()
}

fn insert_row(conn: &Connection, record: &EntityRecord) -> Result<()> {
    let body = record.to_json()?;
    let created = record.created_at().map(|ts| ts.timestamp_micros());

    conn.execute(
        "INSERT INTO replicated_entities (kind, id, created_at_us, body)
         VALUES (?1, ?2, ?3, ?4)",
        params![record.kind().as_str(), record.id().to_string(), created, body],
    )
    .map_err(|e| {
        if let rusqlite::Error::SqliteFailure(f, _) = &e {
            if f.code == ErrorCode::ConstraintViolation {
                return StoreError::DuplicateId {
                    kind: record.kind(),
                    id: record.id(),
                };
            }
        }
        StoreError::Database(e)
    })?;
    Ok(())
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn find_by_id(&mut self, kind: EntityKind, id: Uuid) -> Result<Option<EntityRecord>> {
        find_row(self.conn, kind, id)
    }

    fn insert(&mut self, record: &EntityRecord) -> Result<()> {
        insert_row(self.conn, record)
    }
}

impl ReplicaStore for SqliteStore {
    fn enumerate_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        query_kind(&self.conn.lock(), kind, None)
    }

    fn enumerate_since(&self, kind: EntityKind, since: DateTime<Utc>) -> Result<Vec<EntityRecord>> {
        query_kind(&self.conn.lock(), kind, Some(since))
    }

    fn find_by_id(&self, kind: EntityKind, id: Uuid) -> Result<Option<EntityRecord>> {
        find_row(&self.conn.lock(), kind, id)
    }

    fn insert(&self, record: &EntityRecord) -> Result<()> {
        insert_row(&self.conn.lock(), record)
    }

    fn transaction(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreTransaction) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // Returning early drops `tx`, which rolls it back.
        work(&mut SqliteTransaction { conn: &tx })?;

        tx.commit()?;
        Ok(())
    }

    fn count(&self, kind: EntityKind) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM replicated_entities WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{LedgerEntry, Pool, PoolType, TransactionStatus};
    use chrono::Duration;

    fn pool(name: &str) -> EntityRecord {
        EntityRecord::Pool(Pool {
            id: Uuid::new_v4(),
            name: name.to_string(),
            pool_type: PoolType::Public,
            owner_id: Uuid::new_v4(),
            password: None,
        })
    }

    fn ledger_at(created_at: DateTime<Utc>) -> EntityRecord {
        EntityRecord::LedgerEntry(LedgerEntry {
            id: Uuid::new_v4(),
            pool_id: Uuid::new_v4(),
            from_account_id: Uuid::new_v4(),
            to_account_id: Uuid::new_v4(),
            amount_minor: 500,
            memo: "payout".to_string(),
            created_at,
            status: TransactionStatus::Completed,
        })
    }

    #[test]
    fn test_insert_find_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = pool("alpha");
        store.insert(&rec).unwrap();

        let found = store.find_by_id(EntityKind::Pool, rec.id()).unwrap();
        assert_eq!(found, Some(rec.clone()));
        assert!(store
            .find_by_id(EntityKind::Account, rec.id())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_duplicate_maps_to_duplicate_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = pool("alpha");
        store.insert(&rec).unwrap();
        assert!(matches!(
            store.insert(&rec),
            Err(StoreError::DuplicateId { kind: EntityKind::Pool, .. })
        ));
    }

    #[test]
    fn test_enumerate_since_in_sql() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cutoff = Utc::now();
        store.insert(&ledger_at(cutoff - Duration::hours(1))).unwrap();
        store.insert(&ledger_at(cutoff + Duration::seconds(1))).unwrap();
        store.insert(&ledger_at(cutoff + Duration::hours(1))).unwrap();
        store.insert(&pool("p")).unwrap();

        assert_eq!(store.enumerate_all(EntityKind::LedgerEntry).unwrap().len(), 3);
        assert_eq!(
            store
                .enumerate_since(EntityKind::LedgerEntry, cutoff)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            store.enumerate_since(EntityKind::Pool, cutoff).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_transaction_rollback_discards_inserts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let existing = pool("existing");
        store.insert(&existing).unwrap();
        let fresh = pool("fresh");

        let result = store.transaction(&mut |txn| {
            txn.insert(&fresh)?;
            txn.insert(&existing)
        });

        assert!(result.is_err());
        assert_eq!(store.count(EntityKind::Pool).unwrap(), 1);
    }

    #[test]
    fn test_transaction_sees_own_writes_and_commits() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = pool("staged");

        store
            .transaction(&mut |txn| {
                assert!(txn.find_by_id(EntityKind::Pool, rec.id())?.is_none());
                txn.insert(&rec)?;
                assert!(txn.find_by_id(EntityKind::Pool, rec.id())?.is_some());
                Ok(())
            })
            .unwrap();

        assert_eq!(store.count(EntityKind::Pool).unwrap(), 1);
    }

    #[test]
    fn test_file_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("replica.db");
        let rec = pool("durable");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert(&rec).unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(
            reopened.find_by_id(EntityKind::Pool, rec.id()).unwrap(),
            Some(rec)
        );
    }
}
