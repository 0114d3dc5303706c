//! Realm Store: local copies of the replicated business collections.
//!
//! The mesh layer sees storage only through [`ReplicaStore`]: enumerate,
//! find, insert, and an all-or-nothing transaction scope. Two backends are
//! provided:
//!
//! - [`MemoryStore`] keeps everything in process memory.
//! - [`SqliteStore`] persists to a SQLite file (or an in-memory database).

pub mod entity;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use entity::{
    Account, AccountRole, ComputeNode, EntityKind, EntityRecord, LedgerEntry, Offer, Pool,
    PoolMember, PoolMemberRole, PoolType, TransactionStatus,
};
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ReplicaStore, StoreTransaction};
