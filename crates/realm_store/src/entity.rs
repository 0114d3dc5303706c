//! Replicated entity types.
//!
//! These are the rows every node keeps a copy of. The replication layer only
//! relies on two things: each row has a stable [`Uuid`] and each row can be
//! serialized. Ledger entries additionally carry a creation timestamp, which
//! is what lets a snapshot include only the ledger rows newer than a cutoff.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    GlobalAdmin,
    Owner,
    Officer,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    Public,
    Private,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMemberRole {
    Owner,
    Officer,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Released,
    Completed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: AccountRole,
    pub is_global_admin: bool,
}

/// A pool of members sharing a balance ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: Uuid,
    pub name: String,
    pub pool_type: PoolType,
    pub owner_id: Uuid,
    pub password: Option<String>,
}

/// Membership of an account in a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMember {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub account_id: Uuid,
    pub role: PoolMemberRole,
    pub machines_limit: u32,
    pub machines_used: u32,
    pub referral_count: u32,
}

/// A transfer recorded in a pool ledger. Amounts are in minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount_minor: i64,
    pub memo: String,
    pub created_at: DateTime<Utc>,
    pub status: TransactionStatus,
}

/// A marketplace offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offer {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub pool_id: Uuid,
    pub title: String,
    pub price_minor: i64,
    pub payload: String,
}

/// A compute node registered by an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeNode {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub cpu_power: f64,
    pub gpu_power: f64,
    pub rating: f64,
}

// ---------------------------------------------------------------------------
// Kind + record
// ---------------------------------------------------------------------------

/// The replicated collections, in the order snapshots list them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Pool,
    PoolMember,
    LedgerEntry,
    Offer,
    ComputeNode,
}

impl EntityKind {
    /// Every kind, in snapshot order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Account,
        EntityKind::Pool,
        EntityKind::PoolMember,
        EntityKind::LedgerEntry,
        EntityKind::Offer,
        EntityKind::ComputeNode,
    ];

    /// Stable key used as the storage discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Pool => "pool",
            Self::PoolMember => "pool_member",
            Self::LedgerEntry => "ledger_entry",
            Self::Offer => "offer",
            Self::ComputeNode => "compute_node",
        }
    }

    /// Parse a storage discriminator back into a kind.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Whether rows of this kind carry a reliable creation timestamp.
    pub fn has_creation_time(&self) -> bool {
        matches!(self, Self::LedgerEntry)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of any replicated kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRecord {
    Account(Account),
    Pool(Pool),
    PoolMember(PoolMember),
    LedgerEntry(LedgerEntry),
    Offer(Offer),
    ComputeNode(ComputeNode),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Account(_) => EntityKind::Account,
            Self::Pool(_) => EntityKind::Pool,
            Self::PoolMember(_) => EntityKind::PoolMember,
            Self::LedgerEntry(_) => EntityKind::LedgerEntry,
            Self::Offer(_) => EntityKind::Offer,
            Self::ComputeNode(_) => EntityKind::ComputeNode,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Account(e) => e.id,
            Self::Pool(e) => e.id,
            Self::PoolMember(e) => e.id,
            Self::LedgerEntry(e) => e.id,
            Self::Offer(e) => e.id,
            Self::ComputeNode(e) => e.id,
        }
    }

    /// Creation time, for the kinds that have one.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::LedgerEntry(e) => Some(e.created_at),
            _ => None,
        }
    }

    /// Encode the inner entity (without the kind tag) as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Account(e) => serde_json::to_string(e),
            Self::Pool(e) => serde_json::to_string(e),
            Self::PoolMember(e) => serde_json::to_string(e),
            Self::LedgerEntry(e) => serde_json::to_string(e),
            Self::Offer(e) => serde_json::to_string(e),
            Self::ComputeNode(e) => serde_json::to_string(e),
        }
    }

    /// Decode an entity body previously written by [`to_json`](Self::to_json).
    pub fn from_json(kind: EntityKind, json: &str) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::Account => Self::Account(serde_json::from_str(json)?),
            EntityKind::Pool => Self::Pool(serde_json::from_str(json)?),
            EntityKind::PoolMember => Self::PoolMember(serde_json::from_str(json)?),
            EntityKind::LedgerEntry => Self::LedgerEntry(serde_json::from_str(json)?),
            EntityKind::Offer => Self::Offer(serde_json::from_str(json)?),
            EntityKind::ComputeNode => Self::ComputeNode(serde_json::from_str(json)?),
        })
    }
}

macro_rules! impl_from_entity {
    ($($ty:ident),* $(,)?) => {
        $(
            impl From<$ty> for EntityRecord {
                fn from(e: $ty) -> Self {
                    Self::$ty(e)
                }
            }
        )*
    };
}

impl_from_entity!(Account, Pool, PoolMember, LedgerEntry, Offer, ComputeNode);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
