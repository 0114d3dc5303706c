mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{link, started_node};
use realm_mesh::{ApplyOutcome, MeshConfig, MeshNode, RejectReason, SyncCoordinator, SyncError};
use realm_store::{
    Account, AccountRole, ComputeNode, EntityKind, EntityRecord, LedgerEntry, MemoryStore, Offer,
    Pool, PoolMember, PoolMemberRole, PoolType, ReplicaStore, SqliteStore, StoreError,
    StoreTransaction, TransactionStatus,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn account(name: &str) -> Account {
    Account {
        id: Uuid::new_v4(),
        username: name.to_string(),
        password_hash: format!("hash-{name}"),
        role: AccountRole::Member,
        is_global_admin: false,
    }
}

fn pool(owner: &Account) -> Pool {
    Pool {
        id: Uuid::new_v4(),
        name: format!("{}'s pool", owner.username),
        pool_type: PoolType::Public,
        owner_id: owner.id,
        password: None,
    }
}

fn ledger(pool: &Pool, created_at: DateTime<Utc>) -> LedgerEntry {
    LedgerEntry {
        id: Uuid::new_v4(),
        pool_id: pool.id,
        from_account_id: pool.owner_id,
        to_account_id: Uuid::new_v4(),
        amount_minor: 10_00,
        memo: "settlement".to_string(),
        created_at,
        status: TransactionStatus::Completed,
    }
}

fn member(pool: &Pool, account: &Account) -> PoolMember {
    PoolMember {
        id: Uuid::new_v4(),
        pool_id: pool.id,
        account_id: account.id,
        role: PoolMemberRole::Member,
        machines_limit: 4,
        machines_used: 1,
        referral_count: 2,
    }
}

fn offer(pool: &Pool, seller: &Account) -> Offer {
    Offer {
        id: Uuid::new_v4(),
        seller_id: seller.id,
        pool_id: pool.id,
        title: "GPU hours".to_string(),
        price_minor: 25_00,
        payload: "{\"hours\":10}".to_string(),
    }
}

fn compute_node(owner: &Account) -> ComputeNode {
    ComputeNode {
        id: Uuid::new_v4(),
        owner_id: owner.id,
        name: format!("{}-rig", owner.username),
        cpu_power: 8.0,
        gpu_power: 2.5,
        rating: 4.75,
    }
}

/// Non-ledger rows of every kind: two accounts, one pool, one membership,
/// one offer, one compute node.
fn catalog_rows() -> (Pool, Vec<EntityRecord>) {
    let ana = account("ana");
    let ben = account("ben");
    let pool = pool(&ana);
    let rows = vec![
        EntityRecord::from(member(&pool, &ben)),
        EntityRecord::from(offer(&pool, &ana)),
        EntityRecord::from(compute_node(&ben)),
        EntityRecord::from(pool.clone()),
        EntityRecord::from(ana),
        EntityRecord::from(ben),
    ];
    (pool, rows)
}

/// Every kind, with three ledger rows: nine rows in all.
fn sample_rows() -> Vec<EntityRecord> {
    let (pool, mut rows) = catalog_rows();
    let now = Utc::now();
    for minutes in [30, 20, 10] {
        rows.push(ledger(&pool, now - chrono::Duration::minutes(minutes)).into());
    }
    rows
}

const SAMPLE_ROWS: usize = 9;

fn total_rows(store: &dyn ReplicaStore) -> usize {
    EntityKind::ALL
        .into_iter()
        .map(|kind| store.count(kind).unwrap())
        .sum()
}

fn coordinator(store: Arc<dyn ReplicaStore>) -> SyncCoordinator {
    SyncCoordinator::new(MeshNode::new(MeshConfig::loopback()), store)
}

/// Delegates to a [`MemoryStore`] but fails the n-th insert of a transaction.
struct FailingStore {
    inner: MemoryStore,
    fail_on_insert: usize,
}

struct FailingTransaction<'a> {
    inner: &'a mut dyn StoreTransaction,
    inserts: usize,
    fail_on_insert: usize,
}

impl StoreTransaction for FailingTransaction<'_> {
    fn find_by_id(
        &mut self,
        kind: EntityKind,
        id: Uuid,
    ) -> realm_store::Result<Option<EntityRecord>> {
        self.inner.find_by_id(kind, id)
    }

    fn insert(&mut self, record: &EntityRecord) -> realm_store::Result<()> {
        self.inserts += 1;
        if self.inserts == self.fail_on_insert {
            return Err(StoreError::InvalidData("disk full".to_string()));
        }
        self.inner.insert(record)
    }
}

impl ReplicaStore for FailingStore {
    fn enumerate_all(&self, kind: EntityKind) -> realm_store::Result<Vec<EntityRecord>> {
        self.inner.enumerate_all(kind)
    }

    fn enumerate_since(
        &self,
        kind: EntityKind,
        since: DateTime<Utc>,
    ) -> realm_store::Result<Vec<EntityRecord>> {
        self.inner.enumerate_since(kind, since)
    }

    fn find_by_id(&self, kind: EntityKind, id: Uuid) -> realm_store::Result<Option<EntityRecord>> {
        self.inner.find_by_id(kind, id)
    }

    fn insert(&self, record: &EntityRecord) -> realm_store::Result<()> {
        self.inner.insert(record)
    }

    fn transaction(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreTransaction) -> realm_store::Result<()>,
    ) -> realm_store::Result<()> {
        let fail_on_insert = self.fail_on_insert;
        self.inner.transaction(&mut |tx| {
            let mut failing = FailingTransaction {
                inner: tx,
                inserts: 0,
                fail_on_insert,
            };
            work(&mut failing)
        })
    }
}

// ---------------------------------------------------------------------------
// Snapshot semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_apply_is_idempotent() {
    let source = coordinator(Arc::new(MemoryStore::with_records(sample_rows()).unwrap()));
    let target_store = Arc::new(MemoryStore::new());
    let target = coordinator(target_store.clone());

    let package = source.build_snapshot(None).await.unwrap();
    assert_eq!(package.entity_count(), SAMPLE_ROWS);

    let first = target.apply_snapshot(package.clone()).await.unwrap();
    assert_eq!(
        first,
        ApplyOutcome::Applied {
            inserted: SAMPLE_ROWS,
            skipped: 0
        }
    );
    let second = target.apply_snapshot(package.clone()).await.unwrap();
    assert_eq!(
        second,
        ApplyOutcome::Applied {
            inserted: 0,
            skipped: SAMPLE_ROWS
        }
    );

    assert_eq!(total_rows(target_store.as_ref()), SAMPLE_ROWS);
    assert_eq!(target.last_sync_time(), Some(package.timestamp));
}

#[tokio::test]
async fn test_serialized_package_round_trip_into_sqlite() {
    let rows = sample_rows();
    let source = coordinator(Arc::new(MemoryStore::with_records(rows.clone()).unwrap()));
    let target_store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let target = coordinator(target_store.clone());

    let serialized = source.get_sync_package(None).await.unwrap();
    let outcome = target.apply_sync_package(&serialized).await.unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            inserted: SAMPLE_ROWS,
            skipped: 0
        }
    );

    for (kind, expected) in [
        (EntityKind::Account, 2),
        (EntityKind::Pool, 1),
        (EntityKind::PoolMember, 1),
        (EntityKind::LedgerEntry, 3),
        (EntityKind::Offer, 1),
        (EntityKind::ComputeNode, 1),
    ] {
        assert_eq!(target_store.count(kind).unwrap(), expected, "{kind:?}");
    }
    for row in &rows {
        let stored = target_store.find_by_id(row.kind(), row.id()).unwrap();
        assert_eq!(stored.as_ref(), Some(row));
    }
}

#[tokio::test]
async fn test_own_package_is_ignored() {
    let store = Arc::new(MemoryStore::new());
    let sync = coordinator(store.clone());

    let foreign = coordinator(Arc::new(MemoryStore::with_records(sample_rows()).unwrap()));
    let mut package = foreign.build_snapshot(None).await.unwrap();
    // Same content, but claiming to come from the receiving node.
    package.source_node_id = {
        let own = sync.build_snapshot(None).await.unwrap();
        own.source_node_id
    };
    let serialized = serde_json::to_string(&package).unwrap();

    let outcome = sync.apply_sync_package(&serialized).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Rejected(RejectReason::SelfOrigin));
    assert_eq!(total_rows(store.as_ref()), 0);
    assert!(sync.last_sync_time().is_none());
}

#[tokio::test]
async fn test_ledger_rows_filtered_by_since() {
    let (pool, mut rows) = catalog_rows();
    let base = Utc::now() - chrono::Duration::hours(1);
    let stamps: Vec<DateTime<Utc>> = (0..5)
        .map(|i| base + chrono::Duration::minutes(i * 10))
        .collect();
    rows.extend(stamps.iter().map(|t| EntityRecord::from(ledger(&pool, *t))));
    let sync = coordinator(Arc::new(MemoryStore::with_records(rows).unwrap()));

    let package = sync.build_snapshot(Some(stamps[1])).await.unwrap();
    assert_eq!(package.ledger_entries.len(), 3);
    assert!(
        package
            .ledger_entries
            .iter()
            .all(|e| e.entity.created_at > stamps[1])
    );
    // Collections without a creation time are sent in full.
    assert_eq!(package.users.len(), 2);
    assert_eq!(package.pools.len(), 1);
    assert_eq!(package.pool_members.len(), 1);
    assert_eq!(package.offers.len(), 1);
    assert_eq!(package.nodes.len(), 1);
    assert_eq!(package.entity_count(), 9);

    let everything = sync.build_snapshot(None).await.unwrap();
    assert_eq!(everything.ledger_entries.len(), 5);
    assert_eq!(everything.entity_count(), 11);
}

#[tokio::test]
async fn test_first_write_wins() {
    let original = account("local-name");
    let mut conflicting = original.clone();
    conflicting.username = "remote-name".to_string();

    let target_store =
        Arc::new(MemoryStore::with_records([EntityRecord::from(original.clone())]).unwrap());
    let target = coordinator(target_store.clone());
    let source = coordinator(Arc::new(
        MemoryStore::with_records([EntityRecord::from(conflicting)]).unwrap(),
    ));

    let package = source.build_snapshot(None).await.unwrap();
    let outcome = target.apply_snapshot(package).await.unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Applied {
            inserted: 0,
            skipped: 1
        }
    );

    let kept = target_store
        .find_by_id(EntityKind::Account, original.id)
        .unwrap()
        .unwrap();
    assert_eq!(kept, EntityRecord::Account(original));
}

#[tokio::test]
async fn test_storage_failure_rolls_back_everything() {
    let source = coordinator(Arc::new(MemoryStore::with_records(sample_rows()).unwrap()));
    let failing = Arc::new(FailingStore {
        inner: MemoryStore::new(),
        fail_on_insert: 3,
    });
    let target = coordinator(failing.clone());

    let package = source.build_snapshot(None).await.unwrap();
    let result = target.apply_snapshot(package).await;
    assert!(matches!(
        result,
        Err(SyncError::Store(StoreError::InvalidData(_)))
    ));

    assert_eq!(total_rows(failing.as_ref()), 0);
    assert!(target.last_sync_time().is_none());
}

// ---------------------------------------------------------------------------
// Over the mesh
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sync_request_is_answered_over_the_mesh() {
    let a = started_node().await;
    let b = started_node().await;

    let a_store = Arc::new(MemoryStore::with_records(sample_rows()).unwrap());
    let b_store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let a_sync = Arc::new(SyncCoordinator::new(a.clone(), a_store));
    let b_sync = Arc::new(SyncCoordinator::new(b.clone(), b_store.clone()));
    a_sync.attach().await;
    b_sync.attach().await;

    link(&b, &a).await;
    assert_eq!(b_sync.request_sync(None).await.unwrap(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while total_rows(b_store.as_ref()) < SAMPLE_ROWS && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(total_rows(b_store.as_ref()), SAMPLE_ROWS);
    assert!(b_sync.last_sync_time().is_some());

    a.stop().await;
    b.stop().await;
}
