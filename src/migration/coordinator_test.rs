use std::sync::Arc;

use tracing_test::traced_test;

use super::*;
use crate::test_utils::doc_x;
use crate::test_utils::test_migration_config;
use crate::test_utils::TwoShards;
use crate::test_utils::TEST_NS;
use crate::CatalogError;
use crate::CatalogStore;
use crate::ChunkRange;
use crate::Error;
use crate::Filter;
use crate::KeyBound;
use crate::MigrationError;
use crate::MockCatalogStore;
use crate::RoutingError;
use crate::ShardEntry;
use crate::ShardKey;
use crate::SledCatalogStore;
use crate::StorageError;
use crate::SystemError;

fn upper() -> ChunkRange {
    ChunkRange::new(KeyBound::key(100), KeyBound::Max)
}

/// `db.foo` split at 100 with documents at 50, 150 and 160 on `A`.
async fn split_with_docs() -> TwoShards {
    seed(TwoShards::new(true).await).await
}

async fn seed(fx: TwoShards) -> TwoShards {
    fx.catalog.commit_split(TEST_NS, &ShardKey::single(100)).unwrap();
    fx.a.flush_routing_cache(TEST_NS, true).await.unwrap();
    let req = fx.request();
    for x in [50, 150, 160] {
        fx.a.insert(&req, doc_x(&format!("d{x}"), x)).await.unwrap();
    }
    fx
}

fn coordinator(fx: &TwoShards) -> MigrationCoordinator {
    MigrationCoordinator::new(fx.a.clone(), fx.b.clone(), test_migration_config())
}

/// # Case: moveChunk with waitForDelete
///
/// ## Criterias:
/// 1. the moved chunk gets the next major version
/// 2. the recipient serves the range at the new version
/// 3. the donor keeps no copy of the moved documents
/// 4. the recovery marker is back to zero
#[tokio::test]
#[traced_test]
async fn test_move_chunk_commits_and_cleans_donor() {
    let fx = split_with_docs().await;
    let before = fx.version();

    let mut c = coordinator(&fx);
    let outcome = c.run(TEST_NS, &ShardKey::single(150), true).await.unwrap();
    assert_eq!(c.state(), MigrationState::Committed);
    assert_eq!(outcome.range, upper());
    assert_eq!(outcome.cloned, 2);
    assert_eq!(outcome.orphans_deleted, 2);

    let after = fx.version();
    let crate::RoutingVersion::Sharded(v) = after else {
        panic!("expected a sharded version");
    };
    assert_eq!(outcome.version, v);
    assert_eq!(v.major, 2);
    assert_ne!(before, after);

    let req = fx.request();
    let on_b = fx.b.find(&req, &Filter::new()).await.unwrap();
    assert_eq!(on_b.len(), 2);
    assert_eq!(fx.a.store().count_range(TEST_NS, &upper()).unwrap(), 0);
    assert_eq!(fx.a.count(&req, &ChunkRange::full()).await.unwrap(), 1);

    let record = fx.a.recovery().load().unwrap().unwrap();
    assert_eq!(record.min_op_time_updaters, 0);
    assert!(fx.a.active_migration(TEST_NS).is_none());
}

#[tokio::test]
async fn test_donor_rejects_old_version_after_move() {
    let fx = split_with_docs().await;
    let old = fx.request();
    coordinator(&fx)
        .run(TEST_NS, &ShardKey::single(150), false)
        .await
        .unwrap();

    let err = fx.a.insert(&old, doc_x("late", 170)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Routing(RoutingError::StaleShardVersion { .. })
    ));
}

/// Without `waitForDelete` the donor queues the range and the deleter
/// removes it later.
#[tokio::test]
async fn test_move_chunk_queues_delayed_deletion() {
    let fx = split_with_docs().await;
    let outcome = coordinator(&fx)
        .run(TEST_NS, &ShardKey::single(150), false)
        .await
        .unwrap();
    assert_eq!(outcome.orphans_deleted, 0);

    let tasks = fx.a.deletions().tasks().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].range, upper());
    assert_eq!(fx.a.store().count_range(TEST_NS, &upper()).unwrap(), 2);

    assert_eq!(fx.a.run_pending_range_deletions().await.unwrap(), 2);
    assert!(fx.a.deletions().tasks().unwrap().is_empty());
}

#[tokio::test]
async fn test_donor_must_own_the_chunk() {
    let fx = split_with_docs().await;
    let mut c = MigrationCoordinator::new(fx.b.clone(), fx.a.clone(), test_migration_config());
    let err = c.run(TEST_NS, &ShardKey::single(150), true).await.unwrap_err();
    assert!(matches!(err, Error::Migration(MigrationError::RangeNotOwned { .. })));
}

#[tokio::test]
async fn test_move_to_same_shard_is_aborted() {
    let fx = split_with_docs().await;
    let mut c = MigrationCoordinator::new(fx.a.clone(), fx.a.clone(), test_migration_config());
    let err = c.run(TEST_NS, &ShardKey::single(150), true).await.unwrap_err();
    assert!(matches!(err, Error::Migration(MigrationError::Aborted { .. })));
}

#[tokio::test]
async fn test_draining_recipient_is_unavailable() {
    let fx = split_with_docs().await;
    fx.catalog
        .add_shard(ShardEntry {
            draining: true,
            ..ShardEntry::new("C", "C:27018")
        })
        .unwrap();
    let c_shard = TwoShards::open_shard(&fx.dir, &fx.catalog, "C").await;

    let mut c = MigrationCoordinator::new(fx.a.clone(), c_shard, test_migration_config());
    let err = c.run(TEST_NS, &ShardKey::single(150), true).await.unwrap_err();
    assert!(matches!(err, Error::Migration(MigrationError::RecipientUnavailable(_))));
}

/// # Case: a transaction holds a document inside the range
///
/// ## Criterias:
/// 1. the critical section gives up after its timeout and the move aborts
/// 2. ownership in the catalog is unchanged
/// 3. the recipient's partial clone is discarded
/// 4. writes to the range resume once the section is released
#[tokio::test]
#[traced_test]
async fn test_locked_range_aborts_migration() {
    let fx = split_with_docs().await;
    let req = fx.request();
    fx.a.insert(&req.clone().in_txn(Some("t1".into())), doc_x("t", 170))
        .await
        .unwrap();

    let mut c = coordinator(&fx);
    let err = c.run(TEST_NS, &ShardKey::single(150), true).await.unwrap_err();
    assert!(matches!(err, Error::Migration(MigrationError::Aborted { .. })));
    assert_eq!(c.state(), MigrationState::Aborted);

    assert_eq!(fx.version(), req.version);
    assert_eq!(fx.b.store().count_range(TEST_NS, &upper()).unwrap(), 0);

    fx.a.abort_transaction("t1");
    fx.a.insert(&req, doc_x("after", 180)).await.unwrap();
}

/// A second move of the same chunk in the reverse direction returns it and
/// bumps the major version again.
#[tokio::test]
async fn test_move_back_bumps_version_again() {
    let fx = split_with_docs().await;
    coordinator(&fx)
        .run(TEST_NS, &ShardKey::single(150), true)
        .await
        .unwrap();
    let back = MigrationCoordinator::new(fx.b.clone(), fx.a.clone(), test_migration_config())
        .run(TEST_NS, &ShardKey::single(150), true)
        .await
        .unwrap();
    assert_eq!(back.version.major, 3);
    assert_eq!(back.cloned, 2);
    assert_eq!(fx.b.store().count_range(TEST_NS, &upper()).unwrap(), 0);
    assert_eq!(fx.a.count(&fx.request(), &ChunkRange::full()).await.unwrap(), 3);
}

#[derive(Debug, Clone, Copy)]
enum CommitFault {
    /// The catalog refuses the commit with `VersionMismatch`
    Rejected,
    /// The commit is applied but the reply is lost
    LostReply,
    /// The request never reaches the catalog
    Unreachable,
}

fn lost_connection() -> Error {
    Error::System(SystemError::Storage(StorageError::DbError(
        "connection to catalog reset".to_string(),
    )))
}

/// A catalog answering from `real`, except that migration commits fail
/// with `fault`.
fn faulty_catalog(
    real: Arc<SledCatalogStore>,
    fault: CommitFault,
) -> MockCatalogStore {
    let mut mock = MockCatalogStore::new();
    let r = real.clone();
    mock.expect_connection_string().returning(move || r.connection_string());
    let r = real.clone();
    mock.expect_add_shard().returning(move |shard| r.add_shard(shard));
    let r = real.clone();
    mock.expect_get_shard().returning(move |name| r.get_shard(name));
    let r = real.clone();
    mock.expect_get_shards().returning(move || r.get_shards());
    let r = real.clone();
    mock.expect_create_database().returning(move |name| r.create_database(name));
    let r = real.clone();
    mock.expect_enable_sharding().returning(move |name| r.enable_sharding(name));
    let r = real.clone();
    mock.expect_get_database().returning(move |name| r.get_database(name));
    let r = real.clone();
    mock.expect_get_databases_for_shard()
        .returning(move |shard| r.get_databases_for_shard(shard));
    let r = real.clone();
    mock.expect_commit_move_primary()
        .returning(move |name, to| r.commit_move_primary(name, to));
    let r = real.clone();
    mock.expect_shard_collection()
        .returning(move |ns, pattern, unique| r.shard_collection(ns, pattern, unique));
    let r = real.clone();
    mock.expect_get_collection().returning(move |ns| r.get_collection(ns));
    let r = real.clone();
    mock.expect_get_collections().returning(move |db| r.get_collections(db));
    let r = real.clone();
    mock.expect_drop_collection().returning(move |ns| r.drop_collection(ns));
    let r = real.clone();
    mock.expect_get_chunks().returning(move |ns| r.get_chunks(ns));
    let r = real.clone();
    mock.expect_get_chunks_for_shard()
        .returning(move |shard| r.get_chunks_for_shard(shard));
    let r = real.clone();
    mock.expect_commit_split().returning(move |ns, at| r.commit_split(ns, at));
    let r = real.clone();
    mock.expect_commit_chunks_reassignment()
        .returning(move |chunks, to| r.commit_chunks_reassignment(chunks, to));
    let r = real.clone();
    mock.expect_current_log_position()
        .returning(move || r.current_log_position());
    let r = real;
    mock.expect_commit_chunk_migration()
        .returning(move |ns, range, from, to, expected| match fault {
            CommitFault::Rejected => Err(CatalogError::VersionMismatch {
                namespace: ns.to_string(),
                expected: *expected,
                actual: None,
            }
            .into()),
            CommitFault::LostReply => {
                r.commit_chunk_migration(ns, range, from, to, expected)?;
                Err(lost_connection())
            }
            CommitFault::Unreachable => Err(lost_connection()),
        });
    mock
}

async fn split_with_docs_over(fault: CommitFault) -> TwoShards {
    let fx = TwoShards::with_catalog_view(true, |real| {
        Arc::new(faulty_catalog(real, fault)) as Arc<dyn CatalogStore>
    })
    .await;
    seed(fx).await
}

fn upper_owner(fx: &TwoShards) -> String {
    fx.catalog
        .get_chunks(TEST_NS)
        .unwrap()
        .into_iter()
        .find(|c| c.range == upper())
        .map(|c| c.shard)
        .unwrap()
}

fn updaters(fx: &TwoShards) -> u32 {
    fx.a.recovery().load().unwrap().unwrap().min_op_time_updaters
}

/// # Case: the catalog rejects the commit
///
/// ## Criterias:
/// 1. the migration aborts and the recovery marker is back to zero
/// 2. ownership and the collection version are unchanged
/// 3. the recipient's clone is discarded and the donor keeps its documents
/// 4. writes to the range are accepted again
#[tokio::test]
#[traced_test]
async fn test_rejected_commit_aborts_migration() {
    let fx = split_with_docs_over(CommitFault::Rejected).await;
    let before = fx.version();

    let mut c = coordinator(&fx);
    let err = c.run(TEST_NS, &ShardKey::single(150), true).await.unwrap_err();
    assert!(matches!(err, Error::Migration(MigrationError::Aborted { .. })));
    assert_eq!(c.state(), MigrationState::Aborted);

    assert_eq!(updaters(&fx), 0);
    assert_eq!(upper_owner(&fx), "A");
    assert_eq!(fx.version(), before);
    assert_eq!(fx.b.store().count_range(TEST_NS, &upper()).unwrap(), 0);
    assert_eq!(fx.a.store().count_range(TEST_NS, &upper()).unwrap(), 2);
    assert!(fx.a.active_migration(TEST_NS).is_none());

    fx.a.insert(&fx.request(), doc_x("after", 180)).await.unwrap();
}

/// # Case: the commit applied but its reply was lost
///
/// ## Criterias:
/// 1. the coordinator learns from the catalog that the chunk moved
/// 2. the migration completes with the new major version
/// 3. the recovery marker is back to zero
#[tokio::test]
#[traced_test]
async fn test_lost_commit_reply_is_resolved_as_committed() {
    let fx = split_with_docs_over(CommitFault::LostReply).await;

    let mut c = coordinator(&fx);
    let outcome = c.run(TEST_NS, &ShardKey::single(150), true).await.unwrap();
    assert_eq!(c.state(), MigrationState::Committed);
    assert_eq!(outcome.version.major, 2);

    assert_eq!(updaters(&fx), 0);
    assert_eq!(upper_owner(&fx), "B");
    assert_eq!(fx.b.store().count_range(TEST_NS, &upper()).unwrap(), 2);
    assert_eq!(fx.a.store().count_range(TEST_NS, &upper()).unwrap(), 0);
    let req = fx.request();
    assert_eq!(fx.b.find(&req, &Filter::new()).await.unwrap().len(), 2);
}

/// # Case: the commit never reached the catalog
///
/// ## Criterias:
/// 1. the catalog still shows the donor as owner, so the migration aborts
/// 2. the recovery marker is back to zero and the clone is discarded
#[tokio::test]
async fn test_unreached_commit_is_resolved_as_aborted() {
    let fx = split_with_docs_over(CommitFault::Unreachable).await;
    let before = fx.version();

    let mut c = coordinator(&fx);
    let err = c.run(TEST_NS, &ShardKey::single(150), true).await.unwrap_err();
    assert!(matches!(err, Error::Migration(MigrationError::Aborted { .. })));
    assert_eq!(c.state(), MigrationState::Aborted);

    assert_eq!(updaters(&fx), 0);
    assert_eq!(upper_owner(&fx), "A");
    assert_eq!(fx.version(), before);
    assert_eq!(fx.b.store().count_range(TEST_NS, &upper()).unwrap(), 0);
    assert_eq!(fx.a.store().count_range(TEST_NS, &upper()).unwrap(), 2);
}
