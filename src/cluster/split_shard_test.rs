use std::sync::Arc;

use tempfile::TempDir;
use tracing_test::traced_test;

use super::Cluster;
use super::SplitShardOptions;
use crate::test_utils::doc_x;
use crate::test_utils::test_settings;
use crate::test_utils::TEST_NS;
use crate::CatalogError;
use crate::CatalogStore;
use crate::ChunkRange;
use crate::DocWrite;
use crate::Document;
use crate::Error;
use crate::Filter;
use crate::OperationContext;
use crate::ShardKey;
use crate::ShardKeyPattern;
use crate::ShardServer;
use crate::ShardSpec;

const UNSHARDED_NS: &str = "db.bar";
const MOVED_DB_NS: &str = "db2.baz";

/// Shard `A` holding a sharded `db.foo` split at 100, an unsharded
/// `db.bar` and an unsharded `db2.baz`; then `B` joins as a full copy of `A`.
async fn copied_shard() -> (TempDir, Cluster) {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::open(test_settings(dir.path(), &["A"])).await.unwrap();
    cluster.enable_sharding("db").await.unwrap();
    cluster
        .shard_collection(TEST_NS, ShardKeyPattern::new(["x"]).unwrap(), false)
        .await
        .unwrap();
    cluster.split(TEST_NS, &ShardKey::single(100)).await.unwrap();

    let ctx = OperationContext::default();
    let router = cluster.router().clone();
    router.insert(&ctx, TEST_NS, doc_x("low", 50)).await.unwrap();
    router.insert(&ctx, TEST_NS, doc_x("high", 150)).await.unwrap();
    router.insert(&ctx, UNSHARDED_NS, Document::new("u")).await.unwrap();
    router.insert(&ctx, MOVED_DB_NS, Document::new("v")).await.unwrap();

    let b = cluster
        .add_shard(&ShardSpec {
            name: "B".to_string(),
            endpoint: "B:27018".to_string(),
        })
        .await
        .unwrap();
    let unkeyed = ShardKey(Vec::new());
    b.store()
        .apply(
            &[
                DocWrite::upsert(TEST_NS, ShardKey::single(50), doc_x("low", 50)),
                DocWrite::upsert(TEST_NS, ShardKey::single(150), doc_x("high", 150)),
                DocWrite::upsert(UNSHARDED_NS, unkeyed.clone(), Document::new("u")),
                DocWrite::upsert(MOVED_DB_NS, unkeyed, Document::new("v")),
            ],
            &[],
        )
        .unwrap();
    (dir, cluster)
}

fn stored(
    shard: &Arc<ShardServer>,
    namespace: &str,
) -> u64 {
    shard.store().count_range(namespace, &ChunkRange::full()).unwrap()
}

/// # Case: split with both cleanup options
///
/// ## Criterias:
/// 1. the upper half of `A`'s chunks and databases now belong to `B`
/// 2. queued range deletions leave each document on exactly one shard
/// 3. unsharded collections survive only on their database primary
/// 4. the router reads every document once
#[tokio::test]
#[traced_test]
async fn test_split_shard_with_cleanup() {
    let (_dir, cluster) = copied_shard().await;
    let options = SplitShardOptions {
        remove_orphans: true,
        drop_orphaned_collections: true,
    };
    let outcome = cluster.split_shard("A", "B", options).await.unwrap();
    assert_eq!(outcome.chunks_moved, 1);
    assert_eq!(outcome.databases_moved, vec!["db2".to_string()]);
    assert_eq!(outcome.range_deletions, 2);
    assert_eq!(
        outcome.dropped_collections,
        vec![UNSHARDED_NS.to_string(), MOVED_DB_NS.to_string()]
    );

    let catalog = cluster.catalog();
    let owners: Vec<String> = catalog.get_chunks(TEST_NS).unwrap().into_iter().map(|c| c.shard).collect();
    assert_eq!(owners, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(catalog.get_database("db").unwrap().primary_shard, "A");
    assert_eq!(catalog.get_database("db2").unwrap().primary_shard, "B");

    let a = cluster.shard("A").unwrap();
    let b = cluster.shard("B").unwrap();
    assert_eq!(a.run_pending_range_deletions().await.unwrap(), 1);
    assert_eq!(b.run_pending_range_deletions().await.unwrap(), 1);
    assert_eq!(stored(&a, TEST_NS), 1);
    assert_eq!(stored(&b, TEST_NS), 1);
    assert_eq!((stored(&a, UNSHARDED_NS), stored(&b, UNSHARDED_NS)), (1, 0));
    assert_eq!((stored(&a, MOVED_DB_NS), stored(&b, MOVED_DB_NS)), (0, 1));

    let ctx = OperationContext::default();
    let router = cluster.router();
    assert_eq!(router.count(&ctx, TEST_NS, &ChunkRange::full()).await.unwrap(), 2);
    assert_eq!(router.find(&ctx, MOVED_DB_NS, &Filter::new()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_split_shard_without_cleanup_keeps_copies() {
    let (_dir, cluster) = copied_shard().await;
    let outcome = cluster
        .split_shard("A", "B", SplitShardOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.range_deletions, 0);
    assert!(outcome.dropped_collections.is_empty());

    let b = cluster.shard("B").unwrap();
    assert_eq!(stored(&b, TEST_NS), 2);
    assert!(b.deletions().tasks().unwrap().is_empty());
    // orphans are invisible to routed reads
    let ctx = OperationContext::default();
    assert_eq!(
        cluster.router().count(&ctx, TEST_NS, &ChunkRange::full()).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn test_split_shard_into_itself_is_rejected() {
    let (_dir, cluster) = copied_shard().await;
    let err = cluster
        .split_shard("A", "A", SplitShardOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Catalog(CatalogError::InvalidShardSplit { .. })));
}

#[tokio::test]
async fn test_split_shard_into_unknown_shard() {
    let (_dir, cluster) = copied_shard().await;
    let err = cluster
        .split_shard("A", "C", SplitShardOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(cluster.catalog().get_chunks_for_shard("A").unwrap().len(), 2);
}
