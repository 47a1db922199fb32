//! Case 1: splitShard of a shard whose data was copied to a new shard.
//!
//! Scenario:
//!
//! 1. `A` owns four chunks of `test.foo` holding eight documents.
//! 2. `B` joins holding a full copy of `A`'s documents.
//! 3. `splitShard(A, B)` runs with orphan removal; the range deleters run.
//!
//! Expected Result:
//!
//! - The upper two chunks belong to `B`.
//! - Every document ends up stored on exactly one shard.
//! - The routed count never changes.

use std::time::Duration;

use shard_catalog::CatalogStore;
use shard_catalog::DocWrite;
use shard_catalog::OperationContext;
use shard_catalog::ShardKey;
use shard_catalog::ShardKeyPattern;
use shard_catalog::ShardSpec;
use shard_catalog::SplitShardOptions;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use crate::common::doc_x;
use crate::common::open_cluster;
use crate::common::routed_count;
use crate::common::stored_on;
use crate::common::NS;
use crate::common::WAIT_TIMEOUT;

#[tokio::test]
#[traced_test]
async fn test_split_shard_removes_orphans_on_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = open_cluster(dir.path(), &["A"]).await;
    cluster.enable_sharding("test").await.unwrap();
    let pattern = ShardKeyPattern::new(["x"]).unwrap();
    cluster.shard_collection(NS, pattern.clone(), false).await.unwrap();
    for at in [100, 200, 300] {
        cluster.split(NS, &ShardKey::single(at)).await.unwrap();
    }
    let ctx = OperationContext::default();
    for i in 0..8 {
        cluster
            .router()
            .insert(&ctx, NS, doc_x(&format!("d{i}"), i * 50))
            .await
            .unwrap();
    }

    let b = cluster
        .add_shard(&ShardSpec {
            name: "B".to_string(),
            endpoint: "B:27018".to_string(),
        })
        .await
        .unwrap();
    let copy: Vec<DocWrite> = cluster
        .shard("A")
        .unwrap()
        .store()
        .scan_namespace(NS)
        .unwrap()
        .into_iter()
        .map(|(_, doc)| DocWrite::upsert(NS, pattern.extract(&doc).unwrap(), doc))
        .collect();
    b.store().apply(&copy, &[]).unwrap();
    assert_eq!(routed_count(&cluster).await, 8);

    let outcome = cluster
        .split_shard(
            "A",
            "B",
            SplitShardOptions {
                remove_orphans: true,
                drop_orphaned_collections: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.chunks_moved, 2);
    assert_eq!(outcome.range_deletions, 4);
    let owners: Vec<String> = cluster
        .catalog()
        .get_chunks(NS)
        .unwrap()
        .into_iter()
        .map(|c| c.shard)
        .collect();
    assert_eq!(owners, ["A", "A", "B", "B"]);
    assert_eq!(routed_count(&cluster).await, 8);

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    cluster.spawn_range_deleters(shutdown.clone(), &mut handles);
    timeout(WAIT_TIMEOUT, async {
        while stored_on(&cluster, "A") + stored_on(&cluster, "B") > 8 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("orphans were not cleaned up");
    assert_eq!((stored_on(&cluster, "A"), stored_on(&cluster, "B")), (4, 4));
    assert_eq!(routed_count(&cluster).await, 8);

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}
