//! Case 1: moveChunk while a client keeps inserting.
//!
//! Scenario:
//!
//! 1. `test.foo` is split at 100 and `A` owns both chunks with 20 documents.
//! 2. A writer inserts 20 more documents across the key space while
//!    `[100, MaxKey)` moves to `B` without waiting for deletion.
//! 3. The range deleters run in the background.
//!
//! Expected Result:
//!
//! - The collection major version is bumped.
//! - The routed count equals the number of acknowledged inserts.
//! - Once the deleter catches up, `A` stores nothing in the moved range.

use std::time::Duration;

use shard_catalog::ChunkRange;
use shard_catalog::KeyBound;
use shard_catalog::OperationContext;
use shard_catalog::ShardKey;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use crate::common::doc_x;
use crate::common::routed_count;
use crate::common::sharded_and_split;
use crate::common::stored_on;
use crate::common::NS;
use crate::common::WAIT_TIMEOUT;

#[tokio::test]
#[traced_test]
async fn test_move_chunk_under_concurrent_inserts() {
    let (_dir, cluster) = sharded_and_split().await;
    let ctx = OperationContext::default();
    for i in 0..20 {
        cluster
            .router()
            .insert(&ctx, NS, doc_x(&format!("pre-{i}"), i * 10))
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    cluster.spawn_range_deleters(shutdown.clone(), &mut handles);

    let writer = {
        let router = cluster.router().clone();
        tokio::spawn(async move {
            let ctx = OperationContext::default();
            for i in 0..20 {
                router
                    .insert(&ctx, NS, doc_x(&format!("live-{i}"), i * 10 + 5))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let outcome = cluster
        .move_chunk(NS, &ShardKey::single(150), "B", Some(false))
        .await
        .unwrap();
    writer.await.unwrap();

    assert_eq!(outcome.version.major, 2);
    assert_eq!(routed_count(&cluster).await, 40);

    let upper = ChunkRange::new(KeyBound::key(100), KeyBound::Max);
    let a = cluster.shard("A").unwrap();
    timeout(WAIT_TIMEOUT, async {
        while a.store().count_range(NS, &upper).unwrap() > 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("orphans on the donor were not cleaned up");
    assert_eq!(stored_on(&cluster, "A"), 20);
    assert_eq!(stored_on(&cluster, "B"), 20);

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

/// Moving a chunk away and back bumps the major version each time and,
/// with `wait_for_delete`, never leaves a copy on the donor.
#[tokio::test]
async fn test_move_chunk_round_trip() {
    let (_dir, cluster) = sharded_and_split().await;
    let ctx = OperationContext::default();
    for (id, x) in [("a", 10), ("b", 110), ("c", 120)] {
        cluster.router().insert(&ctx, NS, doc_x(id, x)).await.unwrap();
    }

    let away = cluster
        .move_chunk(NS, &ShardKey::single(110), "B", Some(true))
        .await
        .unwrap();
    assert_eq!((away.from_shard.as_str(), away.version.major), ("A", 2));
    assert_eq!((stored_on(&cluster, "A"), stored_on(&cluster, "B")), (1, 2));

    let back = cluster
        .move_chunk(NS, &ShardKey::single(110), "A", Some(true))
        .await
        .unwrap();
    assert_eq!((back.from_shard.as_str(), back.version.major), ("B", 3));
    assert_eq!((stored_on(&cluster, "A"), stored_on(&cluster, "B")), (3, 0));
    assert_eq!(routed_count(&cluster).await, 3);
}
