//! Case 1: updates that change a document's owning shard.
//!
//! Scenario:
//!
//! 1. `test.foo` is split at 100 and `[100, MaxKey)` lives on `B`.
//! 2. A document with `x = 50` (on `A`) is updated to `x = 150`, inside a
//!    transaction and as a retryable write delivered twice.
//!
//! Expected Result:
//!
//! - The document is never visible on both shards or on neither.
//! - A duplicate delivery replays the first result without a second move.

use shard_catalog::DocumentUpdate;
use shard_catalog::Filter;
use shard_catalog::OperationContext;
use shard_catalog::ShardKey;
use tracing_test::traced_test;

use crate::common::doc_x;
use crate::common::routed_count;
use crate::common::sharded_and_split;
use crate::common::stored_on;
use crate::common::NS;

async fn with_upper_chunk_on_b() -> (tempfile::TempDir, shard_catalog::Cluster) {
    let (dir, cluster) = sharded_and_split().await;
    cluster
        .move_chunk(NS, &ShardKey::single(150), "B", Some(true))
        .await
        .unwrap();
    cluster
        .router()
        .insert(&OperationContext::default(), NS, doc_x("doc", 50))
        .await
        .unwrap();
    (dir, cluster)
}

#[tokio::test]
#[traced_test]
async fn test_relocation_in_transaction_is_atomic() {
    let (_dir, cluster) = with_upper_chunk_on_b().await;

    let mut txn = cluster.router().start_transaction();
    let result = txn
        .update(NS, &Filter::new().eq("x", 50), &DocumentUpdate::set("x", 150))
        .await
        .unwrap();
    assert!(result.relocated);
    // not committed yet: the outside world still sees the pre-image
    assert_eq!((stored_on(&cluster, "A"), stored_on(&cluster, "B")), (1, 0));
    assert_eq!(routed_count(&cluster).await, 1);

    txn.commit().await.unwrap();
    assert_eq!((stored_on(&cluster, "A"), stored_on(&cluster, "B")), (0, 1));
    let docs = cluster
        .router()
        .find(&OperationContext::default(), NS, &Filter::new())
        .await
        .unwrap();
    assert_eq!(docs, vec![doc_x("doc", 150)]);
}

#[tokio::test]
async fn test_aborted_relocation_leaves_document_in_place() {
    let (_dir, cluster) = with_upper_chunk_on_b().await;

    let mut txn = cluster.router().start_transaction();
    txn.update(NS, &Filter::new().eq("x", 50), &DocumentUpdate::set("x", 150))
        .await
        .unwrap();
    txn.abort();

    assert_eq!((stored_on(&cluster, "A"), stored_on(&cluster, "B")), (1, 0));
    let docs = cluster
        .router()
        .find(&OperationContext::default(), NS, &Filter::new().eq("x", 50))
        .await
        .unwrap();
    assert_eq!(docs, vec![doc_x("doc", 50)]);
}

#[tokio::test]
#[traced_test]
async fn test_duplicate_retryable_relocation_applies_once() {
    let (_dir, cluster) = with_upper_chunk_on_b().await;
    let ctx = OperationContext::retryable("retry-1");
    let filter = Filter::new().eq("x", 50);
    let update = DocumentUpdate::set("x", 150);

    let first = cluster.router().update(&ctx, NS, &filter, &update).await.unwrap();
    let second = cluster.router().update(&ctx, NS, &filter, &update).await.unwrap();
    assert!(first.relocated);
    assert_eq!(first, second);

    assert_eq!((stored_on(&cluster, "A"), stored_on(&cluster, "B")), (0, 1));
    assert_eq!(routed_count(&cluster).await, 1);
}
