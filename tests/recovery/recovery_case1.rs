//! Case 1: the donor stops between the catalog commit and learning its outcome.
//!
//! Scenario:
//!
//! 1. `A` owns both chunks of `test.foo`; it marks a commit as in flight in
//!    its recovery record.
//! 2. The catalog commits `[100, MaxKey)` to `B`, then the node stops before
//!    `A` refreshes or clears the marker.
//! 3. The node restarts, twice.
//!
//! Expected Result:
//!
//! - On the first restart `A` adopts the catalog's routing and clears the
//!   marker, advancing `min_op_time`.
//! - The second restart finds nothing to recover and changes nothing.

use shard_catalog::CatalogStore;
use shard_catalog::LogPosition;
use shard_catalog::OperationContext;
use shard_catalog::ShardKey;
use tracing_test::traced_test;

use crate::common::doc_x;
use crate::common::open_cluster;
use crate::common::sharded_and_split;
use crate::common::NS;

#[tokio::test]
#[traced_test]
async fn test_recovery_adopts_catalog_outcome_once() {
    let (dir, cluster) = sharded_and_split().await;
    let ctx = OperationContext::default();
    cluster.router().insert(&ctx, NS, doc_x("low", 50)).await.unwrap();
    cluster.router().insert(&ctx, NS, doc_x("high", 150)).await.unwrap();

    {
        let a = cluster.shard("A").unwrap();
        let catalog = cluster.catalog();
        let before = a.routing(NS).await.unwrap().version().unwrap();
        assert_eq!(before.major, 1);

        let marker = a.recovery().increment_updaters(catalog.as_ref()).unwrap();
        assert_eq!(marker.min_op_time_updaters, 1);
        let upper = catalog.get_chunks(NS).unwrap().pop().unwrap();
        catalog
            .commit_chunk_migration(NS, &upper.range, "A", "B", &upper.version)
            .unwrap();
    }
    drop(cluster);

    let cluster = open_cluster(dir.path(), &["A", "B"]).await;
    let a = cluster.shard("A").unwrap();
    let recovered = a.recovery().load().unwrap().unwrap();
    assert_eq!(recovered.min_op_time_updaters, 0);
    assert!(recovered.min_op_time > LogPosition::ZERO);

    let routing = a.routing(NS).await.unwrap();
    assert_eq!(routing.version().unwrap().major, 2);
    let table = routing.table().unwrap();
    assert_eq!(table.owner_of(&ShardKey::single(150)), "B");
    drop(a);
    drop(cluster);

    let cluster = open_cluster(dir.path(), &["A", "B"]).await;
    let a = cluster.shard("A").unwrap();
    assert_eq!(a.recovery().load().unwrap().unwrap(), recovered);
    assert_eq!(a.routing(NS).await.unwrap().version().unwrap().major, 2);
}
