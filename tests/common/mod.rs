use std::path::Path;
use std::time::Duration;

use shard_catalog::BackoffPolicy;
use shard_catalog::ChunkRange;
use shard_catalog::Cluster;
use shard_catalog::Document;
use shard_catalog::MigrationConfig;
use shard_catalog::OperationContext;
use shard_catalog::RetryPolicies;
use shard_catalog::Settings;
use shard_catalog::ShardKey;
use shard_catalog::ShardKeyPattern;
use shard_catalog::ShardSpec;
use tempfile::TempDir;

pub const NS: &str = "test.foo";

/// How long a test waits on background work before giving up
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn settings(
    root: &Path,
    shards: &[&str],
) -> Settings {
    let mut settings = Settings::default();
    settings.cluster.node_name = "it".to_string();
    settings.cluster.db_root_dir = root.to_path_buf();
    settings.cluster.log_dir = root.join("logs");
    settings.cluster.shards = shards
        .iter()
        .map(|name| ShardSpec {
            name: name.to_string(),
            endpoint: format!("{name}:27018"),
        })
        .collect();

    let quick = BackoffPolicy {
        max_retries: 10,
        timeout_ms: 500,
        base_delay_ms: 1,
        max_delay_ms: 10,
    };
    settings.retry = RetryPolicies {
        stale_config: quick,
        catalog_refresh: quick,
    };
    settings.migration = MigrationConfig {
        clone_batch_size: 8,
        critical_section_timeout_ms: 1_000,
        wait_for_delete: false,
        cleanup_batch_size: 8,
        orphan_cleanup_delay_ms: 0,
        range_deleter_interval_ms: 20,
    };
    settings
}

pub async fn open_cluster(
    root: &Path,
    shards: &[&str],
) -> Cluster {
    Cluster::open(settings(root, shards)).await.unwrap()
}

/// Two shards `A` and `B`; `test.foo` sharded on `{x: 1}` and split at 100.
pub async fn sharded_and_split() -> (TempDir, Cluster) {
    let dir = tempfile::tempdir().unwrap();
    let cluster = open_cluster(dir.path(), &["A", "B"]).await;
    cluster.enable_sharding("test").await.unwrap();
    cluster
        .shard_collection(NS, ShardKeyPattern::new(["x"]).unwrap(), false)
        .await
        .unwrap();
    cluster.split(NS, &ShardKey::single(100)).await.unwrap();
    (dir, cluster)
}

pub fn doc_x(
    id: &str,
    x: i64,
) -> Document {
    Document::new(id).with("x", x)
}

pub async fn routed_count(cluster: &Cluster) -> u64 {
    cluster
        .router()
        .count(&OperationContext::default(), NS, &ChunkRange::full())
        .await
        .unwrap()
}

/// Documents physically stored on `shard`, orphans included.
pub fn stored_on(
    cluster: &Cluster,
    shard: &str,
) -> u64 {
    cluster
        .shard(shard)
        .unwrap()
        .store()
        .count_range(NS, &ChunkRange::full())
        .unwrap()
}
