use std::sync::Arc;

use tempfile::TempDir;

use super::fast_retry;
use super::test_migration_config;
use crate::CatalogStore;
use crate::Router;
use crate::RoutingVersion;
use crate::ShardEntry;
use crate::ShardRegistry;
use crate::ShardKeyPattern;
use crate::ShardRequest;
use crate::ShardServer;
use crate::SledCatalogStore;

pub const TEST_NS: &str = "db.foo";

/// A catalog with shards `A` and `B` plus their servers. `db` has primary
/// `A`; `db.foo` is sharded on `{x: 1}` when requested.
pub struct TwoShards {
    pub dir: TempDir,
    pub catalog: Arc<SledCatalogStore>,
    pub a: Arc<ShardServer>,
    pub b: Arc<ShardServer>,
}

impl TwoShards {
    pub async fn new(shard_foo: bool) -> Self {
        Self::with_catalog_view(shard_foo, |catalog| catalog as Arc<dyn CatalogStore>).await
    }

    /// Like [`TwoShards::new`], but the shards talk to the catalog through
    /// `view`, which may wrap the sled store after the setup writes.
    pub async fn with_catalog_view<F>(
        shard_foo: bool,
        view: F,
    ) -> Self
    where
        F: FnOnce(Arc<SledCatalogStore>) -> Arc<dyn CatalogStore>,
    {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SledCatalogStore::open(dir.path(), "config/test").unwrap());
        for name in ["A", "B"] {
            catalog.add_shard(ShardEntry::new(name, format!("{name}:27018"))).unwrap();
        }
        catalog.create_database("db").unwrap();
        if shard_foo {
            catalog.enable_sharding("db").unwrap();
            catalog
                .shard_collection(TEST_NS, ShardKeyPattern::new(["x"]).unwrap(), false)
                .unwrap();
        }
        let shared = view(catalog.clone());
        let a = Self::open_shard_over(&dir, shared.clone(), "A").await;
        let b = Self::open_shard_over(&dir, shared, "B").await;
        Self { dir, catalog, a, b }
    }

    pub async fn open_shard(
        dir: &TempDir,
        catalog: &Arc<SledCatalogStore>,
        name: &str,
    ) -> Arc<ShardServer> {
        Self::open_shard_over(dir, catalog.clone(), name).await
    }

    pub async fn open_shard_over(
        dir: &TempDir,
        catalog: Arc<dyn CatalogStore>,
        name: &str,
    ) -> Arc<ShardServer> {
        Arc::new(
            ShardServer::open(name, dir.path(), catalog, &fast_retry(), &test_migration_config())
                .await
                .unwrap(),
        )
    }

    /// A fresh router over both shards.
    pub fn router(&self) -> Arc<Router> {
        let registry = ShardRegistry::new();
        registry.register(self.a.clone());
        registry.register(self.b.clone());
        let catalog: Arc<dyn CatalogStore> = self.catalog.clone();
        Arc::new(Router::new(catalog, registry, &fast_retry()))
    }

    /// Request carrying the catalog's current routing version for `TEST_NS`.
    pub fn request(&self) -> ShardRequest {
        ShardRequest::new(TEST_NS, self.version())
    }

    pub fn version(&self) -> RoutingVersion {
        match self.catalog.get_chunks(TEST_NS) {
            Ok(chunks) if !chunks.is_empty() => RoutingVersion::Sharded(
                chunks.iter().map(|c| c.version).max_by_key(|v| (v.major, v.minor)).unwrap(),
            ),
            _ => RoutingVersion::Unsharded(self.catalog.get_database("db").unwrap().version),
        }
    }
}
