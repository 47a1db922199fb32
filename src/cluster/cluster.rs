//! Administrative surface over one catalog, its shards and a router.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;

use crate::db_name;
use crate::CatalogStore;
use crate::ChunkRange;
use crate::ChunkVersion;
use crate::CleanupResult;
use crate::CollectionEntry;
use crate::DatabaseEntry;
use crate::KeyBound;
use crate::MigrationCoordinator;
use crate::MigrationOutcome;
use crate::Result;
use crate::Router;
use crate::Settings;
use crate::ShardEntry;
use crate::ShardKey;
use crate::ShardKeyPattern;
use crate::ShardRegistry;
use crate::ShardServer;
use crate::ShardSpec;
use crate::SledCatalogStore;

pub struct Cluster {
    pub(super) catalog: Arc<dyn CatalogStore>,
    pub(super) registry: ShardRegistry,
    router: Arc<Router>,
    pub(super) settings: Settings,
}

impl std::fmt::Debug for Cluster {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node", &self.settings.cluster.node_name)
            .field("shards", &self.registry.len())
            .finish()
    }
}

impl Cluster {
    /// Opens the catalog under `<db_root_dir>/config` and every configured
    /// shard under `<db_root_dir>/<name>`, registering unknown shards.
    pub async fn open(settings: Settings) -> Result<Self> {
        let root = settings.cluster.db_root_dir.clone();
        let catalog: Arc<dyn CatalogStore> = Arc::new(SledCatalogStore::open(
            &root,
            settings.cluster.config_connection_string.clone(),
        )?);
        let registry = ShardRegistry::new();
        let router = Arc::new(Router::new(catalog.clone(), registry.clone(), &settings.retry));
        let cluster = Self {
            catalog,
            registry,
            router,
            settings,
        };
        for spec in cluster.settings.cluster.shards.clone() {
            cluster.add_shard(&spec).await?;
        }
        info!(
            "cluster node {} open with {} shards",
            cluster.settings.cluster.node_name,
            cluster.registry.len()
        );
        Ok(cluster)
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn shard(
        &self,
        name: &str,
    ) -> Result<Arc<ShardServer>> {
        self.registry.get(name)
    }

    pub fn shards(&self) -> Vec<Arc<ShardServer>> {
        self.registry.all()
    }

    /// Registers the shard in the catalog if needed and opens its storage.
    pub async fn add_shard(
        &self,
        spec: &ShardSpec,
    ) -> Result<Arc<ShardServer>> {
        match self.catalog.get_shard(&spec.name) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => self
                .catalog
                .add_shard(ShardEntry::new(&spec.name, &spec.endpoint))?,
            Err(e) => return Err(e),
        }
        let shard = Arc::new(
            ShardServer::open(
                &spec.name,
                &self.settings.cluster.db_root_dir,
                self.catalog.clone(),
                &self.settings.retry,
                &self.settings.migration,
            )
            .await?,
        );
        self.registry.register(shard.clone());
        Ok(shard)
    }

    /// `enableSharding`: creates the database if needed and marks it
    /// partitioned. The primary reloads the bumped database version.
    #[instrument(skip(self))]
    pub async fn enable_sharding(
        &self,
        db: &str,
    ) -> Result<DatabaseEntry> {
        self.catalog.create_database(db)?;
        let entry = self.catalog.enable_sharding(db)?;
        self.shard(&entry.primary_shard)?
            .flush_database_cache(db)
            .await?;
        Ok(entry)
    }

    /// `shardCollection`: runs on the database primary under a critical
    /// section covering the whole namespace, so no write lands between the
    /// shard key check and the rekeying of existing documents.
    #[instrument(skip(self))]
    pub async fn shard_collection(
        &self,
        namespace: &str,
        pattern: ShardKeyPattern,
        unique: bool,
    ) -> Result<CollectionEntry> {
        let db = self.catalog.get_database(db_name(namespace))?;
        let primary = self.shard(&db.primary_shard)?;
        let _section = primary.sections().enter(namespace, ChunkRange::full()).await;

        primary.check_shard_key_present(namespace, &pattern)?;
        let entry = self.catalog.shard_collection(namespace, pattern, unique)?;
        primary.rekey_collection(namespace).await?;
        info!("sharded {} on {:?} with epoch {}", namespace, entry.key_pattern.fields(), entry.epoch);
        Ok(entry)
    }

    /// `split`: `at` becomes a chunk boundary. The owning shard reloads.
    #[instrument(skip(self))]
    pub async fn split(
        &self,
        namespace: &str,
        at: &ShardKey,
    ) -> Result<ChunkVersion> {
        let version = self.catalog.commit_split(namespace, at)?;
        let owner = self
            .catalog
            .get_chunks(namespace)?
            .into_iter()
            .find(|c| c.range.min == KeyBound::Key(at.clone()))
            .map(|c| c.shard);
        if let Some(owner) = owner {
            self.shard(&owner)?.refresh_routing(namespace).await?;
        }
        Ok(version)
    }

    /// `moveChunk`: migrates the chunk containing `key` to `to_shard`.
    /// `wait_for_delete` defaults to the configured value.
    #[instrument(skip(self))]
    pub async fn move_chunk(
        &self,
        namespace: &str,
        key: &ShardKey,
        to_shard: &str,
        wait_for_delete: Option<bool>,
    ) -> Result<MigrationOutcome> {
        let owner = self
            .catalog
            .get_chunks(namespace)?
            .into_iter()
            .find(|c| c.range.contains(key))
            .map(|c| c.shard)
            .ok_or_else(|| crate::CatalogError::InconsistentChunks {
                namespace: namespace.to_string(),
                reason: format!("no chunk contains {key}"),
            })?;
        let donor = self.shard(&owner)?;
        let recipient = self.shard(to_shard)?;
        let wait = wait_for_delete.unwrap_or(self.settings.migration.wait_for_delete);
        MigrationCoordinator::new(donor, recipient, self.settings.migration.clone())
            .run(namespace, key, wait)
            .await
    }

    /// `dropCollection`: marks the catalog entry dropped and removes the
    /// namespace's documents from every shard. Dropping an unsharded
    /// namespace only removes documents.
    #[instrument(skip(self))]
    pub async fn drop_collection(
        &self,
        namespace: &str,
    ) -> Result<usize> {
        match self.catalog.drop_collection(namespace) {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        let mut dropped = 0;
        for shard in self.registry.all() {
            dropped += shard.drop_collection_data(namespace).await?;
        }
        self.router.cache().invalidate_collection(namespace);
        Ok(dropped)
    }

    pub fn flush_router_cache(&self) {
        self.router.flush_router_cache();
    }

    pub async fn flush_shard_database_cache(
        &self,
        shard: &str,
        db: &str,
    ) -> Result<DatabaseEntry> {
        self.shard(shard)?.flush_database_cache(db).await
    }

    pub async fn flush_shard_routing_cache(
        &self,
        shard: &str,
        namespace: &str,
        sync_from_authority: bool,
    ) -> Result<Option<ChunkVersion>> {
        self.shard(shard)?
            .flush_routing_cache(namespace, sync_from_authority)
            .await
    }

    pub async fn cleanup_orphaned(
        &self,
        shard: &str,
        namespace: &str,
        starting_key: Option<KeyBound>,
    ) -> Result<CleanupResult> {
        self.shard(shard)?
            .cleanup_orphaned(namespace, starting_key)
            .await
    }

    /// Starts one range deleter per shard.
    pub fn spawn_range_deleters(
        &self,
        shutdown: CancellationToken,
        handles: &mut Vec<JoinHandle<()>>,
    ) {
        for shard in self.registry.all() {
            shard.spawn_range_deleter(shutdown.clone(), Some(&mut *handles));
        }
    }

    /// Flushes every shard's storage.
    pub fn flush(&self) -> Result<()> {
        for shard in self.registry.all() {
            shard.flush()?;
        }
        Ok(())
    }
}
