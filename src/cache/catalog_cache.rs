//! Versioned routing cache shared by routers and shards.
//!
//! Each namespace has one slot holding an immutable [`CollectionRouting`]
//! snapshot. Refreshes build a complete new snapshot from the catalog and
//! swap it in; readers holding the previous `Arc` are unaffected.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CachedRoutingTable;
use crate::async_task::backoff_delay;
use crate::db_name;
use crate::BackoffPolicy;
use crate::CatalogError;
use crate::CatalogStore;
use crate::ChunkVersion;
use crate::DatabaseEntry;
use crate::DatabaseVersion;
use crate::Error;
use crate::Result;
use crate::CACHE_REFRESHES;

#[derive(Debug, Clone)]
pub enum CollectionRouting {
    Sharded(Arc<CachedRoutingTable>),
    /// No live collection entry; the namespace lives on the database primary
    Unsharded,
}

impl CollectionRouting {
    pub fn version(&self) -> Option<ChunkVersion> {
        match self {
            CollectionRouting::Sharded(t) => Some(t.version()),
            CollectionRouting::Unsharded => None,
        }
    }

    pub fn table(&self) -> Option<&Arc<CachedRoutingTable>> {
        match self {
            CollectionRouting::Sharded(t) => Some(t),
            CollectionRouting::Unsharded => None,
        }
    }
}

type Slot = Arc<ArcSwapOption<CollectionRouting>>;

pub struct CatalogCache {
    catalog: Arc<dyn CatalogStore>,
    databases: DashMap<String, DatabaseEntry>,
    collections: DashMap<String, Slot>,
    /// Serializes refreshes of one namespace so concurrent stale requests
    /// trigger a single catalog read
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    refresh_policy: BackoffPolicy,
}

impl std::fmt::Debug for CatalogCache {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("CatalogCache")
            .field("databases", &self.databases.len())
            .field("collections", &self.collections.len())
            .finish()
    }
}

impl CatalogCache {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        refresh_policy: BackoffPolicy,
    ) -> Self {
        Self {
            catalog,
            databases: DashMap::new(),
            collections: DashMap::new(),
            refresh_locks: DashMap::new(),
            refresh_policy,
        }
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    fn slot(
        &self,
        namespace: &str,
    ) -> Slot {
        self.collections
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(ArcSwapOption::empty()))
            .clone()
    }

    fn refresh_lock(
        &self,
        key: &str,
    ) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Cached database entry, loading it on first access.
    pub async fn get_database(
        &self,
        db: &str,
    ) -> Result<DatabaseEntry> {
        if let Some(entry) = self.databases.get(db) {
            return Ok(entry.clone());
        }
        self.refresh_database(db).await
    }

    /// Like [`Self::get_database`], creating the database on a miss.
    pub async fn get_or_create_database(
        &self,
        db: &str,
    ) -> Result<DatabaseEntry> {
        match self.get_database(db).await {
            Err(e) if e.is_not_found() => {
                let entry = self.catalog.create_database(db)?;
                self.databases.insert(db.to_string(), entry.clone());
                Ok(entry)
            }
            other => other,
        }
    }

    pub async fn refresh_database(
        &self,
        db: &str,
    ) -> Result<DatabaseEntry> {
        let lock = self.refresh_lock(db);
        let _guard = lock.lock().await;
        CACHE_REFRESHES.with_label_values(&["database"]).inc();
        match self.catalog.get_database(db) {
            Ok(entry) => {
                self.databases.insert(db.to_string(), entry.clone());
                Ok(entry)
            }
            Err(e) => {
                self.databases.remove(db);
                Err(e)
            }
        }
    }

    /// Database entry no older than `wanted`.
    pub async fn on_stale_db_version(
        &self,
        db: &str,
        wanted: Option<DatabaseVersion>,
    ) -> Result<DatabaseEntry> {
        let cached = self.databases.get(db).map(|e| e.clone());
        if let (Some(wanted), Some(cached)) = (wanted, cached) {
            if cached.version == wanted || wanted.is_older_than(&cached.version) {
                return Ok(cached);
            }
        }
        debug!("refreshing database {} after staleness signal (wanted {:?})", db, wanted);
        self.refresh_database(db).await
    }

    /// Routing snapshot for `namespace`, loading it on first access.
    pub async fn get_collection_routing(
        &self,
        namespace: &str,
    ) -> Result<CollectionRouting> {
        if let Some(current) = self.peek_collection(namespace) {
            return Ok(current);
        }
        self.refresh_collection(namespace).await
    }

    /// Current snapshot without touching the catalog.
    pub fn peek_collection(
        &self,
        namespace: &str,
    ) -> Option<CollectionRouting> {
        self.collections
            .get(namespace)
            .and_then(|slot| slot.load_full())
            .map(|r| (*r).clone())
    }

    /// Re-reads the namespace from the catalog and swaps in the result.
    /// An unchanged catalog keeps the existing snapshot.
    pub async fn refresh_collection(
        &self,
        namespace: &str,
    ) -> Result<CollectionRouting> {
        let lock = self.refresh_lock(namespace);
        let _guard = lock.lock().await;
        self.refresh_collection_locked(namespace).await
    }

    async fn refresh_collection_locked(
        &self,
        namespace: &str,
    ) -> Result<CollectionRouting> {
        let fetched = self.fetch_with_retry(namespace).await?;
        let slot = self.slot(namespace);

        let unchanged = match (slot.load_full().as_deref(), &fetched) {
            (Some(CollectionRouting::Sharded(old)), CollectionRouting::Sharded(new)) => {
                old.version() == new.version()
            }
            (Some(CollectionRouting::Unsharded), CollectionRouting::Unsharded) => true,
            _ => false,
        };
        if unchanged {
            if let Some(current) = slot.load_full() {
                return Ok((*current).clone());
            }
        }

        info!(
            "routing cache for {} now at {:?}",
            namespace,
            fetched.version().map(|v| v.to_string())
        );
        slot.store(Some(Arc::new(fetched.clone())));
        Ok(fetched)
    }

    async fn fetch_with_retry(
        &self,
        namespace: &str,
    ) -> Result<CollectionRouting> {
        let mut attempt = 0;
        loop {
            CACHE_REFRESHES.with_label_values(&["collection"]).inc();
            match self.fetch(namespace) {
                Err(Error::Catalog(CatalogError::InconsistentChunks { reason, .. }))
                    if attempt + 1 < self.refresh_policy.max_retries =>
                {
                    warn!("inconsistent chunk listing for {}: {}; retrying", namespace, reason);
                    tokio::time::sleep(backoff_delay(&self.refresh_policy, attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn fetch(
        &self,
        namespace: &str,
    ) -> Result<CollectionRouting> {
        let collection = match self.catalog.get_collection(namespace) {
            Ok(c) => c,
            Err(e) if e.is_not_found() => return Ok(CollectionRouting::Unsharded),
            Err(e) => return Err(e),
        };
        let chunks = self.catalog.get_chunks(namespace)?;
        let table = CachedRoutingTable::new(collection, chunks)?;
        Ok(CollectionRouting::Sharded(Arc::new(table)))
    }

    /// Refreshes unless the cached snapshot is already at least `wanted`.
    pub async fn on_stale_shard_version(
        &self,
        namespace: &str,
        wanted: Option<ChunkVersion>,
    ) -> Result<CollectionRouting> {
        let lock = self.refresh_lock(namespace);
        let _guard = lock.lock().await;

        if let (Some(wanted), Some(current)) = (wanted, self.peek_collection(namespace)) {
            if let Some(have) = current.version() {
                if have.is_same_epoch(&wanted) && !have.is_older_than(&wanted) {
                    return Ok(current);
                }
            }
        }
        debug!("refreshing {} after staleness signal (wanted {:?})", namespace, wanted);
        self.refresh_collection_locked(namespace).await
    }

    /// Installs a snapshot read from local persistence.
    pub fn install_collection(
        &self,
        namespace: &str,
        routing: CollectionRouting,
    ) {
        self.slot(namespace).store(Some(Arc::new(routing)));
    }

    pub fn install_database(
        &self,
        entry: DatabaseEntry,
    ) {
        self.databases.insert(entry.name.clone(), entry);
    }

    pub fn invalidate_database(
        &self,
        db: &str,
    ) {
        self.databases.remove(db);
        for slot in self.collections.iter() {
            if db_name(slot.key()) == db {
                slot.value().store(None);
            }
        }
    }

    pub fn invalidate_collection(
        &self,
        namespace: &str,
    ) {
        if let Some(slot) = self.collections.get(namespace) {
            slot.store(None);
        }
    }

    /// Drops every cached entry; the next access reloads from the catalog.
    pub fn invalidate_all(&self) {
        self.databases.clear();
        for slot in self.collections.iter() {
            slot.value().store(None);
        }
    }

    /// Namespaces with a cached sharded snapshot.
    pub fn cached_namespaces(&self) -> Vec<String> {
        self.collections
            .iter()
            .filter(|slot| matches!(slot.value().load().as_deref(), Some(CollectionRouting::Sharded(_))))
            .map(|slot| slot.key().clone())
            .collect()
    }
}
