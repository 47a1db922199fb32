//! One shard of the cluster.
//!
//! A shard stores documents, rejects requests whose routing version does not
//! match its own cached view, and plays the donor or recipient role during
//! chunk migration. Every write goes through the same admission path: wait
//! out any critical section covering the key, validate the caller's version
//! while holding the write permit, then apply under `apply_lock` so that the
//! migration mod tracker sees writes in commit order.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::CleanWhen;
use super::CriticalSections;
use super::DocWrite;
use super::DocumentStore;
use super::LocalCacheStore;
use super::MigrationSource;
use super::RangeDeletionQueue;
use super::RangeDeletionTask;
use super::RecoveryStore;
use super::RoutingVersion;
use super::ShardRequest;
use super::TransactionParticipant;
use super::WritePermit;
use super::WriteResult;
use crate::async_task::spawn_task;
use crate::cache::CachedRoutingTable;
use crate::cache::CatalogCache;
use crate::cache::CollectionRouting;
use crate::db_name;
use crate::time::get_now_as_u128;
use crate::time::millis;
use crate::CatalogStore;
use crate::ChunkRange;
use crate::ChunkVersion;
use crate::DatabaseEntry;
use crate::DatabaseVersion;
use crate::Document;
use crate::DocumentError;
use crate::DocumentUpdate;
use crate::Filter;
use crate::KeyBound;
use crate::MigrationConfig;
use crate::MigrationError;
use crate::Result;
use crate::RetryPolicies;
use crate::RoutingError;
use crate::ShardKey;
use crate::ShardKeyPattern;
use crate::TransactionError;
use crate::ORPHANS_DELETED;

/// Outcome of one `cleanupOrphaned` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupResult {
    /// Where the next call should resume; `None` once no orphan range is left
    pub stopped_at: Option<KeyBound>,
    pub deleted: usize,
}

enum UpdateOutcome {
    Done(WriteResult, Option<Document>),
    /// The post-image key sits inside an active critical section
    Blocked(ShardKey),
}

pub struct ShardServer {
    name: String,
    db: sled::Db,
    cache: CatalogCache,
    local: LocalCacheStore,
    store: DocumentStore,
    recovery: RecoveryStore,
    deletions: RangeDeletionQueue,
    sections: CriticalSections,
    participant: TransactionParticipant,
    /// Active donor-side migrations, one per namespace
    migrations: DashMap<String, Arc<MigrationSource>>,
    /// Ranges being cloned into this shard; never cleaned as orphans
    incoming: DashMap<String, ChunkRange>,
    apply_lock: Mutex<()>,
    config: MigrationConfig,

    #[cfg(test)]
    commit_faults: std::sync::atomic::AtomicUsize,
}

impl Debug for ShardServer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ShardServer")
            .field("name", &self.name)
            .field("migrations", &self.migrations.len())
            .finish()
    }
}

pub fn init_sled_shard_db(
    sled_db_root_path: impl AsRef<Path> + Debug,
    shard_name: &str,
) -> std::result::Result<sled::Db, std::io::Error> {
    debug!("init_sled_shard_db for {} from path: {:?}", shard_name, &sled_db_root_path);

    let shard_db_path = sled_db_root_path.as_ref().join(shard_name);

    sled::Config::default()
        .path(&shard_db_path)
        .cache_capacity(10 * 1024 * 1024) //10MB
        .use_compression(true)
        .compression_factor(1)
        .open()
        .map_err(|e| {
            warn!(
                "Try to open DB at this location: {:?} and failed: {:?}",
                shard_db_path, e
            );
            std::io::Error::other(e)
        })
}

fn stale_shard_version(
    namespace: &str,
    received: Option<ChunkVersion>,
    wanted: Option<ChunkVersion>,
) -> crate::Error {
    RoutingError::StaleShardVersion {
        namespace: namespace.to_string(),
        received,
        wanted,
    }
    .into()
}

/// Shard key of `doc`; unsharded namespaces store every document under the
/// empty key.
fn shard_key_of(
    routing: &CollectionRouting,
    doc: &Document,
) -> Result<ShardKey> {
    match routing {
        CollectionRouting::Sharded(table) => table.collection().key_pattern.extract(doc),
        CollectionRouting::Unsharded => Ok(ShardKey(Vec::new())),
    }
}

/// Key a single-document write targets.
fn target_key(
    namespace: &str,
    routing: &CollectionRouting,
    filter: &Filter,
) -> Result<ShardKey> {
    match routing {
        CollectionRouting::Sharded(table) => table
            .collection()
            .key_pattern
            .extract_from_filter(filter)
            .ok_or_else(|| {
                RoutingError::ShardKeyNotFound {
                    namespace: namespace.to_string(),
                }
                .into()
            }),
        CollectionRouting::Unsharded => Ok(ShardKey(Vec::new())),
    }
}

impl ShardServer {
    /// Opens the shard's storage at `<db_root>/<name>`, reloads its
    /// persisted routing cache and resolves any migration commit that was
    /// in flight when the shard last stopped.
    pub async fn open(
        name: &str,
        db_root: impl AsRef<Path> + Debug,
        catalog: Arc<dyn CatalogStore>,
        retry: &RetryPolicies,
        config: &MigrationConfig,
    ) -> Result<Self> {
        let db = init_sled_shard_db(db_root, name)?;
        let shard = Self {
            name: name.to_string(),
            cache: CatalogCache::new(catalog, retry.catalog_refresh),
            local: LocalCacheStore::open(&db)?,
            store: DocumentStore::open(&db)?,
            recovery: RecoveryStore::open(&db, name)?,
            deletions: RangeDeletionQueue::open(&db)?,
            sections: CriticalSections::new(millis(config.critical_section_timeout_ms)),
            participant: TransactionParticipant::new(),
            migrations: DashMap::new(),
            incoming: DashMap::new(),
            apply_lock: Mutex::new(()),
            config: config.clone(),
            db,
            #[cfg(test)]
            commit_faults: Default::default(),
        };
        shard.load_persisted_cache()?;

        if shard.recovery.recover_on_startup(shard.catalog().as_ref())? {
            for namespace in shard.local.persisted_namespaces()? {
                shard.refresh_routing(&namespace).await?;
            }
        }
        info!("shard {} is open", shard.name);
        Ok(shard)
    }

    fn load_persisted_cache(&self) -> Result<()> {
        let (databases, collections) = self.local.load_all()?;
        debug!(
            "shard {} loaded {} databases and {} collections from its local cache",
            self.name,
            databases.len(),
            collections.len()
        );
        for entry in databases {
            self.cache.install_database(entry);
        }
        for (namespace, routing) in collections {
            self.cache.install_collection(&namespace, routing);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        self.cache.catalog()
    }

    pub fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    pub fn local_cache(&self) -> &LocalCacheStore {
        &self.local
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn recovery(&self) -> &RecoveryStore {
        &self.recovery
    }

    pub fn sections(&self) -> &CriticalSections {
        &self.sections
    }

    pub fn participant(&self) -> &TransactionParticipant {
        &self.participant
    }

    pub fn deletions(&self) -> &RangeDeletionQueue {
        &self.deletions
    }

    pub fn migration_config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()?;
        self.db.flush()?;
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Routing versions

    /// Cached routing, loading it on first access.
    pub async fn routing(
        &self,
        namespace: &str,
    ) -> Result<CollectionRouting> {
        match self.cache.peek_collection(namespace) {
            Some(routing) => Ok(routing),
            None => self.refresh_routing(namespace).await,
        }
    }

    /// Reloads the namespace from the catalog and persists the result locally.
    #[instrument(skip(self), fields(shard = %self.name))]
    pub async fn refresh_routing(
        &self,
        namespace: &str,
    ) -> Result<CollectionRouting> {
        let routing = self.cache.refresh_collection(namespace).await?;
        self.local.persist_routing(namespace, &routing)?;
        Ok(routing)
    }

    /// Validates the caller's routing version against this shard's view.
    ///
    /// When the caller is ahead (or on another epoch) the shard refreshes
    /// once before judging. Returns the routing the request runs under.
    pub async fn check_routing(
        &self,
        namespace: &str,
        received: &RoutingVersion,
    ) -> Result<CollectionRouting> {
        let current = self.routing(namespace).await?;
        match (received, current.version()) {
            (RoutingVersion::Sharded(r), Some(have)) if *r == have => Ok(current),
            (RoutingVersion::Sharded(r), Some(have)) if r.is_older_than(&have) => {
                Err(stale_shard_version(namespace, Some(*r), Some(have)))
            }
            (RoutingVersion::Sharded(r), _) => {
                let fresh = self.refresh_routing(namespace).await?;
                match fresh.version() {
                    Some(have) if have == *r => Ok(fresh),
                    wanted => Err(stale_shard_version(namespace, Some(*r), wanted)),
                }
            }
            (RoutingVersion::Unsharded(db_version), Some(_)) => {
                let fresh = self.refresh_routing(namespace).await?;
                match fresh.version() {
                    Some(have) => Err(stale_shard_version(namespace, None, Some(have))),
                    None => {
                        self.check_database(namespace, db_version).await?;
                        Ok(fresh)
                    }
                }
            }
            (RoutingVersion::Unsharded(db_version), None) => {
                self.check_database(namespace, db_version).await?;
                Ok(current)
            }
        }
    }

    /// Unsharded namespaces live on the database primary; the caller must
    /// agree with this shard on the database version.
    async fn check_database(
        &self,
        namespace: &str,
        received: &DatabaseVersion,
    ) -> Result<()> {
        let db = db_name(namespace);
        let mut entry = self.cache.get_database(db).await?;
        if entry.version != *received && !received.is_older_than(&entry.version) {
            entry = self.cache.on_stale_db_version(db, Some(*received)).await?;
            self.local.persist_database(&entry)?;
        }
        if entry.version != *received || entry.primary_shard != self.name {
            return Err(RoutingError::StaleDbVersion {
                db: db.to_string(),
                received: Some(*received),
                wanted: Some(entry.version),
            }
            .into());
        }
        Ok(())
    }

    /// Write permit for `key` plus the routing it was validated under.
    async fn admit(
        &self,
        req: &ShardRequest,
        key: &ShardKey,
    ) -> Result<(WritePermit, CollectionRouting)> {
        let permit = self
            .sections
            .write_permit(&req.namespace, Some(&[key]))
            .await?;
        let routing = self.check_routing(&req.namespace, &req.version).await?;
        if let Some(table) = routing.table() {
            if !table.owns(&self.name, key) {
                return Err(MigrationError::RangeNotOwned {
                    namespace: req.namespace.clone(),
                    shard: self.name.clone(),
                }
                .into());
            }
        }
        Ok((permit, routing))
    }

    fn owns_document(
        &self,
        routing: &CollectionRouting,
        doc: &Document,
    ) -> bool {
        match routing {
            CollectionRouting::Sharded(table) => table
                .collection()
                .key_pattern
                .extract(doc)
                .map(|key| table.owns(&self.name, &key))
                .unwrap_or(false),
            CollectionRouting::Unsharded => true,
        }
    }

    /// Committed documents overlaid with the transaction's staged writes.
    fn visible(
        &self,
        txn_id: Option<&str>,
        namespace: &str,
        key: Option<&ShardKey>,
    ) -> Result<BTreeMap<Vec<u8>, Document>> {
        let base = match key {
            Some(key) => self.store.find_by_shard_key(namespace, key)?,
            None => self.store.scan_namespace(namespace)?,
        };
        let mut docs: BTreeMap<Vec<u8>, Document> = base.into_iter().collect();
        if let Some(txn_id) = txn_id {
            for staged in self.participant.staged_in_namespace(txn_id, namespace) {
                if key.is_some_and(|k| *k != staged.shard_key) {
                    continue;
                }
                let storage_key = staged.storage_key();
                match staged.doc {
                    Some(doc) => docs.insert(storage_key, doc),
                    None => docs.remove(&storage_key),
                };
            }
        }
        Ok(docs)
    }

    /// Result of an earlier delivery of the same retryable write.
    fn replayed(
        &self,
        req: &ShardRequest,
    ) -> Result<Option<WriteResult>> {
        match &req.retry_token {
            Some(token) => self.store.executed(token),
            None => Ok(None),
        }
    }

    /// Applies or stages `writes`. Callers hold `apply_lock`.
    fn write_locked(
        &self,
        req: &ShardRequest,
        writes: Vec<DocWrite>,
        result: WriteResult,
    ) -> Result<WriteResult> {
        match &req.txn_id {
            Some(txn_id) => {
                for w in writes {
                    self.participant.stage(txn_id, w)?;
                }
                if let Some(token) = &req.retry_token {
                    self.participant
                        .record_token(txn_id, token.clone(), result)?;
                }
            }
            None => {
                if let Some(prev) = self.replayed(req)? {
                    return Ok(prev);
                }
                for w in &writes {
                    if let Some(holder) = self.participant.lock_holder(&w.namespace, &w.storage_key()) {
                        return Err(TransactionError::WriteConflict {
                            namespace: w.namespace.clone(),
                            txn_id: holder,
                        }
                        .into());
                    }
                }
                let tokens: Vec<(String, WriteResult)> = req
                    .retry_token
                    .iter()
                    .map(|t| (t.clone(), result))
                    .collect();
                self.store.apply(&writes, &tokens)?;
                self.record_mods(&writes);
            }
        }
        Ok(result)
    }

    fn record_mods(
        &self,
        writes: &[DocWrite],
    ) {
        for source in self.migrations.iter() {
            source.record(writes);
        }
    }

    // ----------------------------------------------------------------------
    // Documents

    #[instrument(skip(self, req, doc), fields(shard = %self.name, ns = %req.namespace))]
    pub async fn insert(
        &self,
        req: &ShardRequest,
        doc: Document,
    ) -> Result<WriteResult> {
        doc.validate()?;
        if let Some(prev) = self.replayed(req)? {
            debug!("insert replayed from retry token");
            return Ok(prev);
        }

        let mut key = shard_key_of(&self.routing(&req.namespace).await?, &doc)?;
        loop {
            let (_permit, routing) = self.admit(req, &key).await?;
            let checked = shard_key_of(&routing, &doc)?;
            if checked != key {
                key = checked;
                continue;
            }
            let write = DocWrite::upsert(&req.namespace, key, doc);
            return self.insert_locked(req, &routing, write);
        }
    }

    fn insert_locked(
        &self,
        req: &ShardRequest,
        routing: &CollectionRouting,
        write: DocWrite,
    ) -> Result<WriteResult> {
        let _apply = self.apply_lock.lock();
        let txn_id = req.txn_id.as_deref();
        let existing = self.visible(txn_id, &req.namespace, Some(&write.shard_key))?;
        let unique = routing.table().is_some_and(|t| t.collection().unique);
        if existing.contains_key(&write.storage_key()) || (unique && !existing.is_empty()) {
            return Err(DocumentError::DuplicateKey {
                namespace: req.namespace.clone(),
                key: write.shard_key.to_string(),
            }
            .into());
        }
        // `_id` is unique per shard whatever the shard key; orphans do not count
        let id_taken = self
            .visible(txn_id, &req.namespace, None)?
            .values()
            .any(|d| d.id() == write.id && self.owns_document(routing, d));
        if id_taken {
            return Err(DocumentError::DuplicateKey {
                namespace: req.namespace.clone(),
                key: format!("_id {}", write.id),
            }
            .into());
        }
        self.write_locked(req, vec![write], WriteResult::one())
    }

    /// Documents matching `filter` in ranges this shard owns.
    pub async fn find(
        &self,
        req: &ShardRequest,
        filter: &Filter,
    ) -> Result<Vec<Document>> {
        let routing = self.check_routing(&req.namespace, &req.version).await?;
        let key = routing
            .table()
            .and_then(|t| t.collection().key_pattern.extract_from_filter(filter));
        let docs = self.visible(req.txn_id.as_deref(), &req.namespace, key.as_ref())?;
        Ok(docs
            .into_values()
            .filter(|d| filter.matches(d) && self.owns_document(&routing, d))
            .collect())
    }

    /// Documents of `range` in chunks this shard owns; orphans are not counted.
    pub async fn count(
        &self,
        req: &ShardRequest,
        range: &ChunkRange,
    ) -> Result<u64> {
        let routing = self.check_routing(&req.namespace, &req.version).await?;
        match routing.table() {
            None => Ok(self.store.scan_namespace(&req.namespace)?.len() as u64),
            Some(table) => {
                let mut total = 0;
                for owned in table.owned_ranges(&self.name) {
                    if let Some(r) = owned.intersect(range) {
                        total += self.store.count_range(&req.namespace, &r)?;
                    }
                }
                Ok(total)
            }
        }
    }

    /// Updates the first document matching `filter`.
    pub async fn update(
        &self,
        req: &ShardRequest,
        filter: &Filter,
        update: &DocumentUpdate,
    ) -> Result<WriteResult> {
        if let Some(prev) = self.replayed(req)? {
            return Ok(prev);
        }
        Ok(self.update_one(req, filter, update).await?.0)
    }

    /// Updates the first document matching `filter` and returns its post-image.
    pub async fn find_and_modify(
        &self,
        req: &ShardRequest,
        filter: &Filter,
        update: &DocumentUpdate,
    ) -> Result<Option<Document>> {
        Ok(self.update_one(req, filter, update).await?.1)
    }

    #[instrument(skip(self, req, update), fields(shard = %self.name, ns = %req.namespace))]
    async fn update_one(
        &self,
        req: &ShardRequest,
        filter: &Filter,
        update: &DocumentUpdate,
    ) -> Result<(WriteResult, Option<Document>)> {
        loop {
            let key = target_key(&req.namespace, &self.routing(&req.namespace).await?, filter)?;
            let (permit, routing) = self.admit(req, &key).await?;
            if target_key(&req.namespace, &routing, filter)? != key {
                continue;
            }
            match self.update_locked(req, &routing, &key, filter, update)? {
                UpdateOutcome::Done(result, post) => return Ok((result, post)),
                UpdateOutcome::Blocked(post_key) => {
                    drop(permit);
                    debug!("post-image key {} is in a critical section, waiting", post_key);
                    drop(
                        self.sections
                            .write_permit(&req.namespace, Some(&[&post_key]))
                            .await?,
                    );
                }
            }
        }
    }

    fn update_locked(
        &self,
        req: &ShardRequest,
        routing: &CollectionRouting,
        key: &ShardKey,
        filter: &Filter,
        update: &DocumentUpdate,
    ) -> Result<UpdateOutcome> {
        let namespace = &req.namespace;
        let _apply = self.apply_lock.lock();
        let Some(pre) = self
            .visible(req.txn_id.as_deref(), namespace, Some(key))?
            .into_values()
            .find(|d| filter.matches(d))
        else {
            let result = self.write_locked(req, Vec::new(), WriteResult::none())?;
            return Ok(UpdateOutcome::Done(result, None));
        };

        let post = update.apply(&pre)?;
        let post_key = shard_key_of(routing, &post)?;
        let key_changed = post_key != *key;
        if key_changed {
            if let Some(table) = routing.table() {
                if !table.owns(&self.name, &post_key) {
                    return Err(RoutingError::WouldChangeOwningShard {
                        namespace: namespace.clone(),
                        pre_image: Box::new(pre),
                        post_image: Box::new(post),
                    }
                    .into());
                }
            }
            if self.sections.is_blocked(namespace, &post_key) {
                return Ok(UpdateOutcome::Blocked(post_key));
            }
        }

        let result = WriteResult {
            matched: 1,
            modified: u64::from(post != pre),
            relocated: false,
        };
        let mut writes = Vec::with_capacity(2);
        if key_changed {
            writes.push(DocWrite::delete(namespace, key.clone(), pre.id()));
        }
        writes.push(DocWrite::upsert(namespace, post_key, post.clone()));
        let result = self.write_locked(req, writes, result)?;
        Ok(UpdateOutcome::Done(result, Some(post)))
    }

    /// Deletes the first document matching `filter`.
    #[instrument(skip(self, req), fields(shard = %self.name, ns = %req.namespace))]
    pub async fn delete(
        &self,
        req: &ShardRequest,
        filter: &Filter,
    ) -> Result<WriteResult> {
        if let Some(prev) = self.replayed(req)? {
            return Ok(prev);
        }
        loop {
            let key = target_key(&req.namespace, &self.routing(&req.namespace).await?, filter)?;
            let (_permit, routing) = self.admit(req, &key).await?;
            if target_key(&req.namespace, &routing, filter)? != key {
                continue;
            }
            return self.delete_locked(req, &key, filter);
        }
    }

    fn delete_locked(
        &self,
        req: &ShardRequest,
        key: &ShardKey,
        filter: &Filter,
    ) -> Result<WriteResult> {
        let _apply = self.apply_lock.lock();
        let Some(doc) = self
            .visible(req.txn_id.as_deref(), &req.namespace, Some(key))?
            .into_values()
            .find(|d| filter.matches(d))
        else {
            return self.write_locked(req, Vec::new(), WriteResult::none());
        };
        let write = DocWrite::delete(&req.namespace, key.clone(), doc.id());
        self.write_locked(req, vec![write], WriteResult::one())
    }

    // ----------------------------------------------------------------------
    // Transactions

    pub fn prepare_transaction(
        &self,
        txn_id: &str,
    ) -> Result<()> {
        self.participant.prepare(txn_id)
    }

    /// Records a retry token inside the transaction, committed with its writes.
    pub fn record_retry_token(
        &self,
        txn_id: &str,
        token: &str,
        result: WriteResult,
    ) -> Result<()> {
        self.participant
            .record_token(txn_id, token.to_string(), result)
    }

    /// Applies the transaction's staged writes atomically.
    ///
    /// Document locks are still held, so the commit does not wait for
    /// critical sections; a migration instead waits for the locks to clear.
    /// When the apply fails the transaction keeps its staged writes and
    /// locks, so the commit can be retried.
    #[instrument(skip(self), fields(shard = %self.name))]
    pub async fn commit_transaction(
        &self,
        txn_id: &str,
    ) -> Result<()> {
        let set = self.participant.commit_set(txn_id)?;
        let namespaces: BTreeSet<&str> = set.writes.iter().map(|w| w.namespace.as_str()).collect();
        let mut permits = Vec::with_capacity(namespaces.len());
        for ns in namespaces {
            permits.push(self.sections.barrier_permit(ns).await);
        }

        #[cfg(test)]
        self.take_commit_fault()?;
        {
            let _apply = self.apply_lock.lock();
            self.store.apply(&set.writes, &set.tokens)?;
            self.record_mods(&set.writes);
        }
        self.participant.finish(txn_id);
        debug!("committed transaction {} ({} writes)", txn_id, set.writes.len());
        Ok(())
    }

    /// Makes the next `n` transaction commits on this shard fail before
    /// applying anything.
    #[cfg(test)]
    pub fn fail_next_commits(
        &self,
        n: usize,
    ) {
        self.commit_faults.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_commit_fault(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        let failed = self
            .commit_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(crate::StorageError::DbError(format!("commit on {} failed", self.name)).into());
        }
        Ok(())
    }

    pub fn abort_transaction(
        &self,
        txn_id: &str,
    ) {
        self.participant.abort(txn_id);
    }

    // ----------------------------------------------------------------------
    // Cache administration

    /// `flushShardRoutingCache`: reload from the catalog now, or drop the
    /// in-memory entry so the next request reloads it.
    pub async fn flush_routing_cache(
        &self,
        namespace: &str,
        sync_from_authority: bool,
    ) -> Result<Option<ChunkVersion>> {
        if sync_from_authority {
            return Ok(self.refresh_routing(namespace).await?.version());
        }
        self.cache.invalidate_collection(namespace);
        Ok(None)
    }

    /// `flushShardDatabaseCache`: reload the database entry and persist it.
    pub async fn flush_database_cache(
        &self,
        db: &str,
    ) -> Result<DatabaseEntry> {
        let entry = self.cache.refresh_database(db).await?;
        self.local.persist_database(&entry)?;
        info!("shard {} database cache for {} at {}", self.name, db, entry.version);
        Ok(entry)
    }

    // ----------------------------------------------------------------------
    // Collection lifecycle

    /// Fails unless every stored document of the namespace carries the
    /// fields of `pattern`.
    pub fn check_shard_key_present(
        &self,
        namespace: &str,
        pattern: &ShardKeyPattern,
    ) -> Result<()> {
        for (_, doc) in self.store.scan_namespace(namespace)? {
            pattern.extract(&doc)?;
        }
        Ok(())
    }

    /// Moves documents stored under the unsharded empty key to their shard
    /// key after the collection became sharded. Run under a full-range
    /// critical section.
    pub async fn rekey_collection(
        &self,
        namespace: &str,
    ) -> Result<usize> {
        let routing = self.refresh_routing(namespace).await?;
        let Some(table) = routing.table() else {
            return Ok(0);
        };
        let pattern = table.collection().key_pattern.clone();
        let unkeyed = ShardKey(Vec::new());

        let _apply = self.apply_lock.lock();
        let mut writes = Vec::new();
        for (storage_key, doc) in self.store.scan_namespace(namespace)? {
            if storage_key != DocumentStore::key(namespace, &unkeyed, doc.id()) {
                continue;
            }
            let key = pattern.extract(&doc)?;
            writes.push(DocWrite::delete(namespace, unkeyed.clone(), doc.id()));
            writes.push(DocWrite::upsert(namespace, key, doc));
        }
        self.store.apply(&writes, &[])?;
        let moved = writes.len() / 2;
        info!("rekeyed {} documents of {} on {}", moved, namespace, self.name);
        Ok(moved)
    }

    /// Drops the namespace's documents, pending deletions and any migration.
    pub async fn drop_collection_data(
        &self,
        namespace: &str,
    ) -> Result<usize> {
        self.abort_migration(namespace);
        let dropped = {
            let _apply = self.apply_lock.lock();
            self.store.drop_namespace(namespace)?
        };
        for task in self.deletions.tasks_for(namespace)? {
            self.deletions.complete(&task.id)?;
        }
        self.refresh_routing(namespace).await?;
        Ok(dropped)
    }

    // ----------------------------------------------------------------------
    // Migration: donor side

    pub fn register_migration(
        &self,
        source: Arc<MigrationSource>,
    ) -> Result<()> {
        match self.migrations.entry(source.namespace().to_string()) {
            Entry::Occupied(_) => Err(MigrationError::ConflictingMigration {
                namespace: source.namespace().to_string(),
                shard: self.name.clone(),
            }
            .into()),
            Entry::Vacant(slot) => {
                slot.insert(source);
                Ok(())
            }
        }
    }

    pub fn unregister_migration(
        &self,
        namespace: &str,
    ) {
        self.migrations.remove(namespace);
    }

    pub fn active_migration(
        &self,
        namespace: &str,
    ) -> Option<Arc<MigrationSource>> {
        self.migrations.get(namespace).map(|s| s.clone())
    }

    /// Cancels the namespace's migration if it has not reached its commit.
    pub fn abort_migration(
        &self,
        namespace: &str,
    ) -> bool {
        match self.migrations.get(namespace) {
            Some(source) => {
                source.cancel_token().cancel();
                true
            }
            None => false,
        }
    }

    pub fn clone_batch(
        &self,
        namespace: &str,
        range: &ChunkRange,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Document)>> {
        self.store.scan_range(namespace, range, after, limit)
    }

    // ----------------------------------------------------------------------
    // Migration: recipient side

    pub fn begin_receive(
        &self,
        namespace: &str,
        range: ChunkRange,
    ) {
        self.incoming.insert(namespace.to_string(), range);
    }

    pub fn end_receive(
        &self,
        namespace: &str,
    ) {
        self.incoming.remove(namespace);
    }

    fn is_receiving(
        &self,
        namespace: &str,
        range: &ChunkRange,
    ) -> bool {
        self.incoming
            .get(namespace)
            .is_some_and(|incoming| incoming.overlaps(range))
    }

    /// Applies cloned documents or transferred mods without version checks.
    pub fn apply_migrated(
        &self,
        writes: &[DocWrite],
    ) -> Result<()> {
        let _apply = self.apply_lock.lock();
        self.store.apply(writes, &[])
    }

    /// Deletes every stored document of `range`, owned or not. Used to
    /// clear a recipient's partial clone.
    pub fn discard_range(
        &self,
        namespace: &str,
        range: &ChunkRange,
    ) -> Result<usize> {
        let mut discarded = 0;
        loop {
            let batch = self
                .store
                .scan_range(namespace, range, None, self.config.cleanup_batch_size)?;
            if batch.is_empty() {
                break;
            }
            let keys: Vec<Vec<u8>> = batch.into_iter().map(|(k, _)| k).collect();
            let _apply = self.apply_lock.lock();
            discarded += self.store.delete_keys(&keys)?;
        }
        if discarded > 0 {
            debug!("discarded {} documents of {} {} on {}", discarded, namespace, range, self.name);
        }
        Ok(discarded)
    }

    // ----------------------------------------------------------------------
    // Orphans

    /// Deletes documents of `range` that `table` does not assign to this
    /// shard. Documents locked by a transaction are skipped.
    /// Returns `(deleted, skipped)`.
    fn delete_unowned(
        &self,
        namespace: &str,
        table: &CachedRoutingTable,
        range: &ChunkRange,
    ) -> Result<(usize, usize)> {
        let pattern = &table.collection().key_pattern;
        let mut after: Option<Vec<u8>> = None;
        let (mut deleted, mut skipped) = (0, 0);
        loop {
            let batch = self.store.scan_range(
                namespace,
                range,
                after.as_deref(),
                self.config.cleanup_batch_size,
            )?;
            let Some((last, _)) = batch.last() else {
                break;
            };
            after = Some(last.clone());

            let mut doomed = Vec::new();
            for (storage_key, doc) in &batch {
                let owned = pattern
                    .extract(doc)
                    .map(|key| table.owns(&self.name, &key))
                    .unwrap_or(false);
                if owned {
                    continue;
                }
                if self.participant.is_locked(namespace, storage_key) {
                    skipped += 1;
                    continue;
                }
                doomed.push(storage_key.clone());
            }
            let _apply = self.apply_lock.lock();
            deleted += self.store.delete_keys(&doomed)?;
        }
        ORPHANS_DELETED.inc_by(deleted as u64);
        Ok((deleted, skipped))
    }

    /// `cleanupOrphaned`: deletes the first orphaned range ending after
    /// `start` and reports where to resume.
    #[instrument(skip(self), fields(shard = %self.name))]
    pub async fn cleanup_orphaned(
        &self,
        namespace: &str,
        start: Option<KeyBound>,
    ) -> Result<CleanupResult> {
        let done = CleanupResult {
            stopped_at: None,
            deleted: 0,
        };
        // deletions are judged against the catalog, never a stale cache
        let routing = self.refresh_routing(namespace).await?;
        let Some(table) = routing.table() else {
            return Ok(done);
        };
        let start = start.unwrap_or(KeyBound::Min);
        let Some(orphaned) = table
            .unowned_ranges(&self.name)
            .into_iter()
            .find(|r| r.max > start)
        else {
            return Ok(done);
        };
        let range = ChunkRange::new(orphaned.min.max(start), orphaned.max);
        let stopped_at = (range.max != KeyBound::Max).then(|| range.max.clone());

        if self.is_receiving(namespace, &range) {
            debug!("skipping {} {}: migration incoming", namespace, range);
            return Ok(CleanupResult {
                stopped_at,
                deleted: 0,
            });
        }
        let (deleted, skipped) = self.delete_unowned(namespace, table, &range)?;
        info!(
            "cleanup of {} {} on {}: {} deleted, {} locked",
            namespace, range, self.name, deleted, skipped
        );
        Ok(CleanupResult { stopped_at, deleted })
    }

    // ----------------------------------------------------------------------
    // Range deletion queue

    pub fn schedule_range_deletion(
        &self,
        task: &RangeDeletionTask,
    ) -> Result<()> {
        self.deletions.enqueue(task)
    }

    /// Runs the deletion now; if locked documents remain the task is queued.
    pub async fn delete_range_now(
        &self,
        namespace: &str,
        collection_epoch: uuid::Uuid,
        range: ChunkRange,
    ) -> Result<usize> {
        let task = RangeDeletionTask::new(namespace, collection_epoch, range, CleanWhen::Now);
        let (deleted, finished) = self.run_range_deletion(&task).await?;
        if !finished {
            self.deletions.enqueue(&task)?;
        }
        Ok(deleted)
    }

    /// Processes every eligible queued task once. Returns documents deleted.
    pub async fn run_pending_range_deletions(&self) -> Result<usize> {
        let now = get_now_as_u128();
        let mut total = 0;
        for task in self.deletions.tasks()? {
            if !task.is_eligible(now, self.config.orphan_cleanup_delay_ms) {
                continue;
            }
            let (deleted, finished) = self.run_range_deletion(&task).await?;
            if finished {
                self.deletions.complete(&task.id)?;
            }
            total += deleted;
        }
        Ok(total)
    }

    /// Returns `(deleted, finished)`.
    async fn run_range_deletion(
        &self,
        task: &RangeDeletionTask,
    ) -> Result<(usize, bool)> {
        let routing = self.refresh_routing(&task.namespace).await?;
        let table = match routing.table() {
            Some(table) if table.collection().epoch == task.collection_epoch => table,
            _ => {
                info!(
                    "dropping range deletion {} of {}: collection epoch changed",
                    task.id, task.namespace
                );
                return Ok((0, true));
            }
        };
        if self.is_receiving(&task.namespace, &task.range) {
            return Ok((0, false));
        }
        let (deleted, skipped) = self.delete_unowned(&task.namespace, table, &task.range)?;
        Ok((deleted, skipped == 0))
    }

    /// Background loop draining the range deletion queue until `shutdown`.
    pub fn spawn_range_deleter(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        handles: Option<&mut Vec<JoinHandle<()>>>,
    ) {
        let shard = self.clone();
        let period = millis(self.config.range_deleter_interval_ms);
        spawn_task(
            &format!("range-deleter-{}", self.name),
            move || async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = ticker.tick() => {
                            match shard.run_pending_range_deletions().await {
                                Ok(0) => {}
                                Ok(n) => debug!("range deleter on {} removed {} documents", shard.name, n),
                                Err(e) => warn!("range deleter on {} failed: {:?}", shard.name, e),
                            }
                        }
                    }
                }
            },
            handles,
        );
    }
}
