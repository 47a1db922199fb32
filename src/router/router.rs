//! Query router.
//!
//! The router holds nothing but its routing cache. Every operation is
//! targeted from the cached snapshot; when a shard answers with a staleness
//! signal the router refreshes the affected namespace or database and runs
//! the whole logical operation again, up to `stale_config.max_retries` times.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::try_join_all;
use nanoid::nanoid;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::RouterTransaction;
use super::ShardRegistry;
use crate::async_task::backoff_delay;
use crate::cache::CachedRoutingTable;
use crate::cache::CatalogCache;
use crate::cache::CollectionRouting;
use crate::db_name;
use crate::BackoffPolicy;
use crate::CatalogStore;
use crate::ChunkRange;
use crate::DatabaseEntry;
use crate::Document;
use crate::DocumentUpdate;
use crate::Error;
use crate::Filter;
use crate::Result;
use crate::RetryPolicies;
use crate::RoutingError;
use crate::RoutingVersion;
use crate::ShardKey;
use crate::ShardKeyPattern;
use crate::ShardRequest;
use crate::ShardServer;
use crate::TransactionError;
use crate::WriteResult;
use crate::RELOCATED_DOCUMENTS;
use crate::STALE_CONFIG_RETRIES;

/// Per-operation options: the enclosing transaction and the idempotency
/// token of a retryable write.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    pub(crate) txn_id: Option<String>,
    pub retry_token: Option<String>,
}

impl OperationContext {
    pub fn retryable(token: impl Into<String>) -> Self {
        Self {
            txn_id: None,
            retry_token: Some(token.into()),
        }
    }

    pub(crate) fn in_txn(txn_id: impl Into<String>) -> Self {
        Self {
            txn_id: Some(txn_id.into()),
            retry_token: None,
        }
    }

    pub fn txn_id(&self) -> Option<&str> {
        self.txn_id.as_deref()
    }
}

/// Where the router believes a namespace lives.
enum Placement {
    Sharded(Arc<CachedRoutingTable>),
    /// No collection entry: everything is on the database primary
    Unsharded(DatabaseEntry),
}

impl Placement {
    fn version(&self) -> RoutingVersion {
        match self {
            Placement::Sharded(table) => RoutingVersion::Sharded(table.version()),
            Placement::Unsharded(db) => RoutingVersion::Unsharded(db.version),
        }
    }
}

struct Target {
    shard: Arc<ShardServer>,
    req: ShardRequest,
}

/// Equality filter pinning every field of `key`.
fn key_filter(
    pattern: &ShardKeyPattern,
    key: &ShardKey,
) -> Filter {
    pattern
        .fields()
        .iter()
        .zip(key.values())
        .fold(Filter::new(), |filter, (field, value)| {
            filter.eq(field.clone(), value.clone())
        })
}

pub struct Router {
    cache: CatalogCache,
    registry: ShardRegistry,
    stale_config: BackoffPolicy,
    /// Shards enlisted by each open transaction
    participants: DashMap<String, BTreeSet<String>>,
}

impl std::fmt::Debug for Router {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("cache", &self.cache)
            .field("shards", &self.registry.len())
            .finish()
    }
}

impl Router {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        registry: ShardRegistry,
        policies: &RetryPolicies,
    ) -> Self {
        Self {
            cache: CatalogCache::new(catalog, policies.catalog_refresh),
            registry,
            stale_config: policies.stale_config,
            participants: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &CatalogCache {
        &self.cache
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    /// `flushRouterCache`: every namespace and database reloads on next use.
    pub fn flush_router_cache(&self) {
        self.cache.invalidate_all();
        info!("router cache flushed");
    }

    pub fn start_transaction(self: &Arc<Self>) -> RouterTransaction {
        RouterTransaction::new(self.clone(), nanoid!())
    }

    // ----------------------------------------------------------------------
    // Targeting

    async fn placement(
        &self,
        namespace: &str,
        create_db: bool,
    ) -> Result<Placement> {
        match self.cache.get_collection_routing(namespace).await? {
            CollectionRouting::Sharded(table) => Ok(Placement::Sharded(table)),
            CollectionRouting::Unsharded => {
                let db = db_name(namespace);
                let entry = if create_db {
                    self.cache.get_or_create_database(db).await?
                } else {
                    self.cache.get_database(db).await?
                };
                Ok(Placement::Unsharded(entry))
            }
        }
    }

    fn target(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        placement: &Placement,
        shard: &str,
    ) -> Result<Target> {
        let shard = self.registry.get(shard)?;
        let req = ShardRequest::new(namespace, placement.version())
            .in_txn(ctx.txn_id.clone())
            .with_retry_token(ctx.retry_token.clone());
        Ok(Target { shard, req })
    }

    /// Owner of `key`, or the database primary when unsharded.
    fn target_key(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        placement: &Placement,
        key: &ShardKey,
    ) -> Result<Target> {
        let owner = match placement {
            Placement::Sharded(table) => table.owner_of(key).to_string(),
            Placement::Unsharded(db) => db.primary_shard.clone(),
        };
        self.target(ctx, namespace, placement, &owner)
    }

    /// Single-document writes on a sharded namespace need the full key.
    fn target_filter(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        placement: &Placement,
        filter: &Filter,
    ) -> Result<Target> {
        let key = match placement {
            Placement::Sharded(table) => table
                .collection()
                .key_pattern
                .extract_from_filter(filter)
                .ok_or_else(|| RoutingError::ShardKeyNotFound {
                    namespace: namespace.to_string(),
                })?,
            Placement::Unsharded(_) => ShardKey(Vec::new()),
        };
        self.target_key(ctx, namespace, placement, &key)
    }

    fn targets_for_range(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        placement: &Placement,
        range: &ChunkRange,
    ) -> Result<Vec<Target>> {
        let shards: Vec<String> = match placement {
            Placement::Sharded(table) => table.shards_for_range(range).into_iter().collect(),
            Placement::Unsharded(db) => vec![db.primary_shard.clone()],
        };
        shards
            .iter()
            .map(|s| self.target(ctx, namespace, placement, s))
            .collect()
    }

    /// Turns a staleness signal into a refresh and lets the caller retry;
    /// anything else, or one signal too many, is returned.
    async fn on_stale(
        &self,
        namespace: &str,
        error: Error,
        attempt: &mut usize,
    ) -> Result<()> {
        if !error.is_stale_config() {
            return Err(error);
        }
        if *attempt >= self.stale_config.max_retries {
            warn!("{} still stale after {} retries: {}", namespace, attempt, error);
            return Err(RoutingError::RetriesExhausted {
                namespace: namespace.to_string(),
                attempts: *attempt,
            }
            .into());
        }
        match &error {
            Error::Routing(RoutingError::StaleShardVersion { wanted, .. }) => {
                STALE_CONFIG_RETRIES.with_label_values(&["shard_version"]).inc();
                self.cache.on_stale_shard_version(namespace, *wanted).await?;
            }
            Error::Routing(RoutingError::StaleDbVersion { db, .. }) => {
                STALE_CONFIG_RETRIES.with_label_values(&["db_version"]).inc();
                self.cache.refresh_database(db).await?;
                // the namespace may have become sharded meanwhile
                self.cache.refresh_collection(namespace).await?;
            }
            _ => {}
        }
        debug!("retrying operation on {} after {}", namespace, error);
        tokio::time::sleep(backoff_delay(&self.stale_config, *attempt)).await;
        *attempt += 1;
        Ok(())
    }

    fn enlist(
        &self,
        ctx: &OperationContext,
        shard: &ShardServer,
    ) {
        if let Some(txn_id) = &ctx.txn_id {
            self.participants
                .entry(txn_id.clone())
                .or_default()
                .insert(shard.name().to_string());
        }
    }

    // ----------------------------------------------------------------------
    // Operations

    #[instrument(skip(self, ctx, doc))]
    pub async fn insert(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        doc: Document,
    ) -> Result<WriteResult> {
        let mut attempt = 0;
        loop {
            let placement = self.placement(namespace, true).await?;
            let key = match &placement {
                Placement::Sharded(table) => table.collection().key_pattern.extract(&doc)?,
                Placement::Unsharded(_) => ShardKey(Vec::new()),
            };
            let target = self.target_key(ctx, namespace, &placement, &key)?;
            self.enlist(ctx, &target.shard);
            match target.shard.insert(&target.req, doc.clone()).await {
                Err(e) => self.on_stale(namespace, e, &mut attempt).await?,
                done => return done,
            }
        }
    }

    /// Targeted when the filter carries the shard key, scattered otherwise.
    pub async fn find(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        filter: &Filter,
    ) -> Result<Vec<Document>> {
        let mut attempt = 0;
        loop {
            let placement = match self.placement(namespace, false).await {
                Err(e) if e.is_not_found() => return Ok(Vec::new()),
                other => other?,
            };
            let key = match &placement {
                Placement::Sharded(table) => table.collection().key_pattern.extract_from_filter(filter),
                Placement::Unsharded(_) => None,
            };
            let targets = match key {
                Some(key) => vec![self.target_key(ctx, namespace, &placement, &key)?],
                None => self.targets_for_range(ctx, namespace, &placement, &ChunkRange::full())?,
            };
            match try_join_all(targets.iter().map(|t| t.shard.find(&t.req, filter))).await {
                Ok(parts) => return Ok(parts.into_iter().flatten().collect()),
                Err(e) => self.on_stale(namespace, e, &mut attempt).await?,
            }
        }
    }

    /// Documents in `range`, summed over every shard owning part of it.
    #[instrument(skip(self, ctx))]
    pub async fn count(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        range: &ChunkRange,
    ) -> Result<u64> {
        let mut attempt = 0;
        loop {
            let placement = match self.placement(namespace, false).await {
                Err(e) if e.is_not_found() => return Ok(0),
                other => other?,
            };
            let targets = self.targets_for_range(ctx, namespace, &placement, range)?;
            match try_join_all(targets.iter().map(|t| t.shard.count(&t.req, range))).await {
                Ok(parts) => return Ok(parts.into_iter().sum()),
                Err(e) => self.on_stale(namespace, e, &mut attempt).await?,
            }
        }
    }

    #[instrument(skip(self, ctx, update))]
    pub async fn update(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        filter: &Filter,
        update: &DocumentUpdate,
    ) -> Result<WriteResult> {
        let mut attempt = 0;
        loop {
            let placement = self.placement(namespace, false).await?;
            let target = self.target_filter(ctx, namespace, &placement, filter)?;
            self.enlist(ctx, &target.shard);
            let e = match target.shard.update(&target.req, filter, update).await {
                Err(Error::Routing(RoutingError::WouldChangeOwningShard {
                    pre_image, post_image, ..
                })) => match self
                    .relocate(ctx, namespace, &placement, &target, *pre_image, *post_image)
                    .await
                {
                    Err(e) if ctx.txn_id.is_none() => e,
                    relocated => return relocated.map(|(result, _)| result),
                },
                Err(e) => e,
                done => return done,
            };
            self.on_stale(namespace, e, &mut attempt).await?;
        }
    }

    /// Applies `update` to the document the filter targets and returns its
    /// post-image.
    #[instrument(skip(self, ctx, update))]
    pub async fn find_and_modify(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        filter: &Filter,
        update: &DocumentUpdate,
    ) -> Result<Option<Document>> {
        let mut attempt = 0;
        loop {
            let placement = self.placement(namespace, false).await?;
            let target = self.target_filter(ctx, namespace, &placement, filter)?;
            self.enlist(ctx, &target.shard);
            let e = match target.shard.find_and_modify(&target.req, filter, update).await {
                Err(Error::Routing(RoutingError::WouldChangeOwningShard {
                    pre_image, post_image, ..
                })) => match self
                    .relocate(ctx, namespace, &placement, &target, *pre_image, *post_image)
                    .await
                {
                    Err(e) if ctx.txn_id.is_none() => e,
                    relocated => return relocated.map(|(_, post)| post),
                },
                Err(e) => e,
                done => return done,
            };
            self.on_stale(namespace, e, &mut attempt).await?;
        }
    }

    #[instrument(skip(self, ctx))]
    pub async fn delete(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        filter: &Filter,
    ) -> Result<WriteResult> {
        let mut attempt = 0;
        loop {
            let placement = self.placement(namespace, false).await?;
            let target = self.target_filter(ctx, namespace, &placement, filter)?;
            self.enlist(ctx, &target.shard);
            match target.shard.delete(&target.req, filter).await {
                Err(e) => self.on_stale(namespace, e, &mut attempt).await?,
                done => return done,
            }
        }
    }

    // ----------------------------------------------------------------------
    // Cross-shard relocation

    /// Re-expresses a key-changing update as delete-at-source plus
    /// insert-at-destination.
    ///
    /// Inside a transaction both halves are staged in it. Otherwise they run
    /// in an internal two-shard transaction; a retry token is committed on
    /// both shards with the writes and checked on the destination first, so
    /// a duplicate delivery has no second effect.
    #[instrument(skip_all, fields(ns = %namespace, from = %source.shard.name()))]
    async fn relocate(
        &self,
        ctx: &OperationContext,
        namespace: &str,
        placement: &Placement,
        source: &Target,
        pre: Document,
        post: Document,
    ) -> Result<(WriteResult, Option<Document>)> {
        let Placement::Sharded(table) = placement else {
            return Err(Error::Fatal(format!(
                "{namespace} is unsharded but its update would change the owning shard"
            )));
        };
        let pattern = &table.collection().key_pattern;
        let pre_key = pattern.extract(&pre)?;
        let post_key = pattern.extract(&post)?;
        let result = WriteResult {
            matched: 1,
            modified: 1,
            relocated: true,
        };

        let (txn_id, internal) = match &ctx.txn_id {
            Some(id) => (id.clone(), false),
            None => (nanoid!(), true),
        };
        let txn_ctx = OperationContext::in_txn(txn_id.clone());
        let destination = self.target_key(&txn_ctx, namespace, placement, &post_key)?;
        debug!("relocating {} to {} in transaction {}", pre.id(), destination.shard.name(), txn_id);

        let token = ctx.retry_token.as_deref().filter(|_| internal);
        if let Some(token) = token {
            if let Some(prev) = destination.shard.store().executed(token)? {
                debug!("relocation already applied under token {}", token);
                return Ok((prev, Some(post)));
            }
        }

        let delete_req = ShardRequest::new(namespace, placement.version()).in_txn(Some(txn_id.clone()));
        let by_id = key_filter(pattern, &pre_key).with_id(pre.id());
        let staged = async {
            source.shard.delete(&delete_req, &by_id).await?;
            destination.shard.insert(&destination.req, post.clone()).await?;
            if let Some(token) = token {
                source.shard.record_retry_token(&txn_id, token, result)?;
                destination.shard.record_retry_token(&txn_id, token, result)?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if !internal {
            self.enlist(ctx, &source.shard);
            self.enlist(ctx, &destination.shard);
            staged?;
            RELOCATED_DOCUMENTS.inc();
            return Ok((result, Some(post)));
        }

        let shards = [source.shard.clone(), destination.shard.clone()];
        if let Err(e) = staged {
            for shard in &shards {
                shard.abort_transaction(&txn_id);
            }
            return Err(e);
        }
        self.commit_participants(&txn_id, &shards).await?;
        RELOCATED_DOCUMENTS.inc();
        Ok((result, Some(post)))
    }

    // ----------------------------------------------------------------------
    // Transactions

    /// Prepares every participant, then commits them. A participant that
    /// cannot prepare aborts the whole transaction.
    ///
    /// Once every participant is prepared the transaction is committed: a
    /// failing commit is retried, and if it still fails before anything was
    /// applied the transaction aborts. After a first participant has applied,
    /// the rest stay prepared and are re-enlisted so the commit can resume.
    async fn commit_participants(
        &self,
        txn_id: &str,
        shards: &[Arc<ShardServer>],
    ) -> Result<()> {
        for shard in shards {
            if let Err(e) = shard.prepare_transaction(txn_id) {
                for s in shards {
                    s.abort_transaction(txn_id);
                }
                return Err(TransactionError::Aborted {
                    txn_id: txn_id.to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
        }
        for (i, shard) in shards.iter().enumerate() {
            let Err(e) = self.commit_prepared(txn_id, shard).await else {
                continue;
            };
            if i == 0 {
                for s in shards {
                    s.abort_transaction(txn_id);
                }
                return Err(TransactionError::Aborted {
                    txn_id: txn_id.to_string(),
                    reason: e.to_string(),
                }
                .into());
            }
            let pending: Vec<String> = shards[i..].iter().map(|s| s.name().to_string()).collect();
            warn!("transaction {} left prepared on {:?}: {}", txn_id, pending, e);
            self.participants
                .insert(txn_id.to_string(), pending.iter().cloned().collect());
            return Err(TransactionError::CommitIncomplete {
                txn_id: txn_id.to_string(),
                pending,
                reason: e.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn commit_prepared(
        &self,
        txn_id: &str,
        shard: &ShardServer,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match shard.commit_transaction(txn_id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.stale_config.max_retries => {
                    debug!("commit of {} on {} failed, retrying: {}", txn_id, shard.name(), e);
                    tokio::time::sleep(backoff_delay(&self.stale_config, attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Commits an open transaction, or resumes one that stopped with
    /// `CommitIncomplete`.
    pub async fn commit_transaction(
        &self,
        txn_id: &str,
    ) -> Result<()> {
        let Some((_, names)) = self.participants.remove(txn_id) else {
            return Ok(());
        };
        let shards = names
            .iter()
            .map(|name| self.registry.get(name))
            .collect::<Result<Vec<_>>>()?;
        self.commit_participants(txn_id, &shards).await?;
        debug!("transaction {} committed on {:?}", txn_id, names);
        Ok(())
    }

    pub(crate) fn abort_transaction(
        &self,
        txn_id: &str,
    ) {
        let Some((_, names)) = self.participants.remove(txn_id) else {
            return;
        };
        for name in names {
            if let Ok(shard) = self.registry.get(&name) {
                shard.abort_transaction(txn_id);
            }
        }
        debug!("transaction {} aborted", txn_id);
    }
}
