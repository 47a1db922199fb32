//! `splitShard`: hands half of a shard's chunks and databases to a new shard.
//!
//! The new shard typically starts as a full copy of the old one, so after
//! the catalog commit both hold data they no longer own. The options decide
//! whether that data is cleaned up here.

use std::collections::BTreeSet;

use tracing::debug;
use tracing::info;
use tracing::instrument;

use super::Cluster;
use crate::db_name;
use crate::CatalogError;
use crate::ChunkEntry;
use crate::CleanWhen;
use crate::RangeDeletionTask;
use crate::Result;
use crate::ShardServer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitShardOptions {
    /// Queue range deletions for chunks each shard no longer owns
    pub remove_orphans: bool,
    /// Drop unsharded collections from the shard that is not their
    /// database's primary
    pub drop_orphaned_collections: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitShardOutcome {
    pub chunks_moved: usize,
    pub databases_moved: Vec<String>,
    pub range_deletions: usize,
    pub dropped_collections: Vec<String>,
}

fn queue_deletions(
    shard: &ShardServer,
    chunks: &[ChunkEntry],
) -> Result<usize> {
    for chunk in chunks {
        let task = RangeDeletionTask::new(
            &chunk.namespace,
            chunk.version.epoch,
            chunk.range.clone(),
            CleanWhen::Now,
        );
        shard.schedule_range_deletion(&task)?;
    }
    Ok(chunks.len())
}

impl Cluster {
    #[instrument(skip(self))]
    pub async fn split_shard(
        &self,
        from: &str,
        new_shard: &str,
        options: SplitShardOptions,
    ) -> Result<SplitShardOutcome> {
        if from == new_shard {
            return Err(CatalogError::InvalidShardSplit {
                from: from.to_string(),
                to: new_shard.to_string(),
            }
            .into());
        }
        self.catalog.get_shard(new_shard)?;
        let source = self.shard(from)?;
        let target = self.shard(new_shard)?;

        let owned = self.catalog.get_chunks_for_shard(from)?;
        let (kept, moving) = owned.split_at(owned.len() / 2);
        let chunks_moved = self.catalog.commit_chunks_reassignment(moving, new_shard)?;

        let dbs = self.catalog.get_databases_for_shard(from)?;
        let mut databases_moved = Vec::new();
        for db in &dbs[dbs.len() / 2..] {
            self.catalog.commit_move_primary(&db.name, new_shard)?;
            databases_moved.push(db.name.clone());
        }

        let namespaces: BTreeSet<&str> = owned.iter().map(|c| c.namespace.as_str()).collect();
        for namespace in &namespaces {
            source.refresh_routing(namespace).await?;
            target.refresh_routing(namespace).await?;
        }
        let affected: BTreeSet<&str> = dbs
            .iter()
            .map(|d| d.name.as_str())
            .chain(namespaces.iter().map(|ns| db_name(ns)))
            .collect();
        for db in &affected {
            source.flush_database_cache(db).await?;
            target.flush_database_cache(db).await?;
        }

        let mut range_deletions = 0;
        if options.remove_orphans {
            range_deletions += queue_deletions(&source, moving)?;
            range_deletions += queue_deletions(&target, kept)?;
        }

        let mut dropped_collections = Vec::new();
        if options.drop_orphaned_collections {
            for db in &dbs {
                let non_primary = if databases_moved.contains(&db.name) {
                    &source
                } else {
                    &target
                };
                let sharded: BTreeSet<String> = self
                    .catalog
                    .get_collections(&db.name)?
                    .into_iter()
                    .map(|c| c.namespace)
                    .collect();
                for namespace in non_primary.store().namespaces()? {
                    if db_name(&namespace) != db.name || sharded.contains(&namespace) {
                        continue;
                    }
                    let n = non_primary.drop_collection_data(&namespace).await?;
                    debug!("dropped {} orphaned documents of {} on {}", n, namespace, non_primary.name());
                    dropped_collections.push(namespace);
                }
            }
        }

        info!(
            "split {} into {}: {} chunks and {} databases moved",
            from,
            new_shard,
            chunks_moved,
            databases_moved.len()
        );
        Ok(SplitShardOutcome {
            chunks_moved,
            databases_moved,
            range_deletions,
            dropped_collections,
        })
    }
}
