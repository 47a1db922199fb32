//! Chunk migration state machine.
//!
//! `Planned -> CloneRunning -> CriticalSection -> Committing -> Committed | Aborted`
//!
//! The donor keeps serving the range while the recipient clones it; writes
//! made meanwhile are captured by the donor's [`MigrationSource`] and
//! replayed on the recipient. The critical section covers only the final
//! transfer and the catalog commit. Before committing, the donor durably
//! bumps `minOpTimeUpdaters` so a crash between commit and cache update is
//! resolved from the catalog on restart.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::shard::CleanWhen;
use crate::shard::CriticalSectionGuard;
use crate::shard::DocWrite;
use crate::shard::MigrationSource;
use crate::shard::RangeDeletionTask;
use crate::shard::ShardServer;
use crate::CatalogError;
use crate::ChunkRange;
use crate::ChunkVersion;
use crate::Error;
use crate::MigrationConfig;
use crate::MigrationError;
use crate::Result;
use crate::ShardKey;
use crate::ShardKeyPattern;
use crate::MIGRATIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Planned,
    CloneRunning,
    CriticalSection,
    Committing,
    Committed,
    Aborted,
}

impl fmt::Display for MigrationState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            MigrationState::Planned => "planned",
            MigrationState::CloneRunning => "clone-running",
            MigrationState::CriticalSection => "critical-section",
            MigrationState::Committing => "committing",
            MigrationState::Committed => "committed",
            MigrationState::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub namespace: String,
    pub range: ChunkRange,
    pub from_shard: String,
    pub to_shard: String,
    /// Collection version after the commit
    pub version: ChunkVersion,
    pub cloned: usize,
    /// Donor documents deleted synchronously (`waitForDelete`)
    pub orphans_deleted: usize,
}

/// What the coordinator learned while planning.
struct Plan {
    range: ChunkRange,
    observed: ChunkVersion,
    epoch: uuid::Uuid,
    pattern: ShardKeyPattern,
}

/// Unregisters the donor's source and the recipient's incoming range on
/// every exit path.
struct MigrationScope<'a> {
    donor: &'a ShardServer,
    recipient: &'a ShardServer,
    namespace: &'a str,
}

impl Drop for MigrationScope<'_> {
    fn drop(&mut self) {
        self.donor.unregister_migration(self.namespace);
        self.recipient.end_receive(self.namespace);
    }
}

pub struct MigrationCoordinator {
    donor: Arc<ShardServer>,
    recipient: Arc<ShardServer>,
    config: MigrationConfig,
    state: MigrationState,
}

impl MigrationCoordinator {
    pub fn new(
        donor: Arc<ShardServer>,
        recipient: Arc<ShardServer>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            donor,
            recipient,
            config,
            state: MigrationState::Planned,
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    fn transition(
        &mut self,
        namespace: &str,
        next: MigrationState,
    ) {
        debug!("migration of {}: {} -> {}", namespace, self.state, next);
        self.state = next;
    }

    /// Moves the chunk containing `key` from the donor to the recipient.
    #[instrument(skip(self), fields(from = %self.donor.name(), to = %self.recipient.name()))]
    pub async fn run(
        &mut self,
        namespace: &str,
        key: &ShardKey,
        wait_for_delete: bool,
    ) -> Result<MigrationOutcome> {
        let plan = self.plan(namespace, key).await?;
        let donor = self.donor.clone();
        let recipient = self.recipient.clone();

        let source = Arc::new(MigrationSource::new(
            namespace,
            plan.range.clone(),
            recipient.name(),
        ));
        donor.register_migration(source.clone())?;
        recipient.begin_receive(namespace, plan.range.clone());
        let _scope = MigrationScope {
            donor: &donor,
            recipient: &recipient,
            namespace,
        };
        info!(
            "migrating {} {} from {} to {} at {}",
            namespace,
            plan.range,
            donor.name(),
            recipient.name(),
            plan.observed
        );

        let cloned = match self.clone_range(namespace, &plan, &source).await {
            Ok(n) => n,
            Err(e) => return Err(self.abort(namespace, &plan, e)),
        };

        let guard = match self.enter_critical_section(namespace, &plan, &source).await {
            Ok(guard) => guard,
            Err(e) => return Err(self.abort(namespace, &plan, e)),
        };

        let version = self.commit(namespace, &plan, guard).await?;

        let orphans_deleted = if wait_for_delete {
            donor
                .delete_range_now(namespace, plan.epoch, plan.range.clone())
                .await?
        } else {
            let task = RangeDeletionTask::new(namespace, plan.epoch, plan.range.clone(), CleanWhen::Delayed);
            donor.schedule_range_deletion(&task)?;
            0
        };

        Ok(MigrationOutcome {
            namespace: namespace.to_string(),
            range: plan.range,
            from_shard: donor.name().to_string(),
            to_shard: recipient.name().to_string(),
            version,
            cloned,
            orphans_deleted,
        })
    }

    /// Planned: the donor must own the whole chunk at the version it
    /// observes, and the recipient must be a live shard.
    async fn plan(
        &mut self,
        namespace: &str,
        key: &ShardKey,
    ) -> Result<Plan> {
        self.transition(namespace, MigrationState::Planned);
        let routing = self.donor.refresh_routing(namespace).await?;
        let Some(table) = routing.table() else {
            return Err(CatalogError::NotFound {
                kind: "sharded collection",
                name: namespace.to_string(),
            }
            .into());
        };
        let chunk = table.find_intersecting_chunk(key);
        if chunk.shard != self.donor.name() {
            return Err(MigrationError::RangeNotOwned {
                namespace: namespace.to_string(),
                shard: self.donor.name().to_string(),
            }
            .into());
        }
        if self.recipient.name() == self.donor.name() {
            return Err(MigrationError::Aborted {
                namespace: namespace.to_string(),
                reason: format!("{} already owns {}", self.donor.name(), chunk.range),
            }
            .into());
        }
        match self.donor.catalog().get_shard(self.recipient.name()) {
            Ok(shard) if !shard.draining => {}
            _ => return Err(MigrationError::RecipientUnavailable(self.recipient.name().to_string()).into()),
        }

        Ok(Plan {
            range: chunk.range.clone(),
            observed: chunk.version,
            epoch: table.collection().epoch,
            pattern: table.collection().key_pattern.clone(),
        })
    }

    /// CloneRunning: copies the range in batches, replaying captured writes
    /// after each batch so the final tail stays short.
    async fn clone_range(
        &mut self,
        namespace: &str,
        plan: &Plan,
        source: &MigrationSource,
    ) -> Result<usize> {
        self.transition(namespace, MigrationState::CloneRunning);
        // leftovers of an earlier aborted attempt
        self.recipient.discard_range(namespace, &plan.range)?;

        let mut after: Option<Vec<u8>> = None;
        let mut cloned = 0;
        loop {
            if source.cancel_token().is_cancelled() {
                return Err(MigrationError::Cancelled {
                    namespace: namespace.to_string(),
                }
                .into());
            }
            let batch = self.donor.clone_batch(
                namespace,
                &plan.range,
                after.as_deref(),
                self.config.clone_batch_size,
            )?;
            let Some((last, _)) = batch.last() else {
                break;
            };
            after = Some(last.clone());

            let mut writes = Vec::with_capacity(batch.len());
            for (_, doc) in batch {
                let key = plan.pattern.extract(&doc)?;
                writes.push(DocWrite::upsert(namespace, key, doc));
            }
            self.recipient.apply_migrated(&writes)?;
            cloned += writes.len();

            let mods = source.drain();
            self.recipient.apply_migrated(&mods)?;
            tokio::task::yield_now().await;
        }
        debug!("cloned {} documents of {} {}", cloned, namespace, plan.range);
        Ok(cloned)
    }

    /// CriticalSection: blocks writes to the range, waits for transactions
    /// holding locks inside it, transfers the tail and records the pending
    /// commit in the recovery document.
    async fn enter_critical_section(
        &mut self,
        namespace: &str,
        plan: &Plan,
        source: &MigrationSource,
    ) -> Result<CriticalSectionGuard> {
        if source.cancel_token().is_cancelled() {
            return Err(MigrationError::Cancelled {
                namespace: namespace.to_string(),
            }
            .into());
        }
        self.transition(namespace, MigrationState::CriticalSection);
        let sections = self.donor.sections();
        let guard = sections.enter(namespace, plan.range.clone()).await;

        let unlocked = self
            .donor
            .participant()
            .wait_for_range_unlocked(namespace, &plan.range, sections.timeout())
            .await;
        if !unlocked {
            return Err(MigrationError::Aborted {
                namespace: namespace.to_string(),
                reason: "transactions still hold documents in the range".to_string(),
            }
            .into());
        }

        let tail = source.drain();
        debug!("transferring {} captured writes", tail.len());
        self.recipient.apply_migrated(&tail)?;
        self.recipient.store().flush()?;

        self.donor
            .recovery()
            .increment_updaters(self.donor.catalog().as_ref())?;
        Ok(guard)
    }

    /// Committing: the outcome is resolved from here on, never cancelled.
    async fn commit(
        &mut self,
        namespace: &str,
        plan: &Plan,
        guard: CriticalSectionGuard,
    ) -> Result<ChunkVersion> {
        self.transition(namespace, MigrationState::Committing);
        let catalog = self.donor.catalog().clone();
        let committed = catalog.commit_chunk_migration(
            namespace,
            &plan.range,
            self.donor.name(),
            self.recipient.name(),
            &plan.observed,
        );

        match committed {
            Ok(version) => {
                self.finish_commit(namespace, guard).await?;
                info!("migration of {} {} committed at {}", namespace, plan.range, version);
                Ok(version)
            }
            Err(e @ Error::Catalog(CatalogError::VersionMismatch { .. })) => {
                self.donor
                    .recovery()
                    .decrement_updaters(catalog.as_ref(), None)?;
                drop(guard);
                Err(self.abort(namespace, plan, e))
            }
            Err(e) => self.resolve_unknown_commit(namespace, plan, guard, e).await,
        }
    }

    async fn finish_commit(
        &mut self,
        namespace: &str,
        guard: CriticalSectionGuard,
    ) -> Result<()> {
        let catalog = self.donor.catalog().clone();
        let position = catalog.current_log_position()?;
        self.donor.refresh_routing(namespace).await?;
        self.donor
            .recovery()
            .decrement_updaters(catalog.as_ref(), Some(position))?;
        drop(guard);
        self.recipient.refresh_routing(namespace).await?;
        self.transition(namespace, MigrationState::Committed);
        MIGRATIONS.with_label_values(&["committed"]).inc();
        Ok(())
    }

    /// The commit call failed without saying whether it applied; the catalog
    /// decides. If even that is unreachable the recovery document stays
    /// marked and the next start of the donor resolves it.
    async fn resolve_unknown_commit(
        &mut self,
        namespace: &str,
        plan: &Plan,
        guard: CriticalSectionGuard,
        error: Error,
    ) -> Result<ChunkVersion> {
        warn!("commit of {} {} returned {:?}; consulting the catalog", namespace, plan.range, error);
        let routing = match self.donor.refresh_routing(namespace).await {
            Ok(routing) => routing,
            Err(e) => {
                MIGRATIONS.with_label_values(&["unknown"]).inc();
                warn!("catalog unreachable, leaving recovery marker set: {:?}", e);
                return Err(error);
            }
        };
        let moved = routing.table().and_then(|t| {
            t.chunks()
                .iter()
                .find(|c| c.range == plan.range && c.shard == self.recipient.name())
                .map(|_| t.version())
        });
        match moved {
            Some(version) => {
                self.finish_commit(namespace, guard).await?;
                Ok(version)
            }
            None => {
                self.donor
                    .recovery()
                    .decrement_updaters(self.donor.catalog().as_ref(), None)?;
                drop(guard);
                Err(self.abort(namespace, plan, error))
            }
        }
    }

    /// Aborted: ownership is unchanged; the recipient's partial copy is
    /// discarded. Returns the error to surface.
    fn abort(
        &mut self,
        namespace: &str,
        plan: &Plan,
        cause: Error,
    ) -> Error {
        self.transition(namespace, MigrationState::Aborted);
        let outcome = match cause {
            Error::Migration(MigrationError::Cancelled { .. }) => "cancelled",
            _ => "aborted",
        };
        MIGRATIONS.with_label_values(&[outcome]).inc();
        warn!("migration of {} {} aborted: {}", namespace, plan.range, cause);

        if let Err(e) = self.recipient.discard_range(namespace, &plan.range) {
            warn!("could not discard partial clone on {}: {:?}", self.recipient.name(), e);
        }
        match cause {
            Error::Migration(_) => cause,
            other => MigrationError::Aborted {
                namespace: namespace.to_string(),
                reason: other.to_string(),
            }
            .into(),
        }
    }
}
