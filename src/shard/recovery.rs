//! Migration crash-recovery marker.
//!
//! A singleton document in `admin.system.version` under `minOpTimeRecovery`.
//! The donor increments `min_op_time_updaters` durably before committing a
//! migration and decrements it once the commit outcome is known; a non-zero
//! count at startup means a commit may have happened that this shard never
//! observed.

use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::constants::ADMIN_VERSION_TREE;
use crate::constants::MIN_OP_TIME_RECOVERY_KEY;
use crate::CatalogStore;
use crate::LogPosition;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecoveryRecord {
    pub config_connection_string: String,
    pub shard_name: String,
    pub min_op_time: LogPosition,
    pub min_op_time_updaters: u32,
}

#[derive(Debug)]
pub struct RecoveryStore {
    tree: sled::Tree,
    shard_name: String,
    /// Serializes read-modify-write of the singleton
    lock: Mutex<()>,
}

impl RecoveryStore {
    pub fn open(
        db: &sled::Db,
        shard_name: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(ADMIN_VERSION_TREE)?,
            shard_name: shard_name.into(),
            lock: Mutex::new(()),
        })
    }

    pub fn load(&self) -> Result<Option<MigrationRecoveryRecord>> {
        match self.tree.get(MIN_OP_TIME_RECOVERY_KEY)? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    fn store(
        &self,
        record: &MigrationRecoveryRecord,
    ) -> Result<()> {
        self.tree
            .insert(MIN_OP_TIME_RECOVERY_KEY, bincode::serialize(record)?)?;
        // must be durable before the caller proceeds
        self.tree.flush()?;
        Ok(())
    }

    fn update<F>(
        &self,
        catalog: &dyn CatalogStore,
        f: F,
    ) -> Result<MigrationRecoveryRecord>
    where
        F: FnOnce(&mut MigrationRecoveryRecord),
    {
        let _guard = self.lock.lock();
        let mut record = match self.load()? {
            Some(r) => r,
            None => MigrationRecoveryRecord {
                config_connection_string: catalog.connection_string(),
                shard_name: self.shard_name.clone(),
                min_op_time: LogPosition::ZERO,
                min_op_time_updaters: 0,
            },
        };
        f(&mut record);
        self.store(&record)?;
        Ok(record)
    }

    /// Called before a migration commit is attempted.
    pub fn increment_updaters(
        &self,
        catalog: &dyn CatalogStore,
    ) -> Result<MigrationRecoveryRecord> {
        let position = catalog.current_log_position()?;
        self.update(catalog, |r| {
            r.min_op_time_updaters += 1;
            r.min_op_time = r.min_op_time.max(position);
        })
    }

    /// Called once the commit outcome is known. `committed_at` is `None`
    /// for an aborted commit, which leaves `min_op_time` unchanged.
    pub fn decrement_updaters(
        &self,
        catalog: &dyn CatalogStore,
        committed_at: Option<LogPosition>,
    ) -> Result<MigrationRecoveryRecord> {
        self.update(catalog, |r| {
            r.min_op_time_updaters = r.min_op_time_updaters.saturating_sub(1);
            if let Some(position) = committed_at {
                r.min_op_time = r.min_op_time.max(position);
            }
        })
    }

    /// Startup resolution of interrupted migrations. Returns whether
    /// recovery ran.
    ///
    /// The catalog is the authority: the marker only says that some commit
    /// may have completed, so the shard advances `min_op_time` to the
    /// catalog's current position and clears the updater count. The caller
    /// then refreshes its routing from the catalog.
    pub fn recover_on_startup(
        &self,
        catalog: &dyn CatalogStore,
    ) -> Result<bool> {
        let Some(record) = self.load()? else {
            return Ok(false);
        };
        if record.min_op_time_updaters == 0 {
            return Ok(false);
        }
        warn!(
            "shard {} restarted with {} unresolved migration commit(s); recovering from {}",
            self.shard_name,
            record.min_op_time_updaters,
            catalog.connection_string()
        );

        let position = catalog.current_log_position()?;
        let recovered = self.update(catalog, |r| {
            r.min_op_time = r.min_op_time.max(position);
            r.min_op_time_updaters = 0;
        })?;
        info!(
            "recovery complete for {}: minOpTime {:?}",
            self.shard_name, recovered.min_op_time
        );
        Ok(true)
    }
}
