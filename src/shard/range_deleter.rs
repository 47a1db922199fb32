//! Durable queue of ranges whose documents a shard must delete.

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::constants::RANGE_DELETIONS_TREE;
use crate::time::get_now_as_u128;
use crate::ChunkRange;
use crate::Result;
use crate::PENDING_RANGE_DELETIONS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanWhen {
    Now,
    /// Eligible once the orphan cleanup delay has elapsed
    Delayed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    pub id: String,
    pub namespace: String,
    pub collection_epoch: Uuid,
    pub range: ChunkRange,
    pub when_to_clean: CleanWhen,
    pub created_at_ms: u128,
}

impl RangeDeletionTask {
    pub fn new(
        namespace: impl Into<String>,
        collection_epoch: Uuid,
        range: ChunkRange,
        when_to_clean: CleanWhen,
    ) -> Self {
        Self {
            id: nanoid::nanoid!(),
            namespace: namespace.into(),
            collection_epoch,
            range,
            when_to_clean,
            created_at_ms: get_now_as_u128(),
        }
    }

    pub fn is_eligible(
        &self,
        now_ms: u128,
        delay_ms: u64,
    ) -> bool {
        match self.when_to_clean {
            CleanWhen::Now => true,
            CleanWhen::Delayed => now_ms >= self.created_at_ms + delay_ms as u128,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RangeDeletionQueue {
    tree: sled::Tree,
}

impl RangeDeletionQueue {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let queue = Self {
            tree: db.open_tree(RANGE_DELETIONS_TREE)?,
        };
        PENDING_RANGE_DELETIONS.set(queue.tree.len() as i64);
        Ok(queue)
    }

    pub fn enqueue(
        &self,
        task: &RangeDeletionTask,
    ) -> Result<()> {
        self.tree.insert(task.id.as_bytes(), bincode::serialize(task)?)?;
        self.tree.flush()?;
        PENDING_RANGE_DELETIONS.inc();
        debug!(
            "queued range deletion {} for {} {} ({:?})",
            task.id, task.namespace, task.range, task.when_to_clean
        );
        Ok(())
    }

    pub fn complete(
        &self,
        id: &str,
    ) -> Result<()> {
        if self.tree.remove(id.as_bytes())?.is_some() {
            PENDING_RANGE_DELETIONS.dec();
        }
        self.tree.flush()?;
        Ok(())
    }

    pub fn tasks(&self) -> Result<Vec<RangeDeletionTask>> {
        let mut tasks = self
            .tree
            .iter()
            .values()
            .map(|v| Ok(bincode::deserialize::<RangeDeletionTask>(&v?)?))
            .collect::<Result<Vec<_>>>()?;
        tasks.sort_by_key(|t| t.created_at_ms);
        Ok(tasks)
    }

    pub fn tasks_for(
        &self,
        namespace: &str,
    ) -> Result<Vec<RangeDeletionTask>> {
        Ok(self
            .tasks()?
            .into_iter()
            .filter(|t| t.namespace == namespace)
            .collect())
    }
}
