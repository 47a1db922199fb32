use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::DocWrite;
use crate::ChunkRange;

/// Donor-side state of one active migration: the range being moved and the
/// writes to it captured since cloning started.
#[derive(Debug)]
pub struct MigrationSource {
    namespace: String,
    range: ChunkRange,
    recipient: String,
    mods: Mutex<Vec<DocWrite>>,
    cancel: CancellationToken,
}

impl MigrationSource {
    pub fn new(
        namespace: impl Into<String>,
        range: ChunkRange,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            range,
            recipient: recipient.into(),
            mods: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn range(&self) -> &ChunkRange {
        &self.range
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Captures the writes that touch the migrating range.
    pub fn record(
        &self,
        writes: &[DocWrite],
    ) {
        let mut mods = self.mods.lock();
        for w in writes {
            if w.namespace == self.namespace && self.range.contains(&w.shard_key) {
                mods.push(w.clone());
            }
        }
    }

    /// Takes the captured writes in the order they were applied.
    pub fn drain(&self) -> Vec<DocWrite> {
        std::mem::take(&mut *self.mods.lock())
    }
}
