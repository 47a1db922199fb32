use std::cmp::Ordering;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Chunk ownership generation: `(major, minor)` within an epoch.
///
/// Versions of different epochs are not comparable; any epoch change
/// invalidates everything cached under the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u64,
    pub minor: u64,
    pub epoch: Uuid,
}

impl ChunkVersion {
    pub fn new(
        major: u64,
        minor: u64,
        epoch: Uuid,
    ) -> Self {
        Self { major, minor, epoch }
    }

    /// Version of the single chunk created by shard-collection.
    pub fn initial(epoch: Uuid) -> Self {
        Self::new(1, 0, epoch)
    }

    pub fn is_same_epoch(
        &self,
        other: &ChunkVersion,
    ) -> bool {
        self.epoch == other.epoch
    }

    /// `None` across epochs.
    pub fn partial_cmp_within_epoch(
        &self,
        other: &ChunkVersion,
    ) -> Option<Ordering> {
        self.is_same_epoch(other)
            .then(|| (self.major, self.minor).cmp(&(other.major, other.minor)))
    }

    pub fn is_older_than(
        &self,
        other: &ChunkVersion,
    ) -> bool {
        self.partial_cmp_within_epoch(other) == Some(Ordering::Less)
    }

    pub fn next_major(&self) -> Self {
        Self::new(self.major + 1, 0, self.epoch)
    }

    pub fn next_minor(&self) -> Self {
        Self::new(self.major, self.minor + 1, self.epoch)
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

/// Database metadata generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseVersion {
    pub epoch: Uuid,
    pub counter: u64,
}

impl DatabaseVersion {
    pub fn fresh() -> Self {
        Self {
            epoch: Uuid::new_v4(),
            counter: 1,
        }
    }

    pub fn bumped(&self) -> Self {
        Self {
            epoch: self.epoch,
            counter: self.counter + 1,
        }
    }

    pub fn is_older_than(
        &self,
        other: &DatabaseVersion,
    ) -> bool {
        self.epoch == other.epoch && self.counter < other.counter
    }
}

impl fmt::Display for DatabaseVersion {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}|{}", self.counter, self.epoch)
    }
}

/// Position in the catalog's durable write log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    pub ts: u64,
    pub term: u64,
}

impl LogPosition {
    pub const ZERO: LogPosition = LogPosition { ts: 0, term: 0 };

    pub fn new(
        ts: u64,
        term: u64,
    ) -> Self {
        Self { ts, term }
    }
}
