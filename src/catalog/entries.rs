//! Persisted catalog rows.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use super::ChunkRange;
use super::ChunkVersion;
use super::DatabaseVersion;
use super::ShardKeyPattern;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub primary_shard: String,
    pub version: DatabaseVersion,
    pub partitioned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub namespace: String,
    pub key_pattern: ShardKeyPattern,
    pub epoch: Uuid,
    pub unique: bool,
    pub dropped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub namespace: String,
    pub range: ChunkRange,
    pub shard: String,
    pub version: ChunkVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub name: String,
    pub endpoint: String,
    pub draining: bool,
}

impl ShardEntry {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            draining: false,
        }
    }
}
