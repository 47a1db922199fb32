use serde::Deserialize;
use serde::Serialize;

use crate::ChunkVersion;
use crate::DatabaseVersion;

/// Routing version a caller attaches to every shard request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingVersion {
    /// Collection version of a sharded namespace
    Sharded(ChunkVersion),
    /// Database version; the namespace lives on the database primary
    Unsharded(DatabaseVersion),
}

#[derive(Debug, Clone)]
pub struct ShardRequest {
    pub namespace: String,
    pub version: RoutingVersion,
    /// Multi-statement transaction this operation belongs to
    pub txn_id: Option<String>,
    /// Idempotency token of a retryable write
    pub retry_token: Option<String>,
}

impl ShardRequest {
    pub fn new(
        namespace: impl Into<String>,
        version: RoutingVersion,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            version,
            txn_id: None,
            retry_token: None,
        }
    }

    pub fn in_txn(
        mut self,
        txn_id: Option<String>,
    ) -> Self {
        self.txn_id = txn_id;
        self
    }

    pub fn with_retry_token(
        mut self,
        token: Option<String>,
    ) -> Self {
        self.retry_token = token;
        self
    }
}

/// Outcome of a write, stored with its retry token so a duplicate delivery
/// replays the first result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub matched: u64,
    pub modified: u64,
    /// The document moved to another shard
    pub relocated: bool,
}

impl WriteResult {
    pub fn one() -> Self {
        Self {
            matched: 1,
            modified: 1,
            relocated: false,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}
