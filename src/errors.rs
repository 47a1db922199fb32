//! Shard Catalog Error Hierarchy
//!
//! Defines the error types of the sharding control plane, categorized by the
//! component that raises them: catalog authority, routing caches, chunk
//! migration, distributed transactions and the infrastructure underneath.

use std::path::PathBuf;

use config::ConfigError;
use tokio::task::JoinError;

use crate::ChunkVersion;
use crate::DatabaseVersion;
use crate::Document;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (storage, serialization, background tasks)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Configuration validation failures
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Authoritative catalog failures
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Cache staleness and targeting failures
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Chunk migration failures
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Multi-statement transaction failures
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Rejected document shapes
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// True for the staleness signals of the cache refresh protocol.
    pub fn is_stale_config(&self) -> bool {
        matches!(
            self,
            Error::Routing(RoutingError::StaleShardVersion { .. })
                | Error::Routing(RoutingError::StaleDbVersion { .. })
        )
    }

    /// Distinguishes "try again" from permanent failure.
    pub fn is_retryable(&self) -> bool {
        self.is_stale_config()
            || matches!(
                self,
                Error::Routing(RoutingError::RetriesExhausted { .. })
                    | Error::Transaction(TransactionError::WriteConflict { .. })
                    | Error::Migration(MigrationError::CriticalSectionTimeout { .. })
                    | Error::Migration(MigrationError::ConflictingMigration { .. })
            )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Catalog(CatalogError::NotFound { .. }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    // Storage layer
    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),

    //Serialization
    #[error("Serialization error")]
    Serialization(#[from] SerializationError),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("{0}")]
    SignalSendFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("Error occurred at path: {path}")]
    PathError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Embedded database errors
    #[error("Embedded database error: {0}")]
    DbError(String),

    /// Checksum or decoding validation failures on persisted rows
    #[error("Data corruption detected at {location}")]
    DataCorruption { location: String },
}

// Serialization is classified separately (across protocol layers and system layers)
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Bincode serialization failed: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Namespace, database or shard unknown to the authority
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Optimistic concurrency guard of chunk commits
    #[error("Version mismatch for {namespace}: expected {expected}, found {actual:?}")]
    VersionMismatch {
        namespace: String,
        expected: ChunkVersion,
        actual: Option<ChunkVersion>,
    },

    #[error("Database {0} is not enabled for sharding")]
    ShardingNotEnabled(String),

    #[error("Invalid split point for {namespace}: {reason}")]
    InvalidSplitPoint { namespace: String, reason: String },

    /// Stored chunks do not partition the key space
    #[error("Inconsistent chunk metadata for {namespace}: {reason}")]
    InconsistentChunks { namespace: String, reason: String },

    #[error("Shard {0} is draining")]
    ShardDraining(String),

    #[error("Cannot split shard {from} into {to}")]
    InvalidShardSplit { from: String, to: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// Caller's cached chunk version does not match the shard's
    #[error("Stale shard version for {namespace}: received {received:?}, wanted {wanted:?}")]
    StaleShardVersion {
        namespace: String,
        received: Option<ChunkVersion>,
        wanted: Option<ChunkVersion>,
    },

    /// Caller's cached database version does not match the shard's
    #[error("Stale database version for {db}: received {received:?}, wanted {wanted:?}")]
    StaleDbVersion {
        db: String,
        received: Option<DatabaseVersion>,
        wanted: Option<DatabaseVersion>,
    },

    /// Persistent staleness past the retry bound
    #[error("Gave up on {namespace} after {attempts} stale config retries")]
    RetriesExhausted { namespace: String, attempts: usize },

    #[error("Query for sharded collection {namespace} must contain the shard key")]
    ShardKeyNotFound { namespace: String },

    #[error("Shard {0} is not registered")]
    ShardNotFound(String),

    /// An update whose post-image belongs to another shard
    #[error("Update of {namespace} would change the owning shard")]
    WouldChangeOwningShard {
        namespace: String,
        pre_image: Box<Document>,
        post_image: Box<Document>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Range of {namespace} containing the key is not owned by {shard}")]
    RangeNotOwned { namespace: String, shard: String },

    #[error("Recipient {0} is unavailable")]
    RecipientUnavailable(String),

    #[error("Migration of {namespace} aborted: {reason}")]
    Aborted { namespace: String, reason: String },

    #[error("Migration of {namespace} was cancelled")]
    Cancelled { namespace: String },

    #[error("Another migration of {namespace} is in progress on {shard}")]
    ConflictingMigration { namespace: String, shard: String },

    #[error("Timed out waiting for the critical section of {namespace}")]
    CriticalSectionTimeout { namespace: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// Surfaced as transaction abort; the whole transaction is safe to retry
    #[error("Write conflict on {namespace} in transaction {txn_id}")]
    WriteConflict { namespace: String, txn_id: String },

    #[error("Transaction {0} not found")]
    NoSuchTransaction(String),

    #[error("Transaction {txn_id} is {state}, cannot {action}")]
    InvalidState {
        txn_id: String,
        state: &'static str,
        action: &'static str,
    },

    #[error("Transaction {txn_id} aborted: {reason}")]
    Aborted { txn_id: String, reason: String },

    /// The commit decision was made and applied on some participants; the
    /// listed shards stay prepared, holding their locks, until the commit is
    /// resumed.
    #[error("Transaction {txn_id} is committed but still pending on {pending:?}: {reason}")]
    CommitIncomplete {
        txn_id: String,
        pending: Vec<String>,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Document is missing shard key field {0}")]
    MissingShardKey(String),

    #[error("Field {0} holds a value that cannot be stored")]
    InvalidValue(String),

    #[error("Document must have a non-empty id")]
    MissingId,

    #[error("Shard key pattern must name at least one field")]
    EmptyShardKeyPattern,

    #[error("Duplicate key {key} in {namespace}")]
    DuplicateKey { namespace: String, key: String },
}

// ============== Conversion Implementations ============== //
impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::System(SystemError::Storage(e))
    }
}

impl From<SerializationError> for Error {
    fn from(e: SerializationError) -> Self {
        Error::System(SystemError::Serialization(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        SerializationError::Bincode(e).into()
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        StorageError::DbError(err.to_string()).into()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError(err).into()
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        SystemError::TaskFailed(err).into()
    }
}
