//! Authoritative sharding catalog.
//!
//! The catalog store is the single source of truth for database ownership,
//! collection shard keys and chunk placement. Every chunk version bump is
//! serialized by its atomic commits; every other view in the cluster is an
//! eventually-consistent cache of it.

mod entries;
mod keys;
mod sled_catalog_store;
mod version;

#[cfg(test)]
mod sled_catalog_store_test;

pub use entries::*;
pub use keys::*;
pub use sled_catalog_store::*;
pub use version::*;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Database part of a `db.collection` namespace.
pub fn db_name(namespace: &str) -> &str {
    namespace.split_once('.').map(|(db, _)| db).unwrap_or(namespace)
}

#[cfg_attr(test, automock)]
pub trait CatalogStore: Send + Sync + 'static {
    /// Connection string recorded in shard recovery documents
    fn connection_string(&self) -> String;

    fn add_shard(
        &self,
        shard: ShardEntry,
    ) -> Result<()>;

    fn get_shard(
        &self,
        name: &str,
    ) -> Result<ShardEntry>;

    fn get_shards(&self) -> Result<Vec<ShardEntry>>;

    /// Returns the existing entry or creates one with the least loaded shard as primary.
    fn create_database(
        &self,
        name: &str,
    ) -> Result<DatabaseEntry>;

    /// Marks the database partitioned, bumping its version on change.
    fn enable_sharding(
        &self,
        name: &str,
    ) -> Result<DatabaseEntry>;

    fn get_database(
        &self,
        name: &str,
    ) -> Result<DatabaseEntry>;

    fn get_databases_for_shard(
        &self,
        shard: &str,
    ) -> Result<Vec<DatabaseEntry>>;

    fn commit_move_primary(
        &self,
        name: &str,
        to_shard: &str,
    ) -> Result<DatabaseEntry>;

    /// Creates the collection with a fresh epoch and one chunk covering the
    /// whole key space, owned by the database primary.
    fn shard_collection(
        &self,
        namespace: &str,
        key_pattern: ShardKeyPattern,
        unique: bool,
    ) -> Result<CollectionEntry>;

    /// `NotFound` for unknown and dropped collections.
    fn get_collection(
        &self,
        namespace: &str,
    ) -> Result<CollectionEntry>;

    fn get_collections(
        &self,
        db: &str,
    ) -> Result<Vec<CollectionEntry>>;

    fn drop_collection(
        &self,
        namespace: &str,
    ) -> Result<()>;

    /// Chunks ordered by range, covering the full key space.
    fn get_chunks(
        &self,
        namespace: &str,
    ) -> Result<Vec<ChunkEntry>>;

    fn get_chunks_for_shard(
        &self,
        shard: &str,
    ) -> Result<Vec<ChunkEntry>>;

    /// Splits the chunk containing `at` so that `at` becomes a boundary.
    /// Returns the new collection version.
    fn commit_split(
        &self,
        namespace: &str,
        at: &ShardKey,
    ) -> Result<ChunkVersion>;

    /// Atomically transfers ownership of exactly `range` and bumps its major
    /// version. Fails with `VersionMismatch` unless the stored chunk is owned
    /// by `from_shard` at `expected`.
    fn commit_chunk_migration(
        &self,
        namespace: &str,
        range: &ChunkRange,
        from_shard: &str,
        to_shard: &str,
        expected: &ChunkVersion,
    ) -> Result<ChunkVersion>;

    /// Reassigns a batch of chunks between shards in one commit; chunks that
    /// no longer match their expected owner and version are skipped.
    /// Returns how many moved.
    fn commit_chunks_reassignment(
        &self,
        chunks: &[ChunkEntry],
        to_shard: &str,
    ) -> Result<usize>;

    /// A log position at or after every durable catalog write so far.
    fn current_log_position(&self) -> Result<LogPosition>;
}
