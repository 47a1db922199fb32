//! Catalog store persisted in sled.
//!
//! Layout (one tree per catalog collection):
//! - `databases`:   db name -> [`DatabaseEntry`]
//! - `collections`: namespace -> [`CollectionEntry`] (dropped entries are kept)
//! - `chunks`:      namespace \0 encoded range min -> [`ChunkEntry`]
//! - `shards`:      shard name -> [`ShardEntry`]
//!
//! Commits are serialized by `commit_lock` and written with a single sled
//! batch or transaction, so a reader never observes a half-applied commit.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use autometrics::autometrics;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;
use sled::transaction::TransactionError as SledTransactionError;
use sled::transaction::Transactional;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use uuid::Uuid;

use super::db_name;
use super::CatalogStore;
use super::ChunkEntry;
use super::ChunkRange;
use super::ChunkVersion;
use super::CollectionEntry;
use super::DatabaseEntry;
use super::DatabaseVersion;
use super::KeyBound;
use super::LogPosition;
use super::ShardEntry;
use super::ShardKey;
use super::ShardKeyPattern;
use crate::constants::CATALOG_CHUNKS_TREE;
use crate::constants::CATALOG_COLLECTIONS_TREE;
use crate::constants::CATALOG_DATABASES_TREE;
use crate::constants::CATALOG_SHARDS_TREE;
use crate::convert::encode_bound;
use crate::convert::namespaced_key;
use crate::CatalogError;
use crate::Result;
use crate::StorageError;
use crate::API_SLO;

/// Pending row writes; `None` removes the row.
type WriteSet = Vec<(Vec<u8>, Option<Vec<u8>>)>;

pub struct SledCatalogStore {
    db: sled::Db,
    databases: sled::Tree,
    collections: sled::Tree,
    chunks: sled::Tree,
    shards: sled::Tree,
    commit_lock: Mutex<()>,
    connection_string: String,
}

impl Debug for SledCatalogStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SledCatalogStore")
            .field("connection_string", &self.connection_string)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

pub fn init_sled_catalog_db(
    sled_db_root_path: impl AsRef<Path> + Debug
) -> std::result::Result<sled::Db, std::io::Error> {
    debug!("init_sled_catalog_db from path: {:?}", &sled_db_root_path);

    let catalog_db_path = sled_db_root_path.as_ref().join("config");

    sled::Config::default()
        .path(&catalog_db_path)
        .cache_capacity(10 * 1024 * 1024) //10MB
        .use_compression(true)
        .compression_factor(1)
        .open()
        .map_err(|e| {
            warn!(
                "Try to open DB at this location: {:?} and failed: {:?}",
                catalog_db_path, e
            );
            std::io::Error::other(e)
        })
}

impl SledCatalogStore {
    pub fn open(
        sled_db_root_path: impl AsRef<Path> + Debug,
        connection_string: impl Into<String>,
    ) -> Result<Self> {
        let db = init_sled_catalog_db(sled_db_root_path)?;
        Self::new(db, connection_string)
    }

    pub fn new(
        db: sled::Db,
        connection_string: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            databases: db.open_tree(CATALOG_DATABASES_TREE)?,
            collections: db.open_tree(CATALOG_COLLECTIONS_TREE)?,
            chunks: db.open_tree(CATALOG_CHUNKS_TREE)?,
            shards: db.open_tree(CATALOG_SHARDS_TREE)?,
            db,
            commit_lock: Mutex::new(()),
            connection_string: connection_string.into(),
        })
    }

    fn chunk_key(
        namespace: &str,
        min: &KeyBound,
    ) -> Vec<u8> {
        namespaced_key(namespace, &encode_bound(min))
    }

    fn load_chunks(
        &self,
        namespace: &str,
    ) -> Result<Vec<ChunkEntry>> {
        self.chunks
            .scan_prefix(namespaced_key(namespace, &[]))
            .map(|kv| {
                let (_, v) = kv?;
                Ok(bincode::deserialize::<ChunkEntry>(&v)?)
            })
            .collect()
    }

    fn load_collection(
        &self,
        namespace: &str,
    ) -> Result<Option<CollectionEntry>> {
        get_row(&self.collections, namespace.as_bytes())
    }

    fn require_shard(
        &self,
        name: &str,
    ) -> Result<ShardEntry> {
        get_row::<ShardEntry>(&self.shards, name.as_bytes())?.ok_or_else(|| {
            CatalogError::NotFound {
                kind: "shard",
                name: name.to_string(),
            }
            .into()
        })
    }

    fn create_database_locked(
        &self,
        name: &str,
    ) -> Result<DatabaseEntry> {
        if let Some(existing) = get_row::<DatabaseEntry>(&self.databases, name.as_bytes())? {
            return Ok(existing);
        }

        let shards = self.get_shards()?;
        let mut load: BTreeMap<&str, usize> = shards
            .iter()
            .filter(|s| !s.draining)
            .map(|s| (s.name.as_str(), 0))
            .collect();
        for kv in self.databases.iter() {
            let (_, v) = kv?;
            let entry: DatabaseEntry = bincode::deserialize(&v)?;
            if let Some(n) = load.get_mut(entry.primary_shard.as_str()) {
                *n += 1;
            }
        }
        let primary = load
            .iter()
            .min_by_key(|(name, n)| (**n, **name))
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| CatalogError::NotFound {
                kind: "shard",
                name: "<any>".to_string(),
            })?;

        let entry = DatabaseEntry {
            name: name.to_string(),
            primary_shard: primary,
            version: DatabaseVersion::fresh(),
            partitioned: false,
        };
        put_row(&self.databases, name.as_bytes(), &entry)?;
        self.db.flush()?;
        info!("created database {} with primary {}", name, entry.primary_shard);
        Ok(entry)
    }

    /// Writes to `collections` and `chunks` in one sled transaction.
    fn commit_write_sets(
        &self,
        collection_writes: WriteSet,
        chunk_writes: WriteSet,
    ) -> Result<()> {
        (&self.collections, &self.chunks)
            .transaction(|(colls, chunks)| {
                for (k, v) in &collection_writes {
                    match v {
                        Some(v) => colls.insert(k.as_slice(), v.as_slice())?,
                        None => colls.remove(k.as_slice())?,
                    };
                }
                for (k, v) in &chunk_writes {
                    match v {
                        Some(v) => chunks.insert(k.as_slice(), v.as_slice())?,
                        None => chunks.remove(k.as_slice())?,
                    };
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: SledTransactionError<()>| StorageError::DbError(format!("{e:?}")))?;
        self.db.flush()?;
        Ok(())
    }
}

/// Highest `(major, minor)` among the chunks.
pub(crate) fn collection_version(chunks: &[ChunkEntry]) -> Option<ChunkVersion> {
    chunks
        .iter()
        .map(|c| c.version)
        .max_by_key(|v| (v.major, v.minor))
}

fn get_row<T: DeserializeOwned>(
    tree: &sled::Tree,
    key: &[u8],
) -> Result<Option<T>> {
    match tree.get(key)? {
        Some(ivec) => Ok(Some(bincode::deserialize(&ivec)?)),
        None => Ok(None),
    }
}

fn put_row<T: Serialize>(
    tree: &sled::Tree,
    key: &[u8],
    value: &T,
) -> Result<()> {
    tree.insert(key, bincode::serialize(value)?)?;
    Ok(())
}

impl CatalogStore for SledCatalogStore {
    fn connection_string(&self) -> String {
        self.connection_string.clone()
    }

    fn add_shard(
        &self,
        shard: ShardEntry,
    ) -> Result<()> {
        let _guard = self.commit_lock.lock();
        if let Some(existing) = get_row::<ShardEntry>(&self.shards, shard.name.as_bytes())? {
            if existing == shard {
                return Ok(());
            }
            return Err(CatalogError::AlreadyExists {
                kind: "shard",
                name: shard.name,
            }
            .into());
        }
        put_row(&self.shards, shard.name.as_bytes(), &shard)?;
        self.db.flush()?;
        info!("registered shard {} at {}", shard.name, shard.endpoint);
        Ok(())
    }

    fn get_shard(
        &self,
        name: &str,
    ) -> Result<ShardEntry> {
        self.require_shard(name)
    }

    fn get_shards(&self) -> Result<Vec<ShardEntry>> {
        self.shards
            .iter()
            .map(|kv| {
                let (_, v) = kv?;
                Ok(bincode::deserialize::<ShardEntry>(&v)?)
            })
            .collect()
    }

    fn create_database(
        &self,
        name: &str,
    ) -> Result<DatabaseEntry> {
        let _guard = self.commit_lock.lock();
        self.create_database_locked(name)
    }

    fn enable_sharding(
        &self,
        name: &str,
    ) -> Result<DatabaseEntry> {
        let _guard = self.commit_lock.lock();
        let mut entry = self.create_database_locked(name)?;
        if !entry.partitioned {
            entry.partitioned = true;
            entry.version = entry.version.bumped();
            put_row(&self.databases, name.as_bytes(), &entry)?;
            self.db.flush()?;
            info!("enabled sharding for database {} at version {}", name, entry.version);
        }
        Ok(entry)
    }

    #[autometrics(objective = API_SLO)]
    fn get_database(
        &self,
        name: &str,
    ) -> Result<DatabaseEntry> {
        get_row::<DatabaseEntry>(&self.databases, name.as_bytes())?.ok_or_else(|| {
            CatalogError::NotFound {
                kind: "database",
                name: name.to_string(),
            }
            .into()
        })
    }

    fn get_databases_for_shard(
        &self,
        shard: &str,
    ) -> Result<Vec<DatabaseEntry>> {
        let mut out = Vec::new();
        for kv in self.databases.iter() {
            let (_, v) = kv?;
            let entry: DatabaseEntry = bincode::deserialize(&v)?;
            if entry.primary_shard == shard {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn commit_move_primary(
        &self,
        name: &str,
        to_shard: &str,
    ) -> Result<DatabaseEntry> {
        let _guard = self.commit_lock.lock();
        let to = self.require_shard(to_shard)?;
        if to.draining {
            return Err(CatalogError::ShardDraining(to.name).into());
        }
        let mut entry = self.get_database(name)?;
        if entry.primary_shard != to_shard {
            entry.primary_shard = to_shard.to_string();
            entry.version = entry.version.bumped();
            put_row(&self.databases, name.as_bytes(), &entry)?;
            self.db.flush()?;
            info!("moved primary of {} to {} at version {}", name, to_shard, entry.version);
        }
        Ok(entry)
    }

    #[instrument(skip(self))]
    fn shard_collection(
        &self,
        namespace: &str,
        key_pattern: ShardKeyPattern,
        unique: bool,
    ) -> Result<CollectionEntry> {
        let _guard = self.commit_lock.lock();
        let db = self.get_database(db_name(namespace))?;
        if !db.partitioned {
            return Err(CatalogError::ShardingNotEnabled(db.name).into());
        }
        if let Some(existing) = self.load_collection(namespace)? {
            if !existing.dropped {
                if existing.key_pattern == key_pattern && existing.unique == unique {
                    return Ok(existing);
                }
                return Err(CatalogError::AlreadyExists {
                    kind: "collection",
                    name: namespace.to_string(),
                }
                .into());
            }
        }

        let entry = CollectionEntry {
            namespace: namespace.to_string(),
            key_pattern,
            epoch: Uuid::new_v4(),
            unique,
            dropped: false,
        };
        let chunk = ChunkEntry {
            namespace: namespace.to_string(),
            range: ChunkRange::full(),
            shard: db.primary_shard.clone(),
            version: ChunkVersion::initial(entry.epoch),
        };

        let mut chunk_writes: WriteSet = self
            .chunks
            .scan_prefix(namespaced_key(namespace, &[]))
            .keys()
            .map(|k| k.map(|k| (k.to_vec(), None)))
            .collect::<std::result::Result<_, _>>()?;
        chunk_writes.push((
            Self::chunk_key(namespace, &chunk.range.min),
            Some(bincode::serialize(&chunk)?),
        ));
        self.commit_write_sets(
            vec![(namespace.as_bytes().to_vec(), Some(bincode::serialize(&entry)?))],
            chunk_writes,
        )?;

        info!(
            "sharded collection {} on {:?} with epoch {}, initial chunk on {}",
            namespace,
            entry.key_pattern.fields(),
            entry.epoch,
            chunk.shard
        );
        Ok(entry)
    }

    fn get_collection(
        &self,
        namespace: &str,
    ) -> Result<CollectionEntry> {
        match self.load_collection(namespace)? {
            Some(entry) if !entry.dropped => Ok(entry),
            _ => Err(CatalogError::NotFound {
                kind: "collection",
                name: namespace.to_string(),
            }
            .into()),
        }
    }

    fn get_collections(
        &self,
        db: &str,
    ) -> Result<Vec<CollectionEntry>> {
        let mut out = Vec::new();
        for kv in self.collections.iter() {
            let (_, v) = kv?;
            let entry: CollectionEntry = bincode::deserialize(&v)?;
            if !entry.dropped && db_name(&entry.namespace) == db {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn drop_collection(
        &self,
        namespace: &str,
    ) -> Result<()> {
        let _guard = self.commit_lock.lock();
        let mut entry = self.get_collection(namespace)?;
        entry.dropped = true;

        let chunk_writes: WriteSet = self
            .chunks
            .scan_prefix(namespaced_key(namespace, &[]))
            .keys()
            .map(|k| k.map(|k| (k.to_vec(), None)))
            .collect::<std::result::Result<_, _>>()?;
        self.commit_write_sets(
            vec![(namespace.as_bytes().to_vec(), Some(bincode::serialize(&entry)?))],
            chunk_writes,
        )?;
        info!("dropped collection {} (epoch {})", namespace, entry.epoch);
        Ok(())
    }

    #[autometrics(objective = API_SLO)]
    fn get_chunks(
        &self,
        namespace: &str,
    ) -> Result<Vec<ChunkEntry>> {
        let coll = self.get_collection(namespace)?;
        let mut chunks = self.load_chunks(namespace)?;
        chunks.retain(|c| c.version.epoch == coll.epoch);
        Ok(chunks)
    }

    fn get_chunks_for_shard(
        &self,
        shard: &str,
    ) -> Result<Vec<ChunkEntry>> {
        let mut out = Vec::new();
        for kv in self.chunks.iter() {
            let (_, v) = kv?;
            let chunk: ChunkEntry = bincode::deserialize(&v)?;
            if chunk.shard == shard {
                out.push(chunk);
            }
        }
        Ok(out)
    }

    #[autometrics(objective = API_SLO)]
    fn commit_split(
        &self,
        namespace: &str,
        at: &ShardKey,
    ) -> Result<ChunkVersion> {
        let _guard = self.commit_lock.lock();
        let coll = self.get_collection(namespace)?;
        if !coll.key_pattern.is_valid_key(at) {
            return Err(CatalogError::InvalidSplitPoint {
                namespace: namespace.to_string(),
                reason: format!("{at} does not match the shard key pattern"),
            }
            .into());
        }

        let chunks = self.get_chunks(namespace)?;
        let current = collection_version(&chunks).ok_or_else(|| CatalogError::InconsistentChunks {
            namespace: namespace.to_string(),
            reason: "no chunks".to_string(),
        })?;
        let target = chunks.iter().find(|c| c.range.contains(at)).ok_or_else(|| {
            CatalogError::InconsistentChunks {
                namespace: namespace.to_string(),
                reason: format!("no chunk contains {at}"),
            }
        })?;
        let split_bound = KeyBound::Key(at.clone());
        if target.range.min == split_bound {
            return Err(CatalogError::InvalidSplitPoint {
                namespace: namespace.to_string(),
                reason: format!("{at} is already a chunk boundary"),
            }
            .into());
        }

        let left = ChunkEntry {
            range: ChunkRange::new(target.range.min.clone(), split_bound.clone()),
            version: current.next_minor(),
            ..target.clone()
        };
        let right = ChunkEntry {
            range: ChunkRange::new(split_bound, target.range.max.clone()),
            version: current.next_minor().next_minor(),
            ..target.clone()
        };

        let mut batch = sled::Batch::default();
        batch.insert(
            Self::chunk_key(namespace, &left.range.min),
            bincode::serialize(&left)?,
        );
        batch.insert(
            Self::chunk_key(namespace, &right.range.min),
            bincode::serialize(&right)?,
        );
        self.chunks.apply_batch(batch)?;
        self.db.flush()?;

        info!("split {} at {}: {} | {}", namespace, at, left.range, right.range);
        Ok(right.version)
    }

    #[autometrics(objective = API_SLO)]
    #[instrument(skip(self))]
    fn commit_chunk_migration(
        &self,
        namespace: &str,
        range: &ChunkRange,
        from_shard: &str,
        to_shard: &str,
        expected: &ChunkVersion,
    ) -> Result<ChunkVersion> {
        let _guard = self.commit_lock.lock();
        let to = self.require_shard(to_shard)?;
        if to.draining {
            return Err(CatalogError::ShardDraining(to.name).into());
        }

        let chunks = self.get_chunks(namespace)?;
        let stored = chunks.iter().find(|c| c.range == *range);
        let stored = match stored {
            Some(c) if c.version == *expected && c.shard == from_shard => c,
            other => {
                warn!(
                    "rejecting migration commit of {} {}: expected {} on {}, found {:?}",
                    namespace, range, expected, from_shard, other
                );
                return Err(CatalogError::VersionMismatch {
                    namespace: namespace.to_string(),
                    expected: *expected,
                    actual: other.map(|c| c.version),
                }
                .into());
            }
        };

        let current = collection_version(&chunks).unwrap_or(*expected);
        let moved = ChunkEntry {
            shard: to_shard.to_string(),
            version: current.next_major(),
            ..stored.clone()
        };
        put_row(
            &self.chunks,
            &Self::chunk_key(namespace, &moved.range.min),
            &moved,
        )?;
        self.db.flush()?;

        info!(
            "committed migration of {} {} from {} to {} at version {}",
            namespace, range, from_shard, to_shard, moved.version
        );
        Ok(moved.version)
    }

    fn commit_chunks_reassignment(
        &self,
        chunks: &[ChunkEntry],
        to_shard: &str,
    ) -> Result<usize> {
        let _guard = self.commit_lock.lock();
        self.require_shard(to_shard)?;

        let mut by_namespace: BTreeMap<&str, Vec<&ChunkEntry>> = BTreeMap::new();
        for c in chunks {
            by_namespace.entry(c.namespace.as_str()).or_default().push(c);
        }

        let mut batch = sled::Batch::default();
        let mut moved = 0;
        for (namespace, requested) in by_namespace {
            let stored = self.get_chunks(namespace)?;
            let Some(current) = collection_version(&stored) else {
                continue;
            };
            let mut next = current.next_major();
            for want in requested {
                let Some(row) = stored.iter().find(|c| *c == want) else {
                    warn!("skipping reassignment of {} {}: chunk changed", namespace, want.range);
                    continue;
                };
                let reassigned = ChunkEntry {
                    shard: to_shard.to_string(),
                    version: next,
                    ..row.clone()
                };
                batch.insert(
                    Self::chunk_key(namespace, &reassigned.range.min),
                    bincode::serialize(&reassigned)?,
                );
                next = next.next_minor();
                moved += 1;
            }
        }
        self.chunks.apply_batch(batch)?;
        self.db.flush()?;
        info!("reassigned {} chunks to {}", moved, to_shard);
        Ok(moved)
    }

    fn current_log_position(&self) -> Result<LogPosition> {
        let id = self.db.generate_id()?;
        Ok(LogPosition::new(id + 1, 1))
    }
}
