//! Shard-local persisted mirror of the catalog slices the shard has seen.
//!
//! Survives restarts so a shard can answer version checks before it has
//! talked to the catalog again; any mismatch still triggers a refresh.

use std::sync::Arc;

use sled::transaction::ConflictableTransactionError;
use sled::transaction::TransactionError as SledTransactionError;
use sled::transaction::Transactional;
use tracing::debug;
use tracing::warn;

use crate::cache::CachedRoutingTable;
use crate::cache::CollectionRouting;
use crate::constants::CACHE_CHUNKS_TREE;
use crate::constants::CACHE_COLLECTIONS_TREE;
use crate::constants::CACHE_DATABASES_TREE;
use crate::convert::encode_bound;
use crate::convert::namespaced_key;
use crate::ChunkEntry;
use crate::CollectionEntry;
use crate::DatabaseEntry;
use crate::Result;
use crate::StorageError;

#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    databases: sled::Tree,
    collections: sled::Tree,
    chunks: sled::Tree,
}

impl LocalCacheStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            databases: db.open_tree(CACHE_DATABASES_TREE)?,
            collections: db.open_tree(CACHE_COLLECTIONS_TREE)?,
            chunks: db.open_tree(CACHE_CHUNKS_TREE)?,
        })
    }

    pub fn persist_database(
        &self,
        entry: &DatabaseEntry,
    ) -> Result<()> {
        self.databases
            .insert(entry.name.as_bytes(), bincode::serialize(entry)?)?;
        self.databases.flush()?;
        Ok(())
    }

    pub fn load_database(
        &self,
        name: &str,
    ) -> Result<Option<DatabaseEntry>> {
        match self.databases.get(name.as_bytes())? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    /// Replaces everything persisted for the namespace with `routing`.
    pub fn persist_routing(
        &self,
        namespace: &str,
        routing: &CollectionRouting,
    ) -> Result<()> {
        let stale_chunks: Vec<Vec<u8>> = self
            .chunks
            .scan_prefix(namespaced_key(namespace, &[]))
            .keys()
            .map(|k| k.map(|k| k.to_vec()))
            .collect::<std::result::Result<_, _>>()?;

        let (collection_row, chunk_rows) = match routing {
            CollectionRouting::Sharded(table) => {
                let mut rows = Vec::with_capacity(table.chunks().len());
                for c in table.chunks() {
                    rows.push((
                        namespaced_key(namespace, &encode_bound(&c.range.min)),
                        bincode::serialize(c)?,
                    ));
                }
                (Some(bincode::serialize(table.collection())?), rows)
            }
            CollectionRouting::Unsharded => (None, Vec::new()),
        };

        (&self.collections, &self.chunks)
            .transaction(|(colls, chunks)| {
                for k in &stale_chunks {
                    chunks.remove(k.as_slice())?;
                }
                for (k, v) in &chunk_rows {
                    chunks.insert(k.as_slice(), v.as_slice())?;
                }
                match &collection_row {
                    Some(v) => colls.insert(namespace.as_bytes(), v.as_slice())?,
                    None => colls.remove(namespace.as_bytes())?,
                };
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: SledTransactionError<()>| StorageError::DbError(format!("{e:?}")))?;
        self.chunks.flush()?;
        self.collections.flush()?;
        debug!("persisted routing of {} ({} chunks)", namespace, chunk_rows.len());
        Ok(())
    }

    fn load_routing(
        &self,
        collection: CollectionEntry,
    ) -> Result<CachedRoutingTable> {
        let chunks = self
            .chunks
            .scan_prefix(namespaced_key(&collection.namespace, &[]))
            .values()
            .map(|v| Ok(bincode::deserialize::<ChunkEntry>(&v?)?))
            .collect::<Result<Vec<_>>>()?;
        CachedRoutingTable::new(collection, chunks)
    }

    /// Persisted databases and sharded collections. Unreadable collection
    /// snapshots are skipped; the next request refreshes them.
    pub fn load_all(&self) -> Result<(Vec<DatabaseEntry>, Vec<(String, CollectionRouting)>)> {
        let databases = self
            .databases
            .iter()
            .values()
            .map(|v| Ok(bincode::deserialize::<DatabaseEntry>(&v?)?))
            .collect::<Result<Vec<_>>>()?;

        let mut collections = Vec::new();
        for v in self.collections.iter().values() {
            let collection: CollectionEntry = bincode::deserialize(&v?)?;
            let namespace = collection.namespace.clone();
            match self.load_routing(collection) {
                Ok(table) => {
                    collections.push((namespace, CollectionRouting::Sharded(Arc::new(table))))
                }
                Err(e) => warn!("ignoring persisted routing of {}: {:?}", namespace, e),
            }
        }
        Ok((databases, collections))
    }

    pub fn persisted_namespaces(&self) -> Result<Vec<String>> {
        self.collections
            .iter()
            .keys()
            .map(|k| Ok(String::from_utf8_lossy(&k?).into_owned()))
            .collect()
    }
}
