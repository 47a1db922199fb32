//! Document storage of one shard.
//!
//! All namespaces share the `data.documents` tree; a document lives at
//! `namespace \0 encoded shard key ++ id`, so a chunk range maps onto one
//! contiguous byte interval.

use std::ops::Bound;

use sled::transaction::ConflictableTransactionError;
use sled::transaction::TransactionError as SledTransactionError;
use sled::transaction::Transactional;
use tracing::debug;

use super::WriteResult;
use crate::constants::DOCUMENTS_TREE;
use crate::constants::TRANSACTIONS_TREE;
use crate::convert::document_storage_key;
use crate::convert::encode_shard_key;
use crate::convert::namespaced_key;
use crate::convert::storage_interval;
use crate::ChunkRange;
use crate::Document;
use crate::Result;
use crate::ShardKey;
use crate::StorageError;

/// A pending document write; `doc: None` deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocWrite {
    pub namespace: String,
    pub shard_key: ShardKey,
    pub id: String,
    pub doc: Option<Document>,
}

impl DocWrite {
    pub fn upsert(
        namespace: impl Into<String>,
        shard_key: ShardKey,
        doc: Document,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            id: doc.id().to_string(),
            shard_key,
            doc: Some(doc),
        }
    }

    pub fn delete(
        namespace: impl Into<String>,
        shard_key: ShardKey,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            shard_key,
            id: id.into(),
            doc: None,
        }
    }

    pub fn storage_key(&self) -> Vec<u8> {
        DocumentStore::key(&self.namespace, &self.shard_key, &self.id)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    documents: sled::Tree,
    /// retry token -> [`WriteResult`]
    executed: sled::Tree,
}

impl DocumentStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            documents: db.open_tree(DOCUMENTS_TREE)?,
            executed: db.open_tree(TRANSACTIONS_TREE)?,
        })
    }

    pub fn key(
        namespace: &str,
        shard_key: &ShardKey,
        id: &str,
    ) -> Vec<u8> {
        namespaced_key(namespace, &document_storage_key(shard_key, id))
    }

    fn namespace_bounds(namespace: &str) -> (Vec<u8>, Vec<u8>) {
        let start = namespaced_key(namespace, &[]);
        let mut end = start.clone();
        if let Some(last) = end.last_mut() {
            // the separator byte is 0x00
            *last = 0x01;
        }
        (start, end)
    }

    pub fn get(
        &self,
        namespace: &str,
        shard_key: &ShardKey,
        id: &str,
    ) -> Result<Option<Document>> {
        match self.documents.get(Self::key(namespace, shard_key, id))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    /// Documents whose shard key equals `shard_key`.
    pub fn find_by_shard_key(
        &self,
        namespace: &str,
        shard_key: &ShardKey,
    ) -> Result<Vec<(Vec<u8>, Document)>> {
        let prefix = namespaced_key(namespace, &encode_shard_key(shard_key));
        self.documents
            .scan_prefix(prefix)
            .map(|kv| {
                let (k, v) = kv?;
                Ok((k.to_vec(), bincode::deserialize(&v)?))
            })
            .collect()
    }

    pub fn scan_namespace(
        &self,
        namespace: &str,
    ) -> Result<Vec<(Vec<u8>, Document)>> {
        let (start, end) = Self::namespace_bounds(namespace);
        self.documents
            .range(start..end)
            .map(|kv| {
                let (k, v) = kv?;
                Ok((k.to_vec(), bincode::deserialize(&v)?))
            })
            .collect()
    }

    /// Up to `limit` documents of `range` in key order, strictly after the
    /// storage key `after` when given.
    pub fn scan_range(
        &self,
        namespace: &str,
        range: &ChunkRange,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Document)>> {
        let (_, ns_end) = Self::namespace_bounds(namespace);
        let (lo, hi) = storage_interval(&range.min, &range.max);

        let lower = match after {
            Some(after) if after >= namespaced_key(namespace, &lo).as_slice() => {
                Bound::Excluded(after.to_vec())
            }
            _ => Bound::Included(namespaced_key(namespace, &lo)),
        };
        let upper = match hi {
            Some(hi) => Bound::Excluded(namespaced_key(namespace, &hi)),
            None => Bound::Excluded(ns_end),
        };

        self.documents
            .range::<Vec<u8>, _>((lower, upper))
            .take(limit)
            .map(|kv| {
                let (k, v) = kv?;
                Ok((k.to_vec(), bincode::deserialize(&v)?))
            })
            .collect()
    }

    pub fn count_range(
        &self,
        namespace: &str,
        range: &ChunkRange,
    ) -> Result<u64> {
        Ok(self.scan_range(namespace, range, None, usize::MAX)?.len() as u64)
    }

    /// Applies the writes and records the retry tokens in one sled transaction.
    pub fn apply(
        &self,
        writes: &[DocWrite],
        tokens: &[(String, WriteResult)],
    ) -> Result<()> {
        let mut prepared = Vec::with_capacity(writes.len());
        for w in writes {
            let value = match &w.doc {
                Some(doc) => Some(bincode::serialize(doc)?),
                None => None,
            };
            prepared.push((w.storage_key(), value));
        }
        let mut token_rows = Vec::with_capacity(tokens.len());
        for (token, result) in tokens {
            token_rows.push((token.as_bytes().to_vec(), bincode::serialize(result)?));
        }

        (&self.documents, &self.executed)
            .transaction(|(docs, executed)| {
                for (k, v) in &prepared {
                    match v {
                        Some(v) => docs.insert(k.as_slice(), v.as_slice())?,
                        None => docs.remove(k.as_slice())?,
                    };
                }
                for (k, v) in &token_rows {
                    executed.insert(k.as_slice(), v.as_slice())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: SledTransactionError<()>| StorageError::DbError(format!("{e:?}")))?;
        Ok(())
    }

    /// Result of an already executed retryable write.
    pub fn executed(
        &self,
        token: &str,
    ) -> Result<Option<WriteResult>> {
        match self.executed.get(token.as_bytes())? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    pub fn delete_keys(
        &self,
        keys: &[Vec<u8>],
    ) -> Result<usize> {
        let mut batch = sled::Batch::default();
        for k in keys {
            batch.remove(k.as_slice());
        }
        self.documents.apply_batch(batch)?;
        Ok(keys.len())
    }

    /// Namespaces with at least one stored document. Skips from one
    /// namespace to the next instead of reading every row.
    pub fn namespaces(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut cursor: Vec<u8> = Vec::new();
        while let Some((key, _)) = self.documents.range(cursor.clone()..).next().transpose()? {
            let Some(sep) = key.iter().position(|b| *b == 0x00) else {
                return Err(StorageError::DataCorruption {
                    location: format!("document key {key:?}"),
                }
                .into());
            };
            let namespace = String::from_utf8_lossy(&key[..sep]).into_owned();
            cursor = Self::namespace_bounds(&namespace).1;
            out.push(namespace);
        }
        Ok(out)
    }

    pub fn drop_namespace(
        &self,
        namespace: &str,
    ) -> Result<usize> {
        let keys: Vec<Vec<u8>> = self
            .scan_namespace(namespace)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let n = self.delete_keys(&keys)?;
        debug!("dropped {} documents of {}", n, namespace);
        Ok(n)
    }

    pub fn flush(&self) -> Result<()> {
        self.documents.flush()?;
        self.executed.flush()?;
        Ok(())
    }
}
