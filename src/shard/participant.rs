//! Shard side of multi-statement transactions.
//!
//! Writes are staged per transaction and take a per-document lock when
//! staged; a second transaction touching the same document fails with
//! `WriteConflict`. Staged writes become visible only when the coordinator
//! commits.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::DocWrite;
use super::WriteResult;
use crate::ChunkRange;
use crate::Result;
use crate::ShardKey;
use crate::TransactionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Prepared,
}

impl TxnState {
    fn as_str(&self) -> &'static str {
        match self {
            TxnState::Active => "active",
            TxnState::Prepared => "prepared",
        }
    }
}

#[derive(Debug)]
struct TxnRecord {
    state: TxnState,
    /// storage key -> latest staged write
    writes: BTreeMap<Vec<u8>, DocWrite>,
    /// applied order of first touch, so commits replay in statement order
    order: Vec<Vec<u8>>,
    tokens: Vec<(String, WriteResult)>,
}

/// Everything a commit applies.
#[derive(Debug, Default)]
pub struct CommitSet {
    pub writes: Vec<DocWrite>,
    pub tokens: Vec<(String, WriteResult)>,
}

#[derive(Debug, Default)]
pub struct TransactionParticipant {
    txns: DashMap<String, Mutex<TxnRecord>>,
    /// (namespace, storage key) -> (txn id, shard key)
    locks: DashMap<(String, Vec<u8>), (String, ShardKey)>,
    released: Notify,
}

impl TransactionParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_active<T>(
        &self,
        txn_id: &str,
        action: &'static str,
        f: impl FnOnce(&mut TxnRecord) -> Result<T>,
    ) -> Result<T> {
        let entry = self
            .txns
            .entry(txn_id.to_string())
            .or_insert_with(|| {
                Mutex::new(TxnRecord {
                    state: TxnState::Active,
                    writes: BTreeMap::new(),
                    order: Vec::new(),
                    tokens: Vec::new(),
                })
            });
        let mut record = entry.lock();
        if record.state != TxnState::Active {
            return Err(TransactionError::InvalidState {
                txn_id: txn_id.to_string(),
                state: record.state.as_str(),
                action,
            }
            .into());
        }
        f(&mut record)
    }

    /// Stages a write, locking the document for the transaction.
    pub fn stage(
        &self,
        txn_id: &str,
        write: DocWrite,
    ) -> Result<()> {
        let key = write.storage_key();
        let lock_key = (write.namespace.clone(), key.clone());
        match self.locks.entry(lock_key) {
            dashmap::mapref::entry::Entry::Occupied(held) if held.get().0 != txn_id => {
                return Err(TransactionError::WriteConflict {
                    namespace: write.namespace.clone(),
                    txn_id: txn_id.to_string(),
                }
                .into());
            }
            dashmap::mapref::entry::Entry::Occupied(_) => {}
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((txn_id.to_string(), write.shard_key.clone()));
            }
        }

        let staged = self.with_active(txn_id, "stage a write", |record| {
            if !record.writes.contains_key(&key) {
                record.order.push(key.clone());
            }
            record.writes.insert(key.clone(), write);
            Ok(())
        });
        if staged.is_err() {
            self.release_lock_if_unused(txn_id);
        }
        staged
    }

    fn release_lock_if_unused(
        &self,
        txn_id: &str,
    ) {
        let used: Vec<Vec<u8>> = self
            .txns
            .get(txn_id)
            .map(|r| r.lock().writes.keys().cloned().collect())
            .unwrap_or_default();
        self.locks
            .retain(|(_, k), (owner, _)| owner != txn_id || used.contains(k));
    }

    /// The transaction's own staged write for a document, if any.
    pub fn staged(
        &self,
        txn_id: &str,
        namespace: &str,
        storage_key: &[u8],
    ) -> Option<DocWrite> {
        let record = self.txns.get(txn_id)?;
        let record = record.lock();
        record
            .writes
            .get(storage_key)
            .filter(|w| w.namespace == namespace)
            .cloned()
    }

    /// Staged writes of the transaction in one namespace.
    pub fn staged_in_namespace(
        &self,
        txn_id: &str,
        namespace: &str,
    ) -> Vec<DocWrite> {
        let Some(record) = self.txns.get(txn_id) else {
            return Vec::new();
        };
        let record = record.lock();
        record
            .writes
            .values()
            .filter(|w| w.namespace == namespace)
            .cloned()
            .collect()
    }

    pub fn record_token(
        &self,
        txn_id: &str,
        token: String,
        result: WriteResult,
    ) -> Result<()> {
        self.with_active(txn_id, "record a retry token", |record| {
            record.tokens.push((token, result));
            Ok(())
        })
    }

    /// Idempotent: a prepared transaction stays prepared.
    pub fn prepare(
        &self,
        txn_id: &str,
    ) -> Result<()> {
        if self.state(txn_id) == Some(TxnState::Prepared) {
            return Ok(());
        }
        self.with_active(txn_id, "prepare", |record| {
            record.state = TxnState::Prepared;
            Ok(())
        })?;
        debug!("prepared transaction {}", txn_id);
        Ok(())
    }

    /// What a commit must apply. The transaction and its locks stay in place
    /// until [`Self::finish`], so a failed apply can be retried.
    pub fn commit_set(
        &self,
        txn_id: &str,
    ) -> Result<CommitSet> {
        let Some(entry) = self.txns.get(txn_id) else {
            return Err(TransactionError::NoSuchTransaction(txn_id.to_string()).into());
        };
        let record = entry.lock();
        let writes = record
            .order
            .iter()
            .filter_map(|k| record.writes.get(k).cloned())
            .collect();
        Ok(CommitSet {
            writes,
            tokens: record.tokens.clone(),
        })
    }

    /// Forgets a committed transaction and releases its locks.
    pub fn finish(
        &self,
        txn_id: &str,
    ) {
        self.txns.remove(txn_id);
        self.release(txn_id);
    }

    /// Drops staged state and releases the locks. Unknown ids are a no-op.
    pub fn abort(
        &self,
        txn_id: &str,
    ) {
        if self.txns.remove(txn_id).is_some() {
            debug!("aborted transaction {}", txn_id);
        }
        self.release(txn_id);
    }

    fn release(
        &self,
        txn_id: &str,
    ) {
        self.locks.retain(|_, (owner, _)| owner != txn_id);
        self.released.notify_waiters();
    }

    pub fn is_locked(
        &self,
        namespace: &str,
        storage_key: &[u8],
    ) -> bool {
        self.lock_holder(namespace, storage_key).is_some()
    }

    pub fn lock_holder(
        &self,
        namespace: &str,
        storage_key: &[u8],
    ) -> Option<String> {
        self.locks
            .get(&(namespace.to_string(), storage_key.to_vec()))
            .map(|held| held.0.clone())
    }

    /// Transactions holding locks inside `range`.
    pub fn lock_holders_in_range(
        &self,
        namespace: &str,
        range: &ChunkRange,
    ) -> Vec<String> {
        let mut holders = HashSet::new();
        for entry in self.locks.iter() {
            let ((ns, _), (owner, shard_key)) = (entry.key(), entry.value());
            if ns == namespace && range.contains(shard_key) {
                holders.insert(owner.clone());
            }
        }
        holders.into_iter().collect()
    }

    /// Waits until no transaction holds a lock inside `range`.
    /// Returns false on timeout.
    pub async fn wait_for_range_unlocked(
        &self,
        namespace: &str,
        range: &ChunkRange,
        timeout: Duration,
    ) -> bool {
        let wait = async {
            loop {
                let notified = self.released.notified();
                if self.lock_holders_in_range(namespace, range).is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn state(
        &self,
        txn_id: &str,
    ) -> Option<TxnState> {
        self.txns.get(txn_id).map(|r| r.lock().state)
    }
}
