use std::sync::Arc;

use tracing::debug;

use super::OperationContext;
use super::Router;
use crate::ChunkRange;
use crate::Document;
use crate::DocumentUpdate;
use crate::Filter;
use crate::Result;
use crate::TransactionError;
use crate::WriteResult;

/// A multi-statement transaction driven through the router.
///
/// Statements stage their writes on the shards they target; `commit` runs
/// two-phase commit across every shard that staged something. A failed
/// statement aborts the transaction, and dropping an unfinished transaction
/// aborts it too.
#[derive(Debug)]
pub struct RouterTransaction {
    router: Arc<Router>,
    ctx: OperationContext,
    /// Why the transaction can no longer be used
    closed: Option<String>,
}

impl RouterTransaction {
    pub(crate) fn new(
        router: Arc<Router>,
        txn_id: String,
    ) -> Self {
        debug!("starting transaction {}", txn_id);
        Self {
            router,
            ctx: OperationContext::in_txn(txn_id),
            closed: None,
        }
    }

    pub fn id(&self) -> &str {
        self.ctx.txn_id().unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.closed {
            Some(reason) => Err(TransactionError::Aborted {
                txn_id: self.id().to_string(),
                reason: reason.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Aborts on a failed statement and passes the error through.
    fn track<T>(
        &mut self,
        outcome: Result<T>,
    ) -> Result<T> {
        if let Err(e) = &outcome {
            self.router.abort_transaction(self.id());
            self.closed = Some(e.to_string());
        }
        outcome
    }

    pub async fn insert(
        &mut self,
        namespace: &str,
        doc: Document,
    ) -> Result<WriteResult> {
        self.ensure_open()?;
        let outcome = self.router.insert(&self.ctx, namespace, doc).await;
        self.track(outcome)
    }

    pub async fn find(
        &mut self,
        namespace: &str,
        filter: &Filter,
    ) -> Result<Vec<Document>> {
        self.ensure_open()?;
        let outcome = self.router.find(&self.ctx, namespace, filter).await;
        self.track(outcome)
    }

    pub async fn count(
        &mut self,
        namespace: &str,
        range: &ChunkRange,
    ) -> Result<u64> {
        self.ensure_open()?;
        let outcome = self.router.count(&self.ctx, namespace, range).await;
        self.track(outcome)
    }

    pub async fn update(
        &mut self,
        namespace: &str,
        filter: &Filter,
        update: &DocumentUpdate,
    ) -> Result<WriteResult> {
        self.ensure_open()?;
        let outcome = self.router.update(&self.ctx, namespace, filter, update).await;
        self.track(outcome)
    }

    pub async fn find_and_modify(
        &mut self,
        namespace: &str,
        filter: &Filter,
        update: &DocumentUpdate,
    ) -> Result<Option<Document>> {
        self.ensure_open()?;
        let outcome = self
            .router
            .find_and_modify(&self.ctx, namespace, filter, update)
            .await;
        self.track(outcome)
    }

    pub async fn delete(
        &mut self,
        namespace: &str,
        filter: &Filter,
    ) -> Result<WriteResult> {
        self.ensure_open()?;
        let outcome = self.router.delete(&self.ctx, namespace, filter).await;
        self.track(outcome)
    }

    pub async fn commit(mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = Some("committed".to_string());
        self.router.commit_transaction(self.id()).await
    }

    pub fn abort(mut self) {
        self.router.abort_transaction(self.id());
        self.closed = Some("aborted".to_string());
    }
}

impl Drop for RouterTransaction {
    fn drop(&mut self) {
        if self.closed.is_none() {
            self.router.abort_transaction(self.id());
        }
    }
}
