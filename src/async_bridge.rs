use crate::PartitionEngine;
use crate::catalog::types::{Row, TableId, Value};
use crate::error::AutopartError;
use crate::partition::filter::InsertResult;
use crate::session::SessionContext;
use std::sync::Arc;

/// Async front for callers on a tokio runtime. Every call runs on the
/// blocking pool, since routing may wait on creation locks and workers.
#[derive(Clone)]
pub struct AutopartAsync {
    inner: Arc<PartitionEngine>,
}

impl AutopartAsync {
    pub fn new(inner: Arc<PartitionEngine>) -> Self {
        Self { inner }
    }

    pub fn engine(&self) -> &Arc<PartitionEngine> {
        &self.inner
    }

    pub async fn insert(
        &self,
        session: SessionContext,
        parent: TableId,
        rows: Vec<Row>,
    ) -> Result<InsertResult, AutopartError> {
        let engine = Arc::clone(&self.inner);
        run_blocking(move || engine.insert(&session, parent, rows)).await
    }

    pub async fn obtain_partition(
        &self,
        session: SessionContext,
        parent: TableId,
        value: Value,
    ) -> Result<TableId, AutopartError> {
        let engine = Arc::clone(&self.inner);
        run_blocking(move || engine.obtain_partition(&session, parent, &value)).await
    }
}

async fn run_blocking<F, T>(f: F) -> Result<T, AutopartError>
where
    F: FnOnce() -> Result<T, AutopartError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AutopartError::WorkerUnavailable(format!("blocking task failed: {e}")))?
}
