use crate::catalog::types::{ColumnType, TableId, Value};
use crate::error::AutopartError;
use crate::session::{SessionContext, SessionKind, SessionRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::{debug, warn};

/// Synchronous request/response channel to an out-of-band creator.
pub trait WorkerChannel: Send + Sync {
    fn delegate_create(
        &self,
        parent: TableId,
        value: &Value,
        value_type: &ColumnType,
    ) -> Result<TableId, AutopartError>;
}

/// Work run inside a worker thread under that worker's own session.
pub type CreationHandler = Arc<
    dyn Fn(&SessionContext, TableId, &Value, &ColumnType) -> Result<TableId, AutopartError>
        + Send
        + Sync,
>;

struct CreationTask {
    parent: TableId,
    value: Value,
    value_type: ColumnType,
    response_tx: Sender<Result<TableId, AutopartError>>,
}

/// Fixed pool of creation workers. Requests for one parent always land on the
/// same worker.
pub struct CreationWorkerPool {
    workers: Vec<Sender<CreationTask>>,
    queued_tasks: Arc<AtomicUsize>,
    timeout: Duration,
}

impl std::fmt::Debug for CreationWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreationWorkerPool")
            .field("workers", &self.workers.len())
            .field("queued_tasks", &self.queued_tasks())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CreationWorkerPool {
    pub fn new(
        worker_threads: usize,
        timeout: Duration,
        sessions: &SessionRegistry,
        handler: CreationHandler,
    ) -> Result<Self, AutopartError> {
        let worker_count = worker_threads.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        let queued_tasks = Arc::new(AtomicUsize::new(0));
        for idx in 0..worker_count {
            let (tx, rx) = std_mpsc::channel::<CreationTask>();
            let q = Arc::clone(&queued_tasks);
            let session = sessions.open(SessionKind::Worker);
            let handler = Arc::clone(&handler);
            std::thread::Builder::new()
                .name(format!("autopart-worker-{idx}"))
                .spawn(move || run_worker(rx, q, session, handler))
                .map_err(|e| {
                    AutopartError::WorkerUnavailable(format!("failed to start worker: {e}"))
                })?;
            workers.push(tx);
        }
        Ok(Self {
            workers,
            queued_tasks,
            timeout,
        })
    }

    pub fn queued_tasks(&self) -> usize {
        self.queued_tasks.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl WorkerChannel for CreationWorkerPool {
    fn delegate_create(
        &self,
        parent: TableId,
        value: &Value,
        value_type: &ColumnType,
    ) -> Result<TableId, AutopartError> {
        let (response_tx, response_rx) = std_mpsc::channel();
        let shard = shard_for_parent(parent, self.workers.len());
        self.queued_tasks.fetch_add(1, Ordering::Relaxed);
        let task = CreationTask {
            parent,
            value: value.clone(),
            value_type: value_type.clone(),
            response_tx,
        };
        if let Err(e) = self.workers[shard].send(task) {
            self.queued_tasks.fetch_sub(1, Ordering::Relaxed);
            return Err(AutopartError::WorkerUnavailable(format!(
                "creation worker unavailable: {e}"
            )));
        }
        match response_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(AutopartError::WorkerTimeout),
            Err(RecvTimeoutError::Disconnected) => Err(AutopartError::WorkerUnavailable(
                "creation worker dropped the request".into(),
            )),
        }
    }
}

fn run_worker(
    rx: Receiver<CreationTask>,
    queued_tasks: Arc<AtomicUsize>,
    session: SessionContext,
    handler: CreationHandler,
) {
    while let Ok(task) = rx.recv() {
        queued_tasks.fetch_sub(1, Ordering::Relaxed);
        let response_tx = task.response_tx.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler(&session, task.parent, &task.value, &task.value_type)
        }));
        let response = match outcome {
            Ok(Ok(id)) => {
                debug!(parent = %task.parent, partition = %id, session = %session.id, "worker created partitions");
                Ok(id)
            }
            Ok(Err(e)) => {
                warn!(
                    parent = %task.parent,
                    value = %task.value,
                    session = %session.id,
                    code = e.code_str(),
                    error = %e,
                    "partition creation failed in worker"
                );
                Err(e)
            }
            Err(_) => {
                warn!(parent = %task.parent, session = %session.id, "creation worker panicked");
                Err(AutopartError::WorkerUnavailable(
                    "creation worker panicked".into(),
                ))
            }
        };
        let _ = response_tx.send(response);
    }
}

fn shard_for_parent(parent: TableId, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    (parent.0 % shard_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::{CreationHandler, CreationWorkerPool, WorkerChannel};
    use crate::catalog::types::{ColumnType, TableId, Value};
    use crate::error::{AutopartError, AutopartErrorCode};
    use crate::session::SessionRegistry;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool(handler: CreationHandler, timeout: Duration) -> CreationWorkerPool {
        CreationWorkerPool::new(2, timeout, &SessionRegistry::default(), handler).expect("pool")
    }

    #[test]
    fn handler_runs_under_a_worker_session() {
        let pool = pool(
            Arc::new(|session, parent, _, _| {
                assert!(session.is_worker());
                Ok(TableId(parent.0 + 100))
            }),
            Duration::from_secs(5),
        );
        let id = pool
            .delegate_create(TableId(3), &Value::Integer(1), &ColumnType::Integer)
            .expect("delegate");
        assert_eq!(id, TableId(103));
        assert_eq!(pool.worker_count(), 2);
    }

    #[test]
    fn failures_and_panics_come_back_as_errors() {
        let failing = pool(
            Arc::new(|_, _, _, _| Err(AutopartError::Validation("nope".into()))),
            Duration::from_secs(5),
        );
        let err = failing
            .delegate_create(TableId(1), &Value::Integer(1), &ColumnType::Integer)
            .expect_err("fails");
        assert_eq!(err.code(), AutopartErrorCode::Validation);

        let panicking = pool(Arc::new(|_, _, _, _| panic!("boom")), Duration::from_secs(5));
        let err = panicking
            .delegate_create(TableId(1), &Value::Integer(1), &ColumnType::Integer)
            .expect_err("panics");
        assert_eq!(err.code(), AutopartErrorCode::WorkerUnavailable);
        // The worker survives a panicking task.
        let err = panicking
            .delegate_create(TableId(1), &Value::Integer(1), &ColumnType::Integer)
            .expect_err("still answers");
        assert_eq!(err.code(), AutopartErrorCode::WorkerUnavailable);
    }

    #[test]
    fn slow_worker_times_out() {
        let pool = pool(
            Arc::new(|_, parent, _, _| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(parent)
            }),
            Duration::from_millis(10),
        );
        let err = pool
            .delegate_create(TableId(1), &Value::Integer(1), &ColumnType::Integer)
            .expect_err("timeout");
        assert_eq!(err.code(), AutopartErrorCode::WorkerTimeout);
    }
}
