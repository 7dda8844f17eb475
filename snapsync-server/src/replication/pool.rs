use super::job::{CancelHandle, ReplicationJob};
use super::types::{ReplicationError, ReplicationResult, TransferReport};
use super::worker::ReplicationWorker;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A job handed back by the pool together with its result
#[derive(Debug)]
pub struct JobOutcome {
    pub job: ReplicationJob,
    pub result: ReplicationResult<TransferReport>,
}

/// Fixed-size pool of transfer workers
///
/// Each dispatched job runs on tokio's blocking thread pool once one of
/// `size` permits is free, so at most `size` transfers stream at a time.
#[derive(Clone)]
pub struct ReplicationWorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    next_worker: Arc<AtomicUsize>,
    running: Arc<Mutex<HashMap<Uuid, CancelHandle>>>,
}

impl ReplicationWorkerPool {
    pub fn new(size: usize) -> Self {
        info!("Initializing replication worker pool with {} workers", size);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            next_worker: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently streaming
    pub fn running(&self) -> usize {
        self.running.lock().len()
    }

    /// Run `job` on the next free worker and wait for it to finish
    ///
    /// A job the pool could not run comes back with `PoolClosed` or
    /// `WorkerFailed` as its result; the coordinator has not been answered
    /// in that case. `Err` means the job itself was lost.
    pub async fn dispatch(&self, job: ReplicationJob) -> ReplicationResult<JobOutcome> {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return Ok(JobOutcome {
                job,
                result: Err(ReplicationError::PoolClosed),
            });
        };

        let id = job.id;
        self.running.lock().insert(id, job.cancel_handle());

        let worker_id = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.size.max(1);
        let worker = ReplicationWorker::new(format!("ReplicationWorker-{}", worker_id));

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut job = job;
            let result = panic::catch_unwind(AssertUnwindSafe(|| worker.proc(&mut job)))
                .unwrap_or_else(|cause| {
                    let message = panic_message(&*cause);
                    error!("[{}] worker panicked: {}", worker.name(), message);
                    Err(ReplicationError::WorkerFailed(message))
                });
            JobOutcome { job, result }
        });

        let outcome = handle.await;
        self.running.lock().remove(&id);

        outcome.map_err(|e| {
            warn!("Replication job {} did not complete: {}", id, e);
            ReplicationError::WorkerFailed(e.to_string())
        })
    }

    /// Ask every running transfer to stop at its next loop iteration
    pub fn cancel_all(&self) -> usize {
        let running = self.running.lock();
        for handle in running.values() {
            handle.cancel();
        }
        running.len()
    }

    /// Cancel running transfers and refuse new ones
    pub fn shutdown(&self) {
        let cancelled = self.cancel_all();
        self.permits.close();
        info!(
            "Replication worker pool shut down ({} transfers cancelled)",
            cancelled
        );
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
