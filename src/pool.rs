//! Fixed-width worker pool that runs fetch tasks out of order and hands results
//! back in task order.
//!
//! Workers pull [`FetchTask`]s from a shared queue and push `(index, result)` pairs
//! into a results channel. Ordering is restored by a final sort on `index`; a
//! failed or panicking task only loses its own slot.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::model::FetchTask;

/// A task that did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub index: usize,
    pub label: String,
    pub error: String,
}

#[derive(Debug)]
pub struct PoolOutcome<T> {
    /// Successful results in ascending `index` order.
    pub completed: Vec<(usize, T)>,
    /// Failures in ascending `index` order.
    pub failures: Vec<ItemFailure>,
}

impl<T> PoolOutcome<T> {
    pub fn into_values(self) -> (Vec<T>, Vec<ItemFailure>) {
        (
            self.completed.into_iter().map(|(_, value)| value).collect(),
            self.failures,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    width: usize,
}

impl WorkerPool {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    /// Runs `job` for every task and waits for all of them to finish.
    pub async fn run<T, F, Fut>(&self, tasks: Vec<FetchTask>, job: F) -> PoolOutcome<T>
    where
        T: Send + 'static,
        F: Fn(FetchTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let total = tasks.len();
        let (task_tx, task_rx) = mpsc::unbounded_channel::<FetchTask>();
        for task in tasks {
            // The receiver is alive until the workers below are spawned.
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) =
            mpsc::unbounded_channel::<(usize, String, Result<T, String>)>();
        let job = Arc::new(job);

        let mut workers = JoinSet::new();
        for worker in 0..self.width.min(total) {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let job = Arc::clone(&job);
            workers.spawn(async move {
                loop {
                    let next = { task_rx.lock().await.recv().await };
                    let Some(task) = next else {
                        break;
                    };
                    let index = task.index;
                    let label = task.label.clone();
                    debug!(worker, index, label = %label, "task started");

                    // Spawned separately so a panicking job becomes a per-item failure.
                    let result = match tokio::spawn((*job)(task)).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(err.to_string()),
                        Err(join_err) => Err(format!("task aborted: {join_err}")),
                    };
                    if result_tx.send((index, label, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut completed = Vec::with_capacity(total);
        let mut failures = Vec::new();
        while let Some((index, label, result)) = result_rx.recv().await {
            match result {
                Ok(value) => completed.push((index, value)),
                Err(error) => {
                    warn!(index, label = %label, error = %error, "task failed");
                    failures.push(ItemFailure {
                        index,
                        label,
                        error,
                    });
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "worker stopped unexpectedly");
            }
        }

        completed.sort_by_key(|(index, _)| *index);
        failures.sort_by_key(|failure| failure.index);
        PoolOutcome {
            completed,
            failures,
        }
    }
}
