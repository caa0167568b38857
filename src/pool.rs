//! Local execution on a fixed pool of workers.
//!
//! Workers pull tasks from one shared channel and push results to another.
//! Closing the task channel tells the workers there is nothing left; each of
//! them then pushes one [`PoolMessage::WorkerFinished`] and stops. The pool
//! drains the result channel until it has one result per task and one
//! finished marker per worker, in whatever order they come.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;

use crate::error::HoplaError;
use crate::executor::JobExecutor;
use crate::job::{JobResult, Task};

#[derive(Debug)]
pub enum PoolMessage {
    Result(JobResult),
    /// The worker with this index saw the end of the task stream.
    WorkerFinished(usize),
}

/// What a pool run produced.
#[derive(Debug)]
pub struct PoolOutcome {
    pub results: Vec<JobResult>,
    /// Number of finished markers received.
    pub finished_workers: usize,
}

pub struct WorkerPool {
    workers: usize,
    executor: Arc<dyn JobExecutor>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(workers: usize, executor: Arc<dyn JobExecutor>) -> Result<Self, HoplaError> {
        if workers == 0 {
            return Err(HoplaError::config("the worker pool needs at least one worker"));
        }
        Ok(Self { workers, executor })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs every task and waits for all workers to stop.
    pub async fn run(&self, tasks: Vec<Task>) -> PoolOutcome {
        let (task_tx, task_rx) = flume::unbounded::<Task>();
        let (result_tx, result_rx) = flume::unbounded::<PoolMessage>();

        let handles: Vec<_> = (0..self.workers)
            .map(|index| {
                tokio::spawn(worker(
                    index,
                    task_rx.clone(),
                    result_tx.clone(),
                    Arc::clone(&self.executor),
                ))
            })
            .collect();
        drop(task_rx);
        drop(result_tx);

        let expected = tasks.len();
        for task in tasks {
            if task_tx.send(task).is_err() {
                tracing::error!("all workers stopped before the tasks were queued");
                break;
            }
        }
        // End of the task stream.
        drop(task_tx);

        let mut results = Vec::with_capacity(expected);
        let mut finished_workers = 0;
        while results.len() < expected || finished_workers < self.workers {
            match result_rx.recv_async().await {
                Ok(PoolMessage::Result(result)) => {
                    tracing::info!(
                        job = %result.job_name,
                        exitcode = %result.exitcode(),
                        done = results.len() + 1,
                        total = expected,
                        "job finished"
                    );
                    results.push(result);
                }
                Ok(PoolMessage::WorkerFinished(index)) => {
                    tracing::debug!(worker = index, "worker finished");
                    finished_workers += 1;
                }
                // Every worker is gone.
                Err(_) => break,
            }
        }

        for handle in join_all(handles).await {
            if let Err(error) = handle {
                tracing::error!(%error, "worker crashed");
            }
        }

        PoolOutcome {
            results,
            finished_workers,
        }
    }
}

/// Runs tasks until the task channel is closed and drained, then reports
/// itself finished.
pub async fn worker(
    index: usize,
    tasks: flume::Receiver<Task>,
    results: flume::Sender<PoolMessage>,
    executor: Arc<dyn JobExecutor>,
) {
    while let Ok(task) = tasks.recv_async().await {
        let result = run_task(task, &executor).await;
        if results.send_async(PoolMessage::Result(result)).await.is_err() {
            break;
        }
    }
    let _ = results.send_async(PoolMessage::WorkerFinished(index)).await;
}

/// Runs one task. Failures and panics of the job end up in the result.
async fn run_task(task: Task, executor: &Arc<dyn JobExecutor>) -> JobResult {
    let Task { name, command } = task;
    let mut result = JobResult::new(name, &command);
    result
        .debug
        .insert("hostname".to_string(), Value::from(hostname()));
    result.debug.insert(
        "environ".to_string(),
        Value::Object(
            std::env::vars_os()
                .map(|(k, v)| {
                    (
                        k.to_string_lossy().into_owned(),
                        Value::from(v.to_string_lossy().into_owned()),
                    )
                })
                .collect(),
        ),
    );

    let executor = Arc::clone(executor);
    let job = tokio::spawn(async move { executor.execute(&command).await });
    match job.await {
        Ok(Ok(trace)) => {
            result.info.extend(trace);
            result.set_success();
        }
        Ok(Err(error)) => result.set_failure(error),
        Err(error) => result.set_failure(format!("job crashed: {}", error)),
    }
    result
}

/// Name of the machine running the workers.
pub fn hostname() -> String {
    match ::hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(error) => {
            tracing::warn!(%error, "cannot read the hostname");
            "localhost".to_string()
        }
    }
}
