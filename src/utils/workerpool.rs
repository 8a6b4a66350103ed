//! Fixed-size worker pool for heavyweight tool executions.
//!
//! A small number of workers drain a bounded queue; each job carries its
//! own deadline. Submitting to a full queue fails fast instead of queueing
//! unbounded work behind slow tools. The pool is shared behind an `Arc`,
//! so shutdown goes through `close(&self)` rather than consuming it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
    #[error("worker pool queue is full")]
    QueueFull,
    #[error("worker pool is shut down")]
    Closed,
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
}

type Job<T> = (
    BoxFuture<'static, T>,
    Duration,
    oneshot::Sender<Result<T, PoolError>>,
);

pub struct WorkerPool<T = String> {
    queue: mpsc::Sender<Job<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: CancellationToken,
    task_timeout: Duration,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(workers: usize, queue_depth: usize, task_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Job<T>>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        let closed = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let closed = closed.clone();
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            _ = closed.cancelled() => None,
                            job = async { rx.lock().await.recv().await } => job,
                        };
                        let Some((fut, timeout, reply)) = job else {
                            debug!(worker_id, "Worker pool closed, worker exiting");
                            break;
                        };
                        let result = match tokio::time::timeout(timeout, fut).await {
                            Ok(output) => Ok(output),
                            Err(_) => {
                                warn!(worker_id, ?timeout, "Pool task timed out");
                                Err(PoolError::Timeout(timeout))
                            }
                        };
                        let _ = reply.send(result);
                    }
                })
            })
            .collect();

        Self {
            queue: tx,
            workers: Mutex::new(handles),
            closed,
            task_timeout,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WORKERS, 32, DEFAULT_TASK_TIMEOUT)
    }

    /// Runs the future on a pool worker under the pool's task timeout.
    pub async fn run(&self, fut: BoxFuture<'static, T>) -> Result<T, PoolError> {
        self.run_with_timeout(fut, self.task_timeout).await
    }

    pub async fn run_with_timeout(
        &self,
        fut: BoxFuture<'static, T>,
        timeout: Duration,
    ) -> Result<T, PoolError> {
        if self.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue
            .try_send((fut, timeout, reply_tx))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PoolError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
            })?;
        reply_rx.await.map_err(|_| PoolError::Closed)?
    }

    /// Stops accepting work and waits for the workers to exit.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_tasks() {
        let pool: WorkerPool<String> = WorkerPool::new(2, 8, Duration::from_secs(1));
        let out = pool.run(Box::pin(async { "done".to_string() })).await;
        assert_eq!(out, Ok("done".to_string()));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let pool: WorkerPool<String> = WorkerPool::new(1, 8, Duration::from_millis(20));
        let out = pool
            .run(Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late".to_string()
            }))
            .await;
        assert_eq!(out, Err(PoolError::Timeout(Duration::from_millis(20))));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let pool: WorkerPool<String> = WorkerPool::new(1, 8, Duration::from_secs(1));
        pool.close().await;
        let out = pool.run(Box::pin(async { "x".to_string() })).await;
        assert_eq!(out, Err(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        let pool: WorkerPool<String> = WorkerPool::new(1, 1, Duration::from_secs(5));

        // Fill the worker and the single queue slot, then expect QueueFull.
        let mut oks = 0;
        let mut full = 0;
        let mut pending = Vec::new();
        for _ in 0..4 {
            let fut: BoxFuture<'static, String> = Box::pin(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                "x".to_string()
            });
            let (tx, rx) = oneshot::channel();
            match pool.queue.try_send((fut, Duration::from_secs(1), tx)) {
                Ok(()) => {
                    oks += 1;
                    pending.push(rx);
                }
                Err(mpsc::error::TrySendError::Full(_)) => full += 1,
                Err(e) => panic!("unexpected: {e}"),
            }
        }
        assert!(oks >= 1);
        assert!(full >= 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_parallelism_across_workers() {
        let pool: WorkerPool<String> = WorkerPool::new(4, 8, Duration::from_secs(2));
        let start = std::time::Instant::now();
        let futs: Vec<_> = (0..4)
            .map(|_| {
                pool.run(Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    "ok".to_string()
                }))
            })
            .collect();
        for result in futures::future::join_all(futs).await {
            assert!(result.is_ok());
        }
        // Four 100ms tasks on four workers should not take 400ms.
        assert!(start.elapsed() < Duration::from_millis(350));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_typed_results_pass_through() {
        let pool: WorkerPool<Result<u32, String>> = WorkerPool::new(1, 4, Duration::from_secs(1));
        let out = pool.run(Box::pin(async { Ok::<u32, String>(7) })).await;
        assert_eq!(out, Ok(Ok(7)));
        pool.close().await;
    }
}
