use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Fixed set of workers pulling jobs from one shared FIFO queue.
///
/// The queue is bounded; `submit` waits while it is full. Workers exit once
/// the pool is shut down and the queue has drained.
pub struct WorkerPool<J> {
    tx: Option<mpsc::Sender<J>>,
    workers: Vec<JoinHandle<()>>,
}

impl<J> WorkerPool<J>
where
    J: Send + 'static,
{
    pub fn start<F, Fut>(size: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        let workers = (0..size.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => handler(job).await,
                            None => break,
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub async fn submit(&self, job: J) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("worker pool is shut down"))?;
        tx.send(job)
            .await
            .map_err(|_| anyhow!("worker pool queue closed"))
    }

    /// Closes the queue and waits for every worker to finish its remaining jobs.
    pub async fn shutdown(mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                error!(error = %err, "worker task failed");
            }
        }
    }
}
