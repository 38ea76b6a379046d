//! Worker pool lifecycle: spawning, supervision, and shutdown.
//!
//! Workers are plain tokio tasks sharing a [`CancellationToken`].
//! Graceful shutdown cancels the token and waits for workers to finish
//! their current batch; after the timeout, stragglers are aborted so
//! shutdown always terminates. Restarting the pool never loses queued
//! envelopes because the queue is owned by the engine, not the pool.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    worker::DeliveryWorker,
};

/// Handle to a set of running delivery workers.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns one task per worker and returns the pool handle.
    pub(crate) fn spawn(workers: Vec<DeliveryWorker>, shutdown_timeout: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handles = workers
            .into_iter()
            .map(|worker| {
                let token = cancel.clone();
                tokio::spawn(worker.run(token))
            })
            .collect::<Vec<_>>();

        info!(worker_count = handles.len(), "worker pool started");
        Self { cancel, handles, shutdown_timeout }
    }

    /// Number of workers the pool was started with.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops accepting new batches and waits for in-flight work.
    ///
    /// Envelopes being delivered when shutdown starts are settled
    /// before their worker exits. Workers still running after the
    /// shutdown timeout are aborted; their leased envelopes reappear
    /// after lease expiry.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if any worker had to be
    /// aborted.
    pub async fn shutdown_graceful(mut self) -> Result<()> {
        info!("worker pool shutting down");
        self.cancel.cancel();

        // The handles must survive a cancelled drain so the timeout
        // branch can still abort the stragglers.
        let mut handles = std::mem::take(&mut self.handles);

        let drain = async {
            for (worker_id, handle) in handles.iter_mut().enumerate() {
                if let Err(join_error) = handle.await {
                    if join_error.is_panic() {
                        error!(worker_id, error = %join_error, "worker panicked");
                    }
                }
            }
        };

        match tokio::time::timeout(self.shutdown_timeout, drain).await {
            Ok(()) => {
                info!("worker pool stopped");
                Ok(())
            },
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "shutdown timed out, aborting workers");
                for handle in &handles {
                    handle.abort();
                }
                Err(DeliveryError::ShutdownTimeout { timeout: self.shutdown_timeout })
            },
        }
    }

    /// Aborts all workers without waiting.
    pub fn shutdown_immediate(mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping the pool must not leave orphaned workers running.
        self.cancel.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}
