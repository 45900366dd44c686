//! Fixed-size pool of generation worker slots.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::generation::GenerationWorker;

pub struct WorkerPool {
    slots: JoinSet<()>,
    cancel: CancellationToken,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` slots sharing one worker. Each slot stops when `cancel`
    /// (or a parent of it) is cancelled.
    pub fn spawn(worker: Arc<GenerationWorker>, size: usize, cancel: CancellationToken) -> Self {
        let mut slots = JoinSet::new();
        for slot in 0..size {
            let worker = Arc::clone(&worker);
            let cancel = cancel.clone();
            slots.spawn(async move { worker.run(slot, cancel).await });
        }
        tracing::info!(size, "Worker pool started");
        Self {
            slots,
            cancel,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Cancel every slot and wait up to `grace` for them to stop; slots
    /// still running after that are aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        let joined = tokio::time::timeout(grace, async {
            while let Some(result) = self.slots.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Worker slot panicked");
                }
            }
        })
        .await;
        if joined.is_err() {
            tracing::warn!("Worker slots did not stop in time, aborting");
            self.slots.abort_all();
        }
        tracing::info!("Worker pool stopped");
    }
}
