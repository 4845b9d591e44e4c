//! Worker pool draining the work queue

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};

use csr_signer_common::Error;
use csr_signer_queue::WorkQueue;

use crate::sync::Syncer;

/// Delay before a panicked worker is replaced
pub const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Process one key from the queue
///
/// Returns `false` once the queue is shut down and drained.
pub async fn process_next_work_item(queue: &WorkQueue<String>, syncer: &Syncer) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    match AssertUnwindSafe(syncer.sync(&key)).catch_unwind().await {
        Ok(Ok(outcome)) => {
            debug!(key = %key, ?outcome, "Sync succeeded");
            queue.forget(&key);
        }
        Ok(Err(e)) => {
            queue.add_rate_limited(key.clone());
            if is_expected_failure(&e) {
                info!(key = %key, error = %e, "Sync failed; will retry");
            } else {
                error!(key = %key, error = %e, "Sync failed");
            }
        }
        Err(panic) => {
            // Release the key so it is not held by a dead worker.
            queue.add_rate_limited(key.clone());
            queue.done(&key);
            std::panic::resume_unwind(panic);
        }
    }
    queue.done(&key);
    true
}

/// Failures that are part of normal operation and logged below `error`
///
/// A 409 means the request changed after it was read; the retry sees the
/// new version.
fn is_expected_failure(e: &Error) -> bool {
    e.is_ignorable() || e.is_conflict()
}

/// Pull and process keys until cancelled or the queue shuts down
pub async fn run_worker(queue: WorkQueue<String>, syncer: Arc<Syncer>, cancel: CancellationToken) {
    while !cancel.is_cancelled() && process_next_work_item(&queue, &syncer).await {}
}

/// Fixed-size pool of supervised workers
pub struct WorkerPool {
    workers: usize,
    restart_delay: Duration,
    span: Span,
}

impl WorkerPool {
    /// Create a pool of `workers` workers
    pub fn new(workers: usize, span: Span) -> Self {
        Self {
            workers,
            restart_delay: WORKER_RESTART_DELAY,
            span,
        }
    }

    /// Override the delay before a panicked worker is replaced
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Run the workers until all of them have exited
    ///
    /// A worker that panics is replaced after the restart delay unless
    /// `cancel` has fired.
    pub async fn run(self, queue: WorkQueue<String>, syncer: Arc<Syncer>, cancel: CancellationToken) {
        let mut set = JoinSet::new();
        let mut next_id = 0usize;
        let spawn = |set: &mut JoinSet<()>, id: usize| {
            let worker = run_worker(queue.clone(), syncer.clone(), cancel.clone());
            set.spawn(worker.instrument(tracing::debug_span!(parent: &self.span, "worker", id)));
        };

        for _ in 0..self.workers {
            spawn(&mut set, next_id);
            next_id += 1;
        }
        info!(parent: &self.span, workers = self.workers, "Workers started");

        while let Some(result) = set.join_next().await {
            let Err(e) = result else { continue };
            if !e.is_panic() {
                continue;
            }
            error!(parent: &self.span, error = %e, "Worker panicked");
            tokio::select! {
                _ = cancel.cancelled() => continue,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
            debug!(parent: &self.span, id = next_id, "Restarting worker");
            spawn(&mut set, next_id);
            next_id += 1;
        }
        info!(parent: &self.span, "Workers stopped");
    }
}
