//! Completion dispatcher: runs rescheduling passes off the request path.
//!
//! The gateway acknowledges a worker's submission as soon as the task row is
//! updated and hands the task ID to this pool. A fixed number of workers
//! drain a shared queue and call [`Scheduler::on_task_completed`]; store
//! errors are retried a bounded number of times. Anything still lost (crash,
//! exhausted retries) is picked up by [`Scheduler::recover`] at startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::error::Error;

use super::Scheduler;

/// Point-in-time counters of the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub enqueued: usize,
    pub processed: usize,
    pub failed: usize,
    pub retried: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

/// Shared state handed to every worker.
struct WorkerContext {
    scheduler: Arc<Scheduler>,
    config: DispatchConfig,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<i64>>>,
    counters: Arc<Counters>,
}

/// Bounded pool of rescheduling workers fed by task completions.
pub struct CompletionDispatcher {
    tx: mpsc::UnboundedSender<i64>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl CompletionDispatcher {
    /// Start `config.workers` workers on the current runtime.
    pub fn spawn(scheduler: Arc<Scheduler>, config: DispatchConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = config.workers.max(1);
        let handles = (0..workers)
            .map(|worker| {
                let ctx = WorkerContext {
                    scheduler: Arc::clone(&scheduler),
                    config: config.clone(),
                    rx: Arc::clone(&rx),
                    counters: Arc::clone(&counters),
                };
                tokio::spawn(run_worker(worker, ctx, shutdown_rx.clone()))
            })
            .collect();

        tracing::info!(workers, max_attempts = config.max_attempts, "Completion dispatcher started");

        Self {
            tx,
            shutdown_tx,
            handles: Mutex::new(handles),
            counters,
        }
    }

    /// Queue a rescheduling pass for `task_id`.
    ///
    /// Returns `false` once the dispatcher has shut down; the completion is
    /// then left for startup recovery.
    pub fn notify(&self, task_id: i64) -> bool {
        if *self.shutdown_tx.borrow() {
            return false;
        }
        match self.tx.send(task_id) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                tracing::warn!(task_id, "Dispatcher queue closed, completion dropped");
                false
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and wait for the workers to exit. A pass already
    /// running is finished; queued completions are dropped.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in futures::future::join_all(handles).await {
            if let Err(e) = handle {
                tracing::error!("Dispatcher worker panicked: {}", e);
            }
        }
        tracing::info!(stats = ?self.stats(), "Completion dispatcher stopped");
    }
}

async fn run_worker(worker: usize, ctx: WorkerContext, mut shutdown: watch::Receiver<bool>) {
    let rx = &ctx.rx;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            task_id = async { rx.lock().await.recv().await } => task_id,
        };
        let Some(task_id) = next else {
            break;
        };
        process(&ctx, worker, task_id).await;
    }
    tracing::debug!(worker, "Dispatcher worker exiting");
}

/// Only store failures are worth another attempt.
fn is_transient(error: &Error) -> bool {
    matches!(error, Error::Database(_))
}

async fn process(ctx: &WorkerContext, worker: usize, task_id: i64) {
    let max_attempts = ctx.config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match ctx.scheduler.on_task_completed(task_id).await {
            Ok(status) => {
                ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(worker, task_id, ?status, "Rescheduling pass complete");
                return;
            }
            Err(e) if !is_transient(&e) => {
                ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker, task_id, error = %e, "Rescheduling pass rejected");
                return;
            }
            Err(e) if attempt < max_attempts => {
                ctx.counters.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker, task_id, attempt, error = %e, "Rescheduling pass failed, retrying");
                tokio::time::sleep(ctx.config.retry_delay).await;
            }
            Err(e) => {
                ctx.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker, task_id, attempts = attempt, error = %e, "Rescheduling pass gave up");
            }
        }
    }
}
