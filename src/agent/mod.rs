//! Worker agents: lease a task, compute it, report the outcome.
//!
//! An [`Agent`] talks to the orchestrator through a [`TaskSource`]: the
//! in-process [`WorkerGateway`](crate::gateway::WorkerGateway) or the HTTP
//! client in [`http`]. Either way the loop is the same.

pub mod compute;
pub mod http;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::gateway::protocol::{GetTaskResponse, SubmitResultRequest, SubmitResultResponse, TaskOutcome};

pub use compute::compute;
pub use http::HttpTaskSource;

/// Upper bound of the random delay added to an idle back-off.
const IDLE_JITTER_MS: u64 = 250;

/// Where an agent gets its work from and reports back to.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn get_task(&self, agent_id: &str) -> Result<GetTaskResponse>;

    async fn submit_result(&self, request: SubmitResultRequest) -> Result<SubmitResultResponse>;
}

/// What a single loop iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum Iteration {
    /// Nothing to do; come back after `retry_after`.
    Idle { retry_after: Duration },
    /// Task computed and its value submitted.
    Completed { task_id: i64, value: f64 },
    /// Task could not be computed; the failure was submitted.
    Failed { task_id: i64, message: String },
}

/// A single polling worker.
pub struct Agent {
    id: String,
    source: Arc<dyn TaskSource>,
    error_backoff: Duration,
}

impl Agent {
    pub fn new(id: impl Into<String>, source: Arc<dyn TaskSource>, error_backoff: Duration) -> Self {
        Self {
            id: id.into(),
            source,
            error_backoff,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lease at most one task, compute it and submit the outcome.
    ///
    /// The call takes at least the task's `operation_time_ms`.
    pub async fn run_once(&self) -> Result<Iteration> {
        let assignment = match self.source.get_task(&self.id).await? {
            GetTaskResponse::NoTask { retry_after_seconds } => {
                return Ok(Iteration::Idle {
                    retry_after: Duration::from_secs(retry_after_seconds),
                });
            }
            GetTaskResponse::Task(assignment) => assignment,
        };

        let started = Instant::now();
        let outcome = match compute(&assignment.operator, assignment.operand1, assignment.operand2) {
            Ok(value) => TaskOutcome::Result { value },
            Err(e) => TaskOutcome::Error {
                message: e.to_string(),
            },
        };
        let target = Duration::from_millis(assignment.operation_time_ms);
        if let Some(remaining) = target.checked_sub(started.elapsed()) {
            tokio::time::sleep(remaining).await;
        }

        debug!(
            agent = %self.id,
            task_id = assignment.id,
            ?outcome,
            "{} {} {}",
            assignment.operand1,
            assignment.operator,
            assignment.operand2
        );
        self.source
            .submit_result(SubmitResultRequest {
                task_id: assignment.id,
                agent_id: self.id.clone(),
                outcome: Some(outcome.clone()),
            })
            .await?;

        Ok(match outcome {
            TaskOutcome::Result { value } => Iteration::Completed {
                task_id: assignment.id,
                value,
            },
            TaskOutcome::Error { message } => Iteration::Failed {
                task_id: assignment.id,
                message,
            },
        })
    }

    /// Poll until `shutdown` flips to `true`. A task in hand is always
    /// finished and submitted before stopping.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(agent = %self.id, "Agent started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(Iteration::Idle { retry_after }) => {
                    let jitter = rand::thread_rng().gen_range(0..=IDLE_JITTER_MS);
                    retry_after + Duration::from_millis(jitter)
                }
                Ok(Iteration::Completed { .. }) => Duration::ZERO,
                Ok(Iteration::Failed { task_id, message }) => {
                    warn!(agent = %self.id, task_id, error = %message, "Task failed");
                    Duration::ZERO
                }
                Err(e) => {
                    warn!(agent = %self.id, error = %e, "Orchestrator unreachable, backing off");
                    self.error_backoff
                }
            };

            if !pause.is_zero() {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        info!(agent = %self.id, "Agent stopped");
    }
}

/// Spawn `count` agents sharing one task source.
pub fn spawn_pool(
    count: usize,
    source: Arc<dyn TaskSource>,
    error_backoff: Duration,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| {
            let agent = Agent::new(
                format!("agent-{}", Uuid::new_v4().simple()),
                Arc::clone(&source),
                error_backoff,
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { agent.run(shutdown).await })
        })
        .collect()
}
