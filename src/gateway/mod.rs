//! Gateway: the orchestrator's outward surfaces.
//!
//! - [`WorkerGateway`] serves worker agents: lease a task, submit a result.
//! - [`SubmissionService`] serves clients: submit an expression, read it back.
//! - [`routes`] exposes both over HTTP.

pub mod protocol;
pub mod routes;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::agent::TaskSource;
use crate::config::OperationTimes;
use crate::error::{ProtocolError, Result};
use crate::scheduler::{CompletionDispatcher, Scheduler};
use crate::store::{Expression, TaskStore};

use protocol::{
    GetTaskRequest, GetTaskResponse, SubmitResultRequest, SubmitResultResponse, TaskAssignment,
    TaskOutcome,
};

/// Worker-facing RPC surface.
pub struct WorkerGateway {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<CompletionDispatcher>,
    times: OperationTimes,
    retry_after_secs: u64,
}

impl WorkerGateway {
    pub fn new(
        store: Arc<dyn TaskStore>,
        dispatcher: Arc<CompletionDispatcher>,
        times: OperationTimes,
        retry_after_secs: u64,
    ) -> Self {
        Self {
            store,
            dispatcher,
            times,
            retry_after_secs,
        }
    }

    /// Lease the oldest pending task, or tell the worker when to come back.
    pub async fn get_task(&self, request: &GetTaskRequest) -> Result<GetTaskResponse> {
        let Some(task) = self.store.lease_next_pending_task().await? else {
            return Ok(GetTaskResponse::NoTask {
                retry_after_seconds: self.retry_after_secs,
            });
        };

        let operator = task.operator.as_str();
        debug!(
            task_id = task.id,
            agent = %request.agent_id,
            "Leased {} {} {}",
            task.operand1,
            operator,
            task.operand2
        );
        Ok(GetTaskResponse::Task(TaskAssignment {
            id: task.id,
            operand1: task.operand1,
            operand2: task.operand2,
            operator: operator.to_string(),
            operation_time_ms: self.times.for_operator(operator),
        }))
    }

    /// Record a worker's outcome and queue the rescheduling pass.
    ///
    /// A submission for a task that is not in progress is acknowledged with
    /// `false` and changes nothing.
    pub async fn submit_result(&self, request: &SubmitResultRequest) -> Result<SubmitResultResponse> {
        let task_id = request.task_id;
        let updated = match &request.outcome {
            None => return Err(ProtocolError::MissingOutcome { task_id }.into()),
            Some(TaskOutcome::Result { value }) => {
                debug!(task_id, agent = %request.agent_id, value, "Result received");
                self.store.complete_task(task_id, *value).await?
            }
            Some(TaskOutcome::Error { message }) => {
                warn!(task_id, agent = %request.agent_id, error = %message, "Worker reported failure");
                self.store.fail_task(task_id).await?
            }
        };

        if updated {
            self.dispatcher.notify(task_id);
        }
        Ok(SubmitResultResponse {
            acknowledged: updated,
        })
    }
}

#[async_trait]
impl TaskSource for WorkerGateway {
    async fn get_task(&self, agent_id: &str) -> Result<GetTaskResponse> {
        WorkerGateway::get_task(
            self,
            &GetTaskRequest {
                agent_id: agent_id.to_string(),
            },
        )
        .await
    }

    async fn submit_result(&self, request: SubmitResultRequest) -> Result<SubmitResultResponse> {
        WorkerGateway::submit_result(self, &request).await
    }
}

/// Client-facing submission and lookup.
pub struct SubmissionService {
    store: Arc<dyn TaskStore>,
    scheduler: Arc<Scheduler>,
}

impl SubmissionService {
    pub fn new(store: Arc<dyn TaskStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Store the expression and schedule it in the background.
    ///
    /// Returns as soon as the expression row exists; parse failures surface
    /// later as status `error`.
    pub async fn submit(&self, owner_id: &str, text: &str) -> Result<i64> {
        let expression_id = self.store.create_expression(owner_id, text).await?;
        info!(expression_id, owner = %owner_id, "Expression submitted");

        let scheduler = Arc::clone(&self.scheduler);
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = scheduler.schedule_expression(expression_id, &text).await {
                debug!(expression_id, error = %e, "Initial scheduling failed");
            }
        });
        Ok(expression_id)
    }

    pub async fn get_expression(&self, expression_id: i64, owner_id: &str) -> Result<Option<Expression>> {
        Ok(self.store.get_expression(expression_id, owner_id).await?)
    }

    pub async fn list_expressions(&self, owner_id: &str) -> Result<Vec<Expression>> {
        Ok(self.store.list_expressions_by_owner(owner_id).await?)
    }
}
