//! Scheduler: drives an expression from submission to its final value.
//!
//! Nothing is held in memory between calls: every pass reparses the
//! expression text, folds in the results of completed tasks, and emits the
//! next wave of ready tasks. Progress after the first pass is driven only by
//! task completions (see [`dispatch::CompletionDispatcher`]).

pub mod dispatch;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::expr::{decompose, parse, refill};
use crate::store::{Expression, ExpressionStatus, Task, TaskStatus, TaskStore};

pub use dispatch::{CompletionDispatcher, DispatcherStats};

/// Orchestrates parsing, decomposition and expression state transitions.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    /// Serialises decomposition passes: two passes over the same expression
    /// must not both see a node as unscheduled.
    pass_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// First pass over a freshly submitted expression.
    ///
    /// A parse failure marks the expression `error` and is returned. A bare
    /// literal completes immediately; anything else moves to `in_progress`.
    pub async fn schedule_expression(&self, expression_id: i64, text: &str) -> Result<ExpressionStatus> {
        let _pass = self.pass_lock.lock().await;

        let tree = match parse(text) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(expression_id, error = %e, "Expression rejected by the parser");
                self.mark_error(expression_id, format!("parse error: {e}")).await;
                return Err(e.into());
            }
        };

        let created = match decompose(&tree, self.store.as_ref(), expression_id).await {
            Ok(created) => created,
            Err(e) => {
                error!(expression_id, error = %e, "Failed to schedule tasks");
                self.mark_error(expression_id, format!("scheduling failed: {e}")).await;
                return Err(e.into());
            }
        };

        if let Some(value) = tree.value() {
            info!(expression_id, value, "Expression is a literal, done immediately");
            let steps = vec![format!("result: {value}")];
            self.store
                .update_expression_status(expression_id, ExpressionStatus::Done, Some(value), Some(&steps))
                .await
                .inspect_err(|e| error!(expression_id, error = %e, "Failed to store literal result"))?;
            return Ok(ExpressionStatus::Done);
        }

        self.store
            .update_expression_status(expression_id, ExpressionStatus::InProgress, None, None)
            .await
            .inspect_err(|e| error!(expression_id, error = %e, "Failed to mark expression in progress"))?;
        info!(expression_id, tasks = created, "Expression scheduled");
        Ok(ExpressionStatus::InProgress)
    }

    /// Rescheduling pass after a task finished (successfully or not).
    ///
    /// Idempotent: running it again for the same task creates no duplicate
    /// tasks and leaves a terminal expression untouched.
    pub async fn on_task_completed(&self, task_id: i64) -> Result<ExpressionStatus> {
        let _pass = self.pass_lock.lock().await;

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(Error::NotFound { entity: "task", id: task_id })?;
        let expression = self
            .store
            .get_expression_internal(task.expression_id)
            .await?
            .ok_or(Error::NotFound {
                entity: "expression",
                id: task.expression_id,
            })?;

        if expression.status.is_terminal() {
            info!(
                task_id,
                expression_id = expression.id,
                status = ?expression.status,
                "Expression already finished, nothing to reschedule"
            );
            return Ok(expression.status);
        }

        self.advance(&expression).await
    }

    /// Re-run a pass for every expression left unfinished, e.g. after a
    /// restart dropped queued completions. Returns how many were visited.
    pub async fn recover(&self) -> Result<usize> {
        let unfinished = self.store.list_unfinished_expressions().await?;
        let count = unfinished.len();
        for expression in unfinished {
            let outcome = if expression.status == ExpressionStatus::Pending {
                self.schedule_expression(expression.id, &expression.source).await
            } else {
                let _pass = self.pass_lock.lock().await;
                self.advance(&expression).await
            };
            if let Err(e) = outcome {
                warn!(expression_id = expression.id, error = %e, "Recovery pass failed");
            }
        }
        if count > 0 {
            info!(count, "Recovered unfinished expressions");
        }
        Ok(count)
    }

    /// Reparse, refill from completed tasks, decompose, and update status.
    /// Caller holds the pass lock.
    async fn advance(&self, expression: &Expression) -> Result<ExpressionStatus> {
        let expression_id = expression.id;

        let mut tree = match parse(&expression.source) {
            Ok(tree) => tree,
            Err(e) => {
                error!(expression_id, error = %e, "Stored expression no longer parses");
                self.mark_error(expression_id, format!("parse error: {e}")).await;
                return Err(e.into());
            }
        };

        let completed: Vec<Task> = self
            .store
            .list_tasks(expression_id)
            .await
            .inspect_err(|e| error!(expression_id, error = %e, "Failed to list tasks"))?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Done)
            .collect();

        refill(&mut tree, &completed);
        let created = decompose(&tree, self.store.as_ref(), expression_id)
            .await
            .inspect_err(|e| error!(expression_id, error = %e, "Failed to schedule tasks"))?;

        if let Some(value) = tree.value() {
            let steps = step_trace(&completed);
            self.store
                .update_expression_status(expression_id, ExpressionStatus::Done, Some(value), Some(&steps))
                .await
                .inspect_err(|e| error!(expression_id, error = %e, "Failed to store result"))?;
            info!(expression_id, result = value, "Expression done");
            return Ok(ExpressionStatus::Done);
        }

        self.store
            .update_expression_status(expression_id, ExpressionStatus::InProgress, None, None)
            .await?;
        info!(expression_id, new_tasks = created, "Expression still in progress");
        Ok(ExpressionStatus::InProgress)
    }

    /// Best-effort transition to `error`; a failure here is only logged so
    /// the original error reaches the caller.
    async fn mark_error(&self, expression_id: i64, message: String) {
        let steps = [message];
        if let Err(e) = self
            .store
            .update_expression_status(expression_id, ExpressionStatus::Error, None, Some(&steps))
            .await
        {
            error!(expression_id, error = %e, "Failed to mark expression as error");
        }
    }
}

/// One line per completed task, in creation order.
fn step_trace(completed: &[Task]) -> Vec<String> {
    completed
        .iter()
        .filter_map(|t| {
            t.result
                .map(|r| format!("{} {} {} = {}", t.operand1, t.operator, t.operand2, r))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Operator;
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<LibSqlBackend>, Scheduler) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let scheduler = Scheduler::new(store.clone());
        (store, scheduler)
    }

    async fn submit(store: &LibSqlBackend, scheduler: &Scheduler, text: &str) -> (i64, Result<ExpressionStatus>) {
        let id = store.create_expression("alice", text).await.unwrap();
        let status = scheduler.schedule_expression(id, text).await;
        (id, status)
    }

    /// Lease the next task, check it, and complete it with its true value.
    async fn work_one(store: &LibSqlBackend, scheduler: &Scheduler) -> (Task, ExpressionStatus) {
        let task = store.lease_next_pending_task().await.unwrap().unwrap();
        let value = task.operator.apply(task.operand1, task.operand2).unwrap();
        assert!(store.complete_task(task.id, value).await.unwrap());
        let status = scheduler.on_task_completed(task.id).await.unwrap();
        (task, status)
    }

    async fn expression(store: &LibSqlBackend, id: i64) -> Expression {
        store.get_expression_internal(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn simple_sum_resolves_in_one_task() {
        let (store, scheduler) = setup().await;
        let (id, status) = submit(&store, &scheduler, "2+2").await;
        assert_eq!(status.unwrap(), ExpressionStatus::InProgress);

        let tasks = store.list_tasks(id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].operator, Operator::Add);
        assert_eq!((tasks[0].operand1, tasks[0].operand2), (2.0, 2.0));

        let (_, status) = work_one(&store, &scheduler).await;
        assert_eq!(status, ExpressionStatus::Done);

        let expr = expression(&store, id).await;
        assert_eq!(expr.status, ExpressionStatus::Done);
        assert_eq!(expr.result, Some(4.0));
        assert_eq!(expr.steps, Some(vec!["2 + 2 = 4".to_string()]));
    }

    #[tokio::test]
    async fn dependent_task_waits_for_its_operand() {
        let (store, scheduler) = setup().await;
        let (id, _) = submit(&store, &scheduler, "(1+2)*3").await;

        let tasks = store.list_tasks(id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].operator, Operator::Add);

        let (_, status) = work_one(&store, &scheduler).await;
        assert_eq!(status, ExpressionStatus::InProgress);

        let tasks = store.list_tasks(id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].operator, Operator::Mul);
        assert_eq!((tasks[1].operand1, tasks[1].operand2), (3.0, 3.0));

        let (_, status) = work_one(&store, &scheduler).await;
        assert_eq!(status, ExpressionStatus::Done);
        assert_eq!(expression(&store, id).await.result, Some(9.0));
    }

    #[tokio::test]
    async fn literal_completes_without_tasks() {
        let (store, scheduler) = setup().await;
        let (id, status) = submit(&store, &scheduler, "-12.5").await;
        assert_eq!(status.unwrap(), ExpressionStatus::Done);
        assert!(store.list_tasks(id).await.unwrap().is_empty());

        let expr = expression(&store, id).await;
        assert_eq!(expr.result, Some(-12.5));
    }

    #[tokio::test]
    async fn parse_failure_marks_expression_error() {
        let (store, scheduler) = setup().await;
        let (id, status) = submit(&store, &scheduler, "(1+2").await;
        assert!(matches!(status, Err(Error::Parse(_))));

        let expr = expression(&store, id).await;
        assert_eq!(expr.status, ExpressionStatus::Error);
        let steps = expr.steps.unwrap();
        assert!(steps[0].starts_with("parse error:"), "{steps:?}");
        assert!(store.list_tasks(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_literal_marks_expression_error() {
        let (store, scheduler) = setup().await;
        let huge = format!("1{}", "0".repeat(400));
        let (id, status) = submit(&store, &scheduler, &format!("{huge}-{huge}")).await;
        assert!(matches!(status, Err(Error::Parse(_))));

        assert_eq!(expression(&store, id).await.status, ExpressionStatus::Error);
        assert!(store.list_tasks(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overflowing_task_is_failed_not_completed() {
        let (store, scheduler) = setup().await;
        let big = format!("1{}", "0".repeat(300));
        let (id, _) = submit(&store, &scheduler, &format!("{big}*{big}")).await;

        let task = store.lease_next_pending_task().await.unwrap().unwrap();
        assert!(task.operator.apply(task.operand1, task.operand2).is_err());
        assert!(store.fail_task(task.id).await.unwrap());
        assert_eq!(scheduler.on_task_completed(task.id).await.unwrap(), ExpressionStatus::InProgress);

        let tasks = store.list_tasks(id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].result, None);
    }

    #[tokio::test]
    async fn repeated_completion_is_idempotent() {
        let (store, scheduler) = setup().await;
        let (id, _) = submit(&store, &scheduler, "(1+2)*(1+2)").await;
        assert_eq!(store.list_tasks(id).await.unwrap().len(), 2);

        let (first, _) = work_one(&store, &scheduler).await;
        for _ in 0..3 {
            scheduler.on_task_completed(first.id).await.unwrap();
        }
        assert_eq!(store.list_tasks(id).await.unwrap().len(), 2);

        work_one(&store, &scheduler).await;
        let (_, status) = work_one(&store, &scheduler).await;
        assert_eq!(status, ExpressionStatus::Done);
        assert_eq!(expression(&store, id).await.result, Some(9.0));

        // Re-delivery after the end changes nothing.
        let again = scheduler.on_task_completed(first.id).await.unwrap();
        assert_eq!(again, ExpressionStatus::Done);
        assert_eq!(store.list_tasks(id).await.unwrap().len(), 3);
        assert_eq!(expression(&store, id).await.result, Some(9.0));
    }

    #[tokio::test]
    async fn repeated_sub_expressions_get_separate_tasks() {
        let (store, scheduler) = setup().await;
        let (id, _) = submit(&store, &scheduler, "(2+3)+(2+3)").await;

        let tasks = store.list_tasks(id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].node_path, "L");
        assert_eq!(tasks[1].node_path, "R");

        work_one(&store, &scheduler).await;
        work_one(&store, &scheduler).await;
        let (last, status) = work_one(&store, &scheduler).await;
        assert_eq!(last.node_path, "");
        assert_eq!(status, ExpressionStatus::Done);
        assert_eq!(expression(&store, id).await.result, Some(10.0));
    }

    #[tokio::test]
    async fn failed_task_is_retried_without_duplicates() {
        let (store, scheduler) = setup().await;
        let (id, _) = submit(&store, &scheduler, "1/0").await;

        for attempt in 1..=2 {
            let task = store.lease_next_pending_task().await.unwrap().unwrap();
            assert!(store.fail_task(task.id).await.unwrap());
            let status = scheduler.on_task_completed(task.id).await.unwrap();
            assert_eq!(status, ExpressionStatus::InProgress);

            let tasks = store.list_tasks(id).await.unwrap();
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].status, TaskStatus::Pending);
            assert_eq!(tasks[0].retries, attempt);
        }
        assert_eq!(expression(&store, id).await.status, ExpressionStatus::InProgress);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (_store, scheduler) = setup().await;
        let err = scheduler.on_task_completed(77).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "task", id: 77 }));
    }

    #[tokio::test]
    async fn recover_schedules_pending_and_advances_in_progress() {
        let (store, scheduler) = setup().await;

        // Submitted but never scheduled.
        let pending = store.create_expression("alice", "4*5").await.unwrap();

        // Completed task whose rescheduling pass was lost.
        let (running, _) = submit(&store, &scheduler, "6-1").await;
        let task = store.lease_next_pending_task().await.unwrap().unwrap();
        store.complete_task(task.id, 5.0).await.unwrap();

        assert_eq!(scheduler.recover().await.unwrap(), 2);
        assert_eq!(expression(&store, pending).await.status, ExpressionStatus::InProgress);
        assert_eq!(store.list_tasks(pending).await.unwrap().len(), 1);

        let expr = expression(&store, running).await;
        assert_eq!(expr.status, ExpressionStatus::Done);
        assert_eq!(expr.result, Some(5.0));
    }
}
