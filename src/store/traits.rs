//! `TaskStore` trait: the single async interface for task and expression
//! persistence, and the concurrency contract behind it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::expr::Operator;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker to lease it.
    Pending,
    /// Leased by exactly one worker.
    InProgress,
    /// Result recorded.
    Done,
}

/// Lifecycle status of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

impl ExpressionStatus {
    /// `done` and `error` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExpressionStatus::Done | ExpressionStatus::Error)
    }
}

/// One atomic binary operation scheduled for remote execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub expression_id: i64,
    pub operator: Operator,
    pub operand1: f64,
    pub operand2: f64,
    /// Structural position of the node this task computes.
    pub node_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
    pub status: TaskStatus,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether this task computes the node at `path` with the given operation.
    pub fn matches(&self, path: &str, op: Operator, lhs: f64, rhs: f64) -> bool {
        self.node_path == path && self.operator == op && self.operand1 == lhs && self.operand2 == rhs
    }
}

/// One user-submitted formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expression {
    pub id: i64,
    pub owner_id: String,
    #[serde(rename = "expression")]
    pub source: String,
    pub status: ExpressionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic task/expression store.
///
/// Writers are serialised with respect to each other; readers may run
/// concurrently. [`TaskStore::lease_next_pending_task`] is a single atomic
/// unit: two concurrent callers never receive the same task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Append a new pending task. Duplicates are not rejected here.
    async fn create_task(
        &self,
        expression_id: i64,
        operator: Operator,
        operand1: f64,
        operand2: f64,
        node_path: &str,
    ) -> Result<i64, DatabaseError>;

    /// Move the oldest pending task to `in_progress` and return it.
    async fn lease_next_pending_task(&self) -> Result<Option<Task>, DatabaseError>;

    /// `in_progress` → `done` with `result`.
    ///
    /// Returns `false` (and changes nothing) if the task is not in progress.
    async fn complete_task(&self, task_id: i64, result: f64) -> Result<bool, DatabaseError>;

    /// `in_progress` → `pending`, bumping the retry counter.
    ///
    /// Returns `false` (and changes nothing) if the task is not in progress.
    async fn fail_task(&self, task_id: i64) -> Result<bool, DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, task_id: i64) -> Result<Option<Task>, DatabaseError>;

    /// All tasks of an expression, in creation order.
    async fn list_tasks(&self, expression_id: i64) -> Result<Vec<Task>, DatabaseError>;

    // ── Expressions ─────────────────────────────────────────────────

    /// Insert a new pending expression. Returns its ID.
    async fn create_expression(&self, owner_id: &str, source: &str) -> Result<i64, DatabaseError>;

    /// Get an expression, scoped to its owner.
    async fn get_expression(
        &self,
        expression_id: i64,
        owner_id: &str,
    ) -> Result<Option<Expression>, DatabaseError>;

    /// Get an expression regardless of owner (scheduler use).
    async fn get_expression_internal(
        &self,
        expression_id: i64,
    ) -> Result<Option<Expression>, DatabaseError>;

    /// An owner's expressions, newest first.
    async fn list_expressions_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<Expression>, DatabaseError>;

    /// Expressions still `pending` or `in_progress`, oldest first.
    async fn list_unfinished_expressions(&self) -> Result<Vec<Expression>, DatabaseError>;

    /// Set status, result and step trace of an expression.
    async fn update_expression_status(
        &self,
        expression_id: i64,
        status: ExpressionStatus,
        result: Option<f64>,
        steps: Option<&[String]>,
    ) -> Result<(), DatabaseError>;
}
