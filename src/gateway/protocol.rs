//! Wire messages exchanged between the orchestrator and worker agents.

use serde::{Deserialize, Serialize};

/// Worker asks for the next task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTaskRequest {
    pub agent_id: String,
}

/// A leased task, as handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: i64,
    pub operand1: f64,
    pub operand2: f64,
    /// Operator symbol (`+`, `-`, `*`, `/`).
    pub operator: String,
    /// Simulated execution time the worker should take.
    pub operation_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GetTaskResponse {
    Task(TaskAssignment),
    NoTask { retry_after_seconds: u64 },
}

/// Outcome of one computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Result { value: f64 },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResultRequest {
    pub task_id: i64,
    pub agent_id: String,
    /// Exactly one outcome is required; a missing one is a protocol error.
    #[serde(default)]
    pub outcome: Option<TaskOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResultResponse {
    pub acknowledged: bool,
}
