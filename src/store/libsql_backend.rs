//! libSQL backend: async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; an async read/write lock in front of it
//! serialises writers while letting readers proceed together.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::expr::Operator;
use crate::store::migrations;
use crate::store::traits::{Expression, ExpressionStatus, Task, TaskStatus, TaskStore};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Write half for every mutation, read half for every query.
    lock: RwLock<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            lock: RwLock::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 timestamp, so text order is time order.
fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn task_status_to_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Done => "done",
    }
}

fn str_to_task_status(s: &str) -> TaskStatus {
    match s {
        "in_progress" => TaskStatus::InProgress,
        "done" => TaskStatus::Done,
        _ => TaskStatus::Pending,
    }
}

fn expr_status_to_str(status: ExpressionStatus) -> &'static str {
    match status {
        ExpressionStatus::Pending => "pending",
        ExpressionStatus::InProgress => "in_progress",
        ExpressionStatus::Done => "done",
        ExpressionStatus::Error => "error",
    }
}

fn str_to_expr_status(s: &str) -> ExpressionStatus {
    match s {
        "in_progress" => ExpressionStatus::InProgress,
        "done" => ExpressionStatus::Done,
        "error" => ExpressionStatus::Error,
        _ => ExpressionStatus::Pending,
    }
}

/// Convert `Option<f64>` to libsql Value.
fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

const TASK_COLUMNS: &str = "id, expression_id, operator, operand1, operand2, node_path, result, status, retries, created_at, updated_at";

const EXPRESSION_COLUMNS: &str =
    "id, owner_id, source, status, result, steps, created_at, updated_at";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));

    let operator_str: String = row.get(2).map_err(read)?;
    let operator: Operator = operator_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("task operator: {e}")))?;
    let status_str: String = row.get(7).map_err(read)?;
    let retries: i64 = row.get(8).map_err(read)?;
    let created_str: String = row.get(9).map_err(read)?;
    let updated_str: String = row.get(10).map_err(read)?;

    Ok(Task {
        id: row.get(0).map_err(read)?,
        expression_id: row.get(1).map_err(read)?,
        operator,
        operand1: row.get(3).map_err(read)?,
        operand2: row.get(4).map_err(read)?,
        node_path: row.get(5).map_err(read)?,
        result: row.get::<f64>(6).ok(),
        status: str_to_task_status(&status_str),
        retries: u32::try_from(retries).unwrap_or(u32::MAX),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an Expression. Column order matches EXPRESSION_COLUMNS.
fn row_to_expression(row: &libsql::Row) -> Result<Expression, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("expression row parse: {e}"));

    let status_str: String = row.get(3).map_err(read)?;
    let steps = match row.get::<String>(5).ok() {
        Some(json) => Some(
            serde_json::from_str::<Vec<String>>(&json)
                .map_err(|e| DatabaseError::Serialization(format!("expression steps: {e}")))?,
        ),
        None => None,
    };
    let created_str: String = row.get(6).map_err(read)?;
    let updated_str: String = row.get(7).map_err(read)?;

    Ok(Expression {
        id: row.get(0).map_err(read)?,
        owner_id: row.get(1).map_err(read)?,
        source: row.get(2).map_err(read)?,
        status: str_to_expr_status(&status_str),
        result: row.get::<f64>(4).ok(),
        steps,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_expressions(
    mut rows: libsql::Rows,
    context: &str,
) -> Result<Vec<Expression>, DatabaseError> {
    let mut expressions = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match row_to_expression(&row) {
                Ok(expr) => expressions.push(expr),
                Err(e) => warn!("{context}: skipping expression row: {e}"),
            },
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{context}: {e}"))),
        }
    }
    Ok(expressions)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.write().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(
        &self,
        expression_id: i64,
        operator: Operator,
        operand1: f64,
        operand2: f64,
        node_path: &str,
    ) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        let now = now_str();
        conn.execute(
            "INSERT INTO tasks (expression_id, operator, operand1, operand2, node_path, status, retries, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
            params![expression_id, operator.as_str(), operand1, operand2, node_path, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        let task_id = conn.last_insert_rowid();
        debug!(task_id, expression_id, "Task inserted into DB");
        Ok(task_id)
    }

    async fn lease_next_pending_task(&self) -> Result<Option<Task>, DatabaseError> {
        let _guard = self.lock.write().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("lease begin: {e}")))?;

        let mut rows = tx
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lease select: {e}")))?;

        let mut task = match rows.next().await {
            Ok(Some(row)) => row_to_task(&row)?,
            Ok(None) => {
                drop(rows);
                tx.rollback()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("lease rollback: {e}")))?;
                return Ok(None);
            }
            Err(e) => return Err(DatabaseError::Query(format!("lease select: {e}"))),
        };
        drop(rows);

        let now = now_str();
        tx.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                task_status_to_str(TaskStatus::InProgress),
                now.clone(),
                task.id,
                task_status_to_str(TaskStatus::Pending)
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("lease update: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("lease commit: {e}")))?;

        task.status = TaskStatus::InProgress;
        task.updated_at = parse_datetime(&now);
        info!(
            task_id = task.id,
            expression_id = task.expression_id,
            retries = task.retries,
            "Task leased"
        );
        Ok(Some(task))
    }

    async fn complete_task(&self, task_id: i64, result: f64) -> Result<bool, DatabaseError> {
        let _guard = self.lock.write().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, result = ?2, updated_at = ?3 WHERE id = ?4 AND status = ?5",
                params![
                    task_status_to_str(TaskStatus::Done),
                    result,
                    now_str(),
                    task_id,
                    task_status_to_str(TaskStatus::InProgress)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_task: {e}")))?;

        if affected == 0 {
            warn!(task_id, "Ignoring completion of a task that is not in progress");
            return Ok(false);
        }
        info!(task_id, result, "Task completed");
        Ok(true)
    }

    async fn fail_task(&self, task_id: i64) -> Result<bool, DatabaseError> {
        let _guard = self.lock.write().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, retries = retries + 1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    task_status_to_str(TaskStatus::Pending),
                    now_str(),
                    task_id,
                    task_status_to_str(TaskStatus::InProgress)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_task: {e}")))?;

        if affected == 0 {
            warn!(task_id, "Ignoring failure of a task that is not in progress");
            return Ok(false);
        }
        info!(task_id, "Task failed, returned to the pending pool");
        Ok(true)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>, DatabaseError> {
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(&self, expression_id: i64) -> Result<Vec<Task>, DatabaseError> {
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE expression_id = ?1 ORDER BY id ASC"),
                params![expression_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_task(&row) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!(expression_id, "Skipping task row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_tasks: {e}"))),
            }
        }
        Ok(tasks)
    }

    // ── Expressions ─────────────────────────────────────────────────

    async fn create_expression(&self, owner_id: &str, source: &str) -> Result<i64, DatabaseError> {
        let _guard = self.lock.write().await;
        let conn = self.conn();
        let now = now_str();
        conn.execute(
            "INSERT INTO expressions (owner_id, source, status, created_at, updated_at) VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![owner_id, source, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_expression: {e}")))?;

        let expression_id = conn.last_insert_rowid();
        info!(expression_id, owner_id, source, "Expression created");
        Ok(expression_id)
    }

    async fn get_expression(
        &self,
        expression_id: i64,
        owner_id: &str,
    ) -> Result<Option<Expression>, DatabaseError> {
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXPRESSION_COLUMNS} FROM expressions WHERE id = ?1 AND owner_id = ?2"
                ),
                params![expression_id, owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_expression: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_expression(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_expression: {e}"))),
        }
    }

    async fn get_expression_internal(
        &self,
        expression_id: i64,
    ) -> Result<Option<Expression>, DatabaseError> {
        let _guard = self.lock.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EXPRESSION_COLUMNS} FROM expressions WHERE id = ?1"),
                params![expression_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_expression_internal: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_expression(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_expression_internal: {e}"))),
        }
    }

    async fn list_expressions_by_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<Expression>, DatabaseError> {
        let _guard = self.lock.read().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXPRESSION_COLUMNS} FROM expressions WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC"
                ),
                params![owner_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expressions_by_owner: {e}")))?;

        collect_expressions(rows, "list_expressions_by_owner").await
    }

    async fn list_unfinished_expressions(&self) -> Result<Vec<Expression>, DatabaseError> {
        let _guard = self.lock.read().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXPRESSION_COLUMNS} FROM expressions WHERE status IN ('pending', 'in_progress') ORDER BY id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unfinished_expressions: {e}")))?;

        collect_expressions(rows, "list_unfinished_expressions").await
    }

    async fn update_expression_status(
        &self,
        expression_id: i64,
        status: ExpressionStatus,
        result: Option<f64>,
        steps: Option<&[String]>,
    ) -> Result<(), DatabaseError> {
        let steps_json = steps
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("expression steps: {e}")))?;

        let _guard = self.lock.write().await;
        self.conn()
            .execute(
                "UPDATE expressions SET status = ?1, result = ?2, steps = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    expr_status_to_str(status),
                    opt_real(result),
                    opt_text_owned(steps_json),
                    now_str(),
                    expression_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_expression_status: {e}")))?;

        debug!(expression_id, status = ?status, "Expression status updated in DB");
        Ok(())
    }
}
