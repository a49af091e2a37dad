//! Decomposition engine: turns the resolved frontier of a tree into tasks,
//! and folds completed task results back into a freshly parsed tree.
//!
//! Interior nodes are identified by their structural path from the root
//! (`L`/`R` moves, the root being the empty path) together with the
//! operation they carry. Matching on the operand values alone cannot tell
//! apart the two halves of `(2+3)+(2+3)`; the path can.

use tracing::debug;

use crate::error::DatabaseError;
use crate::store::{Task, TaskStatus, TaskStore};

use super::tree::{Node, Operator};

/// An interior node whose operands are both known.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyOperation {
    pub path: String,
    pub op: Operator,
    pub lhs: f64,
    pub rhs: f64,
}

impl ReadyOperation {
    fn is_scheduled_as(&self, task: &Task) -> bool {
        task.matches(&self.path, self.op, self.lhs, self.rhs)
    }
}

/// Collect every computable operation of `tree`, deepest first.
pub fn ready_operations(tree: &Node) -> Vec<ReadyOperation> {
    let mut ready = Vec::new();
    collect_ready(tree, &mut String::new(), &mut ready);
    ready
}

fn collect_ready(node: &Node, path: &mut String, out: &mut Vec<ReadyOperation>) {
    let Node::Op { left, right, .. } = node else {
        return;
    };

    path.push('L');
    collect_ready(left, path, out);
    path.pop();
    path.push('R');
    collect_ready(right, path, out);
    path.pop();

    if let Some((op, lhs, rhs)) = node.ready_operands() {
        out.push(ReadyOperation {
            path: path.clone(),
            op,
            lhs,
            rhs,
        });
    }
}

/// Create a pending task for every ready node of `tree` that has no task yet.
///
/// Returns the number of tasks created. A node never gets a task before both
/// of its children are literals, so evaluation order is deepest-first.
pub async fn decompose(
    tree: &Node,
    store: &dyn TaskStore,
    expression_id: i64,
) -> Result<usize, DatabaseError> {
    let ready = ready_operations(tree);
    if ready.is_empty() {
        return Ok(0);
    }

    let existing = store.list_tasks(expression_id).await?;
    let mut created = 0;
    for operation in ready {
        if existing.iter().any(|t| operation.is_scheduled_as(t)) {
            continue;
        }
        let task_id = store
            .create_task(
                expression_id,
                operation.op,
                operation.lhs,
                operation.rhs,
                &operation.path,
            )
            .await?;
        debug!(
            task_id,
            expression_id,
            path = %operation.path,
            "Scheduled {} {} {}",
            operation.lhs,
            operation.op,
            operation.rhs
        );
        created += 1;
    }
    Ok(created)
}

/// Replace every interior node that has a completed task by a leaf holding
/// that task's result.
///
/// Works bottom-up, so a chain of completed tasks collapses in one call.
pub fn refill(tree: &mut Node, completed: &[Task]) {
    refill_at(tree, &mut String::new(), completed);
}

fn refill_at(node: &mut Node, path: &mut String, completed: &[Task]) {
    if let Node::Op { left, right, .. } = node {
        path.push('L');
        refill_at(left, path, completed);
        path.pop();
        path.push('R');
        refill_at(right, path, completed);
        path.pop();
    }

    let Some((op, lhs, rhs)) = node.ready_operands() else {
        return;
    };
    let result = completed
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .find(|t| t.matches(path, op, lhs, rhs))
        .and_then(|t| t.result);
    if let Some(value) = result {
        *node = Node::Value(value);
    }
}
