//! Persistence layer: libSQL-backed storage for expressions and tasks.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Expression, ExpressionStatus, Task, TaskStatus, TaskStore};
