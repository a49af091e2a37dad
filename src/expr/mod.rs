//! Expressions: parsing, the operation tree, and decomposition into tasks.

pub mod decompose;
pub mod parser;
pub mod tree;

pub use decompose::{ReadyOperation, decompose, ready_operations, refill};
pub use parser::parse;
pub use tree::{Node, Operator};
