//! Operation tree: the binary tree a parsed expression is turned into.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ComputeError;

/// One of the four supported binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
        }
    }

    /// Apply the operator to two operands.
    /// Infinite or NaN results are rejected: they cannot be stored or sent.
    pub fn apply(self, lhs: f64, rhs: f64) -> Result<f64, ComputeError> {
        let value = match self {
            Operator::Add => lhs + rhs,
            Operator::Sub => lhs - rhs,
            Operator::Mul => lhs * rhs,
            Operator::Div if rhs == 0.0 => return Err(ComputeError::DivisionByZero),
            Operator::Div => lhs / rhs,
        };
        if !value.is_finite() {
            return Err(ComputeError::NonFinite {
                operator: self.as_str(),
            });
        }
        Ok(value)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Operator::Add),
            "-" => Ok(Operator::Sub),
            "*" => Ok(Operator::Mul),
            "/" => Ok(Operator::Div),
            other => Err(ComputeError::UnsupportedOperator(other.to_string())),
        }
    }
}

/// A node of the operation tree.
///
/// Leaves hold a literal (or an already computed sub-result); interior nodes
/// always have exactly two children. Unary minus never appears here: the
/// parser folds it into a literal or a multiplication by `-1`.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Value(f64),
    Op {
        op: Operator,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    pub fn binary(op: Operator, left: Node, right: Node) -> Self {
        Node::Op {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// The literal value, if this node is a leaf.
    pub fn value(&self) -> Option<f64> {
        match self {
            Node::Value(v) => Some(*v),
            Node::Op { .. } => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Value(_))
    }

    /// For an interior node whose children are both leaves, the operation
    /// that can be computed right now.
    pub fn ready_operands(&self) -> Option<(Operator, f64, f64)> {
        match self {
            Node::Op { op, left, right } => Some((*op, left.value()?, right.value()?)),
            Node::Value(_) => None,
        }
    }

    /// Number of interior nodes, i.e. the number of tasks a full resolution
    /// of this tree needs.
    pub fn operation_count(&self) -> usize {
        match self {
            Node::Value(_) => 0,
            Node::Op { left, right, .. } => 1 + left.operation_count() + right.operation_count(),
        }
    }

    /// Evaluate the whole tree locally.
    pub fn evaluate(&self) -> Result<f64, ComputeError> {
        match self {
            Node::Value(v) => Ok(*v),
            Node::Op { op, left, right } => op.apply(left.evaluate()?, right.evaluate()?),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Value(v) if *v < 0.0 => write!(f, "({v})"),
            Node::Value(v) => write!(f, "{v}"),
            Node::Op { op, left, right } => write!(f, "({left}{op}{right})"),
        }
    }
}
