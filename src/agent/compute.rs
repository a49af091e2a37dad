//! The arithmetic a worker performs for one task.

use crate::error::ComputeError;
use crate::expr::Operator;

/// Apply the operator named by `op` to `a` and `b`.
pub fn compute(op: &str, a: f64, b: f64) -> Result<f64, ComputeError> {
    let operator: Operator = op.parse()?;
    operator.apply(a, b)
}
