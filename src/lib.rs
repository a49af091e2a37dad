//! Calc orchestrator: distributed evaluation of arithmetic expressions.

pub mod agent;
pub mod config;
pub mod error;
pub mod expr;
pub mod gateway;
pub mod scheduler;
pub mod store;
