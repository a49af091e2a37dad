//! Error types for the calculation orchestrator.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Malformed expression text. Terminal: the expression is marked `error`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,

    #[error("expected an operand at position {position}, found {found}")]
    ExpectedOperand { found: String, position: usize },

    #[error("invalid number at position {position}: more than one decimal point")]
    MultipleDecimalPoints { position: usize },

    #[error("invalid number literal '{literal}'")]
    InvalidNumber { literal: String },

    #[error("expected ')' at position {position} to close '(' opened earlier")]
    UnclosedParen { position: usize },

    #[error("unexpected character '{found}' at position {position} after a complete expression")]
    TrailingInput { found: char, position: usize },
}

/// Failure of a single binary operation on the worker side.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputeError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("result of '{operator}' is not a finite number")]
    NonFinite { operator: &'static str },
}

/// Worker RPC errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("submission for task {task_id} carries neither a result nor an error")]
    MissingOutcome { task_id: i64 },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("orchestrator answered {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

impl From<reqwest::Error> for ProtocolError {
    fn from(e: reqwest::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
