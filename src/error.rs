use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReteError {
    #[error("Constraint evaluation failed in {constraint}: {message}")]
    ConstraintEvaluation { constraint: String, message: String },
    #[error("Function {function} failed on {tuple}: {message}")]
    FunctionEvaluation { function: String, tuple: String, message: String },
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Build error: {0}")]
    Build(String),
    #[error("Unknown rule: {0}")]
    UnknownRule(String),
    #[error("Unknown fact handle: {0}")]
    UnknownFact(u64),
    #[error("Unknown node: {0}")]
    UnknownNode(u32),
    #[error("Network in use by {0} live session(s)")]
    NetworkInUse(usize),
    #[error("Session poisoned by an earlier failure: {0}")]
    SessionPoisoned(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, ReteError>;

impl ReteError {
    /// Failures raised by injected collaborators (constraints, grouping and
    /// accumulate functions). These abort the triggering propagation.
    pub fn is_evaluation_failure(&self) -> bool {
        matches!(
            self,
            Self::ConstraintEvaluation { .. } | Self::FunctionEvaluation { .. }
        )
    }
}

// Helper conversions
impl From<config::ConfigError> for ReteError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for ReteError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
