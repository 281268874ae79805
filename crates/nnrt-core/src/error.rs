use std::fmt;

/// What kind of graph entity a lookup failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Network,
    Executor,
    Variable,
    Function,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Network => write!(f, "network"),
            EntityKind::Executor => write!(f, "executor"),
            EntityKind::Variable => write!(f, "variable"),
            EntityKind::Function => write!(f, "function"),
        }
    }
}

/// Errors raised by graph construction and execution.
///
/// Every error is raised where it is detected; nothing is recovered inside
/// the runtime.
#[derive(Debug, thiserror::Error)]
pub enum NnrtError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: EntityKind, name: String },

    #[error("shape mismatch for {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("`{0}` is not supported yet")]
    UnsupportedOperator(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid attribute for {function}: {message}")]
    InvalidAttribute { function: String, message: String },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("format error: {0}")]
    Format(String),
}

impl NnrtError {
    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        NnrtError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Size mismatch between a flat buffer and a declared shape.
    pub fn size_mismatch(context: impl Into<String>, expected: &[usize], got: usize) -> Self {
        NnrtError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            got: vec![got],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = NnrtError::not_found(EntityKind::Executor, "runtime");
        assert_eq!(err.to_string(), "executor not found: runtime");

        let err = NnrtError::UnsupportedOperator("LSTM".into());
        assert_eq!(err.to_string(), "`LSTM` is not supported yet");

        let err = NnrtError::size_mismatch("x", &[2, 3], 5);
        assert_eq!(
            err.to_string(),
            "shape mismatch for x: expected [2, 3], got [5]"
        );
    }
}
