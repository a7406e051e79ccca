//! Agent error taxonomy.
//!
//! | Variant        | Leaves a session? |
//! |----------------|-------------------|
//! | InvalidInput   | yes (fail fast)   |
//! | Diagnostics    | only configuration errors |
//! | Completion     | no, becomes an observation or failure record |
//! | Retrieval      | no, retrieval is skipped |
//! | State          | only on a broken loop invariant |

use diagnostics::DiagnosticsError;
use thiserror::Error;

use crate::state_machine::IllegalTransition;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Empty source, empty report, zero budget, bad project root.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Completion service request failed (network, status, empty reply).
    #[error("Completion failure: {0}")]
    Completion(String),

    /// Knowledge retriever failed.
    #[error("Knowledge retrieval failure: {0}")]
    Retrieval(String),

    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),

    #[error(transparent)]
    State(#[from] IllegalTransition),
}

impl AgentError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Whether the caller's input or configuration is at fault.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::InvalidInput(_) => true,
            Self::Diagnostics(e) => e.is_configuration(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(AgentError::invalid("empty source").is_configuration());
        assert!(AgentError::from(DiagnosticsError::config("bad budget")).is_configuration());
        assert!(!AgentError::from(DiagnosticsError::not_indexed("x.py")).is_configuration());
        assert!(!AgentError::Completion("503".into()).is_configuration());
    }

    #[test]
    fn test_display() {
        let err = AgentError::Completion("LLM API error (500)".into());
        assert_eq!(err.to_string(), "Completion failure: LLM API error (500)");
        let err = AgentError::from(DiagnosticsError::not_indexed("a.py"));
        assert_eq!(err.to_string(), "File not found in project index: a.py");
    }
}
