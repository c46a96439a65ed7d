//! Error taxonomy for the memory engine

use thiserror::Error;

use crate::traits::llm::LLMError;

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Llm(#[from] LLMError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid supersession: {0}")]
    InvalidSupersession(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    /// Errors worth a single retry: the backend or the model may recover.
    pub fn is_transient(&self) -> bool {
        match self {
            MemoryError::Backend(_) | MemoryError::Timeout(_) => true,
            MemoryError::Llm(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Errors that mean the storage layer itself is unreachable.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            MemoryError::Backend(_) | MemoryError::Persistence(_) | MemoryError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_converts() {
        let err: MemoryError = LLMError::Unavailable("reset".into()).into();
        assert!(matches!(err, MemoryError::Llm(_)));
        assert!(err.is_transient());
        assert!(!err.is_backend_unavailable());

        let rejected: MemoryError = LLMError::Rejected("prompt too long".into()).into();
        assert!(!rejected.is_transient());
    }

    #[test]
    fn test_display() {
        let err = MemoryError::Timeout(200);
        assert_eq!(err.to_string(), "Timed out after 200ms");
        assert!(err.is_backend_unavailable());
    }
}
