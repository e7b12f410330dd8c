//! Domain-level error taxonomy for the refinement engine.
//!
//! Only malformed input and service outages are modelled as errors. Quality
//! problems (failed patches, regressions, exhausted budgets) are recorded as
//! values on the run report instead of being propagated.

/// Errors produced by external service calls (evaluator, generator, verifier).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid service response: {0}")]
    InvalidResponse(String),

    #[error("service call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("http error: {0}")]
    Http(String),
}

/// Refinement domain errors.
#[derive(Debug, thiserror::Error)]
pub enum RefineError {
    #[error("invalid rubric: criterion weights sum to {sum:.4}, expected 1.0")]
    InvalidRubric { sum: f64 },

    #[error("invalid rubric definition: {0}")]
    InvalidRubricDefinition(String),

    #[error("invalid refinement config: {0}")]
    InvalidConfig(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("invalid verdict from {evaluator}: {reason}")]
    InvalidVerdict { evaluator: String, reason: String },

    #[error("evaluator {evaluator} unavailable: {reason}")]
    EvaluatorUnavailable { evaluator: String, reason: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for refinement domain operations.
pub type Result<T> = std::result::Result<T, RefineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_rubric_display_includes_sum() {
        let err = RefineError::InvalidRubric { sum: 0.95 };
        let msg = err.to_string();
        assert!(msg.contains("0.9500"));
        assert!(msg.contains("expected 1.0"));
    }

    #[test]
    fn test_evaluator_unavailable_display() {
        let err = RefineError::EvaluatorUnavailable {
            evaluator: "judge-b".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("judge-b"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_service_error_timeout_display() {
        let err = ServiceError::Timeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "service call timed out after 1500ms");
    }
}
