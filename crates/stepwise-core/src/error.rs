use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepwiseError {
    // Workflow validation errors
    #[error("Invalid step id: {0:?}")]
    InvalidStepId(String),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle detected involving step: {0}")]
    CycleDetected(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    // Completion service errors
    #[error("Completion request failed: {0}")]
    CompletionRequest(String),

    #[error("Completion streaming error: {0}")]
    CompletionStream(String),

    #[error("Completion response parse error: {0}")]
    CompletionParse(String),

    #[error("Completion provider not supported: {0}")]
    UnsupportedProvider(String),

    #[error("Completion timed out after {0}s")]
    CompletionTimeout(u64),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("State store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    // Run errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    // Notification errors
    #[error("Notification error: {channel}: {message}")]
    Notify { channel: String, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StepwiseError {
    /// Errors raised while loading or validating a workflow, before any step runs.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidStepId(_)
                | Self::DuplicateStep(_)
                | Self::UnknownDependency { .. }
                | Self::CycleDetected(_)
                | Self::Workflow(_)
                | Self::Config(_)
                | Self::ConfigNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StepwiseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_classification() {
        assert!(StepwiseError::CycleDetected("a".into()).is_validation());
        assert!(StepwiseError::UnknownDependency {
            step: "b".into(),
            dependency: "x".into()
        }
        .is_validation());
        assert!(!StepwiseError::Store("disk full".into()).is_validation());
        assert!(!StepwiseError::CompletionRequest("HTTP 500".into()).is_validation());
        assert!(!StepwiseError::Scheduler("dispatch limit".into()).is_validation());
    }

    #[test]
    fn messages_name_offending_ids() {
        let e = StepwiseError::UnknownDependency {
            step: "build".into(),
            dependency: "fetch".into(),
        };
        assert_eq!(e.to_string(), "Step build depends on unknown step fetch");
        assert!(StepwiseError::DuplicateStep("a".into())
            .to_string()
            .contains('a'));
    }
}
