//! Error taxonomy shared by every Narrative Forge component.
//!
//! All fallible operations in the core crate and the application crate
//! return [`Result<T>`]. Batch operations and the notification hook are
//! the only places where an [`Error`] is converted into a degraded result
//! instead of being surfaced to the caller.

use std::time::Duration;

use thiserror::Error as ThisError;

/// Result alias for Narrative Forge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Input or state validation failures.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ValidationError {
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("checkpoint {id} is not awaiting review (status: {status})")]
    NotAwaitingReview { id: String, status: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Top-level error type.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(
        "no registered model satisfies task '{task}' (missing capabilities: [{}], min context window: {min_context_window})",
        missing.join(", ")
    )]
    NoSuitableModel {
        task: String,
        missing: Vec<String>,
        min_context_window: u32,
    },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("timed out after {waited:?} waiting for review of checkpoint {id}")]
    Timeout { id: String, waited: Duration },

    #[error("text generation failed: {0}")]
    Provider(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("stage '{stage}' produced unusable output: {message}")]
    InvalidOutput { stage: String, message: String },

    #[error("stage '{stage}' was rejected by the reviewer{}", notes.as_deref().map(|n| format!(": {n}")).unwrap_or_default())]
    StageRejected {
        stage: String,
        notes: Option<String>,
    },

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl Error {
    /// True for [`Error::Validation`] errors.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// True if the error reports an unknown checkpoint id.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Validation(ValidationError::CheckpointNotFound(_))
        )
    }

    /// True if the error reports a checkpoint that already left review.
    pub fn is_not_awaiting_review(&self) -> bool {
        matches!(
            self,
            Error::Validation(ValidationError::NotAwaitingReview { .. })
        )
    }

    /// Shorthand for an [`ValidationError::InvalidInput`] error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::Validation(ValidationError::InvalidInput(msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err: Error = ValidationError::CheckpointNotFound("abc".to_string()).into();
        assert!(err.is_validation());
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "checkpoint not found: abc");
    }

    #[test]
    fn test_no_suitable_model_names_capabilities() {
        let err = Error::NoSuitableModel {
            task: "shot_planning".to_string(),
            missing: vec!["json_mode".to_string(), "creative".to_string()],
            min_context_window: 8000,
        };
        let msg = err.to_string();
        assert!(msg.contains("json_mode, creative"));
        assert!(msg.contains("shot_planning"));
    }

    #[test]
    fn test_stage_rejected_with_and_without_notes() {
        let with = Error::StageRejected {
            stage: "scenes".to_string(),
            notes: Some("too short".to_string()),
        };
        assert!(with.to_string().ends_with(": too short"));
        let without = Error::StageRejected {
            stage: "scenes".to_string(),
            notes: None,
        };
        assert!(without.to_string().ends_with("reviewer"));
    }
}
