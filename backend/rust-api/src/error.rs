use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::SessionStatus;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Exam {0} not found")]
    ExamNotFound(String),

    #[error("Student {0} has not joined this session")]
    ParticipantNotFound(String),

    #[error("Cannot {action} while session is {status}")]
    InvalidTransition {
        status: SessionStatus,
        action: &'static str,
    },

    #[error("Question {question_index} already has a final answer")]
    DuplicateSubmission { question_index: u32 },

    #[error("Student {0} has already submitted")]
    AlreadySubmitted(String),

    #[error("Question index {0} does not exist in this exam")]
    UnknownQuestion(u32),

    #[error("Unrecognized timestamp shape: {0}")]
    StaleClockInput(String),

    #[error("Store operation failed: {0}")]
    TransientStoreFailure(String),

    #[error("Best-effort write dropped: {0}")]
    BestEffortFailure(String),

    #[error("Invalid request: {0}")]
    Validation(String),
}

impl SessionError {
    pub fn store(err: anyhow::Error) -> Self {
        SessionError::TransientStoreFailure(format!("{:#}", err))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::SessionNotFound(_)
            | SessionError::ExamNotFound(_)
            | SessionError::ParticipantNotFound(_) => StatusCode::NOT_FOUND,
            SessionError::InvalidTransition { .. }
            | SessionError::DuplicateSubmission { .. }
            | SessionError::AlreadySubmitted(_) => StatusCode::CONFLICT,
            SessionError::UnknownQuestion(_) | SessionError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            SessionError::StaleClockInput(_) | SessionError::BestEffortFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SessionError::TransientStoreFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether the caller should retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::TransientStoreFailure(_))
    }

    fn code(&self) -> &'static str {
        match self {
            SessionError::SessionNotFound(_) => "session_not_found",
            SessionError::ExamNotFound(_) => "exam_not_found",
            SessionError::ParticipantNotFound(_) => "participant_not_found",
            SessionError::InvalidTransition { .. } => "invalid_transition",
            SessionError::DuplicateSubmission { .. } => "duplicate_submission",
            SessionError::AlreadySubmitted(_) => "already_submitted",
            SessionError::UnknownQuestion(_) => "unknown_question",
            SessionError::StaleClockInput(_) => "stale_clock_input",
            SessionError::TransientStoreFailure(_) => "transient_store_failure",
            SessionError::BestEffortFailure(_) => "best_effort_failure",
            SessionError::Validation(_) => "validation_error",
        }
    }
}

impl From<validator::ValidationErrors> for SessionError {
    fn from(errors: validator::ValidationErrors) -> Self {
        SessionError::Validation(errors.to_string())
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Session operation failed");
        } else {
            tracing::info!(error = %self, "Session operation rejected");
        }

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_submission_is_conflict() {
        let err = SessionError::DuplicateSubmission { question_index: 3 };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(!err.is_retryable());
    }

    #[test]
    fn store_failures_are_retryable() {
        let err = SessionError::store(anyhow::anyhow!("connection reset"));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }
}
