use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::agent::AgentError;
use crate::event_store::StoreError;
use crate::platform::PlatformError;
use crate::signature::SignatureError;
use crate::worktree::{PushError, WorktreeError};

/// Reasons a webhook delivery is not admitted.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown webhook provider '{0}'")]
    UnknownProvider(String),

    #[error("source address not allowed")]
    Forbidden,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("missing event type header")]
    MissingEventType,

    #[error("unsupported event type '{0}'")]
    UnsupportedEventType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownProvider(_) => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Signature(_) => StatusCode::UNAUTHORIZED,
            Self::MissingEventType | Self::UnsupportedEventType(_) | Self::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Storage details stay in the log
        let message = match &self {
            Self::Internal(_) => "Failed to record event".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "success": false, "message": message }))).into_response()
    }
}

/// Why one processing attempt of a queued event failed.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payload no longer decodes: {0}")]
    Payload(String),

    #[error("no handler for event kind '{0}'")]
    UnsupportedKind(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("head branch {0} lives in a fork and cannot be pushed to")]
    ForkHead(String),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("agent did not finish (exit code {exit_code:?}, turn limit reached: {hit_turn_limit})")]
    AgentFailed {
        exit_code: Option<i32>,
        hit_turn_limit: bool,
    },

    #[error("agent left uncommitted changes in the worktree")]
    DirtyWorktree,

    #[error("branch {branch} has diverged from the remote: {message}")]
    BranchDiverged { branch: String, message: String },

    #[error("push to {branch} failed: {message}")]
    PushFailed { branch: String, message: String },
}

impl From<PushError> for ProcessingError {
    fn from(e: PushError) -> Self {
        match e {
            PushError::Diverged { branch, message } => Self::BranchDiverged { branch, message },
            PushError::Failed { branch, message } => Self::PushFailed { branch, message },
        }
    }
}

impl ProcessingError {
    /// Whether another attempt could plausibly succeed without an operator.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Payload(_)
            | Self::UnsupportedKind(_)
            | Self::ForkHead(_)
            | Self::BranchDiverged { .. } => false,
            Self::Platform(PlatformError::Api { status, .. }) => !matches!(status, 404 | 410),
            Self::Worktree(WorktreeError::InvalidBranch(_))
            | Self::Worktree(WorktreeError::NotARepository(_)) => false,
            Self::Store(_)
            | Self::Platform(_)
            | Self::Worktree(_)
            | Self::Agent(_)
            | Self::AgentFailed { .. }
            | Self::DirtyWorktree
            | Self::PushFailed { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            WebhookError::Signature(SignatureError::Mismatch).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(WebhookError::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            WebhookError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            WebhookError::UnsupportedEventType("push".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebhookError::UnknownProvider("gitlab".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WebhookError::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[tokio::test]
    async fn test_internal_error_does_not_leak_details() {
        let response = WebhookError::Internal("disk I/O error at /var/lib".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Failed to record event");
    }

    #[tokio::test]
    async fn test_error_body_is_structured() {
        let body = body_json(WebhookError::RateLimited.into_response()).await;
        assert_eq!(
            body,
            json!({"success": false, "message": "rate limit exceeded"})
        );
    }

    #[test]
    fn test_retry_split() {
        let diverged: ProcessingError = PushError::Diverged {
            branch: "b".into(),
            message: "fetch first".into(),
        }
        .into();
        assert!(!diverged.is_retryable());

        let push_failed: ProcessingError = PushError::Failed {
            branch: "b".into(),
            message: "connection reset".into(),
        }
        .into();
        assert!(push_failed.is_retryable());

        assert!(ProcessingError::AgentFailed {
            exit_code: Some(0),
            hit_turn_limit: true
        }
        .is_retryable());
        assert!(ProcessingError::DirtyWorktree.is_retryable());
        assert!(!ProcessingError::Payload("eof".into()).is_retryable());

        let gone = ProcessingError::Platform(PlatformError::Api {
            url: "u".into(),
            status: 404,
            body: String::new(),
        });
        assert!(!gone.is_retryable());
        let flaky = ProcessingError::Platform(PlatformError::Api {
            url: "u".into(),
            status: 502,
            body: String::new(),
        });
        assert!(flaky.is_retryable());
    }
}
