//! Typed views of GitHub webhook bodies.
//!
//! The event store keeps raw bytes plus a kind tag. Bodies are decoded here
//! twice: once at admission to decide whether to record the delivery, and
//! again by the worker when it processes the stored record.

use patchbot_core::SubjectId;
use serde::Deserialize;

use crate::error::WebhookError;
use crate::event_store::EventKind;

pub const EVENT_TYPE_HEADER: &str = "x-github-event";

#[derive(Debug, Clone, Deserialize)]
pub struct UserPayload {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPayload {
    pub name: String,
    pub full_name: String,
    pub owner: UserPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadPayload {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
    pub number: u64,
    pub title: String,
    pub head: HeadPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewPayload {
    pub id: u64,
    pub user: UserPayload,
    pub state: String,
    pub body: Option<String>,
}

/// `pull_request_review` delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewSubmittedPayload {
    pub action: String,
    pub review: ReviewPayload,
    pub pull_request: PullRequestPayload,
    pub repository: RepositoryPayload,
}

impl ReviewSubmittedPayload {
    pub fn subject_id(&self) -> SubjectId {
        SubjectId::new(
            self.repository.owner.login.clone(),
            self.repository.name.clone(),
            self.pull_request.number,
        )
    }

    fn is_bare_approval(&self) -> bool {
        self.review.state.eq_ignore_ascii_case("approved")
            && self
                .review
                .body
                .as_deref()
                .map_or(true, |b| b.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingPayload {
    pub zen: Option<String>,
    pub hook_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    ReviewSubmitted(ReviewSubmittedPayload),
    Ping(PingPayload),
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl EventPayload {
    pub fn decode(kind: &EventKind, raw: &[u8]) -> Result<Self, PayloadError> {
        match kind {
            EventKind::ReviewSubmitted => Ok(Self::ReviewSubmitted(serde_json::from_slice(raw)?)),
            EventKind::Ping => Ok(Self::Ping(serde_json::from_slice(raw)?)),
            EventKind::Unknown(tag) => Err(PayloadError::UnknownKind(tag.clone())),
        }
    }
}

/// What the webhook endpoint should do with a verified delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Enqueue(EventKind),
    Ignore(String),
}

#[derive(Deserialize)]
struct ActionOnly {
    action: Option<String>,
}

/// Decide from the event type header and body whether to record a delivery.
pub fn classify(event_type: Option<&str>, body: &[u8]) -> Result<Admission, WebhookError> {
    let event_type = event_type.ok_or(WebhookError::MissingEventType)?;

    match event_type {
        "ping" => {
            serde_json::from_slice::<PingPayload>(body)
                .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
            Ok(Admission::Enqueue(EventKind::Ping))
        }
        "pull_request_review" => {
            let action: ActionOnly = serde_json::from_slice(body)
                .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
            let action = action.action.unwrap_or_default();
            if action != "submitted" {
                return Ok(Admission::Ignore(format!(
                    "Ignoring review action '{}'",
                    action
                )));
            }

            let payload: ReviewSubmittedPayload = serde_json::from_slice(body)
                .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
            if payload.is_bare_approval() {
                return Ok(Admission::Ignore(
                    "Ignoring approval without comments".to_string(),
                ));
            }
            Ok(Admission::Enqueue(EventKind::ReviewSubmitted))
        }
        other => Err(WebhookError::UnsupportedEventType(other.to_string())),
    }
}
