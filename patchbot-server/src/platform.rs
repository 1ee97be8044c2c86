//! The code-hosting collaborator as seen by the worker.

use async_trait::async_trait;
use patchbot_core::{ReviewComment, SubjectId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("{url} returned {status}: {body}")]
    Api {
        url: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSnapshot {
    pub title: String,
    pub head_branch: String,
    /// `false` when the head lives in a fork the service cannot push to.
    pub head_in_base_repo: bool,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub content: String,
    pub user_login: String,
}

#[async_trait]
pub trait ReviewPlatform: Send + Sync {
    async fn get_pull_request(&self, subject: &SubjectId)
        -> Result<PullRequestSnapshot, PlatformError>;

    /// Inline review comments on the subject, oldest first.
    async fn list_review_comments(
        &self,
        subject: &SubjectId,
    ) -> Result<Vec<ReviewComment>, PlatformError>;

    async fn list_comment_reactions(
        &self,
        subject: &SubjectId,
        comment_id: u64,
    ) -> Result<Vec<Reaction>, PlatformError>;

    async fn add_comment_reaction(
        &self,
        subject: &SubjectId,
        comment_id: u64,
        content: &str,
    ) -> Result<(), PlatformError>;

    async fn reply_to_comment(
        &self,
        subject: &SubjectId,
        comment_id: u64,
        body: &str,
    ) -> Result<(), PlatformError>;
}
