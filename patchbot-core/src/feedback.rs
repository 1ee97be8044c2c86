use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a reviewed pull request on the code host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId {
    pub repo_owner: String,
    pub repo_name: String,
    pub number: u64,
}

impl SubjectId {
    pub fn new(repo_owner: impl Into<String>, repo_name: impl Into<String>, number: u64) -> Self {
        Self {
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            number,
        }
    }

    /// `owner/name` form of the repository.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.repo_owner, self.repo_name, self.number)
    }
}

/// A single inline review comment as the code host currently reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: u64,
    pub file_path: String,
    /// None for comments on outdated diffs or whole files.
    pub line_number: Option<u64>,
    pub diff_context: String,
    pub body: String,
    pub author_id: String,
    /// Replies cannot carry a completion marker; only thread roots can.
    pub is_reply: bool,
}

/// Everything the agent needs to know about one review, rebuilt from live
/// remote state on every processing attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub subject_id: SubjectId,
    pub subject_title: String,
    pub repository_id: String,
    pub branch_name: String,
    pub reviewer_id: String,
    pub review_state: String,
    pub review_body: Option<String>,
    pub comments: Vec<ReviewComment>,
}

impl ReviewFeedback {
    /// Thread-root comments, in the order the code host returned them.
    pub fn actionable_comments(&self) -> impl Iterator<Item = &ReviewComment> {
        self.comments.iter().filter(|c| !c.is_reply)
    }

    pub fn reply_comments(&self) -> impl Iterator<Item = &ReviewComment> {
        self.comments.iter().filter(|c| c.is_reply)
    }

    /// Ids of the comments that should receive a completion marker once
    /// the agent's work is pushed.
    pub fn markable_comment_ids(&self) -> Vec<u64> {
        self.actionable_comments().map(|c| c.id).collect()
    }

    /// Whether the review body carries any text worth acting on.
    pub fn has_review_body(&self) -> bool {
        self.review_body
            .as_deref()
            .is_some_and(|body| !body.trim().is_empty())
    }

    /// False when there is neither an open comment nor a review body, in
    /// which case there is nothing for the agent to do.
    pub fn has_work(&self) -> bool {
        self.actionable_comments().next().is_some() || self.has_review_body()
    }
}
