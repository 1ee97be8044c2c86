//! Completion markers on review comments.
//!
//! A comment counts as addressed once it carries the configured reaction,
//! optionally only when the reaction was left by a specific login. Reads use
//! set semantics, so a duplicated marker is harmless.

use std::collections::HashSet;
use std::sync::Arc;

use patchbot_core::{ReviewComment, SubjectId};
use tracing::{debug, info, warn};

use crate::platform::{PlatformError, Reaction, ReviewPlatform};

pub struct CompletionTracker {
    platform: Arc<dyn ReviewPlatform>,
    reaction: String,
    reactor: Option<String>,
}

impl CompletionTracker {
    pub fn new(
        platform: Arc<dyn ReviewPlatform>,
        reaction: impl Into<String>,
        reactor: Option<String>,
    ) -> Self {
        Self {
            platform,
            reaction: reaction.into(),
            reactor,
        }
    }

    fn is_marker(&self, reaction: &Reaction) -> bool {
        reaction.content == self.reaction
            && self
                .reactor
                .as_deref()
                .map_or(true, |login| reaction.user_login.eq_ignore_ascii_case(login))
    }

    async fn is_addressed(&self, subject: &SubjectId, comment_id: u64) -> Result<bool, PlatformError> {
        let reactions = self
            .platform
            .list_comment_reactions(subject, comment_id)
            .await?;
        Ok(reactions.iter().any(|r| self.is_marker(r)))
    }

    /// Ids of all top-level comments on the subject that already carry the
    /// completion marker.
    pub async fn addressed_set(&self, subject: &SubjectId) -> Result<HashSet<u64>, PlatformError> {
        let comments = self.platform.list_review_comments(subject).await?;
        self.addressed_among(subject, &comments).await
    }

    /// As `addressed_set`, for comments the caller has already fetched.
    pub async fn addressed_among(
        &self,
        subject: &SubjectId,
        comments: &[ReviewComment],
    ) -> Result<HashSet<u64>, PlatformError> {
        let mut addressed = HashSet::new();
        for comment in comments.iter().filter(|c| !c.is_reply) {
            if self.is_addressed(subject, comment.id).await? {
                addressed.insert(comment.id);
            }
        }
        debug!(%subject, addressed = addressed.len(), "Loaded completion markers");
        Ok(addressed)
    }

    /// Mark each top-level comment as addressed. Returns the ids that now
    /// carry the marker.
    ///
    /// Best effort: a failure on one comment is logged and the rest are
    /// still marked.
    pub async fn mark_addressed(&self, subject: &SubjectId, comments: &[ReviewComment]) -> Vec<u64> {
        let mut marked = Vec::new();
        for comment in comments {
            if comment.is_reply {
                debug!(%subject, comment_id = comment.id, "Skipping reply comment");
                continue;
            }
            match self
                .platform
                .add_comment_reaction(subject, comment.id, &self.reaction)
                .await
            {
                Ok(()) => marked.push(comment.id),
                Err(e) => warn!(
                    %subject,
                    comment_id = comment.id,
                    "Failed to mark comment as addressed: {}",
                    e
                ),
            }
        }
        info!(%subject, marked = marked.len(), "Marked comments as addressed");
        marked
    }
}
