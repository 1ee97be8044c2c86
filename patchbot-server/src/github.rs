use async_trait::async_trait;
use patchbot_core::{ReviewComment, SubjectId};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::platform::{PlatformError, PullRequestSnapshot, Reaction, ReviewPlatform};

const PER_PAGE: usize = 100;

/// REST client for the GitHub API, authenticated with a single token.
#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    api_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestRefResponse {
    #[serde(rename = "ref")]
    ref_name: String,
    // Null when the fork has been deleted
    repo: Option<RepoResponse>,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    title: String,
    state: String,
    head: PullRequestRefResponse,
    base: PullRequestRefResponse,
}

#[derive(Debug, Deserialize)]
struct ReviewCommentResponse {
    id: u64,
    path: String,
    line: Option<u64>,
    original_line: Option<u64>,
    #[serde(default)]
    diff_hunk: String,
    body: String,
    user: UserResponse,
    in_reply_to_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReactionResponse {
    content: String,
    user: UserResponse,
}

#[derive(Debug, Serialize)]
struct CreateReactionRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateReplyRequest<'a> {
    body: &'a str,
}

impl From<ReviewCommentResponse> for ReviewComment {
    fn from(c: ReviewCommentResponse) -> Self {
        ReviewComment {
            id: c.id,
            file_path: c.path,
            line_number: c.line.or(c.original_line),
            diff_context: c.diff_hunk,
            body: c.body,
            author_id: c.user.login,
            is_reply: c.in_reply_to_id.is_some(),
        }
    }
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self, PlatformError> {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .user_agent(concat!("patchbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Http {
                url: api_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            api_url,
            token: token.into(),
        })
    }

    fn repo_url(&self, subject: &SubjectId) -> String {
        format!(
            "{}/repos/{}/{}",
            self.api_url, subject.repo_owner, subject.repo_name
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(
        &self,
        url: &str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PlatformError> {
        let response = builder.send().await.map_err(|e| PlatformError::Http {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("GitHub API error for {}: {} - {}", url, status, body);
            return Err(PlatformError::Api {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, PlatformError> {
        let response = self
            .send(url, self.request(reqwest::Method::GET, url))
            .await?;
        response.json().await.map_err(|e| PlatformError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// Follow `page` until a short page comes back.
    async fn get_paginated<T: DeserializeOwned>(&self, base_url: &str) -> Result<Vec<T>, PlatformError> {
        let mut all = Vec::new();
        let mut page = 1;
        loop {
            let url = format!("{}?page={}&per_page={}", base_url, page, PER_PAGE);
            let items: Vec<T> = self.get_json(&url).await?;
            let count = items.len();
            all.extend(items);
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<(), PlatformError> {
        self.send(url, self.request(reqwest::Method::POST, url).json(body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReviewPlatform for GitHubClient {
    async fn get_pull_request(
        &self,
        subject: &SubjectId,
    ) -> Result<PullRequestSnapshot, PlatformError> {
        let url = format!("{}/pulls/{}", self.repo_url(subject), subject.number);
        let pr: PullRequestResponse = self.get_json(&url).await?;

        let head_in_base_repo = match (&pr.head.repo, &pr.base.repo) {
            (Some(head), Some(base)) => head.full_name.eq_ignore_ascii_case(&base.full_name),
            _ => false,
        };

        Ok(PullRequestSnapshot {
            title: pr.title,
            head_branch: pr.head.ref_name,
            head_in_base_repo,
            state: pr.state,
        })
    }

    async fn list_review_comments(
        &self,
        subject: &SubjectId,
    ) -> Result<Vec<ReviewComment>, PlatformError> {
        let url = format!("{}/pulls/{}/comments", self.repo_url(subject), subject.number);
        let comments: Vec<ReviewCommentResponse> = self.get_paginated(&url).await?;
        info!(%subject, count = comments.len(), "Fetched review comments");
        Ok(comments.into_iter().map(ReviewComment::from).collect())
    }

    async fn list_comment_reactions(
        &self,
        subject: &SubjectId,
        comment_id: u64,
    ) -> Result<Vec<Reaction>, PlatformError> {
        let url = format!(
            "{}/pulls/comments/{}/reactions",
            self.repo_url(subject),
            comment_id
        );
        let reactions: Vec<ReactionResponse> = self.get_paginated(&url).await?;
        Ok(reactions
            .into_iter()
            .map(|r| Reaction {
                content: r.content,
                user_login: r.user.login,
            })
            .collect())
    }

    async fn add_comment_reaction(
        &self,
        subject: &SubjectId,
        comment_id: u64,
        content: &str,
    ) -> Result<(), PlatformError> {
        let url = format!(
            "{}/pulls/comments/{}/reactions",
            self.repo_url(subject),
            comment_id
        );
        self.post_json(&url, &CreateReactionRequest { content }).await
    }

    async fn reply_to_comment(
        &self,
        subject: &SubjectId,
        comment_id: u64,
        body: &str,
    ) -> Result<(), PlatformError> {
        let url = format!(
            "{}/pulls/{}/comments/{}/replies",
            self.repo_url(subject),
            subject.number,
            comment_id
        );
        self.post_json(&url, &CreateReplyRequest { body }).await
    }
}
