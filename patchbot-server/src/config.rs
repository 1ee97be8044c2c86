use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::allowlist::IpAllowlist;
use crate::rate_limit::RateLimitConfig;
use crate::worktree::CommitIdentity;

#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub webhook_secret: String,
    pub github_token: String,
    pub github_api_url: String,
    /// Post a reply on every comment once it has been addressed.
    pub auto_reply: bool,
    /// Present only when `IP_ALLOWLIST_ENABLED` is set.
    pub ip_allowlist: Option<IpAllowlist>,
    /// Take the client address from `X-Forwarded-For` instead of the socket.
    pub trust_proxy: bool,
    pub agent: AgentConfig,
    pub event_db_path: PathBuf,
    /// The checkout the service runs in; worktrees are created from it.
    pub repo_dir: PathBuf,
    pub worktree_dir: PathBuf,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub rate_limit: RateLimitConfig,
    /// Alternate identity for commits made by the agent.
    pub commit_author: Option<CommitIdentity>,
    pub completion_reaction: String,
    /// When set, only this login's reactions count as completion markers.
    pub completion_reactor: Option<String>,
    pub completed_retention: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let webhook_secret = var("GITHUB_WEBHOOK_SECRET")
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let github_token =
            var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable is required")?;

        let github_api_url = var("GITHUB_API_URL")
            .unwrap_or_else(|| "https://api.github.com".to_string())
            .trim_end_matches('/')
            .to_string();

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_or(&var, "PORT", 3000u16)?;

        let auto_reply = parse_flag(var("AUTO_REPLY"));
        let trust_proxy = parse_flag(var("TRUST_PROXY"));

        let ip_allowlist = if parse_flag(var("IP_ALLOWLIST_ENABLED")) {
            match var("IP_ALLOWLIST") {
                Some(ranges) => Some(
                    IpAllowlist::parse(&ranges).context("IP_ALLOWLIST must be comma-separated CIDRs")?,
                ),
                None => Some(IpAllowlist::github_hooks()),
            }
        } else {
            None
        };

        let agent = AgentConfig {
            binary: var("AGENT_BINARY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("claude")),
            max_turns: parse_or(&var, "AGENT_MAX_TURNS", 30u32)?,
            extra_args: var("AGENT_EXTRA_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            turn_limit_marker: var("AGENT_TURN_LIMIT_MARKER")
                .unwrap_or_else(|| "Reached max turns".to_string()),
        };

        let state_dir = var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let event_db_path = var("EVENT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("patchbot-events.db"));
        let repo_dir = var("REPO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let worktree_dir = var("WORKTREE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("worktrees"));

        let max_retries = parse_or(&var, "MAX_RETRIES", 3u32)?;
        let retry_delay = Duration::from_secs(parse_or(&var, "RETRY_DELAY_SECS", 30u64)?);

        let rate_limit = RateLimitConfig {
            window: Duration::from_secs(parse_or(&var, "RATE_LIMIT_WINDOW_SECS", 60u64)?),
            max_requests: parse_or(&var, "RATE_LIMIT_MAX_REQUESTS", 30usize)?,
        };
        if rate_limit.max_requests == 0 {
            return Err(anyhow!("RATE_LIMIT_MAX_REQUESTS must be at least 1"));
        }
        if rate_limit.window.is_zero() {
            return Err(anyhow!("RATE_LIMIT_WINDOW_SECS must be at least 1"));
        }

        let commit_author = match (var("COMMIT_AUTHOR_NAME"), var("COMMIT_AUTHOR_EMAIL")) {
            (Some(name), Some(email)) => Some(CommitIdentity { name, email }),
            _ => None,
        };

        let completion_reaction = var("COMPLETION_REACTION").unwrap_or_else(|| "rocket".to_string());
        let completion_reactor = var("COMPLETION_REACTOR");

        let retention_hours = parse_or(&var, "COMPLETED_RETENTION_HOURS", 168u64)?;
        let completed_retention = retention_hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| anyhow!("COMPLETED_RETENTION_HOURS is too large"))?;

        Ok(Config {
            host,
            port,
            webhook_secret,
            github_token,
            github_api_url,
            auto_reply,
            ip_allowlist,
            trust_proxy,
            agent,
            event_db_path,
            repo_dir,
            worktree_dir,
            max_retries,
            retry_delay,
            rate_limit,
            commit_author,
            completion_reaction,
            completion_reactor,
            completed_retention,
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow!("{} must be a valid number, got '{}'", key, raw)),
        None => Ok(default),
    }
}

/// Parse a boolean toggle. Unset or unrecognised values are off.
pub fn parse_flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true") | Some("1") | Some("yes") | Some("on")
    )
}
