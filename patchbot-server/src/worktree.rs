//! Reusable per-branch git worktrees.
//!
//! The service runs inside a clone of the repository it remediates. Each
//! branch gets one worktree under `worktree_dir`, created on first use and
//! re-synchronised to the remote tip on every later use. Worktrees are never
//! deleted; reusing them avoids re-materialising large trees per event.
//!
//! Nothing here locks the worktree itself. Exclusive use comes from the
//! worker processing one event at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

const REMOTE: &str = "origin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("{0} is not inside a git working directory")]
    NotARepository(PathBuf),

    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),

    #[error("failed to sync branch {branch} ({step}): {message}")]
    BranchSyncFailed {
        branch: String,
        step: &'static str,
        message: String,
    },

    #[error("git {command} failed: {message}")]
    Git {
        command: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum PushError {
    /// The remote branch has commits the local branch does not.
    #[error("push to {branch} rejected, remote has diverged: {message}")]
    Diverged { branch: String, message: String },

    #[error("push to {branch} failed: {message}")]
    Failed { branch: String, message: String },
}

/// Operations the worker needs from a branch checkout.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Bring the branch's worktree to the remote tip and return its path.
    async fn prepare(&self, branch: &str) -> Result<PathBuf, WorktreeError>;

    async fn configure_author(
        &self,
        path: &Path,
        identity: &CommitIdentity,
    ) -> Result<(), WorktreeError>;

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool, WorktreeError>;

    /// Commits on `HEAD` that the remote branch does not have.
    async fn commits_ahead(&self, path: &Path, branch: &str) -> Result<u32, WorktreeError>;

    async fn head_commit(&self, path: &Path) -> Result<String, WorktreeError>;

    async fn push(&self, path: &Path, branch: &str) -> Result<(), PushError>;

    /// End the current borrow of the branch's worktree. The checkout stays.
    async fn release(&self, branch: &str);
}

#[derive(Debug, Clone)]
pub struct Worktree {
    pub branch_name: String,
    pub local_path: PathBuf,
    pub last_prepared_at: DateTime<Utc>,
    pub in_use: bool,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_dir: PathBuf,
    worktrees: Mutex<HashMap<String, Worktree>>,
}

impl WorktreeManager {
    /// Locate the repository containing `repo_dir`.
    pub async fn discover(repo_dir: &Path, worktree_dir: &Path) -> Result<Self, WorktreeError> {
        let out = git(repo_dir, &["rev-parse", "--show-toplevel"])
            .await
            .map_err(|_| WorktreeError::NotARepository(repo_dir.to_path_buf()))?;
        if !out.success {
            return Err(WorktreeError::NotARepository(repo_dir.to_path_buf()));
        }
        let repo_root = PathBuf::from(out.stdout.trim());

        tokio::fs::create_dir_all(worktree_dir)
            .await
            .map_err(|e| WorktreeError::Git {
                command: "create worktree directory",
                message: format!("{}: {}", worktree_dir.display(), e),
            })?;

        info!(
            repo = %repo_root.display(),
            worktrees = %worktree_dir.display(),
            "Using repository"
        );

        Ok(Self {
            repo_root,
            worktree_dir: worktree_dir.to_path_buf(),
            worktrees: Mutex::new(HashMap::new()),
        })
    }

    pub fn worktree(&self, branch: &str) -> Option<Worktree> {
        self.worktrees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(branch)
            .cloned()
    }

    fn path_for(&self, branch: &str) -> PathBuf {
        self.worktree_dir.join(worktree_dir_name(branch))
    }

    async fn validate_branch(&self, branch: &str) -> Result<(), WorktreeError> {
        if branch.is_empty() || branch.starts_with('-') {
            return Err(WorktreeError::InvalidBranch(branch.to_string()));
        }
        let out = git(&self.repo_root, &["check-ref-format", "--branch", branch])
            .await
            .map_err(|e| io_to_git("check-ref-format", e))?;
        if !out.success {
            return Err(WorktreeError::InvalidBranch(branch.to_string()));
        }
        Ok(())
    }

    async fn sync_step(
        &self,
        dir: &Path,
        branch: &str,
        step: &'static str,
        args: &[&str],
    ) -> Result<(), WorktreeError> {
        let failed = |message: String| WorktreeError::BranchSyncFailed {
            branch: branch.to_string(),
            step,
            message,
        };
        let out = git(dir, args).await.map_err(|e| failed(e.to_string()))?;
        if !out.success {
            return Err(failed(out.stderr.trim().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Workspace for WorktreeManager {
    async fn prepare(&self, branch: &str) -> Result<PathBuf, WorktreeError> {
        self.validate_branch(branch).await?;

        let remote_ref = format!("{}/{}", REMOTE, branch);
        let refspec = format!("+refs/heads/{}:refs/remotes/{}", branch, remote_ref);
        self.sync_step(&self.repo_root, branch, "fetch", &["fetch", REMOTE, &refspec])
            .await?;

        let path = self.path_for(branch);
        let path_str = path.to_string_lossy().to_string();

        if !path.join(".git").exists() {
            info!(branch, path = %path.display(), "Creating worktree");
            // Forget registrations whose directories were removed by hand
            self.sync_step(&self.repo_root, branch, "worktree prune", &["worktree", "prune"])
                .await?;
            self.sync_step(
                &self.repo_root,
                branch,
                "worktree add",
                &["worktree", "add", "--detach", &path_str, &remote_ref],
            )
            .await?;
        } else {
            debug!(branch, path = %path.display(), "Reusing worktree");
        }

        self.sync_step(
            &path,
            branch,
            "checkout",
            &[
                "checkout",
                "--force",
                "--ignore-other-worktrees",
                "-B",
                branch,
                &remote_ref,
            ],
        )
        .await?;
        self.sync_step(&path, branch, "reset", &["reset", "--hard", &remote_ref])
            .await?;
        self.sync_step(&path, branch, "clean", &["clean", "-fd"])
            .await?;

        let mut worktrees = self.worktrees.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = worktrees
            .entry(branch.to_string())
            .or_insert_with(|| Worktree {
                branch_name: branch.to_string(),
                local_path: path.clone(),
                last_prepared_at: Utc::now(),
                in_use: false,
            });
        if entry.in_use {
            warn!(branch, "Worktree prepared while still marked in use");
        }
        entry.last_prepared_at = Utc::now();
        entry.in_use = true;

        info!(branch, path = %path.display(), "Worktree synced to remote tip");
        Ok(path)
    }

    async fn configure_author(
        &self,
        path: &Path,
        identity: &CommitIdentity,
    ) -> Result<(), WorktreeError> {
        for (key, value) in [
            ("user.name", identity.name.as_str()),
            ("user.email", identity.email.as_str()),
        ] {
            let out = git(path, &["config", key, value])
                .await
                .map_err(|e| io_to_git("config", e))?;
            if !out.success {
                return Err(WorktreeError::Git {
                    command: "config",
                    message: out.stderr.trim().to_string(),
                });
            }
        }
        debug!(name = %identity.name, email = %identity.email, "Configured commit author");
        Ok(())
    }

    async fn has_uncommitted_changes(&self, path: &Path) -> Result<bool, WorktreeError> {
        let out = git_checked(path, "status", &["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    async fn commits_ahead(&self, path: &Path, branch: &str) -> Result<u32, WorktreeError> {
        let range = format!("{}/{}..HEAD", REMOTE, branch);
        let out = git_checked(path, "rev-list", &["rev-list", "--count", &range]).await?;
        out.trim().parse().map_err(|_| WorktreeError::Git {
            command: "rev-list",
            message: format!("unexpected output '{}'", out.trim()),
        })
    }

    async fn head_commit(&self, path: &Path) -> Result<String, WorktreeError> {
        let out = git_checked(path, "rev-parse", &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    async fn push(&self, path: &Path, branch: &str) -> Result<(), PushError> {
        let target = format!("HEAD:refs/heads/{}", branch);
        let out = git(path, &["push", REMOTE, &target])
            .await
            .map_err(|e| PushError::Failed {
                branch: branch.to_string(),
                message: e.to_string(),
            })?;

        if out.success {
            info!(branch, "Pushed to remote");
            return Ok(());
        }

        let message = out.stderr.trim().to_string();
        if is_non_fast_forward(&message) {
            Err(PushError::Diverged {
                branch: branch.to_string(),
                message,
            })
        } else {
            Err(PushError::Failed {
                branch: branch.to_string(),
                message,
            })
        }
    }

    async fn release(&self, branch: &str) {
        let mut worktrees = self.worktrees.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(worktree) = worktrees.get_mut(branch) {
            worktree.in_use = false;
            debug!(branch, "Worktree released");
        }
    }
}

/// Directory name for a branch: readable, filesystem-safe, collision-free.
fn worktree_dir_name(branch: &str) -> String {
    let readable: String = branch
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Sha256::digest(branch.as_bytes());
    format!("{}-{}", readable, &hex::encode(digest)[..8])
}

fn is_non_fast_forward(stderr: &str) -> bool {
    stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
        || stderr.contains("[rejected]")
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn git(dir: &Path, args: &[&str]) -> std::io::Result<GitOutput> {
    debug!(dir = %dir.display(), "git {}", args.join(" "));
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .output()
        .await?;
    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

async fn git_checked(
    dir: &Path,
    command: &'static str,
    args: &[&str],
) -> Result<String, WorktreeError> {
    let out = git(dir, args).await.map_err(|e| io_to_git(command, e))?;
    if !out.success {
        return Err(WorktreeError::Git {
            command,
            message: out.stderr.trim().to_string(),
        });
    }
    Ok(out.stdout)
}

fn io_to_git(command: &'static str, e: std::io::Error) -> WorktreeError {
    WorktreeError::Git {
        command,
        message: e.to_string(),
    }
}
