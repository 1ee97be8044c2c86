//! Supervision of the external change-making agent.
//!
//! The agent is a child process started in the worktree. The remediation
//! instructions are written to its stdin, which is then closed; stdout and
//! stderr are mirrored line by line while the process runs and accumulated
//! into a single combined transcript.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub binary: PathBuf,
    pub max_turns: u32,
    /// Passed before `--max-turns`.
    pub extra_args: Vec<String>,
    /// Text the agent prints when it stops because it ran out of turns.
    pub turn_limit_marker: String,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to start agent {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    /// Exit code 0 and no turn-limit marker in the output.
    pub success: bool,
    pub output: String,
    pub hit_turn_limit: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives agent output as it is produced.
pub trait OutputSink: Send + Sync {
    fn line(&self, stream: OutputStream, line: &str);
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, instructions: &str, work_dir: &Path) -> Result<AgentOutcome, AgentError>;
}

pub struct AgentRunner {
    config: AgentConfig,
    sink: Option<Arc<dyn OutputSink>>,
}

impl AgentRunner {
    pub fn new(config: AgentConfig) -> Self {
        Self { config, sink: None }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

#[async_trait]
impl Agent for AgentRunner {
    async fn run(&self, instructions: &str, work_dir: &Path) -> Result<AgentOutcome, AgentError> {
        info!(
            binary = %self.config.binary.display(),
            work_dir = %work_dir.display(),
            max_turns = self.config.max_turns,
            "Starting agent"
        );

        let mut command = Command::new(&self.config.binary);
        command
            .args(&self.config.extra_args)
            .arg("--max-turns")
            .arg(self.config.max_turns.to_string())
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            binary: self.config.binary.display().to_string(),
            source,
        })?;

        // Feed stdin concurrently with draining output, otherwise a chatty
        // agent can fill its stdout pipe before it has read its input
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let instructions = instructions.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(instructions.as_bytes()).await {
                    warn!("Failed to write instructions to agent stdin: {}", e);
                    return;
                }
                if let Err(e) = stdin.shutdown().await {
                    warn!("Failed to close agent stdin: {}", e);
                }
            })
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, OutputStream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, OutputStream::Stderr, tx.clone());
        }
        drop(tx);

        let mut output = String::new();
        while let Some((stream, line)) = rx.recv().await {
            debug!(target: "patchbot::agent", ?stream, "{}", line);
            if let Some(sink) = &self.sink {
                sink.line(stream, &line);
            }
            output.push_str(&line);
            output.push('\n');
        }

        let status = child.wait().await?;
        if let Some(task) = stdin_task {
            let _ = task.await;
        }

        let exit_code = status.code();
        let hit_turn_limit = output.contains(&self.config.turn_limit_marker);
        let success = status.success() && !hit_turn_limit;

        if hit_turn_limit {
            warn!(?exit_code, "Agent reached its turn limit");
        } else if !status.success() {
            warn!(?exit_code, "Agent exited unsuccessfully");
        } else {
            info!("Agent finished");
        }

        Ok(AgentOutcome {
            success,
            output,
            hit_turn_limit,
            exit_code,
        })
    }
}

fn spawn_line_reader<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Agents may echo binary diffs; a bad byte must not end the transcript
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send((stream, line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(?stream, "Failed to read agent output: {}", e);
                    break;
                }
            }
        }
    });
}
