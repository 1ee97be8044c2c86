//! The single-concurrency review pipeline.
//!
//! Event ids arrive on an unbounded channel and are handled strictly one at
//! a time, so no two attempts ever share the worktree. Each attempt rebuilds
//! the feedback from live remote state rather than trusting the queued body.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use patchbot_core::{build_instructions, ReviewFeedback};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::Agent;
use crate::completion::CompletionTracker;
use crate::error::ProcessingError;
use crate::event_store::{EventStatus, EventStore, WebhookEvent};
use crate::payload::{EventPayload, PayloadError, ReviewSubmittedPayload};
use crate::platform::ReviewPlatform;
use crate::worktree::{CommitIdentity, Workspace};

/// Handle for submitting event ids to the worker.
#[derive(Clone)]
pub struct ReviewQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl ReviewQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, event_id: String) {
        if let Err(e) = self.tx.send(event_id) {
            // The event stays pending in the store and is recovered on restart
            error!(event_id = %e.0, "Worker queue closed, event left for recovery");
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub commit_author: Option<CommitIdentity>,
    pub auto_reply: bool,
    pub retry_delay: Duration,
}

/// What a successful attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ping,
    NothingToDo,
    Remediated { commits_pushed: u32, marked: usize },
}

pub struct ReviewWorker {
    store: Arc<EventStore>,
    platform: Arc<dyn ReviewPlatform>,
    completion: CompletionTracker,
    workspace: Arc<dyn Workspace>,
    agent: Arc<dyn Agent>,
    queue: ReviewQueue,
    settings: WorkerSettings,
}

impl ReviewWorker {
    pub fn new(
        store: Arc<EventStore>,
        platform: Arc<dyn ReviewPlatform>,
        completion: CompletionTracker,
        workspace: Arc<dyn Workspace>,
        agent: Arc<dyn Agent>,
        queue: ReviewQueue,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            platform,
            completion,
            workspace,
            agent,
            queue,
            settings,
        }
    }

    /// Process submitted events one at a time. The worker keeps its own
    /// queue handle for retries, so this runs for the life of the process.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<String>) {
        info!("Review worker started");
        while let Some(event_id) = rx.recv().await {
            self.handle(&event_id).await;
        }
        info!("Review worker stopped");
    }

    /// Run one attempt for `event_id` and record the result.
    ///
    /// Returns the status the event was left in, or `None` when the event
    /// was not attempted or its outcome could not be recorded. In the latter
    /// case the stored status is still unfinished and the event is submitted
    /// again after the retry delay.
    pub async fn handle(&self, event_id: &str) -> Option<EventStatus> {
        let event = match self.store.get_event(event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(event_id, "Submitted event not found in store");
                return None;
            }
            Err(e) => {
                error!(event_id, "Failed to load event: {}", e);
                self.schedule_retry(event_id.to_string());
                return None;
            }
        };

        // A retry timer and a recovery pass can both submit the same id
        if event.status.is_terminal() {
            debug!(event_id, status = %event.status, "Skipping finished event");
            return None;
        }

        if let Err(e) = self.store.mark_processing(event_id).await {
            error!(event_id, "Failed to claim event: {}", e);
            self.schedule_retry(event_id.to_string());
            return None;
        }

        info!(
            event_id,
            kind = %event.kind,
            attempt = event.retry_count + 1,
            "Processing event"
        );

        match self.process(&event).await {
            Ok(outcome) => match self.store.mark_completed(event_id).await {
                Ok(()) => {
                    info!(event_id, ?outcome, "Event completed");
                    Some(EventStatus::Completed)
                }
                Err(e) => {
                    // Completion markers are already on the remote, so the
                    // next attempt finds nothing left to do
                    error!(event_id, "Failed to mark event completed: {}", e);
                    self.schedule_retry(event_id.to_string());
                    None
                }
            },
            Err(e) => self.record_failure(event_id, e).await,
        }
    }

    async fn record_failure(&self, event_id: &str, err: ProcessingError) -> Option<EventStatus> {
        let reason = err.to_string();

        if !err.is_retryable() {
            error!(event_id, "Event failed permanently: {}", reason);
            return match self.store.mark_failed_permanently(event_id, &reason).await {
                Ok(()) => Some(EventStatus::Failed),
                Err(e) => {
                    error!(event_id, "Failed to record failure: {}", e);
                    self.schedule_retry(event_id.to_string());
                    None
                }
            };
        }

        match self.store.mark_failed(event_id, &reason).await {
            Ok(EventStatus::Pending) => {
                warn!(
                    event_id,
                    retry_in = ?self.settings.retry_delay,
                    "Event attempt failed, will retry: {}",
                    reason
                );
                self.schedule_retry(event_id.to_string());
                Some(EventStatus::Pending)
            }
            Ok(status) => {
                error!(event_id, "Event failed after exhausting retries: {}", reason);
                Some(status)
            }
            Err(e) => {
                error!(event_id, "Failed to record failure: {}", e);
                self.schedule_retry(event_id.to_string());
                None
            }
        }
    }

    fn schedule_retry(&self, event_id: String) {
        let queue = self.queue.clone();
        let delay = self.settings.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.submit(event_id);
        });
    }

    async fn process(&self, event: &WebhookEvent) -> Result<Outcome, ProcessingError> {
        let payload = EventPayload::decode(&event.kind, &event.payload).map_err(|e| match e {
            PayloadError::UnknownKind(tag) => ProcessingError::UnsupportedKind(tag),
            PayloadError::Malformed(e) => ProcessingError::Payload(e.to_string()),
        })?;

        match payload {
            EventPayload::Ping(ping) => {
                info!(hook_id = ?ping.hook_id, zen = ?ping.zen, "Ping received");
                Ok(Outcome::Ping)
            }
            EventPayload::ReviewSubmitted(review) => self.process_review(&review).await,
        }
    }

    async fn process_review(
        &self,
        review: &ReviewSubmittedPayload,
    ) -> Result<Outcome, ProcessingError> {
        let subject = review.subject_id();

        let pr = self.platform.get_pull_request(&subject).await?;
        if pr.state != "open" {
            info!(%subject, state = %pr.state, "Pull request is no longer open");
            return Ok(Outcome::NothingToDo);
        }
        if !pr.head_in_base_repo {
            return Err(ProcessingError::ForkHead(pr.head_branch));
        }

        let comments = self.platform.list_review_comments(&subject).await?;
        let addressed = self.completion.addressed_among(&subject, &comments).await?;
        let total = comments.len();
        let open: Vec<_> = comments
            .into_iter()
            .filter(|c| !addressed.contains(&c.id))
            .collect();

        let feedback = ReviewFeedback {
            subject_id: subject.clone(),
            subject_title: pr.title,
            repository_id: review.repository.full_name.clone(),
            branch_name: pr.head_branch,
            reviewer_id: review.review.user.login.clone(),
            review_state: review.review.state.clone(),
            review_body: review.review.body.clone(),
            comments: open,
        };

        info!(
            %subject,
            total,
            already_addressed = addressed.len(),
            open = feedback.markable_comment_ids().len(),
            "Loaded review feedback"
        );

        if !feedback.has_work() {
            info!(%subject, "Nothing left to address");
            return Ok(Outcome::NothingToDo);
        }

        let branch = feedback.branch_name.clone();
        let path = self.workspace.prepare(&branch).await?;
        let result = self.remediate(&feedback, &path).await;
        self.workspace.release(&branch).await;
        result
    }

    async fn remediate(
        &self,
        feedback: &ReviewFeedback,
        path: &Path,
    ) -> Result<Outcome, ProcessingError> {
        let subject = &feedback.subject_id;
        let branch = &feedback.branch_name;

        if let Some(identity) = &self.settings.commit_author {
            self.workspace.configure_author(path, identity).await?;
        }

        let instructions = build_instructions(feedback);
        let outcome = self.agent.run(&instructions, path).await?;
        if !outcome.success {
            return Err(ProcessingError::AgentFailed {
                exit_code: outcome.exit_code,
                hit_turn_limit: outcome.hit_turn_limit,
            });
        }

        if self.workspace.has_uncommitted_changes(path).await? {
            return Err(ProcessingError::DirtyWorktree);
        }

        let ahead = self.workspace.commits_ahead(path, branch).await?;
        let pushed_commit = if ahead > 0 {
            self.workspace.push(path, branch).await?;
            let head = self.workspace.head_commit(path).await?;
            info!(%subject, branch = %branch, commits = ahead, head = %head, "Pushed agent commits");
            Some(head)
        } else {
            info!(%subject, "Agent made no commits");
            None
        };

        let to_mark: Vec<_> = feedback.actionable_comments().cloned().collect();
        let marked = self.completion.mark_addressed(subject, &to_mark).await;

        if self.settings.auto_reply {
            let reply = match &pushed_commit {
                Some(sha) => format!("Addressed in {}.", sha),
                None => "Reviewed; no code change was needed.".to_string(),
            };
            for comment_id in &marked {
                if let Err(e) = self
                    .platform
                    .reply_to_comment(subject, *comment_id, &reply)
                    .await
                {
                    warn!(%subject, comment_id, "Failed to post reply: {}", e);
                }
            }
        }

        Ok(Outcome::Remediated {
            commits_pushed: ahead,
            marked: marked.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    use async_trait::async_trait;

    use crate::agent::{AgentError, AgentOutcome};
    use crate::completion::fake::{comment, FakePlatform};
    use crate::event_store::EventKind;
    use crate::payload::fixtures::review_body;
    use crate::worktree::{PushError, WorktreeError};

    #[derive(Default)]
    struct FakeWorkspace {
        prepared: Mutex<Vec<String>>,
        released: Mutex<Vec<String>>,
        pushed: Mutex<Vec<String>>,
        authors: Mutex<Vec<CommitIdentity>>,
        dirty: AtomicBool,
        ahead: AtomicU32,
        push_error: Mutex<Option<PushError>>,
    }

    #[async_trait]
    impl Workspace for FakeWorkspace {
        async fn prepare(&self, branch: &str) -> Result<PathBuf, WorktreeError> {
            self.prepared.lock().unwrap().push(branch.to_string());
            Ok(PathBuf::from("/work").join(branch))
        }

        async fn configure_author(
            &self,
            _path: &Path,
            identity: &CommitIdentity,
        ) -> Result<(), WorktreeError> {
            self.authors.lock().unwrap().push(identity.clone());
            Ok(())
        }

        async fn has_uncommitted_changes(&self, _path: &Path) -> Result<bool, WorktreeError> {
            Ok(self.dirty.load(Ordering::SeqCst))
        }

        async fn commits_ahead(&self, _path: &Path, _branch: &str) -> Result<u32, WorktreeError> {
            Ok(self.ahead.load(Ordering::SeqCst))
        }

        async fn head_commit(&self, _path: &Path) -> Result<String, WorktreeError> {
            Ok("abc1234".to_string())
        }

        async fn push(&self, _path: &Path, branch: &str) -> Result<(), PushError> {
            if let Some(e) = self.push_error.lock().unwrap().take() {
                return Err(e);
            }
            self.pushed.lock().unwrap().push(branch.to_string());
            self.ahead.store(0, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&self, branch: &str) {
            self.released.lock().unwrap().push(branch.to_string());
        }
    }

    fn succeeded() -> AgentOutcome {
        AgentOutcome {
            success: true,
            output: "done\n".to_string(),
            hit_turn_limit: false,
            exit_code: Some(0),
        }
    }

    fn failed() -> AgentOutcome {
        AgentOutcome {
            success: false,
            output: "crashed\n".to_string(),
            hit_turn_limit: false,
            exit_code: Some(1),
        }
    }

    struct FakeAgent {
        script: Mutex<VecDeque<AgentOutcome>>,
        fallback: AgentOutcome,
        delay: Duration,
        instructions: Mutex<Vec<String>>,
        intervals: Mutex<Vec<(Instant, Instant)>>,
    }

    impl FakeAgent {
        fn new(script: Vec<AgentOutcome>, fallback: AgentOutcome) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                delay: Duration::ZERO,
                instructions: Mutex::new(Vec::new()),
                intervals: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.instructions.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Agent for FakeAgent {
        async fn run(&self, instructions: &str, _work_dir: &Path) -> Result<AgentOutcome, AgentError> {
            let start = Instant::now();
            self.instructions
                .lock()
                .unwrap()
                .push(instructions.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            self.intervals.lock().unwrap().push((start, Instant::now()));
            Ok(outcome)
        }
    }

    struct Harness {
        store: Arc<EventStore>,
        platform: Arc<FakePlatform>,
        workspace: Arc<FakeWorkspace>,
        agent: Arc<FakeAgent>,
        worker: ReviewWorker,
        rx: mpsc::UnboundedReceiver<String>,
    }

    fn harness(max_retries: u32, agent: FakeAgent, auto_reply: bool) -> Harness {
        let store = Arc::new(EventStore::new_in_memory(max_retries).unwrap());
        let platform = Arc::new(FakePlatform::new(vec![
            comment(1, false),
            comment(2, false),
            comment(3, true),
        ]));
        let workspace = Arc::new(FakeWorkspace::default());
        let agent = Arc::new(agent);
        let (queue, rx) = ReviewQueue::channel();
        let worker = ReviewWorker::new(
            store.clone(),
            platform.clone(),
            CompletionTracker::new(platform.clone(), "rocket", None),
            workspace.clone(),
            agent.clone(),
            queue,
            WorkerSettings {
                commit_author: None,
                auto_reply,
                retry_delay: Duration::from_millis(10),
            },
        );
        Harness {
            store,
            platform,
            workspace,
            agent,
            worker,
            rx,
        }
    }

    async fn enqueue_review(store: &EventStore, body: Option<&str>) -> String {
        let raw = serde_json::to_vec(&review_body("submitted", "changes_requested", body)).unwrap();
        store.enqueue(EventKind::ReviewSubmitted, raw).await.unwrap()
    }

    async fn wait_for_status(store: &EventStore, id: &str, status: EventStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let current = store.get_event(id).await.unwrap().unwrap().status;
            if current == status {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "event {} stuck in {} waiting for {}",
                id,
                current,
                status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_successful_review_pushes_and_marks() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        h.workspace.ahead.store(2, Ordering::SeqCst);
        let id = enqueue_review(&h.store, Some("Tidy up")).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));

        assert_eq!(*h.workspace.prepared.lock().unwrap(), vec!["feature/widgets"]);
        assert_eq!(*h.workspace.released.lock().unwrap(), vec!["feature/widgets"]);
        assert_eq!(*h.workspace.pushed.lock().unwrap(), vec!["feature/widgets"]);
        assert_eq!(h.platform.reaction_count(1), 1);
        assert_eq!(h.platform.reaction_count(2), 1);
        // Replies are context only
        assert_eq!(h.platform.reaction_count(3), 0);

        let instructions = h.agent.instructions.lock().unwrap()[0].clone();
        assert!(instructions.contains("Tidy up"));
        assert!(instructions.contains("Please fix #1"));
        assert!(instructions.contains("DISCUSSION REPLIES"));
    }

    #[tokio::test]
    async fn test_addressed_comments_are_excluded() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        h.platform.react(1, "rocket", "patchbot");
        let id = enqueue_review(&h.store, None).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));

        let instructions = h.agent.instructions.lock().unwrap()[0].clone();
        assert!(!instructions.contains("Please fix #1"));
        assert!(instructions.contains("Please fix #2"));
        // Not marked a second time
        assert_eq!(h.platform.reaction_count(1), 1);
        assert_eq!(h.platform.reaction_count(2), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_do_skips_worktree() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        h.platform.react(1, "rocket", "patchbot");
        h.platform.react(2, "rocket", "patchbot");
        let id = enqueue_review(&h.store, Some("  ")).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));
        assert!(h.workspace.prepared.lock().unwrap().is_empty());
        assert_eq!(h.agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_turn_limit_is_failure_without_push() {
        let turn_limited = AgentOutcome {
            success: false,
            output: "Reached max turns\n".to_string(),
            hit_turn_limit: true,
            exit_code: Some(0),
        };
        let h = harness(3, FakeAgent::new(vec![turn_limited], succeeded()), false);
        h.workspace.ahead.store(1, Ordering::SeqCst);
        let id = enqueue_review(&h.store, None).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Pending));
        assert!(h.workspace.pushed.lock().unwrap().is_empty());
        assert_eq!(h.platform.reaction_count(1), 0);
        // The worktree is still handed back
        assert_eq!(h.workspace.released.lock().unwrap().len(), 1);

        let event = h.store.get_event(&id).await.unwrap().unwrap();
        assert_eq!(event.retry_count, 1);
        assert!(event.last_error.unwrap().contains("turn limit reached: true"));
    }

    #[tokio::test]
    async fn test_dirty_worktree_is_failure() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        h.workspace.dirty.store(true, Ordering::SeqCst);
        h.workspace.ahead.store(1, Ordering::SeqCst);
        let id = enqueue_review(&h.store, None).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Pending));
        assert!(h.workspace.pushed.lock().unwrap().is_empty());
        assert_eq!(h.platform.reaction_count(1), 0);
    }

    #[tokio::test]
    async fn test_diverged_branch_fails_permanently() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        h.workspace.ahead.store(1, Ordering::SeqCst);
        *h.workspace.push_error.lock().unwrap() = Some(PushError::Diverged {
            branch: "feature/widgets".to_string(),
            message: "[rejected] (fetch first)".to_string(),
        });
        let id = enqueue_review(&h.store, None).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Failed));
        let event = h.store.get_event(&id).await.unwrap().unwrap();
        assert_eq!(event.retry_count, 0);
        assert!(event.last_error.unwrap().contains("diverged"));
        assert_eq!(h.platform.reaction_count(1), 0);
    }

    #[tokio::test]
    async fn test_fork_head_fails_permanently() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        h.platform.pr.lock().unwrap().head_in_base_repo = false;
        let id = enqueue_review(&h.store, None).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Failed));
        assert!(h.workspace.prepared.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_platform_outage_is_retried() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        *h.platform.comment_failures.lock().unwrap() = 1;
        let id = enqueue_review(&h.store, None).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Pending));
        assert!(h.workspace.prepared.lock().unwrap().is_empty());
        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));
    }

    #[tokio::test]
    async fn test_closed_pull_request_is_nothing_to_do() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        h.platform.pr.lock().unwrap().state = "closed".to_string();
        let id = enqueue_review(&h.store, Some("Tidy up")).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));
        assert!(h.workspace.prepared.lock().unwrap().is_empty());
        assert_eq!(h.agent.calls(), 0);
    }

    async fn next_submission(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no resubmission")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn test_claim_failure_is_resubmitted() {
        let mut h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        let id = enqueue_review(&h.store, None).await;
        h.store.execute_sql(
            "CREATE TEMP TRIGGER block_claim BEFORE UPDATE ON webhook_events
             WHEN NEW.status = 'processing'
             BEGIN SELECT RAISE(ABORT, 'database is locked'); END;",
        );

        assert_eq!(h.worker.handle(&id).await, None);
        assert_eq!(
            h.store.get_event(&id).await.unwrap().unwrap().status,
            EventStatus::Pending
        );
        assert_eq!(h.agent.calls(), 0);

        h.store.execute_sql("DROP TRIGGER block_claim;");
        assert_eq!(next_submission(&mut h.rx).await, id);
        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));
        assert_eq!(h.agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_completion_write_failure_is_resubmitted() {
        let mut h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        h.workspace.ahead.store(1, Ordering::SeqCst);
        let id = enqueue_review(&h.store, None).await;
        h.store.execute_sql(
            "CREATE TEMP TRIGGER block_completion BEFORE UPDATE ON webhook_events
             WHEN NEW.status = 'completed'
             BEGIN SELECT RAISE(ABORT, 'database is locked'); END;",
        );

        assert_eq!(h.worker.handle(&id).await, None);
        let event = h.store.get_event(&id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processing);
        assert_eq!(h.platform.reaction_count(1), 1);

        h.store.execute_sql("DROP TRIGGER block_completion;");
        assert_eq!(next_submission(&mut h.rx).await, id);
        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));

        // The comments were already marked, so the agent is not run again
        assert_eq!(h.agent.calls(), 1);
        assert_eq!(h.workspace.pushed.lock().unwrap().len(), 1);
        assert_eq!(h.platform.reaction_count(1), 1);
        let stats = h.store.get_stats().await.unwrap();
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn test_ping_completes_without_worktree() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        let id = h
            .store
            .enqueue(EventKind::Ping, br#"{"zen":"Design for failure.","hook_id":9}"#.to_vec())
            .await
            .unwrap();

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));
        assert!(h.workspace.prepared.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_payload_fails_permanently() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        let id = h
            .store
            .enqueue(EventKind::ReviewSubmitted, b"{\"action\":\"submitted\"}".to_vec())
            .await
            .unwrap();

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Failed));
        assert_eq!(h.store.get_event(&id).await.unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_finished_event_is_not_attempted_again() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        let id = enqueue_review(&h.store, None).await;
        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));
        assert_eq!(h.worker.handle(&id).await, None);
        assert_eq!(h.agent.calls(), 1);
    }

    #[tokio::test]
    async fn test_auto_reply_names_commit() {
        let h = harness(3, FakeAgent::new(vec![], succeeded()), true);
        h.workspace.ahead.store(1, Ordering::SeqCst);
        let id = enqueue_review(&h.store, None).await;

        assert_eq!(h.worker.handle(&id).await, Some(EventStatus::Completed));
        let replies = h.platform.replies.lock().unwrap().clone();
        assert_eq!(
            replies,
            vec![
                (1, "Addressed in abc1234.".to_string()),
                (2, "Addressed in abc1234.".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_commit_author_configured() {
        let mut h = harness(3, FakeAgent::new(vec![], succeeded()), false);
        let identity = CommitIdentity {
            name: "Fix Bot".to_string(),
            email: "fixbot@example.com".to_string(),
        };
        h.worker.settings.commit_author = Some(identity.clone());
        let id = enqueue_review(&h.store, None).await;

        h.worker.handle(&id).await;
        assert_eq!(*h.workspace.authors.lock().unwrap(), vec![identity]);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let h = harness(3, FakeAgent::new(vec![failed()], succeeded()), false);
        let id = enqueue_review(&h.store, None).await;

        let Harness {
            store,
            agent,
            worker,
            rx,
            ..
        } = h;
        worker.queue.submit(id.clone());
        tokio::spawn(worker.run(rx));

        wait_for_status(&store, &id, EventStatus::Completed).await;
        let event = store.get_event(&id).await.unwrap().unwrap();
        assert_eq!(event.retry_count, 1);
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_terminal_after_retry_ceiling() {
        let h = harness(2, FakeAgent::new(vec![], failed()), false);
        let id = enqueue_review(&h.store, None).await;

        let Harness {
            store,
            agent,
            worker,
            rx,
            ..
        } = h;
        worker.queue.submit(id.clone());
        tokio::spawn(worker.run(rx));

        wait_for_status(&store, &id, EventStatus::Failed).await;
        assert_eq!(store.get_event(&id).await.unwrap().unwrap().retry_count, 3);

        // Nothing resubmits it
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.calls(), 3);
        assert_eq!(
            store.get_event(&id).await.unwrap().unwrap().status,
            EventStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_same_branch_events_never_overlap() {
        let mut agent = FakeAgent::new(vec![], succeeded());
        agent.delay = Duration::from_millis(30);
        let h = harness(3, agent, false);
        let first = enqueue_review(&h.store, None).await;
        let second = enqueue_review(&h.store, Some("again")).await;

        let Harness {
            store,
            agent,
            worker,
            rx,
            ..
        } = h;
        worker.queue.submit(first.clone());
        worker.queue.submit(second.clone());
        tokio::spawn(worker.run(rx));

        wait_for_status(&store, &first, EventStatus::Completed).await;
        wait_for_status(&store, &second, EventStatus::Completed).await;

        let intervals = agent.intervals.lock().unwrap().clone();
        assert_eq!(intervals.len(), 2);
        let (a, b) = (intervals[0], intervals[1]);
        assert!(a.1 <= b.0 || b.1 <= a.0, "attempts overlapped");
        // Admission order
        assert!(a.0 < b.0);
        assert!(agent.instructions.lock().unwrap()[1].contains("again"));
    }
}
