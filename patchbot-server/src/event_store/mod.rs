//! Durable queue of inbound webhook events, backed by SQLite.
//!
//! Every admitted delivery becomes exactly one row. The row's `status` moves
//! `pending -> processing -> completed`, or back to `pending` through
//! `mark_failed` until the retry ceiling is reached, after which it stays
//! `failed`. `completed` and `failed` are terminal.
//!
//! `enqueue` returns only after the insert has been committed with
//! `synchronous = FULL`, so the HTTP handler can treat its return as the
//! commit point for accepting the delivery.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table. When the schema changes,
//! increment `CURRENT_SCHEMA_VERSION` and add a step in `run_migrations()`.


use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const CURRENT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt data in event store: {0}")]
    Corruption(String),

    #[error("event {0} not found")]
    NotFound(String),

    #[error("event {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: EventStatus,
        to: EventStatus,
    },
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption(what.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "completed" => Some(EventStatus::Completed),
            "failed" => Some(EventStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type tag stored next to the raw payload.
///
/// Tags written by a newer build that this build does not know survive a
/// round trip as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    ReviewSubmitted,
    Ping,
    Unknown(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ReviewSubmitted => "review_submitted",
            EventKind::Ping => "ping",
            EventKind::Unknown(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "review_submitted" => EventKind::ReviewSubmitted,
            "ping" => EventKind::Ping,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: EventKind,
    /// Raw request body exactly as received.
    pub payload: Vec<u8>,
    pub status: EventStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Queue depth counters for the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
    max_retries: u32,
}

impl EventStore {
    /// Open (or create) the event database at `path`.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL`
    /// - `synchronous = FULL`, so a committed enqueue survives power loss
    /// - `busy_timeout = 5000ms`
    pub fn new<P: AsRef<Path>>(path: P, max_retries: u32) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // SQLite silently keeps DELETE mode on filesystems without shared
        // memory support; in-memory databases report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "SQLite returned '{}' instead of 'wal'; the event store requires WAL mode",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_retries,
        })
    }

    pub fn new_in_memory(max_retries: u32) -> Result<Self, StoreError> {
        Self::new(":memory:", max_retries)
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            // seq gives a stable admission order that survives deletes
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS webhook_events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    event_type TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    status TEXT NOT NULL CHECK(status IN (
                        'pending', 'processing', 'completed', 'failed'
                    )),
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at INTEGER NOT NULL,
                    last_error TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_webhook_events_open
                    ON webhook_events(seq) WHERE status IN ('pending', 'processing');
                CREATE INDEX IF NOT EXISTS idx_webhook_events_status
                    ON webhook_events(status, updated_at);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_sql(&self, sql: &str) {
        self.conn.lock().unwrap().execute_batch(sql).unwrap();
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::storage(operation, e.to_string()))?
    }

    /// Append a new pending event. Durable once this returns `Ok`.
    pub async fn enqueue(&self, kind: EventKind, payload: Vec<u8>) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        let now = now_secs();
        let tag = kind.as_str().to_string();

        let event_id = id.clone();
        self.with_conn("enqueue", move |conn| {
            conn.execute(
                "INSERT INTO webhook_events
                     (id, event_type, payload, status, retry_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5)",
                params![event_id, tag, payload, created_at, now],
            )
            .map_err(|e| StoreError::storage("enqueue", e.to_string()))?;
            Ok(())
        })
        .await?;

        info!(event_id = %id, kind = %kind, "Event enqueued");
        Ok(id)
    }

    pub async fn get_event(&self, id: &str) -> Result<Option<WebhookEvent>, StoreError> {
        let id = id.to_string();
        self.with_conn("get_event", move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM webhook_events WHERE id = ?1", EVENT_COLUMNS),
                    params![id],
                    read_raw_row,
                )
                .optional()
                .map_err(|e| StoreError::storage("get_event", e.to_string()))?;
            row.map(RawEventRow::into_event).transpose()
        })
        .await
    }

    /// Claim an event for processing.
    ///
    /// Accepts `processing` as well as `pending` so that events orphaned by
    /// a crash can be re-claimed on startup.
    pub async fn mark_processing(&self, id: &str) -> Result<(), StoreError> {
        self.transition(
            id,
            EventStatus::Processing,
            &[EventStatus::Pending, EventStatus::Processing],
            None,
        )
        .await
    }

    pub async fn mark_completed(&self, id: &str) -> Result<(), StoreError> {
        self.transition(
            id,
            EventStatus::Completed,
            &[EventStatus::Pending, EventStatus::Processing],
            None,
        )
        .await
    }

    /// Record a failed attempt.
    ///
    /// Increments `retry_count`; the event goes back to `pending` while
    /// `retry_count <= max_retries` and becomes terminally `failed`
    /// otherwise. Returns the resulting status.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<EventStatus, StoreError> {
        let id = id.to_string();
        let reason = reason.to_string();
        let max_retries = self.max_retries;
        let now = now_secs();

        self.with_conn("mark_failed", move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("mark_failed", e.to_string()))?;

            let current: Option<(String, i64)> = tx
                .query_row(
                    "SELECT status, retry_count FROM webhook_events WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(|e| StoreError::storage("mark_failed", e.to_string()))?;

            let (status, retry_count) = current.ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let status = EventStatus::parse(&status)
                .ok_or_else(|| StoreError::corruption(format!("status '{}'", status)))?;
            if status.is_terminal() {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: status,
                    to: EventStatus::Failed,
                });
            }

            let retry_count = u32::try_from(retry_count)
                .map_err(|_| StoreError::corruption(format!("retry_count {}", retry_count)))?
                .saturating_add(1);
            let next = if retry_count <= max_retries {
                EventStatus::Pending
            } else {
                EventStatus::Failed
            };

            tx.execute(
                "UPDATE webhook_events
                 SET status = ?1, retry_count = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![next.as_str(), retry_count, reason, now, id],
            )
            .map_err(|e| StoreError::storage("mark_failed", e.to_string()))?;
            tx.commit()
                .map_err(|e| StoreError::storage("mark_failed", e.to_string()))?;

            Ok(next)
        })
        .await
    }

    /// Move straight to terminal `failed` without touching the retry budget.
    ///
    /// Used for failures that need an operator, such as a diverged branch.
    pub async fn mark_failed_permanently(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        self.transition(
            id,
            EventStatus::Failed,
            &[EventStatus::Pending, EventStatus::Processing],
            Some(reason.to_string()),
        )
        .await
    }

    async fn transition(
        &self,
        id: &str,
        to: EventStatus,
        allowed_from: &'static [EventStatus],
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let now = now_secs();

        self.with_conn("transition", move |conn| {
            let from_list = allowed_from
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");

            let changed = match &last_error {
                Some(reason) => conn.execute(
                    &format!(
                        "UPDATE webhook_events SET status = ?1, updated_at = ?2, last_error = ?3
                         WHERE id = ?4 AND status IN ({})",
                        from_list
                    ),
                    params![to.as_str(), now, reason, id],
                ),
                None => conn.execute(
                    &format!(
                        "UPDATE webhook_events SET status = ?1, updated_at = ?2
                         WHERE id = ?3 AND status IN ({})",
                        from_list
                    ),
                    params![to.as_str(), now, id],
                ),
            }
            .map_err(|e| StoreError::storage("transition", e.to_string()))?;

            if changed > 0 {
                return Ok(());
            }

            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM webhook_events WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("transition", e.to_string()))?;

            match current {
                None => Err(StoreError::NotFound(id)),
                Some(status) => {
                    let from = EventStatus::parse(&status)
                        .ok_or_else(|| StoreError::corruption(format!("status '{}'", status)))?;
                    Err(StoreError::InvalidTransition { id, from, to })
                }
            }
        })
        .await
    }

    /// All events still owed processing, in admission order.
    ///
    /// Includes `processing` rows: nothing survives a crash to finish them,
    /// so they must be attempted again from scratch.
    pub async fn get_pending_events(&self) -> Result<Vec<WebhookEvent>, StoreError> {
        self.with_conn("get_pending_events", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM webhook_events
                     WHERE status IN ('pending', 'processing')
                     ORDER BY seq ASC",
                    EVENT_COLUMNS
                ))
                .map_err(|e| StoreError::storage("get_pending_events", e.to_string()))?;

            let rows = stmt
                .query_map([], read_raw_row)
                .map_err(|e| StoreError::storage("get_pending_events", e.to_string()))?;

            let mut events = Vec::new();
            for row in rows {
                // One unreadable row must not block recovery of the rest
                let raw = match row {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Failed to read pending event row: {}", e);
                        continue;
                    }
                };
                let id = raw.id.clone();
                match raw.into_event() {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(event_id = %id, "Skipping corrupt event row: {}", e),
                }
            }
            Ok(events)
        })
        .await
    }

    pub async fn get_stats(&self) -> Result<QueueStats, StoreError> {
        self.with_conn("get_stats", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT status, COUNT(*) FROM webhook_events
                     WHERE status IN ('pending', 'processing', 'failed')
                     GROUP BY status",
                )
                .map_err(|e| StoreError::storage("get_stats", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| StoreError::storage("get_stats", e.to_string()))?;

            let mut stats = QueueStats::default();
            for row in rows {
                let (status, count) =
                    row.map_err(|e| StoreError::storage("get_stats", e.to_string()))?;
                let count = u64::try_from(count).unwrap_or(0);
                match EventStatus::parse(&status) {
                    Some(EventStatus::Pending) => stats.pending = count,
                    Some(EventStatus::Processing) => stats.processing = count,
                    Some(EventStatus::Failed) => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
        .await
    }

    /// Delete completed records last touched more than `older_than` ago.
    ///
    /// Failed records are kept for operator attention.
    pub async fn purge_completed(&self, older_than: Duration) -> Result<usize, StoreError> {
        let retention = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now_secs().saturating_sub(retention);
        self.with_conn("purge_completed", move |conn| {
            conn.execute(
                "DELETE FROM webhook_events WHERE status = 'completed' AND updated_at <= ?1",
                params![cutoff],
            )
            .map_err(|e| StoreError::storage("purge_completed", e.to_string()))
        })
        .await
    }
}

const EVENT_COLUMNS: &str =
    "id, event_type, payload, status, retry_count, created_at, last_error";

/// A row as SQLite returns it, before validation.
struct RawEventRow {
    id: String,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    retry_count: i64,
    created_at: String,
    last_error: Option<String>,
}

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEventRow> {
    Ok(RawEventRow {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload: row.get(2)?,
        status: row.get(3)?,
        retry_count: row.get(4)?,
        created_at: row.get(5)?,
        last_error: row.get(6)?,
    })
}

impl RawEventRow {
    fn into_event(self) -> Result<WebhookEvent, StoreError> {
        let status = EventStatus::parse(&self.status)
            .ok_or_else(|| StoreError::corruption(format!("status '{}'", self.status)))?;
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| StoreError::corruption(format!("retry_count {}", self.retry_count)))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|_| StoreError::corruption(format!("created_at '{}'", self.created_at)))?
            .with_timezone(&Utc);

        Ok(WebhookEvent {
            id: self.id,
            kind: EventKind::from_tag(&self.event_type),
            payload: self.payload,
            status,
            retry_count,
            created_at,
            last_error: self.last_error,
        })
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
