//! # dotclaw-store
//!
//! SQLite persistence for the dotclaw host. Two database files:
//!
//! - `messages.db` -- message log, durable per-chat queue, chat catch-up
//!   state, scheduled tasks, background jobs, workflow runs. Wrapped by
//!   [`HostStore`].
//! - `memory.db` -- typed long-term memories with an FTS5 mirror and
//!   optional embedding blobs. Wrapped by [`MemoryStore`].
//!
//! Schemas are created idempotently on first access. The host process is
//! the single writer (WAL mode); every operation runs a short transaction
//! on a blocking thread via `tokio::task::spawn_blocking`.

mod chats;
mod db;
mod error;
mod jobs;
mod memory;
mod queue;
mod tasks;
mod workflows;

pub use chats::StoredMessage;
pub use db::Db;
pub use error::{Result, StoreError};
pub use memory::{MemoryFilter, MemoryStore, ScoredMemory};
pub use queue::RetryPolicy;
pub use workflows::{WorkflowRun, WorkflowStore};

use std::path::Path;

/// Handle over `messages.db`.
///
/// Cheap to clone; each operation opens its own connection on a blocking
/// thread (single-writer process, WAL mode), so clones never contend on a
/// shared handle.
#[derive(Clone)]
pub struct HostStore {
    pub(crate) db: Db,
}

impl HostStore {
    /// Open (or create) the host store at `path` and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Db::open(path.as_ref().to_path_buf(), SCHEMA).await?;
        Ok(Self { db })
    }
}

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY,
    chat_id     TEXT NOT NULL,
    sender_id   TEXT NOT NULL DEFAULT '',
    sender_name TEXT NOT NULL DEFAULT '',
    content     TEXT NOT NULL,
    timestamp   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages (chat_id, timestamp);

CREATE TABLE IF NOT EXISTS queue (
    id             TEXT PRIMARY KEY,
    chat_id        TEXT NOT NULL,
    sender_id      TEXT NOT NULL DEFAULT '',
    sender_name    TEXT NOT NULL DEFAULT '',
    content        TEXT NOT NULL,
    timestamp      INTEGER NOT NULL,
    is_group       INTEGER NOT NULL DEFAULT 0,
    chat_type      TEXT NOT NULL DEFAULT '',
    status         TEXT NOT NULL DEFAULT 'queued',
    attempt        INTEGER NOT NULL DEFAULT 0,
    last_error     TEXT,
    claimed_at     INTEGER,
    claim_deadline INTEGER,
    visible_at     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_queue_chat_status ON queue (chat_id, status, timestamp);

CREATE TABLE IF NOT EXISTS chats (
    chat_id              TEXT PRIMARY KEY,
    name                 TEXT NOT NULL DEFAULT '',
    last_message_time    INTEGER NOT NULL DEFAULT 0,
    last_agent_timestamp INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS tasks (
    id             TEXT PRIMARY KEY,
    group_folder   TEXT NOT NULL,
    chat_jid       TEXT NOT NULL,
    prompt         TEXT NOT NULL,
    schedule_type  TEXT NOT NULL,
    schedule_value TEXT NOT NULL,
    context_mode   TEXT NOT NULL DEFAULT 'none',
    next_run       INTEGER NOT NULL,
    status         TEXT NOT NULL DEFAULT 'active',
    attempt        INTEGER NOT NULL DEFAULT 0,
    last_result    TEXT,
    running_since  INTEGER,
    state_json     TEXT,
    created_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, next_run);

CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    group_folder TEXT NOT NULL,
    chat_jid     TEXT NOT NULL,
    prompt       TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'queued',
    output       TEXT,
    output_path  TEXT,
    created_at   INTEGER NOT NULL,
    started_at   INTEGER,
    finished_at  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, created_at);

CREATE TABLE IF NOT EXISTS workflow_runs (
    id           TEXT PRIMARY KEY,
    group_folder TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'running',
    created_at   INTEGER NOT NULL,
    finished_at  INTEGER
);

CREATE TABLE IF NOT EXISTS workflow_steps (
    run_id  TEXT NOT NULL,
    idx     INTEGER NOT NULL,
    result  TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (run_id, idx)
);
"#;
