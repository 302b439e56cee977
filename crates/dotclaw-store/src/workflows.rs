//! Workflow-run persistence.
//!
//! Workflow runs record multi-step agent work (step results included) so
//! the maintenance loop can prune them past retention. The store carries
//! an explicit closed flag; `close` is idempotent and later operations
//! fail fast instead of touching the database.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::{Row, params};

use crate::HostStore;
use crate::db::Db;
use crate::error::{Result, StoreError};

/// One recorded workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    /// Run id.
    pub id: String,
    /// Owning group folder.
    pub group_folder: String,
    /// `running`, `completed`, or `failed`.
    pub status: String,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Terminal time, epoch milliseconds.
    pub finished_at: Option<i64>,
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<WorkflowRun> {
    Ok(WorkflowRun {
        id: row.get("id")?,
        group_folder: row.get("group_folder")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        finished_at: row.get("finished_at")?,
    })
}

/// Handle over the workflow tables of `messages.db`.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Db,
    closed: Arc<AtomicBool>,
}

impl WorkflowStore {
    /// Borrow the workflow tables from an open [`HostStore`].
    pub fn new(host: &HostStore) -> Self {
        Self {
            db: host.db.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Close the store. Idempotent; subsequent operations return
    /// [`StoreError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start a run.
    pub async fn create_run(&self, id: &str, group_folder: &str, now_ms: i64) -> Result<()> {
        self.ensure_open()?;
        let (id, group_folder) = (id.to_string(), group_folder.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_runs (id, group_folder, status, created_at)
                     VALUES (?1, ?2, 'running', ?3)",
                    params![id, group_folder, now_ms],
                )?;
                Ok(())
            })
            .await
    }

    /// Append one step result.
    pub async fn add_step(&self, run_id: &str, idx: u32, result: &str) -> Result<()> {
        self.ensure_open()?;
        let (run_id, result) = (run_id.to_string(), result.to_string());
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO workflow_steps (run_id, idx, result)
                     VALUES (?1, ?2, ?3)",
                    params![run_id, idx as i64, result],
                )?;
                Ok(())
            })
            .await
    }

    /// Mark a run terminal.
    pub async fn finish_run(&self, id: &str, status: &str, now_ms: i64) -> Result<()> {
        self.ensure_open()?;
        let (id, status) = (id.to_string(), status.to_string());
        self.db
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE workflow_runs SET status = ?2, finished_at = ?3 WHERE id = ?1",
                    params![id, status, now_ms],
                )?;
                if n == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Fetch a run by id.
    pub async fn run(&self, id: &str) -> Result<Option<WorkflowRun>> {
        self.ensure_open()?;
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM workflow_runs WHERE id = ?1")?;
                let mut rows = stmt.query_map(params![id], row_to_run)?;
                match rows.next() {
                    Some(row) => Ok(Some(row?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Delete terminal runs finished before `cutoff_ms`, and their step
    /// results. Running runs are never deleted. Returns the number of
    /// removed runs.
    pub async fn prune_finished_before(&self, cutoff_ms: i64) -> Result<u64> {
        self.ensure_open()?;
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM workflow_steps WHERE run_id IN
                        (SELECT id FROM workflow_runs
                         WHERE status != 'running' AND finished_at IS NOT NULL AND finished_at < ?1)",
                    params![cutoff_ms],
                )?;
                let n = tx.execute(
                    "DELETE FROM workflow_runs
                     WHERE status != 'running' AND finished_at IS NOT NULL AND finished_at < ?1",
                    params![cutoff_ms],
                )?;
                tx.commit()?;
                Ok(n as u64)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (WorkflowStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let host = HostStore::open(dir.path().join("m.db")).await.unwrap();
        (WorkflowStore::new(&host), dir)
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let (wf, _dir) = store().await;
        wf.create_run("wf-1", "main", 1000).await.unwrap();
        wf.add_step("wf-1", 0, "step zero").await.unwrap();
        wf.add_step("wf-1", 1, "step one").await.unwrap();
        wf.finish_run("wf-1", "completed", 2000).await.unwrap();

        let run = wf.run("wf-1").await.unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert_eq!(run.finished_at, Some(2000));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_operations() {
        let (wf, _dir) = store().await;
        wf.close();
        wf.close();
        assert!(wf.is_closed());
        assert!(matches!(
            wf.create_run("wf-1", "main", 1000).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn prune_spares_running_and_recent_runs() {
        let (wf, _dir) = store().await;
        wf.create_run("old", "main", 1000).await.unwrap();
        wf.finish_run("old", "completed", 2000).await.unwrap();
        wf.create_run("recent", "main", 1000).await.unwrap();
        wf.finish_run("recent", "completed", 9000).await.unwrap();
        wf.create_run("live", "main", 1000).await.unwrap();

        let removed = wf.prune_finished_before(5000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(wf.run("old").await.unwrap().is_none());
        assert!(wf.run("recent").await.unwrap().is_some());
        assert!(wf.run("live").await.unwrap().is_some());
    }
}
