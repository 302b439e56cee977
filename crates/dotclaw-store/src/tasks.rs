//! Scheduled-task persistence.
//!
//! The scheduler claims due tasks atomically by setting `running_since`;
//! a task with `running_since` set is held by exactly one worker. Crash
//! recovery reverts claims older than the configured task timeout.

use rusqlite::{Row, params};

use dotclaw_types::task::{ContextMode, ScheduleType, ScheduledTask, TaskStatus};

use crate::HostStore;
use crate::error::{Result, StoreError};

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let schedule_type: String = row.get("schedule_type")?;
    let status: String = row.get("status")?;
    let context_mode: String = row.get("context_mode")?;
    Ok(ScheduledTask {
        id: row.get("id")?,
        group_folder: row.get("group_folder")?,
        chat_jid: row.get("chat_jid")?,
        prompt: row.get("prompt")?,
        schedule_type: ScheduleType::parse(&schedule_type).unwrap_or(ScheduleType::Once),
        schedule_value: row.get("schedule_value")?,
        context_mode: if context_mode == "recent" {
            ContextMode::Recent
        } else {
            ContextMode::None
        },
        next_run: row.get("next_run")?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Canceled),
        attempt: row.get::<_, i64>("attempt")? as u32,
        last_result: row.get("last_result")?,
        running_since: row.get("running_since")?,
        state_json: row.get("state_json")?,
        created_at: row.get("created_at")?,
    })
}

impl HostStore {
    /// Insert a new task.
    pub async fn create_task(&self, task: ScheduledTask) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, group_folder, chat_jid, prompt, schedule_type,
                        schedule_value, context_mode, next_run, status, attempt, last_result,
                        running_since, state_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        task.id,
                        task.group_folder,
                        task.chat_jid,
                        task.prompt,
                        task.schedule_type.as_str(),
                        task.schedule_value,
                        match task.context_mode {
                            ContextMode::None => "none",
                            ContextMode::Recent => "recent",
                        },
                        task.next_run,
                        task.status.as_str(),
                        task.attempt as i64,
                        task.last_result,
                        task.running_since,
                        task.state_json,
                        task.created_at
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Fetch a task by id.
    pub async fn task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
                let mut rows = stmt.query_map(params![id], row_to_task)?;
                match rows.next() {
                    Some(row) => Ok(Some(row?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// List tasks, optionally scoped to one group.
    pub async fn list_tasks(&self, group_folder: Option<String>) -> Result<Vec<ScheduledTask>> {
        self.db
            .call(move |conn| {
                let (sql, param): (&str, Vec<String>) = match &group_folder {
                    Some(g) => (
                        "SELECT * FROM tasks WHERE group_folder = ?1 ORDER BY created_at ASC",
                        vec![g.clone()],
                    ),
                    None => ("SELECT * FROM tasks ORDER BY created_at ASC", vec![]),
                };
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(param), row_to_task)?;
                rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
            })
            .await
    }

    /// Atomically claim all due active tasks: `status = active`,
    /// `next_run <= now`, `running_since IS NULL`. Claimed tasks get
    /// `running_since = now`.
    pub async fn claim_due_tasks(&self, now_ms: i64) -> Result<Vec<ScheduledTask>> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut due: Vec<ScheduledTask> = {
                    let mut stmt = tx.prepare(
                        "SELECT * FROM tasks
                         WHERE status = 'active' AND next_run <= ?1 AND running_since IS NULL
                         ORDER BY next_run ASC",
                    )?;
                    let rows = stmt.query_map(params![now_ms], row_to_task)?;
                    rows.collect::<rusqlite::Result<_>>()?
                };
                for task in &mut due {
                    tx.execute(
                        "UPDATE tasks SET running_since = ?2 WHERE id = ?1",
                        params![task.id, now_ms],
                    )?;
                    task.running_since = Some(now_ms);
                }
                tx.commit()?;
                Ok(due)
            })
            .await
    }

    /// Record a run outcome and release the claim.
    ///
    /// `next_run = None` parks the task as canceled (a one-shot that
    /// finished or exhausted its retries).
    pub async fn finish_task_run(
        &self,
        id: &str,
        last_result: String,
        attempt: u32,
        next_run: Option<i64>,
    ) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let n = match next_run {
                    Some(next) => conn.execute(
                        "UPDATE tasks SET running_since = NULL, last_result = ?2,
                                attempt = ?3, next_run = ?4
                         WHERE id = ?1",
                        params![id, last_result, attempt as i64, next],
                    )?,
                    None => conn.execute(
                        "UPDATE tasks SET running_since = NULL, last_result = ?2,
                                attempt = ?3, status = 'canceled'
                         WHERE id = ?1",
                        params![id, last_result, attempt as i64],
                    )?,
                };
                if n == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Set a task's lifecycle status. Pausing or canceling also clears
    /// any stale claim.
    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = ?2,
                            running_since = CASE WHEN ?2 = 'active' THEN running_since ELSE NULL END
                     WHERE id = ?1",
                    params![id, status.as_str()],
                )?;
                if n == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Update a task's prompt, schedule, and context mode.
    pub async fn update_task(
        &self,
        id: &str,
        prompt: Option<String>,
        schedule: Option<(ScheduleType, String, i64)>,
        context_mode: Option<ContextMode>,
    ) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(p) = prompt {
                    tx.execute("UPDATE tasks SET prompt = ?2 WHERE id = ?1", params![id, p])?;
                }
                if let Some((kind, value, next_run)) = schedule {
                    tx.execute(
                        "UPDATE tasks SET schedule_type = ?2, schedule_value = ?3, next_run = ?4,
                                attempt = 0
                         WHERE id = ?1",
                        params![id, kind.as_str(), value, next_run],
                    )?;
                }
                if let Some(mode) = context_mode {
                    tx.execute(
                        "UPDATE tasks SET context_mode = ?2 WHERE id = ?1",
                        params![
                            id,
                            match mode {
                                ContextMode::None => "none",
                                ContextMode::Recent => "recent",
                            }
                        ],
                    )?;
                }
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                    params![id],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(StoreError::NotFound(id));
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Revert claims older than `cutoff_ms` (crash recovery). Returns the
    /// number of revived tasks.
    pub async fn recover_stale_tasks(&self, cutoff_ms: i64) -> Result<u64> {
        self.db
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET running_since = NULL
                     WHERE running_since IS NOT NULL AND running_since < ?1",
                    params![cutoff_ms],
                )?;
                Ok(n as u64)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, group: &str, next_run: i64) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            group_folder: group.into(),
            chat_jid: "telegram:-1".into(),
            prompt: "do the thing".into(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "60000".into(),
            context_mode: ContextMode::None,
            next_run,
            status: TaskStatus::Active,
            attempt: 0,
            last_result: None,
            running_since: None,
            state_json: None,
            created_at: 0,
        }
    }

    async fn store() -> (HostStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = HostStore::open(dir.path().join("m.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn claim_due_sets_running_since_once() {
        let (store, _dir) = store().await;
        store.create_task(task("t1", "main", 1000)).await.unwrap();
        store.create_task(task("t2", "main", 9000)).await.unwrap();

        let claimed = store.claim_due_tasks(5000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "t1");
        assert_eq!(claimed[0].running_since, Some(5000));

        // Already claimed: a second sweep takes nothing.
        let again = store.claim_due_tasks(5001).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn finish_run_releases_and_reschedules() {
        let (store, _dir) = store().await;
        store.create_task(task("t1", "main", 1000)).await.unwrap();
        store.claim_due_tasks(5000).await.unwrap();

        store
            .finish_task_run("t1", "ok".into(), 0, Some(65_000))
            .await
            .unwrap();
        let t = store.task("t1").await.unwrap().unwrap();
        assert!(t.running_since.is_none());
        assert_eq!(t.next_run, 65_000);
        assert_eq!(t.last_result.as_deref(), Some("ok"));
        assert_eq!(t.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn finish_run_without_next_run_goes_terminal() {
        let (store, _dir) = store().await;
        let mut t = task("t1", "main", 1000);
        t.schedule_type = ScheduleType::Once;
        store.create_task(t).await.unwrap();
        store.claim_due_tasks(5000).await.unwrap();
        store.finish_task_run("t1", "done".into(), 0, None).await.unwrap();

        let t = store.task("t1").await.unwrap().unwrap();
        assert_eq!(t.status, TaskStatus::Canceled);
        assert!(store.claim_due_tasks(999_999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn paused_tasks_are_never_claimed() {
        let (store, _dir) = store().await;
        store.create_task(task("t1", "main", 1000)).await.unwrap();
        store.set_task_status("t1", TaskStatus::Paused).await.unwrap();
        assert!(store.claim_due_tasks(5000).await.unwrap().is_empty());

        store.set_task_status("t1", TaskStatus::Active).await.unwrap();
        assert_eq!(store.claim_due_tasks(5000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recovery_only_revives_old_claims() {
        let (store, _dir) = store().await;
        store.create_task(task("t1", "main", 1000)).await.unwrap();
        store.claim_due_tasks(5000).await.unwrap();

        // Claim at 5000: cutoff 4000 is older, nothing revived.
        assert_eq!(store.recover_stale_tasks(4000).await.unwrap(), 0);
        // Cutoff past the claim: revived.
        assert_eq!(store.recover_stale_tasks(999_999).await.unwrap(), 1);
        let t = store.task("t1").await.unwrap().unwrap();
        assert!(t.running_since.is_none());
    }

    #[tokio::test]
    async fn list_tasks_scopes_by_group() {
        let (store, _dir) = store().await;
        store.create_task(task("t1", "main", 1)).await.unwrap();
        store.create_task(task("t2", "side", 1)).await.unwrap();

        assert_eq!(store.list_tasks(None).await.unwrap().len(), 2);
        let side = store.list_tasks(Some("side".into())).await.unwrap();
        assert_eq!(side.len(), 1);
        assert_eq!(side[0].id, "t2");
    }

    #[tokio::test]
    async fn update_task_changes_fields() {
        let (store, _dir) = store().await;
        store.create_task(task("t1", "main", 1000)).await.unwrap();
        store
            .update_task(
                "t1",
                Some("new prompt".into()),
                Some((ScheduleType::Cron, "0 0 9 * * * *".into(), 7777)),
                Some(ContextMode::Recent),
            )
            .await
            .unwrap();
        let t = store.task("t1").await.unwrap().unwrap();
        assert_eq!(t.prompt, "new prompt");
        assert_eq!(t.schedule_type, ScheduleType::Cron);
        assert_eq!(t.next_run, 7777);
        assert_eq!(t.context_mode, ContextMode::Recent);
    }

    #[tokio::test]
    async fn missing_task_errors() {
        let (store, _dir) = store().await;
        assert!(matches!(
            store.set_task_status("nope", TaskStatus::Paused).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
