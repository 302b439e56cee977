//! Background job persistence.

use rusqlite::{Row, params};

use dotclaw_types::job::{BackgroundJob, JobState};

use crate::HostStore;
use crate::error::{Result, StoreError};

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<BackgroundJob> {
    let status: String = row.get("status")?;
    Ok(BackgroundJob {
        id: row.get("id")?,
        group_folder: row.get("group_folder")?,
        chat_jid: row.get("chat_jid")?,
        prompt: row.get("prompt")?,
        status: JobState::parse(&status).unwrap_or(JobState::Failed),
        output: row.get("output")?,
        output_path: row.get("output_path")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

impl HostStore {
    /// Insert a queued job.
    pub async fn create_job(&self, job: BackgroundJob) -> Result<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (id, group_folder, chat_jid, prompt, status, output,
                        output_path, created_at, started_at, finished_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        job.id,
                        job.group_folder,
                        job.chat_jid,
                        job.prompt,
                        job.status.as_str(),
                        job.output,
                        job.output_path,
                        job.created_at,
                        job.started_at,
                        job.finished_at
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Claim the oldest queued job, marking it running.
    pub async fn claim_next_job(&self, now_ms: i64) -> Result<Option<BackgroundJob>> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let job = {
                    let mut stmt = tx.prepare(
                        "SELECT * FROM jobs WHERE status = 'queued' ORDER BY created_at ASC LIMIT 1",
                    )?;
                    let mut rows = stmt.query_map([], row_to_job)?;
                    match rows.next() {
                        Some(row) => Some(row?),
                        None => None,
                    }
                };
                let Some(mut job) = job else {
                    return Ok(None);
                };
                tx.execute(
                    "UPDATE jobs SET status = 'running', started_at = ?2 WHERE id = ?1",
                    params![job.id, now_ms],
                )?;
                tx.commit()?;
                job.status = JobState::Running;
                job.started_at = Some(now_ms);
                Ok(Some(job))
            })
            .await
    }

    /// Record a terminal outcome for a job.
    pub async fn finish_job(
        &self,
        id: &str,
        state: JobState,
        output: Option<String>,
        output_path: Option<String>,
        now_ms: i64,
    ) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE jobs SET status = ?2, output = ?3, output_path = ?4, finished_at = ?5
                     WHERE id = ?1",
                    params![id, state.as_str(), output, output_path, now_ms],
                )?;
                if n == 0 {
                    return Err(StoreError::NotFound(id));
                }
                Ok(())
            })
            .await
    }

    /// Cancel a job that has not finished. Returns the state the job was
    /// in before cancellation, or `None` if it was already terminal.
    pub async fn cancel_job(&self, id: &str, now_ms: i64) -> Result<Option<JobState>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let prior: Option<String> = {
                    let mut stmt = tx.prepare("SELECT status FROM jobs WHERE id = ?1")?;
                    let mut rows = stmt.query_map(params![id], |row| row.get(0))?;
                    match rows.next() {
                        Some(row) => Some(row?),
                        None => None,
                    }
                };
                let Some(prior) = prior else {
                    return Err(StoreError::NotFound(id));
                };
                let prior = JobState::parse(&prior).unwrap_or(JobState::Failed);
                if prior.is_terminal() {
                    return Ok(None);
                }
                tx.execute(
                    "UPDATE jobs SET status = 'canceled', finished_at = ?2 WHERE id = ?1",
                    params![id, now_ms],
                )?;
                tx.commit()?;
                Ok(Some(prior))
            })
            .await
    }

    /// Fetch a job by id.
    pub async fn job(&self, id: &str) -> Result<Option<BackgroundJob>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
                let mut rows = stmt.query_map(params![id], row_to_job)?;
                match rows.next() {
                    Some(row) => Ok(Some(row?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// List jobs for a group, newest first.
    pub async fn list_jobs(&self, group_folder: &str) -> Result<Vec<BackgroundJob>> {
        let group_folder = group_folder.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs WHERE group_folder = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![group_folder], row_to_job)?;
                rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> BackgroundJob {
        BackgroundJob {
            id: id.into(),
            group_folder: "main".into(),
            chat_jid: "telegram:-1".into(),
            prompt: "research everything".into(),
            status: JobState::Queued,
            output: None,
            output_path: None,
            created_at: 1000,
            started_at: None,
            finished_at: None,
        }
    }

    async fn store() -> (HostStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = HostStore::open(dir.path().join("m.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn claim_marks_running_in_fifo_order() {
        let (store, _dir) = store().await;
        let mut j1 = job("job-1");
        j1.created_at = 1000;
        let mut j2 = job("job-2");
        j2.created_at = 2000;
        store.create_job(j2).await.unwrap();
        store.create_job(j1).await.unwrap();

        let first = store.claim_next_job(5000).await.unwrap().unwrap();
        assert_eq!(first.id, "job-1");
        assert_eq!(first.status, JobState::Running);
        assert_eq!(first.started_at, Some(5000));

        let second = store.claim_next_job(5001).await.unwrap().unwrap();
        assert_eq!(second.id, "job-2");
        assert!(store.claim_next_job(5002).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finish_records_output_reference() {
        let (store, _dir) = store().await;
        store.create_job(job("job-1")).await.unwrap();
        store.claim_next_job(5000).await.unwrap();
        store
            .finish_job(
                "job-1",
                JobState::Completed,
                Some("summary".into()),
                Some("jobs/job-1/output.md".into()),
                6000,
            )
            .await
            .unwrap();
        let j = store.job("job-1").await.unwrap().unwrap();
        assert_eq!(j.status, JobState::Completed);
        assert_eq!(j.output_path.as_deref(), Some("jobs/job-1/output.md"));
        assert_eq!(j.finished_at, Some(6000));
    }

    #[tokio::test]
    async fn cancel_queued_and_running_but_not_terminal() {
        let (store, _dir) = store().await;
        store.create_job(job("job-1")).await.unwrap();
        assert_eq!(
            store.cancel_job("job-1", 2000).await.unwrap(),
            Some(JobState::Queued)
        );
        // Second cancel is a no-op.
        assert_eq!(store.cancel_job("job-1", 2001).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_jobs_newest_first() {
        let (store, _dir) = store().await;
        let mut j1 = job("job-1");
        j1.created_at = 1000;
        let mut j2 = job("job-2");
        j2.created_at = 2000;
        store.create_job(j1).await.unwrap();
        store.create_job(j2).await.unwrap();
        let jobs = store.list_jobs("main").await.unwrap();
        assert_eq!(jobs[0].id, "job-2");
    }
}
