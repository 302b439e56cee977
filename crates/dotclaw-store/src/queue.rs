//! The durable per-chat message queue.
//!
//! Transitions: `queued → claimed` (batch claim only), `claimed → queued`
//! (requeue with incremented attempt and jittered backoff),
//! `claimed → done`, `claimed → failed`. A chat never has two claimed
//! batches at once: `claim_batch` returns empty while any item for the
//! chat is still claimed, which is also what backpressure leans on.

use rusqlite::{Connection, params};

use dotclaw_types::message::{QueueItem, QueueStatus};

use crate::error::{Result, StoreError};
use crate::HostStore;

/// Backoff parameters for [`HostStore::requeue`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base delay in milliseconds.
    pub base_ms: u64,
    /// Delay cap in milliseconds.
    pub max_ms: u64,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` becomes visible again, with ±50%
    /// jitter, capped at `max_ms`.
    fn delay_ms(&self, attempt: u32) -> u64 {
        use rand::Rng;
        let exp = self.base_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        ((exp as f64 * jitter) as u64).min(self.max_ms)
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
    let status: String = row.get("status")?;
    Ok(QueueItem {
        id: row.get("id")?,
        chat_id: row.get("chat_id")?,
        sender_id: row.get("sender_id")?,
        sender_name: row.get("sender_name")?,
        content: row.get("content")?,
        timestamp: row.get("timestamp")?,
        is_group: row.get::<_, i64>("is_group")? != 0,
        chat_type: row.get("chat_type")?,
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Queued),
        attempt: row.get::<_, i64>("attempt")? as u32,
        last_error: row.get("last_error")?,
        claimed_at: row.get("claimed_at")?,
        claim_deadline: row.get("claim_deadline")?,
    })
}

fn chat_has_claim(conn: &Connection, chat_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM queue WHERE chat_id = ?1 AND status = 'claimed')",
        params![chat_id],
        |row| row.get(0),
    )
}

impl HostStore {
    /// Persist an admitted message to the log and the queue in one
    /// transaction, and bump the chat's `last_message_time`.
    pub async fn enqueue(&self, item: QueueItem, chat_name: String) -> Result<()> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR REPLACE INTO messages (id, chat_id, sender_id, sender_name, content, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        item.id,
                        item.chat_id,
                        item.sender_id,
                        item.sender_name,
                        item.content,
                        item.timestamp
                    ],
                )?;
                tx.execute(
                    "INSERT OR IGNORE INTO queue
                     (id, chat_id, sender_id, sender_name, content, timestamp, is_group, chat_type)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        item.id,
                        item.chat_id,
                        item.sender_id,
                        item.sender_name,
                        item.content,
                        item.timestamp,
                        item.is_group as i64,
                        item.chat_type
                    ],
                )?;
                tx.execute(
                    "INSERT INTO chats (chat_id, name, last_message_time) VALUES (?1, ?2, ?3)
                     ON CONFLICT(chat_id) DO UPDATE SET
                        name = excluded.name,
                        last_message_time = MAX(last_message_time, excluded.last_message_time)",
                    params![item.chat_id, chat_name, item.timestamp],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Claim the next batch for a chat: up to `max_batch` queued items in
    /// timestamp order, all within `window_ms` of the first one.
    ///
    /// Returns empty while the chat already has a claimed batch, or when
    /// nothing is visible yet.
    pub async fn claim_batch(
        &self,
        chat_id: &str,
        window_ms: u64,
        max_batch: u32,
        now_ms: i64,
        claim_deadline_ms: u64,
    ) -> Result<Vec<QueueItem>> {
        let chat_id = chat_id.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                if chat_has_claim(&tx, &chat_id)? {
                    return Ok(Vec::new());
                }

                let mut items: Vec<QueueItem> = {
                    let mut stmt = tx.prepare(
                        "SELECT * FROM queue
                         WHERE chat_id = ?1 AND status = 'queued' AND visible_at <= ?2
                         ORDER BY timestamp ASC LIMIT ?3",
                    )?;
                    let rows = stmt.query_map(
                        params![chat_id, now_ms, max_batch as i64],
                        row_to_item,
                    )?;
                    rows.collect::<rusqlite::Result<_>>()?
                };

                if let Some(first_ts) = items.first().map(|i| i.timestamp) {
                    items.retain(|i| i.timestamp <= first_ts + window_ms as i64);
                }

                let deadline = now_ms + claim_deadline_ms as i64;
                for item in &mut items {
                    tx.execute(
                        "UPDATE queue SET status = 'claimed', claimed_at = ?2, claim_deadline = ?3
                         WHERE id = ?1",
                        params![item.id, now_ms, deadline],
                    )?;
                    item.status = QueueStatus::Claimed;
                    item.claimed_at = Some(now_ms);
                    item.claim_deadline = Some(deadline);
                }
                tx.commit()?;
                Ok(items)
            })
            .await
    }

    /// Mark claimed items done (terminal).
    pub async fn mark_done(&self, ids: Vec<String>) -> Result<()> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        "UPDATE queue SET status = 'done', last_error = NULL WHERE id = ?1",
                        params![id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Return claimed items to the queue with `attempt + 1` and a
    /// jittered exponential backoff before they become visible again.
    pub async fn requeue(
        &self,
        ids: Vec<String>,
        reason: String,
        policy: RetryPolicy,
        now_ms: i64,
    ) -> Result<()> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    let attempt: u32 = tx
                        .query_row(
                            "SELECT attempt FROM queue WHERE id = ?1",
                            params![id],
                            |row| row.get::<_, i64>(0),
                        )
                        .map(|a| a as u32)
                        .map_err(|_| StoreError::NotFound(id.clone()))?;
                    let next = attempt + 1;
                    let visible_at = now_ms + policy.delay_ms(next) as i64;
                    tx.execute(
                        "UPDATE queue SET status = 'queued', attempt = ?2, last_error = ?3,
                                claimed_at = NULL, claim_deadline = NULL, visible_at = ?4
                         WHERE id = ?1",
                        params![id, next as i64, reason, visible_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Hand claimed items back to the queue without an attempt penalty
    /// (interrupt-on-new-message path). Items are visible immediately.
    pub async fn release_claims(&self, ids: Vec<String>) -> Result<()> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        "UPDATE queue SET status = 'queued', claimed_at = NULL,
                                claim_deadline = NULL
                         WHERE id = ?1 AND status = 'claimed'",
                        params![id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Mark items failed (terminal) with a reason.
    pub async fn fail(&self, ids: Vec<String>, reason: String) -> Result<()> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        "UPDATE queue SET status = 'failed', last_error = ?2,
                                claimed_at = NULL, claim_deadline = NULL
                         WHERE id = ?1",
                        params![id, reason],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Return abandoned claims (deadline in the past) to the queue.
    /// Returns how many were reaped.
    pub async fn reap_expired_claims(&self, now_ms: i64) -> Result<u64> {
        self.db
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE queue SET status = 'queued', claimed_at = NULL, claim_deadline = NULL
                     WHERE status = 'claimed' AND claim_deadline < ?1",
                    params![now_ms],
                )?;
                Ok(n as u64)
            })
            .await
    }

    /// Count queued items for a chat newer than `after_ts`.
    ///
    /// The pipeline uses this to detect that a newer message arrived while
    /// a run is in flight.
    pub async fn queued_after(&self, chat_id: &str, after_ts: i64) -> Result<u64> {
        let chat_id = chat_id.to_string();
        self.db
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM queue
                     WHERE chat_id = ?1 AND status = 'queued' AND timestamp > ?2",
                    params![chat_id, after_ts],
                    |row| row.get(0),
                )?;
                Ok(n as u64)
            })
            .await
    }

    /// Chats that currently have visible queued items.
    pub async fn chats_with_queued(&self, now_ms: i64) -> Result<Vec<String>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT chat_id FROM queue
                     WHERE status = 'queued' AND visible_at <= ?1",
                )?;
                let rows = stmt.query_map(params![now_ms], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
            })
            .await
    }

    /// Fetch one queue item by id.
    pub async fn queue_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT * FROM queue WHERE id = ?1")?;
                let mut rows = stmt.query_map(params![id], row_to_item)?;
                match rows.next() {
                    Some(row) => Ok(Some(row?)),
                    None => Ok(None),
                }
            })
            .await
    }
}
