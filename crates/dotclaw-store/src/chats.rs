//! Chat catch-up state and message history reads.

use rusqlite::params;

use dotclaw_types::message::ChatState;

use crate::HostStore;
use crate::error::Result;

/// A stored message used for catch-up formatting.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Sender display name.
    pub sender_name: String,
    /// Message text.
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl HostStore {
    /// Current chat state, if the chat has ever seen a message.
    pub async fn chat_state(&self, chat_id: &str) -> Result<Option<ChatState>> {
        let chat_id = chat_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chat_id, name, last_message_time, last_agent_timestamp
                     FROM chats WHERE chat_id = ?1",
                )?;
                let mut rows = stmt.query_map(params![chat_id], |row| {
                    Ok(ChatState {
                        chat_id: row.get(0)?,
                        name: row.get(1)?,
                        last_message_time: row.get(2)?,
                        last_agent_timestamp: row.get(3)?,
                    })
                })?;
                match rows.next() {
                    Some(row) => Ok(Some(row?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Record that the agent replied to the chat at `ts`.
    pub async fn set_last_agent_timestamp(&self, chat_id: &str, ts: i64) -> Result<()> {
        let chat_id = chat_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO chats (chat_id, last_agent_timestamp) VALUES (?1, ?2)
                     ON CONFLICT(chat_id) DO UPDATE SET
                        last_agent_timestamp = MAX(last_agent_timestamp, excluded.last_agent_timestamp)",
                    params![chat_id, ts],
                )?;
                Ok(())
            })
            .await
    }

    /// Messages for a chat strictly after `after_ts`, oldest first.
    pub async fn messages_since(&self, chat_id: &str, after_ts: i64) -> Result<Vec<StoredMessage>> {
        let chat_id = chat_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sender_name, content, timestamp FROM messages
                     WHERE chat_id = ?1 AND timestamp > ?2
                     ORDER BY timestamp ASC",
                )?;
                let rows = stmt.query_map(params![chat_id, after_ts], |row| {
                    Ok(StoredMessage {
                        sender_name: row.get(0)?,
                        content: row.get(1)?,
                        timestamp: row.get(2)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
            })
            .await
    }
}
