//! Inbound messages, the durable queue item, and chat catch-up state.

use serde::{Deserialize, Serialize};

/// A message delivered by a provider adapter, before admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Provider message id (unique within the chat).
    pub id: String,

    /// Provider-prefixed chat id.
    pub chat_id: String,

    /// Sender's provider user id.
    pub sender_id: String,

    /// Sender's display name.
    pub sender_name: String,

    /// Message text.
    pub content: String,

    /// Epoch milliseconds.
    pub timestamp: i64,

    /// Whether the chat is a group chat (vs. a private chat).
    #[serde(default)]
    pub is_group: bool,

    /// Provider-specific chat type tag (`private`, `group`, `channel`).
    #[serde(default)]
    pub chat_type: String,

    /// Whether the message mentions or replies to the bot.
    #[serde(default)]
    pub mentions_bot: bool,
}

/// Queue item lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be claimed.
    Queued,
    /// Claimed by a drain; at most one batch per chat is claimed at once.
    Claimed,
    /// Terminal success.
    Done,
    /// Terminal failure after exhausting retries.
    Failed,
}

impl QueueStatus {
    /// Stable string form used in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parse the store string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "claimed" => Some(Self::Claimed),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A durable message-queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Item id (the provider message id).
    pub id: String,
    /// Provider-prefixed chat id.
    pub chat_id: String,
    /// Sender's provider user id.
    pub sender_id: String,
    /// Sender's display name.
    pub sender_name: String,
    /// Message text.
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Whether the chat is a group chat.
    pub is_group: bool,
    /// Provider chat type tag.
    pub chat_type: String,
    /// Lifecycle state.
    pub status: QueueStatus,
    /// Retry attempts so far.
    pub attempt: u32,
    /// Last failure reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the item was claimed, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    /// Claims older than this are reaped back to queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_deadline: Option<i64>,
}

impl QueueItem {
    /// Build a fresh queued item from an admitted inbound message.
    pub fn from_incoming(msg: &IncomingMessage) -> Self {
        Self {
            id: msg.id.clone(),
            chat_id: msg.chat_id.clone(),
            sender_id: msg.sender_id.clone(),
            sender_name: msg.sender_name.clone(),
            content: msg.content.clone(),
            timestamp: msg.timestamp,
            is_group: msg.is_group,
            chat_type: msg.chat_type.clone(),
            status: QueueStatus::Queued,
            attempt: 0,
            last_error: None,
            claimed_at: None,
            claim_deadline: None,
        }
    }
}

/// Materialized per-chat state used for catch-up since the last agent
/// reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    /// Provider-prefixed chat id.
    pub chat_id: String,
    /// Display name of the chat.
    pub name: String,
    /// Timestamp of the newest stored message, epoch milliseconds.
    pub last_message_time: i64,
    /// Timestamp of the last agent reply, epoch milliseconds.
    pub last_agent_timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_status_roundtrip() {
        for s in [
            QueueStatus::Queued,
            QueueStatus::Claimed,
            QueueStatus::Done,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(QueueStatus::parse("bogus"), None);
    }

    #[test]
    fn from_incoming_starts_queued() {
        let msg = IncomingMessage {
            id: "m1".into(),
            chat_id: "telegram:-1".into(),
            sender_id: "u1".into(),
            sender_name: "Ada".into(),
            content: "hi".into(),
            timestamp: 1_700_000_000_000,
            is_group: false,
            chat_type: "private".into(),
            mentions_bot: false,
        };
        let item = QueueItem::from_incoming(&msg);
        assert_eq!(item.status, QueueStatus::Queued);
        assert_eq!(item.attempt, 0);
        assert!(item.claimed_at.is_none());
    }

    #[test]
    fn incoming_serde_defaults() {
        let json = r#"{"id":"m1","chatId":"c","senderId":"u","senderName":"n","content":"x","timestamp":5}"#;
        let msg: IncomingMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.is_group);
        assert!(!msg.mentions_bot);
        assert!(msg.chat_type.is_empty());
    }
}
