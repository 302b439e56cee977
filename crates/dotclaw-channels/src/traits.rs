//! Provider trait definitions.
//!
//! A provider is a bidirectional connection to a chat platform (Telegram,
//! Discord). The host manages the lifecycle:
//!
//! 1. The host calls [`start`](Provider::start) with an
//!    `Arc<dyn ProviderHost>` and a `CancellationToken`.
//! 2. `start` is long-lived -- it runs until the token is cancelled and
//!    delivers inbound messages via [`ProviderHost::deliver_inbound`].
//! 3. The host calls [`send`](Provider::send) / [`edit`](Provider::edit)
//!    / [`delete`](Provider::delete) for outbound traffic, including the
//!    streaming edit-in-place path.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use dotclaw_types::message::IncomingMessage;

/// Provider-layer errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProviderError {
    /// Failed to establish a connection to the platform backend.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication / authorization was rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Sending, editing, or deleting a message failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The provider is not currently connected.
    #[error("not connected")]
    NotConnected,

    /// No provider is registered for the chat id prefix.
    #[error("no provider for chat: {0}")]
    NoProvider(String),

    /// The provider does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Unique identifier for a sent message, returned by [`Provider::send`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

/// An outbound text message.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Provider-prefixed chat id.
    pub chat_id: String,
    /// Message text, already formatted for the provider.
    pub text: String,
    /// Message to reply to, when threading.
    pub reply_to: Option<String>,
    /// Provider parse mode (`Markdown`, `HTML`, ...).
    pub parse_mode: Option<String>,
}

impl OutboundMessage {
    /// Plain text message to a chat.
    pub fn text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            reply_to: None,
            parse_mode: None,
        }
    }
}

/// A non-text outbound payload (photo, document, poll, ...).
///
/// Fields are provider-specific and pass through as JSON; the host only
/// routes and authorizes them.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    /// Payload kind (`photo`, `document`, `voice`, `audio`, `location`,
    /// `contact`, `poll`, `buttons`).
    pub kind: String,
    /// Provider-specific fields.
    pub fields: serde_json::Value,
}

/// The capability interface every provider adapter implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider identifier; also the chat-id prefix (e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// Whether the provider currently holds a live connection.
    fn is_connected(&self) -> bool;

    /// Start receiving messages. Long-lived; returns when `cancel` fires.
    async fn start(
        &self,
        host: Arc<dyn ProviderHost>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Stop the provider and drop its connection.
    async fn stop(&self) -> Result<(), ProviderError>;

    /// Send a text message.
    async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ProviderError>;

    /// Edit a previously sent message in place.
    async fn edit(
        &self,
        chat_id: &str,
        message_id: &MessageId,
        text: &str,
    ) -> Result<(), ProviderError>;

    /// Delete a previously sent message.
    async fn delete(&self, chat_id: &str, message_id: &MessageId) -> Result<(), ProviderError>;

    /// Send a media payload.
    async fn send_media(
        &self,
        chat_id: &str,
        media: &MediaPayload,
    ) -> Result<MessageId, ProviderError>;

    /// Download a provider attachment by its file id.
    async fn download(&self, file_id: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Services the host exposes to provider adapters.
#[async_trait]
pub trait ProviderHost: Send + Sync {
    /// Deliver an inbound message into the pipeline.
    async fn deliver_inbound(&self, msg: IncomingMessage) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_text_builder() {
        let msg = OutboundMessage::text("telegram:-1", "hello");
        assert_eq!(msg.chat_id, "telegram:-1");
        assert!(msg.reply_to.is_none());
        assert!(msg.parse_mode.is_none());
    }

    #[test]
    fn message_id_hash_and_eq() {
        use std::collections::HashSet;
        let a = MessageId("m1".into());
        let b = MessageId("m1".into());
        let c = MessageId("m2".into());
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn provider_error_display() {
        assert_eq!(ProviderError::NotConnected.to_string(), "not connected");
        assert_eq!(
            ProviderError::NoProvider("matrix:1".into()).to_string(),
            "no provider for chat: matrix:1"
        );
    }
}
