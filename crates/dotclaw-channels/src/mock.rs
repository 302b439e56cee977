//! In-memory recording provider.
//!
//! Stands in for Telegram/Discord in host tests: records every send,
//! edit, and delete, hands out sequential message ids, and can simulate a
//! disconnected adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::traits::{
    MediaPayload, MessageId, OutboundMessage, Provider, ProviderError, ProviderHost,
};

/// One recorded outbound operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    /// `send` with (chat_id, text, assigned message id).
    Send(String, String, String),
    /// `edit` with (chat_id, message id, new text).
    Edit(String, String, String),
    /// `delete` with (chat_id, message id).
    Delete(String, String),
    /// `send_media` with (chat_id, media kind).
    Media(String, String),
}

/// Recording provider for tests.
pub struct MockProvider {
    name: String,
    connected: AtomicBool,
    next_id: AtomicU64,
    records: Mutex<Vec<Recorded>>,
}

impl MockProvider {
    /// A connected mock named `"mock"`.
    pub fn new() -> Self {
        Self::named("mock")
    }

    /// A connected mock with an explicit provider name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Simulate (dis)connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Everything recorded so far, in order.
    pub fn records(&self) -> Vec<Recorded> {
        self.records.lock().clone()
    }

    /// Texts of all `send` operations, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Send(_, text, _) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// The final text of a message after all edits, if it still exists.
    pub fn final_text(&self, message_id: &str) -> Option<String> {
        let records = self.records.lock();
        let mut text = None;
        for record in records.iter() {
            match record {
                Recorded::Send(_, t, id) if id == message_id => text = Some(t.clone()),
                Recorded::Edit(_, id, t) if id == message_id => text = Some(t.clone()),
                Recorded::Delete(_, id) if id == message_id => text = None,
                _ => {}
            }
        }
        text
    }

    fn ensure_connected(&self) -> Result<(), ProviderError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::NotConnected)
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start(
        &self,
        _host: Arc<dyn ProviderHost>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ProviderError> {
        self.ensure_connected()?;
        let id = format!("{}-msg-{}", self.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records.lock().push(Recorded::Send(
            msg.chat_id.clone(),
            msg.text.clone(),
            id.clone(),
        ));
        Ok(MessageId(id))
    }

    async fn edit(
        &self,
        chat_id: &str,
        message_id: &MessageId,
        text: &str,
    ) -> Result<(), ProviderError> {
        self.ensure_connected()?;
        self.records.lock().push(Recorded::Edit(
            chat_id.to_string(),
            message_id.0.clone(),
            text.to_string(),
        ));
        Ok(())
    }

    async fn delete(&self, chat_id: &str, message_id: &MessageId) -> Result<(), ProviderError> {
        self.ensure_connected()?;
        self.records
            .lock()
            .push(Recorded::Delete(chat_id.to_string(), message_id.0.clone()));
        Ok(())
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: &MediaPayload,
    ) -> Result<MessageId, ProviderError> {
        self.ensure_connected()?;
        let id = format!("{}-msg-{}", self.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.records
            .lock()
            .push(Recorded::Media(chat_id.to_string(), media.kind.clone()));
        Ok(MessageId(id))
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>, ProviderError> {
        self.ensure_connected()?;
        Ok(format!("file:{file_id}").into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_send_edit_delete() {
        let p = MockProvider::new();
        let id = p
            .send(&OutboundMessage::text("mock:1", "first"))
            .await
            .unwrap();
        p.edit("mock:1", &id, "second").await.unwrap();
        assert_eq!(p.final_text(&id.0).as_deref(), Some("second"));

        p.delete("mock:1", &id).await.unwrap();
        assert_eq!(p.final_text(&id.0), None);
        assert_eq!(p.records().len(), 3);
    }

    #[tokio::test]
    async fn disconnected_mock_refuses() {
        let p = MockProvider::new();
        p.set_connected(false);
        let err = p
            .send(&OutboundMessage::text("mock:1", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConnected));
    }

    #[tokio::test]
    async fn ids_are_sequential_and_prefixed() {
        let p = MockProvider::named("telegram");
        let a = p.send(&OutboundMessage::text("telegram:1", "a")).await.unwrap();
        let b = p.send(&OutboundMessage::text("telegram:1", "b")).await.unwrap();
        assert_eq!(a.0, "telegram-msg-1");
        assert_eq!(b.0, "telegram-msg-2");
    }

    #[tokio::test]
    async fn media_and_download() {
        let p = MockProvider::new();
        p.send_media(
            "mock:1",
            &MediaPayload {
                kind: "photo".into(),
                fields: serde_json::json!({"url": "x"}),
            },
        )
        .await
        .unwrap();
        assert!(matches!(&p.records()[0], Recorded::Media(_, kind) if kind == "photo"));

        let bytes = p.download("f1").await.unwrap();
        assert_eq!(bytes, b"file:f1");
    }
}
