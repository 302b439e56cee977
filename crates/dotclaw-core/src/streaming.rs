//! Streaming delivery.
//!
//! The in-container agent can emit incremental output as
//! `chunk_000001.txt`, `chunk_000002.txt`, … in a stream directory,
//! terminated by a `done` sentinel. The host consumes them strictly in
//! index order (a chunk whose predecessor has not appeared yet is not
//! applied), coalesces within the flush interval, sends the first flush
//! as a fresh provider message, and edits that message in place for later
//! flushes -- rolling over to a new message when `max_edit_length` would
//! be exceeded.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dotclaw_channels::{MessageId, OutboundMessage, Provider};
use dotclaw_types::config::StreamingConfig;

/// Name of the end-of-stream sentinel file.
pub const DONE_SENTINEL: &str = "done";

/// What a streaming pass delivered.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Every provider message created, in order.
    pub messages: Vec<MessageId>,
    /// The full text delivered so far.
    pub delivered: String,
    /// Length of the text held by the last (editable) message. Earlier
    /// rolled-over messages are frozen; this is what finalization may
    /// still rewrite.
    pub last_len: usize,
    /// Chunks applied.
    pub chunks_applied: u32,
}

impl StreamOutcome {
    /// The message currently being edited in place.
    pub fn last_message(&self) -> Option<&MessageId> {
        self.messages.last()
    }
}

fn chunk_name(index: u32) -> String {
    format!("chunk_{index:06}.txt")
}

/// Consume a stream directory until the `done` sentinel (and all
/// contiguous chunks) or cancellation.
pub async fn deliver_stream(
    provider: Arc<dyn Provider>,
    chat_id: &str,
    stream_dir: &Path,
    cfg: &StreamingConfig,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let mut outcome = StreamOutcome::default();
    let mut next_index: u32 = 1;
    let mut pending = String::new();
    let mut current_text = String::new();
    let mut last_flush = tokio::time::Instant::now();
    let flush_every = Duration::from_millis(cfg.chunk_flush_interval_ms);
    let poll = Duration::from_millis(50);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Drain every contiguous chunk that has appeared.
        loop {
            let path = stream_dir.join(chunk_name(next_index));
            match tokio::fs::read_to_string(&path).await {
                Ok(chunk) => {
                    pending.push_str(&chunk);
                    outcome.chunks_applied += 1;
                    next_index += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => {
                    warn!(error = %e, "unreadable stream chunk");
                    break;
                }
            }
        }

        let done = tokio::fs::try_exists(stream_dir.join(DONE_SENTINEL))
            .await
            .unwrap_or(false);

        if !pending.is_empty() && (done || last_flush.elapsed() >= flush_every) {
            flush(
                provider.as_ref(),
                chat_id,
                cfg,
                &mut outcome,
                &mut current_text,
                &mut pending,
            )
            .await;
            last_flush = tokio::time::Instant::now();
        }

        if done {
            // Anything past a gap is refused; whatever was contiguous has
            // been applied.
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.cancelled() => break,
        }
    }
    outcome
}

async fn flush(
    provider: &dyn Provider,
    chat_id: &str,
    cfg: &StreamingConfig,
    outcome: &mut StreamOutcome,
    current_text: &mut String,
    pending: &mut String,
) {
    let addition = std::mem::take(pending);
    outcome.delivered.push_str(&addition);

    let rolled_over =
        !current_text.is_empty() && current_text.len() + addition.len() > cfg.max_edit_length;
    if rolled_over {
        current_text.clear();
    }
    current_text.push_str(&addition);
    outcome.last_len = current_text.len();

    let result = match outcome.messages.last() {
        Some(last) if !rolled_over => provider.edit(chat_id, last, current_text).await,
        _ => match provider
            .send(&OutboundMessage::text(chat_id, current_text.clone()))
            .await
        {
            Ok(id) => {
                outcome.messages.push(id);
                Ok(())
            }
            Err(e) => Err(e),
        },
    };
    if let Err(e) = result {
        warn!(error = %e, "stream flush failed");
    }
    debug!(len = outcome.delivered.len(), "stream flushed");
}

/// Finalize a streamed delivery with the definitive reply text.
///
/// When something was streamed, the last message is edited to hold the
/// tail of the final text (earlier rolled-over messages stay as they
/// are); when nothing was streamed, nothing happens and the caller sends
/// the reply normally.
pub async fn finalize_stream(
    provider: &dyn Provider,
    chat_id: &str,
    outcome: &StreamOutcome,
    final_text: &str,
    cfg: &StreamingConfig,
) -> bool {
    let Some(last) = outcome.last_message() else {
        return false;
    };
    // The final text minus what earlier (frozen) messages already carry.
    let already_frozen = outcome.delivered.len().saturating_sub(outcome.last_len);
    let tail = final_text.get(already_frozen..).unwrap_or(final_text);
    let bounded = if tail.len() > cfg.max_edit_length {
        let mut cut = cfg.max_edit_length;
        while !tail.is_char_boundary(cut) {
            cut -= 1;
        }
        &tail[..cut]
    } else {
        tail
    };
    if let Err(e) = provider.edit(chat_id, last, bounded).await {
        warn!(error = %e, "stream finalize failed");
    }
    true
}

/// Delete every streamed message (interrupt-on-new-message policy).
pub async fn discard_stream(provider: &dyn Provider, chat_id: &str, outcome: &StreamOutcome) {
    for id in &outcome.messages {
        if let Err(e) = provider.delete(chat_id, id).await {
            warn!(error = %e, "failed to delete streamed message");
        }
    }
}
