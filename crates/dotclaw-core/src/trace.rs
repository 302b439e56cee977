//! Run telemetry.
//!
//! One JSON line per agent run, appended to the day's
//! `traces/trace-YYYY-MM-DD.jsonl`. Traces carry categories and sanitized
//! messages only, never secrets or full payloads, and are what the
//! benchmark harness and SLO checks consume.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use dotclaw_platform::DataPaths;
use dotclaw_platform::fs::append_line;

/// One trace line.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    /// Epoch milliseconds when the run finished.
    pub ts: i64,
    /// Originating chat.
    pub chat_id: String,
    /// Owning group folder.
    pub group_folder: String,
    /// Model that served (or last attempted) the run.
    pub model: String,
    /// Run latency.
    pub latency_ms: u64,
    /// Prompt tokens.
    pub tokens_prompt: u64,
    /// Completion tokens.
    pub tokens_completion: u64,
    /// Number of tool calls.
    pub tool_calls: u32,
    /// Memory lines recalled for the turn.
    pub memory_recall_count: u32,
    /// Attempts consumed (1 = no failover).
    pub attempts: u32,
    /// Sanitized error string for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Appends trace records to the dated trace file.
#[derive(Clone)]
pub struct TraceWriter {
    paths: DataPaths,
}

impl TraceWriter {
    /// Writer over the data root.
    pub fn new(paths: DataPaths) -> Self {
        Self { paths }
    }

    /// Append one record. Failures are logged, never propagated: a run
    /// must not fail because telemetry did.
    pub async fn append(&self, record: &TraceRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "unserializable trace record");
                return;
            }
        };
        let path = self.paths.trace_file(Utc::now());
        if let Err(e) = append_line(&path, &line).await {
            warn!(error = %e, "failed to append trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().to_path_buf());
        let writer = TraceWriter::new(paths.clone());

        for i in 0..3 {
            writer
                .append(&TraceRecord {
                    ts: i,
                    chat_id: "telegram:-1".into(),
                    group_folder: "main".into(),
                    model: "model-a".into(),
                    latency_ms: 1200,
                    attempts: 1,
                    ..Default::default()
                })
                .await;
        }

        let path = paths.trace_file(Utc::now());
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 3);
        let first: TraceRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first.model, "model-a");
        assert!(first.error.is_none());
    }
}
