//! Per-group session state.
//!
//! The in-container agent owns the conversational session (the mounted
//! session directory); the host keeps the index (which session is
//! current, the rolling summary, and the extracted facts tail) and
//! performs mechanical compaction when the history outgrows the token
//! ceiling.
//!
//! Layout per group: `data/sessions/<group>/index.json` plus
//! `data/sessions/<group>/openrouter/<sessionId>/history.jsonl` (one
//! `{role, content, timestamp}` object per line, written by the agent).

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use dotclaw_platform::DataPaths;
use dotclaw_platform::fs::{append_line, read_json_opt, write_json_atomic};
use dotclaw_types::Result;
use dotclaw_types::config::SessionConfig;

/// The host-side session index for one group.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndex {
    /// Session the next run should resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Condensation of history older than the kept turns.
    #[serde(default)]
    pub summary: String,
    /// Extracted long-term facts.
    #[serde(default)]
    pub facts_tail: Vec<String>,
}

/// One conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTurn {
    /// `user`, `assistant`, or `tool`.
    pub role: String,
    /// Turn content.
    pub content: String,
    /// Epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// Host-side session bookkeeping.
pub struct SessionManager {
    paths: DataPaths,
    cfg: SessionConfig,
}

impl SessionManager {
    /// Build a manager over the data root.
    pub fn new(paths: DataPaths, cfg: SessionConfig) -> Self {
        Self { paths, cfg }
    }

    fn index_path(&self, folder: &str) -> std::path::PathBuf {
        self.paths.group_sessions_dir(folder).join("index.json")
    }

    fn history_path(&self, folder: &str, session_id: &str) -> std::path::PathBuf {
        self.paths
            .group_sessions_dir(folder)
            .join("openrouter")
            .join(session_id)
            .join("history.jsonl")
    }

    /// Load the index (default when missing).
    pub async fn index(&self, folder: &str) -> Result<SessionIndex> {
        Ok(read_json_opt(&self.index_path(folder)).await?.unwrap_or_default())
    }

    /// The session id the next run should resume, if any.
    pub async fn current_session_id(&self, folder: &str) -> Option<String> {
        self.index(folder).await.ok().and_then(|i| i.session_id)
    }

    /// Record the session id returned by a successful run.
    pub async fn record_session(&self, folder: &str, session_id: &str) -> Result<()> {
        let mut index = self.index(folder).await?;
        if index.session_id.as_deref() != Some(session_id) {
            debug!(group = folder, session_id, "session id updated");
            index.session_id = Some(session_id.to_string());
            write_json_atomic(&self.index_path(folder), &index).await?;
        }
        Ok(())
    }

    /// Append a turn to the current session's history (host-side
    /// bookkeeping; the agent appends its own turns in-container).
    pub async fn append_turn(&self, folder: &str, turn: &SessionTurn) -> Result<()> {
        let Some(session_id) = self.current_session_id(folder).await else {
            return Ok(());
        };
        let line = serde_json::to_string(turn)?;
        append_line(&self.history_path(folder, &session_id), &line).await?;
        Ok(())
    }

    /// Read the current session's history, skipping malformed lines.
    pub async fn history(&self, folder: &str) -> Result<Vec<SessionTurn>> {
        let Some(session_id) = self.current_session_id(folder).await else {
            return Ok(Vec::new());
        };
        let path = self.history_path(folder, &session_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut turns = Vec::new();
        for line in raw.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionTurn>(trimmed) {
                Ok(turn) => turns.push(turn),
                Err(e) => warn!(group = folder, error = %e, "skipping malformed history line"),
            }
        }
        Ok(turns)
    }

    /// Compact the current session when its history exceeds the token
    /// ceiling: older turns are condensed into the summary, the most
    /// recent `keep_recent_turns` survive verbatim. Returns whether a
    /// compaction happened.
    pub async fn compact(&self, folder: &str) -> Result<bool> {
        let turns = self.history(folder).await?;
        let total_chars: usize = turns.iter().map(|t| t.content.len()).sum();
        if total_chars / 4 <= self.cfg.compact_tokens as usize {
            return Ok(false);
        }

        let keep = self.cfg.keep_recent_turns as usize;
        if turns.len() <= keep {
            return Ok(false);
        }
        let (older, recent) = turns.split_at(turns.len() - keep);

        let mut index = self.index(folder).await?;
        for turn in older {
            let mut line = turn.content.split_whitespace().collect::<Vec<_>>().join(" ");
            if line.len() > 120 {
                let mut cut = 120;
                while !line.is_char_boundary(cut) {
                    cut -= 1;
                }
                line.truncate(cut);
                line.push('…');
            }
            index.summary.push_str(&format!("{}: {}\n", turn.role, line));
        }
        // The summary itself stays bounded; oldest condensations fall off.
        if index.summary.len() > 8_000 {
            let keep_from = index.summary.len() - 8_000;
            let boundary = index.summary[keep_from..]
                .find('\n')
                .map(|p| keep_from + p + 1)
                .unwrap_or(keep_from);
            index.summary = index.summary.split_off(boundary);
        }
        write_json_atomic(&self.index_path(folder), &index).await?;

        // Rewrite the history with only the kept turns.
        if let Some(session_id) = index.session_id.as_deref() {
            let path = self.history_path(folder, session_id);
            let body: String = recent
                .iter()
                .filter_map(|t| serde_json::to_string(t).ok())
                .map(|l| l + "\n")
                .collect();
            dotclaw_platform::fs::write_bytes_atomic(&path, body.as_bytes()).await?;
        }
        debug!(group = folder, dropped = older.len(), "session compacted");
        Ok(true)
    }

    /// Append extracted facts to the facts tail.
    pub async fn append_facts(&self, folder: &str, facts: &[String]) -> Result<()> {
        if facts.is_empty() {
            return Ok(());
        }
        let mut index = self.index(folder).await?;
        index.facts_tail.extend(facts.iter().cloned());
        write_json_atomic(&self.index_path(folder), &index).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path, compact_tokens: u32, keep: u32) -> SessionManager {
        SessionManager::new(
            DataPaths::at(dir.to_path_buf()),
            SessionConfig {
                compact_tokens,
                keep_recent_turns: keep,
            },
        )
    }

    fn turn(role: &str, content: &str) -> SessionTurn {
        SessionTurn {
            role: role.into(),
            content: content.into(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn record_and_resume_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 12_000, 12);
        assert!(mgr.current_session_id("main").await.is_none());

        mgr.record_session("main", "sess-1").await.unwrap();
        assert_eq!(mgr.current_session_id("main").await.as_deref(), Some("sess-1"));

        // Re-recording the same id does not clobber anything.
        mgr.record_session("main", "sess-1").await.unwrap();
        mgr.record_session("main", "sess-2").await.unwrap();
        assert_eq!(mgr.current_session_id("main").await.as_deref(), Some("sess-2"));
    }

    #[tokio::test]
    async fn history_tolerates_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 12_000, 12);
        mgr.record_session("main", "s1").await.unwrap();
        mgr.append_turn("main", &turn("user", "hello")).await.unwrap();

        let path = mgr.history_path("main", "s1");
        append_line(&path, "{broken json").await.unwrap();
        mgr.append_turn("main", &turn("assistant", "hi there")).await.unwrap();

        let turns = mgr.history("main").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, "assistant");
    }

    #[tokio::test]
    async fn compaction_keeps_recent_turns_and_builds_summary() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny ceiling so compaction triggers quickly.
        let mgr = manager(dir.path(), 10, 3);
        mgr.record_session("main", "s1").await.unwrap();
        for i in 0..10 {
            mgr.append_turn("main", &turn("user", &format!("message number {i} with some padding")))
                .await
                .unwrap();
        }

        assert!(mgr.compact("main").await.unwrap());
        let turns = mgr.history("main").await.unwrap();
        assert_eq!(turns.len(), 3);
        assert!(turns[0].content.contains("number 7"));

        let index = mgr.index("main").await.unwrap();
        assert!(index.summary.contains("message number 0"));
        assert!(index.summary.contains("user:"));
    }

    #[tokio::test]
    async fn small_history_is_not_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 12_000, 3);
        mgr.record_session("main", "s1").await.unwrap();
        mgr.append_turn("main", &turn("user", "short")).await.unwrap();
        assert!(!mgr.compact("main").await.unwrap());
        assert_eq!(mgr.history("main").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn facts_tail_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 12_000, 12);
        mgr.append_facts("main", &["likes tea".into()]).await.unwrap();
        mgr.append_facts("main", &["sister named Kim".into()]).await.unwrap();
        let index = mgr.index("main").await.unwrap();
        assert_eq!(index.facts_tail.len(), 2);
    }
}
