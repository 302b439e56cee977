//! On-disk data layout.
//!
//! Everything the host persists lives under one data root, `~/.dotclaw`
//! by default (overridable with `DOTCLAW_HOME`):
//!
//! ```text
//! <root>/
//!   config/            runtime.json, model.json, behavior.json, tool-policy.json
//!   data/              registered_groups.json, cooldowns.json
//!   data/store/        messages.db, memory.db
//!   data/ipc/<group>/  requests, responses, agent_requests, messages, tasks, errors
//!   data/sessions/     <group>/openrouter/<sessionId>/
//!   groups/<group>/    per-group working folder, CLAUDE.md, jobs/<id>/
//!   traces/            trace-YYYY-MM-DD.jsonl
//!   logs/              dotclaw.log
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// IPC subdirectories created per group.
pub const IPC_SUBDIRS: &[&str] = &[
    "requests",
    "responses",
    "agent_requests",
    "messages",
    "tasks",
    "errors",
];

/// Resolved data-root paths.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Resolve the data root: `DOTCLAW_HOME` when set, else `~/.dotclaw`.
    pub fn resolve() -> dotclaw_types::Result<Self> {
        if let Ok(home) = std::env::var("DOTCLAW_HOME")
            && !home.is_empty()
        {
            return Ok(Self::at(PathBuf::from(home)));
        }
        let home = dirs::home_dir().ok_or_else(|| dotclaw_types::DotclawError::ConfigInvalid {
            reason: "cannot determine home directory".into(),
        })?;
        Ok(Self::at(home.join(".dotclaw")))
    }

    /// Use an explicit root (tests, `--data-dir`).
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// The data root itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `config/` directory (mounted read-only into containers).
    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// `config/runtime.json`.
    pub fn runtime_config_file(&self) -> PathBuf {
        self.config_dir().join("runtime.json")
    }

    /// `config/model.json`: authoritative model selection.
    pub fn model_file(&self) -> PathBuf {
        self.config_dir().join("model.json")
    }

    /// `config/behavior.json`.
    pub fn behavior_file(&self) -> PathBuf {
        self.config_dir().join("behavior.json")
    }

    /// `config/tool-policy.json`.
    pub fn tool_policy_file(&self) -> PathBuf {
        self.config_dir().join("tool-policy.json")
    }

    /// `config/tool-budgets.json`.
    pub fn tool_budgets_file(&self) -> PathBuf {
        self.config_dir().join("tool-budgets.json")
    }

    /// `config/mount-allowlist.json`: allowed prefixes for extra mounts.
    /// This file itself is never mounted.
    pub fn mount_allowlist_file(&self) -> PathBuf {
        self.config_dir().join("mount-allowlist.json")
    }

    /// `data/registered_groups.json`.
    pub fn registered_groups_file(&self) -> PathBuf {
        self.root.join("data").join("registered_groups.json")
    }

    /// `data/cooldowns.json`: persisted failover cooldowns.
    pub fn cooldowns_file(&self) -> PathBuf {
        self.root.join("data").join("cooldowns.json")
    }

    /// `data/store/messages.db`.
    pub fn messages_db(&self) -> PathBuf {
        self.root.join("data").join("store").join("messages.db")
    }

    /// `data/store/memory.db`.
    pub fn memory_db(&self) -> PathBuf {
        self.root.join("data").join("store").join("memory.db")
    }

    /// `data/ipc/`.
    pub fn ipc_dir(&self) -> PathBuf {
        self.root.join("data").join("ipc")
    }

    /// `data/ipc/<group>/`.
    pub fn group_ipc_dir(&self, folder: &str) -> PathBuf {
        self.ipc_dir().join(folder)
    }

    /// `data/sessions/<group>/`.
    pub fn group_sessions_dir(&self, folder: &str) -> PathBuf {
        self.root.join("data").join("sessions").join(folder)
    }

    /// `data/sessions/`.
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("data").join("sessions")
    }

    /// `groups/<group>/`.
    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.root.join("groups").join(folder)
    }

    /// `groups/<group>/jobs/<id>/`.
    pub fn job_dir(&self, folder: &str, job_id: &str) -> PathBuf {
        self.group_dir(folder).join("jobs").join(job_id)
    }

    /// `traces/`.
    pub fn traces_dir(&self) -> PathBuf {
        self.root.join("traces")
    }

    /// `traces/trace-YYYY-MM-DD.jsonl` for the given instant.
    pub fn trace_file(&self, at: DateTime<Utc>) -> PathBuf {
        self.traces_dir()
            .join(format!("trace-{}.jsonl", at.format("%Y-%m-%d")))
    }

    /// `logs/`.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create the directory skeleton. Idempotent.
    pub async fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.config_dir(),
            self.root.join("data").join("store"),
            self.ipc_dir(),
            self.sessions_dir(),
            self.root.join("groups").join("global"),
            self.traces_dir(),
            self.logs_dir(),
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    /// Create a group's folder, session dir, and IPC subdirectories.
    pub async fn ensure_group_layout(&self, folder: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.group_dir(folder)).await?;
        tokio::fs::create_dir_all(self.group_sessions_dir(folder)).await?;
        let ipc = self.group_ipc_dir(folder);
        for sub in IPC_SUBDIRS {
            tokio::fs::create_dir_all(ipc.join(sub)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_hang_off_root() {
        let p = DataPaths::at(PathBuf::from("/tmp/dc"));
        assert_eq!(p.messages_db(), PathBuf::from("/tmp/dc/data/store/messages.db"));
        assert_eq!(p.group_dir("main"), PathBuf::from("/tmp/dc/groups/main"));
        assert_eq!(
            p.group_ipc_dir("side"),
            PathBuf::from("/tmp/dc/data/ipc/side")
        );
    }

    #[test]
    fn trace_file_is_dated() {
        let p = DataPaths::at(PathBuf::from("/tmp/dc"));
        let at = DateTime::parse_from_rfc3339("2026-03-04T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            p.trace_file(at),
            PathBuf::from("/tmp/dc/traces/trace-2026-03-04.jsonl")
        );
    }

    #[tokio::test]
    async fn ensure_layout_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let p = DataPaths::at(dir.path().join("root"));
        p.ensure_layout().await.unwrap();
        p.ensure_layout().await.unwrap();
        assert!(p.config_dir().is_dir());
        assert!(p.traces_dir().is_dir());
    }

    #[tokio::test]
    async fn ensure_group_layout_creates_ipc_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let p = DataPaths::at(dir.path().join("root"));
        p.ensure_group_layout("main").await.unwrap();
        for sub in IPC_SUBDIRS {
            assert!(p.group_ipc_dir("main").join(sub).is_dir(), "{sub}");
        }
    }
}
