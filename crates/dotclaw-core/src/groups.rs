//! Group registry service.
//!
//! Owns `data/registered_groups.json`: an in-memory map behind a lock
//! with write-through persistence. Every component that needs group
//! metadata (admission, IPC authorization, the runner's mount set) reads
//! through this service rather than touching the file.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use dotclaw_platform::DataPaths;
use dotclaw_platform::fs::{read_json_opt, write_json_atomic};
use dotclaw_types::Result;
use dotclaw_types::group::{Group, RegisteredGroups};

/// Process-wide registry of groups.
pub struct GroupRegistry {
    paths: DataPaths,
    groups: RwLock<RegisteredGroups>,
}

impl GroupRegistry {
    /// Load the registry from disk (empty when the file is missing).
    pub async fn load(paths: DataPaths) -> Result<Arc<Self>> {
        let groups: RegisteredGroups = read_json_opt(&paths.registered_groups_file())
            .await?
            .unwrap_or_default();
        Ok(Arc::new(Self {
            paths,
            groups: RwLock::new(groups),
        }))
    }

    /// Look up a group by its provider-prefixed chat id.
    pub fn by_chat_id(&self, chat_id: &str) -> Option<Group> {
        self.groups.read().by_chat_id(chat_id).cloned()
    }

    /// Look up a group by folder name.
    pub fn by_folder(&self, folder: &str) -> Option<Group> {
        self.groups.read().by_folder(folder).cloned()
    }

    /// All registered groups.
    pub fn list(&self) -> Vec<Group> {
        self.groups.read().groups.values().cloned().collect()
    }

    /// Register a group, create its on-disk layout, and persist.
    pub async fn register(&self, group: Group) -> Result<()> {
        {
            let mut groups = self.groups.write();
            groups.register(group.clone())?;
        }
        self.paths.ensure_group_layout(&group.folder).await?;
        self.persist().await?;
        info!(chat_id = %group.chat_id, folder = %group.folder, "registered group");
        Ok(())
    }

    /// Remove a group by chat id and persist. The group's folder is left
    /// on disk; only explicit operator action deletes data.
    pub async fn remove(&self, chat_id: &str) -> Result<Option<Group>> {
        let removed = { self.groups.write().remove(chat_id) };
        if removed.is_some() {
            self.persist().await?;
            info!(chat_id, "removed group");
        }
        Ok(removed)
    }

    /// Re-read the registry from disk (SIGHUP-style reload).
    pub async fn reload(&self) -> Result<()> {
        let groups: RegisteredGroups = read_json_opt(&self.paths.registered_groups_file())
            .await?
            .unwrap_or_default();
        *self.groups.write() = groups;
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = self.groups.read().clone();
        write_json_atomic(&self.paths.registered_groups_file(), &snapshot).await?;
        Ok(())
    }
}
