//! Registered groups.
//!
//! A group is a registered chat with its own on-disk folder, memory, and
//! session state. The registry maps provider-prefixed chat ids
//! (`telegram:-100123`, `discord:9876`) to group metadata and is persisted
//! as `data/registered_groups.json`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Folder name of the main (operator) group.
pub const MAIN_GROUP_FOLDER: &str = "main";

/// A registered chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Provider-prefixed chat id (`telegram:…`, `discord:…`). Unique.
    pub chat_id: String,

    /// Display name.
    pub name: String,

    /// On-disk folder under `groups/`. Immutable once bound.
    pub folder: String,

    /// Optional regex that admits group-chat messages without a mention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,

    /// Additional host paths mounted into this group's container, each
    /// validated against the external mount allowlist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<String>,

    /// Per-group environment overrides forwarded into the container.
    /// Values here are still subject to the env-name allowlist.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl Group {
    /// Whether this is the privileged main group.
    pub fn is_main(&self) -> bool {
        self.folder == MAIN_GROUP_FOLDER
    }
}

/// The persisted group registry: prefixed chat id → group.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegisteredGroups {
    /// All registered groups keyed by chat id.
    #[serde(flatten)]
    pub groups: HashMap<String, Group>,
}

impl RegisteredGroups {
    /// Look up a group by chat id.
    pub fn by_chat_id(&self, chat_id: &str) -> Option<&Group> {
        self.groups.get(chat_id)
    }

    /// Look up a group by folder name.
    pub fn by_folder(&self, folder: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.folder == folder)
    }

    /// Register a group. Fails when the chat id is already registered or
    /// the folder is already bound to a different chat.
    pub fn register(&mut self, group: Group) -> crate::Result<()> {
        if !is_safe_group_folder(&group.folder) {
            return Err(crate::DotclawError::SecurityViolation {
                reason: format!("unsafe group folder: {:?}", group.folder),
            });
        }
        if self.groups.contains_key(&group.chat_id) {
            return Err(crate::DotclawError::ConfigInvalid {
                reason: format!("chat already registered: {}", group.chat_id),
            });
        }
        if self.by_folder(&group.folder).is_some() {
            return Err(crate::DotclawError::ConfigInvalid {
                reason: format!("folder already bound: {}", group.folder),
            });
        }
        self.groups.insert(group.chat_id.clone(), group);
        Ok(())
    }

    /// Remove a group by chat id, returning it when present.
    pub fn remove(&mut self, chat_id: &str) -> Option<Group> {
        self.groups.remove(chat_id)
    }
}

/// Validate a group folder name: lowercase `[a-z0-9-]+`, no traversal.
///
/// Folders become path components under `groups/` and bind-mount targets,
/// so anything outside the strict alphabet is rejected outright.
pub fn is_safe_group_folder(folder: &str) -> bool {
    !folder.is_empty()
        && folder != "."
        && folder != ".."
        && folder
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(chat_id: &str, folder: &str) -> Group {
        Group {
            chat_id: chat_id.into(),
            name: "Test".into(),
            folder: folder.into(),
            trigger: None,
            extra_mounts: Vec::new(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn safe_folder_accepts_lowercase_kebab() {
        assert!(is_safe_group_folder("main"));
        assert!(is_safe_group_folder("my-group-2"));
        assert!(is_safe_group_folder("a"));
    }

    #[test]
    fn safe_folder_rejects_everything_else() {
        for bad in ["", ".", "..", "My-Group", "a/b", "a\\b", "a.b", "a_b", "../x"] {
            assert!(!is_safe_group_folder(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = RegisteredGroups::default();
        reg.register(group("telegram:-1", "main")).unwrap();
        reg.register(group("discord:42", "side")).unwrap();

        assert_eq!(reg.by_chat_id("telegram:-1").unwrap().folder, "main");
        assert_eq!(reg.by_folder("side").unwrap().chat_id, "discord:42");
        assert!(reg.by_chat_id("telegram:-1").unwrap().is_main());
        assert!(!reg.by_chat_id("discord:42").unwrap().is_main());
    }

    #[test]
    fn duplicate_chat_id_rejected() {
        let mut reg = RegisteredGroups::default();
        reg.register(group("telegram:-1", "one")).unwrap();
        assert!(reg.register(group("telegram:-1", "two")).is_err());
    }

    #[test]
    fn duplicate_folder_rejected() {
        let mut reg = RegisteredGroups::default();
        reg.register(group("telegram:-1", "shared")).unwrap();
        assert!(reg.register(group("telegram:-2", "shared")).is_err());
    }

    #[test]
    fn unsafe_folder_rejected_at_registration() {
        let mut reg = RegisteredGroups::default();
        let err = reg.register(group("telegram:-1", "../etc")).unwrap_err();
        assert!(err.to_string().contains("unsafe group folder"));
    }

    #[test]
    fn registry_serde_roundtrip() {
        let mut reg = RegisteredGroups::default();
        reg.register(group("telegram:-100", "main")).unwrap();
        let json = serde_json::to_string(&reg).unwrap();
        let back: RegisteredGroups = serde_json::from_str(&json).unwrap();
        assert_eq!(back.by_chat_id("telegram:-100").unwrap().folder, "main");
    }

    #[test]
    fn remove_returns_group() {
        let mut reg = RegisteredGroups::default();
        reg.register(group("telegram:-1", "main")).unwrap();
        let removed = reg.remove("telegram:-1").unwrap();
        assert_eq!(removed.folder, "main");
        assert!(reg.by_chat_id("telegram:-1").is_none());
    }
}
