//! Typed long-term memory items.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Who a memory is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// About a specific user (`subject_id` identifies them).
    User,
    /// About the group as a whole.
    Group,
    /// Shared across all groups. Writable only from the main group.
    Global,
}

impl MemoryScope {
    /// Stable string form used in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Global => "global",
        }
    }

    /// Parse the store string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "group" => Some(Self::Group),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// A typed memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryItem {
    /// Memory id (`mem-<uuid>`).
    pub id: String,
    /// Owning group folder.
    pub group_folder: String,
    /// Scope of the memory.
    pub scope: MemoryScope,
    /// Subject user id for user-scoped memories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    /// Freeform type tag (`preference`, `fact`, `task`, `relationship`, …).
    #[serde(rename = "type")]
    pub kind: String,
    /// The memory content.
    pub content: String,
    /// Normalized search tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Relative importance in [0, 1].
    #[serde(default = "default_weight")]
    pub importance: f64,
    /// Confidence in [0, 1].
    #[serde(default = "default_weight")]
    pub confidence: f64,
    /// When present, `(group_folder, scope, subject_id, conflict_key)` is
    /// unique and the newest write wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_key: Option<String>,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last update time, epoch milliseconds.
    pub updated_at: i64,
    /// Optional embedding vector, back-filled by a batch worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

fn default_weight() -> f64 {
    0.5
}

/// Aggregate store statistics for `memory_stats`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// Total rows for the group.
    pub total: u64,
    /// Rows per type tag.
    pub by_type: HashMap<String, u64>,
    /// Rows that have an embedding.
    pub embedded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_roundtrip() {
        for s in [MemoryScope::User, MemoryScope::Group, MemoryScope::Global] {
            assert_eq!(MemoryScope::parse(s.as_str()), Some(s));
        }
        assert_eq!(MemoryScope::parse("everyone"), None);
    }

    #[test]
    fn memory_item_serde_uses_type_key() {
        let item = MemoryItem {
            id: "mem-1".into(),
            group_folder: "main".into(),
            scope: MemoryScope::User,
            subject_id: Some("u1".into()),
            kind: "preference".into(),
            content: "prefers dark roast".into(),
            tags: vec!["coffee".into()],
            metadata: HashMap::new(),
            importance: 0.9,
            confidence: 0.8,
            conflict_key: Some("coffee-roast".into()),
            created_at: 1,
            updated_at: 2,
            embedding: None,
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"type\":\"preference\""));
        let back: MemoryItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "preference");
        assert_eq!(back.conflict_key.as_deref(), Some("coffee-roast"));
    }

    #[test]
    fn defaults_applied_on_sparse_json() {
        let json = r#"{"id":"m","groupFolder":"g","scope":"group","type":"fact","content":"c","createdAt":1,"updatedAt":1}"#;
        let item: MemoryItem = serde_json::from_str(json).unwrap();
        assert!((item.importance - 0.5).abs() < f64::EPSILON);
        assert!(item.tags.is_empty());
        assert!(item.embedding.is_none());
    }
}
