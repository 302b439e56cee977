//! Routing decision types and per-model cooldown state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

/// Execution profile picked by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Short low-signal prompt: small budgets, zero recall.
    Fast,
    /// Default interactive profile.
    Standard,
    /// Long-running asynchronous job.
    Background,
}

/// Reasoning effort forwarded to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    /// No extended reasoning.
    Off,
    /// Minimal.
    Low,
    /// Default.
    Medium,
    /// Maximum.
    High,
}

impl ReasoningEffort {
    /// One step down, used on each failover retry.
    pub fn downgrade(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium => Self::Low,
            Self::Low | Self::Off => Self::Off,
        }
    }
}

/// The router's answer for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    /// Selected profile.
    pub profile: Profile,
    /// Primary model id.
    pub model: String,
    /// Failover candidates in preference order.
    pub fallbacks: Vec<String>,
    /// Output token cap.
    pub max_output_tokens: u32,
    /// Tool-step budget.
    pub max_tool_steps: u32,
    /// Reasoning effort.
    pub reasoning_effort: ReasoningEffort,
    /// Recall line budget; zero disables recall.
    pub recall_max_results: u32,
    /// Recall token budget.
    pub recall_max_tokens: u32,
    /// Whether the background classifier should be consulted.
    pub should_run_classifier: bool,
}

/// One per-model cooldown entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownEntry {
    /// The model is excluded from selection until this time, epoch ms.
    pub until_ms: i64,
    /// Why the cooldown was applied.
    pub reason: ErrorCategory,
}

/// Persisted cooldown map (`data/cooldowns.json`).
///
/// Persisting across restarts prevents a restart from stampeding a model
/// that was failing moments earlier. Entries past `until_ms` are ignored
/// on read.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CooldownMap {
    /// Model id → active cooldown.
    #[serde(flatten)]
    pub entries: HashMap<String, CooldownEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effort_downgrade_chain() {
        assert_eq!(ReasoningEffort::High.downgrade(), ReasoningEffort::Medium);
        assert_eq!(ReasoningEffort::Medium.downgrade(), ReasoningEffort::Low);
        assert_eq!(ReasoningEffort::Low.downgrade(), ReasoningEffort::Off);
        assert_eq!(ReasoningEffort::Off.downgrade(), ReasoningEffort::Off);
    }

    #[test]
    fn effort_ordering() {
        assert!(ReasoningEffort::Off < ReasoningEffort::High);
    }

    #[test]
    fn cooldown_map_serde_roundtrip() {
        let mut map = CooldownMap::default();
        map.entries.insert(
            "model-b".into(),
            CooldownEntry {
                until_ms: 61_000,
                reason: ErrorCategory::RateLimit,
            },
        );
        let json = serde_json::to_string(&map).unwrap();
        let back: CooldownMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entries["model-b"].until_ms, 61_000);
        assert_eq!(back.entries["model-b"].reason, ErrorCategory::RateLimit);
    }

    #[test]
    fn decision_serde_camel_case() {
        let d = RoutingDecision {
            profile: Profile::Standard,
            model: "a".into(),
            fallbacks: vec!["b".into()],
            max_output_tokens: 4096,
            max_tool_steps: 24,
            reasoning_effort: ReasoningEffort::Medium,
            recall_max_results: 8,
            recall_max_tokens: 600,
            should_run_classifier: false,
        };
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("maxToolSteps"));
        assert!(json.contains("\"reasoningEffort\":\"medium\""));
    }
}
