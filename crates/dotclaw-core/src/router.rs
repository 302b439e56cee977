//! Request routing and failover selection.
//!
//! Given a prompt, the router picks an execution profile (fast, standard,
//! background), the model and its failover chain, and the budgets that go
//! with them. On failure the executor asks [`RequestRouter::next_model`]
//! for the next candidate that is neither in cooldown nor already
//! attempted.
//!
//! The active model lives in `config/model.json` (authoritative); the
//! `OPENROUTER_MODEL` environment variable only seeds that file when it
//! does not exist yet.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use dotclaw_platform::fs::{read_json_opt, write_json_atomic};
use dotclaw_types::config::{ModelConfig, RecallConfig, RouterConfig};
use dotclaw_types::routing::{Profile, ReasoningEffort, RoutingDecision};
use dotclaw_types::{DotclawError, Result};

use crate::cooldown::CooldownRegistry;

/// Verbs that disqualify a short prompt from the fast path: they imply
/// tool use or multi-step work.
const TOOL_VERBS: &[&str] = &[
    "search", "run", "execute", "build", "create", "schedule", "download", "install", "deploy",
    "fix", "write", "remember", "fetch", "scrape",
];

/// Signals that a prompt may deserve a long asynchronous job.
const BACKGROUND_HINTS: &[&str] = &[
    "research",
    "analyze",
    "audit",
    "full report",
    "comprehensive",
    "in depth",
    "in-depth",
    "every file",
    "entire",
];

/// Classifier verdict for background eligibility.
#[derive(Debug, Clone, Copy)]
pub struct BackgroundVerdict {
    /// Whether the classifier thinks this should be a background job.
    pub background: bool,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// Decides whether a prompt becomes an asynchronous background job.
///
/// The production implementation asks a small, fast model; the built-in
/// heuristic keeps the host functional without one.
#[async_trait]
pub trait BackgroundClassifier: Send + Sync {
    /// Classify the prompt.
    async fn classify(&self, prompt: &str) -> BackgroundVerdict;
}

/// Keyword heuristic classifier.
///
/// Confidence grows with the number of background hints present and the
/// prompt length.
pub struct HeuristicClassifier;

#[async_trait]
impl BackgroundClassifier for HeuristicClassifier {
    async fn classify(&self, prompt: &str) -> BackgroundVerdict {
        let lower = prompt.to_lowercase();
        let hits = BACKGROUND_HINTS.iter().filter(|h| lower.contains(*h)).count();
        let length_signal = (prompt.len() as f64 / 1200.0).min(0.3);
        let confidence = ((hits as f64) * 0.35 + length_signal).min(1.0);
        BackgroundVerdict {
            background: hits > 0,
            confidence,
        }
    }
}

/// The request router.
pub struct RequestRouter {
    cfg: RouterConfig,
    recall_cfg: RecallConfig,
    model_path: PathBuf,
    model: RwLock<ModelConfig>,
    cooldowns: Arc<CooldownRegistry>,
    classifier: Arc<dyn BackgroundClassifier>,
}

impl RequestRouter {
    /// Load `model.json` (seeding it from `OPENROUTER_MODEL` when absent)
    /// and build the router.
    pub async fn load(
        cfg: RouterConfig,
        recall_cfg: RecallConfig,
        model_path: PathBuf,
        cooldowns: Arc<CooldownRegistry>,
        classifier: Arc<dyn BackgroundClassifier>,
    ) -> Result<Self> {
        let model = match read_json_opt::<ModelConfig>(&model_path).await? {
            Some(m) => m,
            None => {
                let mut seeded = ModelConfig::default();
                if let Ok(env_model) = std::env::var("OPENROUTER_MODEL")
                    && !env_model.is_empty()
                {
                    seeded.model = env_model;
                }
                write_json_atomic(&model_path, &seeded).await?;
                seeded
            }
        };
        Ok(Self {
            cfg,
            recall_cfg,
            model_path,
            model: RwLock::new(model),
            cooldowns,
            classifier,
        })
    }

    /// Current model configuration.
    pub fn model_config(&self) -> ModelConfig {
        self.model.read().clone()
    }

    /// Change the active model (honoring the allowlist) and persist.
    pub async fn set_model(&self, model: &str) -> Result<()> {
        let snapshot = {
            let mut cfg = self.model.write();
            if !cfg.allowlist.is_empty() && !cfg.allowlist.iter().any(|m| m == model) {
                return Err(DotclawError::ConfigInvalid {
                    reason: format!("model not in allowlist: {model}"),
                });
            }
            cfg.model = model.to_string();
            cfg.clone()
        };
        write_json_atomic(&self.model_path, &snapshot).await?;
        info!(model, "active model changed");
        Ok(())
    }

    /// Route one prompt. `queue_depth` raises the classifier's effective
    /// confidence threshold so a busy host defers fewer prompts into
    /// background jobs.
    pub async fn route(&self, prompt: &str, queue_depth: usize) -> RoutingDecision {
        let model_cfg = self.model_config();
        let trimmed = prompt.trim();

        if self.is_fast_eligible(trimmed) {
            return RoutingDecision {
                profile: Profile::Fast,
                model: model_cfg.model,
                fallbacks: model_cfg.fallbacks,
                max_output_tokens: (self.cfg.max_output_tokens / 4).max(256),
                max_tool_steps: 4,
                reasoning_effort: ReasoningEffort::Off,
                recall_max_results: 0,
                recall_max_tokens: 0,
                should_run_classifier: false,
            };
        }

        let should_run_classifier = self.is_background_candidate(trimmed);
        let mut profile = Profile::Standard;
        if should_run_classifier {
            let verdict = self.classifier.classify(trimmed).await;
            if verdict.background && verdict.confidence >= self.effective_threshold(queue_depth) {
                profile = Profile::Background;
            }
        }

        RoutingDecision {
            profile,
            model: model_cfg.model,
            fallbacks: model_cfg.fallbacks,
            max_output_tokens: self.cfg.max_output_tokens,
            max_tool_steps: match profile {
                Profile::Background => self.cfg.max_tool_steps * 2,
                _ => self.cfg.max_tool_steps,
            },
            reasoning_effort: ReasoningEffort::Medium,
            recall_max_results: self.recall_cfg.max_results,
            recall_max_tokens: self.recall_cfg.max_tokens,
            should_run_classifier,
        }
    }

    /// The next failover candidate from `[primary, fallbacks…]` that is
    /// neither attempted nor in cooldown.
    pub fn next_model(
        &self,
        primary: &str,
        fallbacks: &[String],
        attempted: &HashSet<String>,
        now_ms: i64,
    ) -> Option<String> {
        std::iter::once(primary)
            .chain(fallbacks.iter().map(String::as_str))
            .find(|m| !attempted.contains(*m) && !self.cooldowns.is_in_cooldown(m, now_ms))
            .map(str::to_string)
    }

    fn is_fast_eligible(&self, prompt: &str) -> bool {
        if prompt.len() > self.cfg.max_fast_chars {
            return false;
        }
        let lower = prompt.to_lowercase();
        !TOOL_VERBS.iter().any(|v| lower.contains(v))
    }

    fn is_background_candidate(&self, prompt: &str) -> bool {
        let lower = prompt.to_lowercase();
        prompt.len() > 400 || BACKGROUND_HINTS.iter().any(|h| lower.contains(h))
    }

    fn effective_threshold(&self, queue_depth: usize) -> f64 {
        (self.cfg.confidence_threshold + 0.05 * queue_depth as f64).min(0.95)
    }
}
