//! Runtime configuration schema.
//!
//! The host loads `config/runtime.json` at startup, merges it over typed
//! defaults, and clamps out-of-range values instead of failing. Loading
//! only errors when the JSON shape itself is wrong. All structs accept
//! both `snake_case` and `camelCase` field names via `#[serde(alias)]`;
//! unknown fields are silently ignored for forward compatibility.
//!
//! Secrets never live here: they are sourced from the environment and only
//! an allowlisted subset of names is forwarded into containers.

use serde::{Deserialize, Serialize};

/// How agent containers are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerMode {
    /// A fresh container per run (`docker run --rm`).
    #[default]
    Ephemeral,
    /// One long-lived container per group, fed through the IPC directory.
    Daemon,
}

/// Root runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Container lifecycle and sandbox settings.
    #[serde(default)]
    pub container: ContainerConfig,

    /// Message pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Lane-aware semaphore settings.
    #[serde(default)]
    pub lanes: LaneConfig,

    /// Routing and failover settings.
    #[serde(default)]
    pub router: RouterConfig,

    /// Memory recall settings.
    #[serde(default)]
    pub recall: RecallConfig,

    /// Task scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Background job settings.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Maintenance loop settings.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Streaming delivery settings.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Session persistence settings.
    #[serde(default)]
    pub session: SessionConfig,
}

impl RuntimeConfig {
    /// Parse a user override JSON document merged over defaults.
    ///
    /// Missing fields take their defaults; out-of-range values are clamped
    /// deterministically. Fails only when the document is structurally
    /// wrong (not an object, wrong field types).
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        let mut cfg: Self =
            serde_json::from_str(raw).map_err(|e| crate::DotclawError::ConfigInvalid {
                reason: format!("runtime.json: {e}"),
            })?;
        cfg.clamp();
        Ok(cfg)
    }

    /// Clamp every field to its documented range. Idempotent.
    pub fn clamp(&mut self) {
        self.container.clamp();
        self.pipeline.clamp();
        self.lanes.clamp();
        self.router.clamp();
        self.recall.clamp();
        self.scheduler.clamp();
        self.jobs.clamp();
        self.maintenance.clamp();
        self.streaming.clamp();
        self.session.clamp();
    }
}

// ── Container ────────────────────────────────────────────────────────────

/// Container lifecycle, resource caps, and privilege scoping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Ephemeral or daemon mode, selected at startup.
    #[serde(default)]
    pub mode: ContainerMode,

    /// Image used for agent containers.
    #[serde(default = "default_image")]
    pub image: String,

    /// Per-run timeout in milliseconds.
    #[serde(default = "default_container_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,

    /// Daemon status/response polling cadence in milliseconds.
    #[serde(default = "default_daemon_poll_ms", alias = "daemonPollMs")]
    pub daemon_poll_ms: u64,

    /// Upper bound on deadline extension while the daemon reports the
    /// request as actively processing, in milliseconds.
    #[serde(default = "default_max_extension_ms", alias = "maxExtensionMs")]
    pub max_extension_ms: u64,

    /// `--pids-limit` value.
    #[serde(default = "default_pids_limit", alias = "pidsLimit")]
    pub pids_limit: u32,

    /// Optional `--memory` cap (docker syntax, e.g. `"1g"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Optional `--cpus` cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,

    /// Run with `--read-only` root and explicit tmpfs mounts.
    #[serde(default, alias = "readOnlyRoot")]
    pub read_only_root: bool,

    /// tmpfs size used when `read_only_root` is set (docker syntax).
    #[serde(default = "default_tmpfs_size", alias = "tmpfsSize")]
    pub tmpfs_size: String,

    /// Container UID; defaults to the host user on Linux.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    /// Container GID; defaults to the host user on Linux.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    /// Legacy escape hatch; must be explicitly opted into.
    #[serde(default)]
    pub privileged: bool,

    /// Force read-only group mounts for groups other than the main group.
    #[serde(default, alias = "nonMainReadOnly")]
    pub non_main_read_only: bool,
}

fn default_image() -> String {
    "dotclaw-agent:latest".into()
}
fn default_container_timeout_ms() -> u64 {
    300_000
}
fn default_daemon_poll_ms() -> u64 {
    250
}
fn default_max_extension_ms() -> u64 {
    600_000
}
fn default_pids_limit() -> u32 {
    256
}
fn default_tmpfs_size() -> String {
    "64m".into()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            mode: ContainerMode::Ephemeral,
            image: default_image(),
            timeout_ms: default_container_timeout_ms(),
            daemon_poll_ms: default_daemon_poll_ms(),
            max_extension_ms: default_max_extension_ms(),
            pids_limit: default_pids_limit(),
            memory: None,
            cpus: None,
            read_only_root: false,
            tmpfs_size: default_tmpfs_size(),
            uid: None,
            gid: None,
            privileged: false,
            non_main_read_only: false,
        }
    }
}

impl ContainerConfig {
    fn clamp(&mut self) {
        self.timeout_ms = self.timeout_ms.clamp(5_000, 3_600_000);
        self.daemon_poll_ms = self.daemon_poll_ms.clamp(25, 5_000);
        self.pids_limit = self.pids_limit.max(16);
        if let Some(cpus) = self.cpus
            && cpus <= 0.0
        {
            self.cpus = None;
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// Message pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Batching window after the first queued message, in milliseconds.
    #[serde(default = "default_batch_window_ms", alias = "batchWindowMs")]
    pub batch_window_ms: u64,

    /// Maximum messages claimed in one batch.
    #[serde(default = "default_max_batch_size", alias = "maxBatchSize")]
    pub max_batch_size: u32,

    /// Transient-failure retries before an item is marked failed.
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,

    /// Base delay for re-queue backoff, in milliseconds.
    #[serde(default = "default_retry_base_ms", alias = "retryBaseMs")]
    pub retry_base_ms: u64,

    /// Cap on re-queue backoff, in milliseconds.
    #[serde(default = "default_retry_max_ms", alias = "retryMaxMs")]
    pub retry_max_ms: u64,

    /// Character budget for the assembled prompt.
    #[serde(default = "default_prompt_max_chars", alias = "promptMaxChars")]
    pub prompt_max_chars: usize,

    /// Cancel the active run when a newer message arrives for the chat.
    #[serde(default = "default_true", alias = "interruptOnNewMessage")]
    pub interrupt_on_new_message: bool,

    /// Claims older than this are returned to the queue by the reaper,
    /// in milliseconds.
    #[serde(default = "default_claim_deadline_ms", alias = "claimDeadlineMs")]
    pub claim_deadline_ms: u64,
}

fn default_batch_window_ms() -> u64 {
    1_500
}
fn default_max_batch_size() -> u32 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    2_000
}
fn default_retry_max_ms() -> u64 {
    60_000
}
fn default_prompt_max_chars() -> usize {
    24_000
}
fn default_claim_deadline_ms() -> u64 {
    600_000
}
fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: default_batch_window_ms(),
            max_batch_size: default_max_batch_size(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            prompt_max_chars: default_prompt_max_chars(),
            interrupt_on_new_message: true,
            claim_deadline_ms: default_claim_deadline_ms(),
        }
    }
}

impl PipelineConfig {
    fn clamp(&mut self) {
        self.batch_window_ms = self.batch_window_ms.min(30_000);
        self.max_batch_size = self.max_batch_size.clamp(1, 100);
        self.max_retries = self.max_retries.min(10);
        self.retry_base_ms = self.retry_base_ms.clamp(100, 60_000);
        self.retry_max_ms = self.retry_max_ms.clamp(self.retry_base_ms, 3_600_000);
        self.prompt_max_chars = self.prompt_max_chars.clamp(1_000, 200_000);
        self.claim_deadline_ms = self.claim_deadline_ms.clamp(30_000, 3_600_000);
    }
}

// ── Lanes ────────────────────────────────────────────────────────────────

/// Lane-aware semaphore tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Total concurrent agent runs across all lanes.
    #[serde(default = "default_max_agents", alias = "maxAgents")]
    pub max_agents: u32,

    /// A lower-priority waiter older than this is dispatched ahead of
    /// higher-priority lanes, in milliseconds.
    #[serde(default = "default_lane_starvation_ms", alias = "laneStarvationMs")]
    pub lane_starvation_ms: u64,

    /// After this many consecutive interactive dispatches a waiting
    /// lower-priority lane gets the next permit.
    #[serde(
        default = "default_max_consecutive_interactive",
        alias = "maxConsecutiveInteractive"
    )]
    pub max_consecutive_interactive: u32,
}

fn default_max_agents() -> u32 {
    2
}
fn default_lane_starvation_ms() -> u64 {
    30_000
}
fn default_max_consecutive_interactive() -> u32 {
    5
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            lane_starvation_ms: default_lane_starvation_ms(),
            max_consecutive_interactive: default_max_consecutive_interactive(),
        }
    }
}

impl LaneConfig {
    fn clamp(&mut self) {
        self.max_agents = self.max_agents.clamp(1, 64);
        self.lane_starvation_ms = self.lane_starvation_ms.clamp(100, 600_000);
        self.max_consecutive_interactive = self.max_consecutive_interactive.clamp(1, 100);
    }
}

// ── Router ───────────────────────────────────────────────────────────────

/// Model routing and failover tuning.
///
/// The active model and its fallback chain live in `config/model.json`,
/// which is authoritative; `OPENROUTER_MODEL` only seeds that file when it
/// does not exist yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Prompts at or below this length with no tool verbs take the fast
    /// profile.
    #[serde(default = "default_max_fast_chars", alias = "maxFastChars")]
    pub max_fast_chars: usize,

    /// Background-classifier decisions below this confidence are ignored.
    /// The effective threshold adapts upward with queue depth.
    #[serde(default = "default_confidence_threshold", alias = "confidenceThreshold")]
    pub confidence_threshold: f64,

    /// Retry an empty successful result once with a stricter prompt.
    #[serde(default = "default_true", alias = "retryEmptySuccess")]
    pub retry_empty_success: bool,

    /// Output token cap for the standard profile.
    #[serde(default = "default_max_output_tokens", alias = "maxOutputTokens")]
    pub max_output_tokens: u32,

    /// Tool-step budget for the standard profile.
    #[serde(default = "default_max_tool_steps", alias = "maxToolSteps")]
    pub max_tool_steps: u32,
}

fn default_max_fast_chars() -> usize {
    80
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_max_output_tokens() -> u32 {
    4_096
}
fn default_max_tool_steps() -> u32 {
    24
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_fast_chars: default_max_fast_chars(),
            confidence_threshold: default_confidence_threshold(),
            retry_empty_success: true,
            max_output_tokens: default_max_output_tokens(),
            max_tool_steps: default_max_tool_steps(),
        }
    }
}

impl RouterConfig {
    fn clamp(&mut self) {
        self.max_fast_chars = self.max_fast_chars.clamp(8, 2_000);
        self.confidence_threshold = self.confidence_threshold.clamp(0.0, 1.0);
        self.max_output_tokens = self.max_output_tokens.clamp(256, 65_536);
        self.max_tool_steps = self.max_tool_steps.clamp(1, 200);
    }
}

// ── Recall ───────────────────────────────────────────────────────────────

/// Memory recall tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    /// Maximum recalled lines per turn.
    #[serde(default = "default_recall_max_results", alias = "maxResults")]
    pub max_results: u32,

    /// Token budget for recalled lines.
    #[serde(default = "default_recall_max_tokens", alias = "maxTokens")]
    pub max_tokens: u32,

    /// Weight of vector similarity vs keyword rank when merging, in [0,1].
    #[serde(default = "default_vector_weight", alias = "vectorWeight")]
    pub vector_weight: f64,

    /// Whether embedding search participates at all.
    #[serde(default, alias = "embeddingsEnabled")]
    pub embeddings_enabled: bool,
}

fn default_recall_max_results() -> u32 {
    8
}
fn default_recall_max_tokens() -> u32 {
    600
}
fn default_vector_weight() -> f64 {
    0.4
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            max_results: default_recall_max_results(),
            max_tokens: default_recall_max_tokens(),
            vector_weight: default_vector_weight(),
            embeddings_enabled: false,
        }
    }
}

impl RecallConfig {
    fn clamp(&mut self) {
        self.max_results = self.max_results.clamp(1, 50);
        self.max_tokens = self.max_tokens.clamp(50, 8_000);
        self.vector_weight = self.vector_weight.clamp(0.0, 1.0);
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────

/// Task scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Poller cadence in milliseconds. Clamped to at least one second.
    #[serde(default = "default_scheduler_poll_ms", alias = "pollIntervalMs")]
    pub poll_interval_ms: u64,

    /// Tasks claimed longer than this are considered abandoned and
    /// reverted for retry, in milliseconds.
    #[serde(default = "default_task_timeout_ms", alias = "taskTimeoutMs")]
    pub task_timeout_ms: u64,

    /// Retry attempts for a failing task before its schedule advances
    /// (or a one-shot task goes terminal).
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,
}

fn default_scheduler_poll_ms() -> u64 {
    15_000
}
fn default_task_timeout_ms() -> u64 {
    900_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_scheduler_poll_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl SchedulerConfig {
    fn clamp(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(1_000, 600_000);
        self.task_timeout_ms = self.task_timeout_ms.clamp(60_000, 6 * 3_600_000);
        self.max_retries = self.max_retries.min(10);
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────

/// Background job runner tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Concurrent background job workers.
    #[serde(default = "default_job_workers", alias = "workers")]
    pub workers: u32,

    /// Outputs above this many characters go to a file; the chat gets a
    /// short summary with a file reference.
    #[serde(default = "default_inline_output_chars", alias = "inlineOutputChars")]
    pub inline_output_chars: usize,
}

fn default_job_workers() -> u32 {
    1
}
fn default_inline_output_chars() -> usize {
    3_000
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_job_workers(),
            inline_output_chars: default_inline_output_chars(),
        }
    }
}

impl JobsConfig {
    fn clamp(&mut self) {
        self.workers = self.workers.clamp(1, 16);
        self.inline_output_chars = self.inline_output_chars.clamp(200, 100_000);
    }
}

// ── Maintenance ──────────────────────────────────────────────────────────

/// Maintenance loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Loop cadence in milliseconds; never below one minute.
    #[serde(default = "default_maintenance_interval_ms", alias = "intervalMs")]
    pub interval_ms: u64,

    /// Trace files older than this many days are removed.
    #[serde(default = "default_trace_retention_days", alias = "traceRetentionDays")]
    pub trace_retention_days: u32,

    /// Orphaned IPC request/cancel files older than this many minutes are
    /// removed.
    #[serde(default = "default_ipc_retention_minutes", alias = "ipcRetentionMinutes")]
    pub ipc_retention_minutes: u32,

    /// Session snapshots with an mtime older than this many days are
    /// removed.
    #[serde(
        default = "default_session_retention_days",
        alias = "sessionRetentionDays"
    )]
    pub session_retention_days: u32,

    /// Completed workflow runs older than this many days are removed.
    #[serde(
        default = "default_workflow_retention_days",
        alias = "workflowRetentionDays"
    )]
    pub workflow_retention_days: u32,
}

fn default_maintenance_interval_ms() -> u64 {
    600_000
}
fn default_trace_retention_days() -> u32 {
    14
}
fn default_ipc_retention_minutes() -> u32 {
    10
}
fn default_session_retention_days() -> u32 {
    30
}
fn default_workflow_retention_days() -> u32 {
    7
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_maintenance_interval_ms(),
            trace_retention_days: default_trace_retention_days(),
            ipc_retention_minutes: default_ipc_retention_minutes(),
            session_retention_days: default_session_retention_days(),
            workflow_retention_days: default_workflow_retention_days(),
        }
    }
}

impl MaintenanceConfig {
    fn clamp(&mut self) {
        self.interval_ms = self.interval_ms.clamp(60_000, 24 * 3_600_000);
        self.trace_retention_days = self.trace_retention_days.clamp(1, 365);
        self.ipc_retention_minutes = self.ipc_retention_minutes.clamp(1, 24 * 60);
        self.session_retention_days = self.session_retention_days.clamp(1, 365);
        self.workflow_retention_days = self.workflow_retention_days.clamp(1, 365);
    }
}

// ── Streaming ────────────────────────────────────────────────────────────

/// Streaming delivery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Chunks arriving within this window are coalesced into one edit,
    /// in milliseconds.
    #[serde(default = "default_chunk_flush_ms", alias = "chunkFlushIntervalMs")]
    pub chunk_flush_interval_ms: u64,

    /// Maximum length of an edited provider message before a continuation
    /// message is started.
    #[serde(default = "default_max_edit_length", alias = "maxEditLength")]
    pub max_edit_length: usize,
}

fn default_chunk_flush_ms() -> u64 {
    800
}
fn default_max_edit_length() -> usize {
    3_800
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_flush_interval_ms: default_chunk_flush_ms(),
            max_edit_length: default_max_edit_length(),
        }
    }
}

impl StreamingConfig {
    fn clamp(&mut self) {
        self.chunk_flush_interval_ms = self.chunk_flush_interval_ms.clamp(100, 10_000);
        self.max_edit_length = self.max_edit_length.clamp(500, 4_096);
    }
}

// ── Session ──────────────────────────────────────────────────────────────

/// Session persistence tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Approximate token ceiling before older history is compacted into
    /// the summary.
    #[serde(default = "default_compact_tokens", alias = "compactTokens")]
    pub compact_tokens: u32,

    /// Turns preserved verbatim through a compaction.
    #[serde(default = "default_keep_recent_turns", alias = "keepRecentTurns")]
    pub keep_recent_turns: u32,
}

fn default_compact_tokens() -> u32 {
    12_000
}
fn default_keep_recent_turns() -> u32 {
    12
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            compact_tokens: default_compact_tokens(),
            keep_recent_turns: default_keep_recent_turns(),
        }
    }
}

impl SessionConfig {
    fn clamp(&mut self) {
        self.compact_tokens = self.compact_tokens.clamp(1_000, 200_000);
        self.keep_recent_turns = self.keep_recent_turns.clamp(2, 100);
    }
}

// ── Tool policy ──────────────────────────────────────────────────────────

/// Tool allow/deny lists (`config/tool-policy.json`) plus the per-day
/// budget snapshot (`config/tool-budgets.json`) forwarded into each run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    /// Tool allowlist; empty means all tools.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Tool denylist.
    #[serde(default)]
    pub deny: Vec<String>,

    /// Remaining per-day tool budgets, passed through opaquely.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub budgets: serde_json::Value,
}

// ── Model file ───────────────────────────────────────────────────────────

/// Contents of `config/model.json`: the active model and its fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Active model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Failover candidates in preference order.
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Optional allowlist; when non-empty, `set_model` rejects models
    /// outside it.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4.5".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            fallbacks: Vec::new(),
            allowlist: Vec::new(),
        }
    }
}
