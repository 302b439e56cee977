//! Agent execution.
//!
//! Assembles the container invocation payload, takes the per-group lock
//! and a lane permit, runs the container, and drives the failover state
//! machine on errors: classify, cool the model down, downgrade reasoning
//! effort, shrink the tool budget, and move to the next candidate. Every
//! attempt leaves a telemetry trace line.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dotclaw_types::agent::{AgentInvocation, AgentResponse};
use dotclaw_types::config::{ContainerConfig, RouterConfig, ToolPolicy};
use dotclaw_types::group::Group;
use dotclaw_types::routing::RoutingDecision;
use dotclaw_types::{DotclawError, ErrorCategory};

use crate::cooldown::CooldownRegistry;
use crate::lanes::{GroupLocks, Lane, LaneGate};
use crate::now_ms;
use crate::recall::RecallBackend;
use crate::router::RequestRouter;
use crate::runner::{ContainerRunner, RunnerError};
use crate::session::SessionManager;
use crate::trace::{TraceRecord, TraceWriter};

/// Suffix appended to the prompt when retrying an empty success.
const STRICT_RETRY_SUFFIX: &str =
    "\n\nYour previous attempt returned an empty reply. Respond with a non-empty answer.";

/// One execution request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Request id; also keys the daemon response file and stream dir.
    pub request_id: String,
    /// The owning group.
    pub group: Group,
    /// Chat the reply belongs to.
    pub chat_jid: String,
    /// Assembled prompt.
    pub prompt: String,
    /// Requesting user id.
    pub user_id: String,
    /// Requesting user display name.
    pub user_name: String,
    /// Semaphore lane for this work.
    pub lane: Lane,
    /// Queued items behind this one (classifier threshold input).
    pub queue_depth: usize,
    /// Whether the agent should persist its session.
    pub persist_session: bool,
}

/// A finished execution.
#[derive(Debug)]
pub struct ExecOutcome {
    /// The agent's reply text.
    pub reply: String,
    /// Model that served the run.
    pub model: String,
    /// Attempts consumed (1 = no failover).
    pub attempts: u32,
    /// The routing decision that governed the run.
    pub decision: RoutingDecision,
    /// The raw response.
    pub response: AgentResponse,
}

/// The execution service.
pub struct AgentExecutor {
    runner: Arc<dyn ContainerRunner>,
    router: Arc<RequestRouter>,
    cooldowns: Arc<CooldownRegistry>,
    lanes: LaneGate,
    locks: GroupLocks,
    sessions: Arc<SessionManager>,
    recall: Arc<dyn RecallBackend>,
    trace: TraceWriter,
    container_cfg: ContainerConfig,
    router_cfg: RouterConfig,
    tool_policy: ToolPolicy,
}

impl AgentExecutor {
    /// Wire an executor from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<dyn ContainerRunner>,
        router: Arc<RequestRouter>,
        cooldowns: Arc<CooldownRegistry>,
        lanes: LaneGate,
        locks: GroupLocks,
        sessions: Arc<SessionManager>,
        recall: Arc<dyn RecallBackend>,
        trace: TraceWriter,
        container_cfg: ContainerConfig,
        router_cfg: RouterConfig,
        tool_policy: ToolPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            runner,
            router,
            cooldowns,
            lanes,
            locks,
            sessions,
            recall,
            trace,
            container_cfg,
            router_cfg,
            tool_policy,
        })
    }

    /// The session manager (pipeline needs it for compaction checks).
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Execute one request end to end.
    ///
    /// Ordering per the concurrency model: routing and recall happen
    /// before any lock, then the per-group lock, then the lane permit,
    /// then container attempts.
    pub async fn execute(
        &self,
        req: ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, DotclawError> {
        let decision = self.router.route(&req.prompt, req.queue_depth).await;

        let recall_lines = if decision.recall_max_results > 0 {
            self.recall
                .build_recall(
                    &req.group.folder,
                    &req.user_id,
                    &req.prompt,
                    decision.recall_max_results,
                    decision.recall_max_tokens,
                )
                .await
        } else {
            Vec::new()
        };
        let personalization = self
            .recall
            .build_user_profile(&req.group.folder, &req.user_id)
            .await;

        let _group_guard = self.locks.acquire(&req.group.folder).await;
        let Some(_permit) = self.lanes.acquire(req.lane, cancel).await else {
            return Err(DotclawError::Cancelled);
        };

        let mut attempted: HashSet<String> = HashSet::new();
        let mut effort = decision.reasoning_effort;
        let mut tool_steps = decision.max_tool_steps;
        let mut prompt = req.prompt.clone();
        let mut strict_retry_done = false;
        let mut attempts: u32 = 0;
        let mut last_failure: Option<(ErrorCategory, String)> = None;

        loop {
            let now = now_ms();
            let Some(model) =
                self.router
                    .next_model(&decision.model, &decision.fallbacks, &attempted, now)
            else {
                break;
            };
            attempted.insert(model.clone());
            attempts += 1;

            let session_id = self.sessions.current_session_id(&req.group.folder).await;
            let invocation = AgentInvocation {
                id: req.request_id.clone(),
                prompt: prompt.clone(),
                group_folder: req.group.folder.clone(),
                chat_jid: req.chat_jid.clone(),
                is_main: req.group.is_main(),
                user_id: req.user_id.clone(),
                user_name: req.user_name.clone(),
                model: model.clone(),
                fallbacks: decision.fallbacks.clone(),
                reasoning_effort: effort,
                max_output_tokens: decision.max_output_tokens,
                max_tool_steps: tool_steps,
                timeout_ms: self.container_cfg.timeout_ms,
                tool_allow: self.tool_policy.allow.clone(),
                tool_deny: self.tool_policy.deny.clone(),
                tool_budgets_snapshot: self.tool_policy.budgets.clone(),
                session_id,
                persist_session: req.persist_session,
                recall: recall_lines.clone(),
                system_prompt_overrides: Vec::new(),
                personalization: personalization.clone(),
            };

            match self.runner.run(&req.group, &invocation, cancel).await {
                Ok(response) if response.is_success() && !response.is_empty_success() => {
                    if req.persist_session
                        && let Some(session_id) = response.new_session_id.as_deref()
                        && let Err(e) = self.sessions.record_session(&req.group.folder, session_id)
                            .await
                    {
                        warn!(error = %e, "failed to record session id");
                    }
                    self.trace_run(&req, &model, attempts, Some(&response), None).await;
                    let reply = response.result.clone().unwrap_or_default();
                    return Ok(ExecOutcome {
                        reply,
                        model,
                        attempts,
                        decision,
                        response,
                    });
                }
                Ok(response) if response.is_empty_success() => {
                    // Soft failure: one strict retry on the same model
                    // before normal failover handles it.
                    if self.router_cfg.retry_empty_success && !strict_retry_done {
                        debug!(request = %req.request_id, "empty success, strict retry");
                        strict_retry_done = true;
                        attempted.remove(&model);
                        prompt = format!("{}{STRICT_RETRY_SUFFIX}", req.prompt);
                        continue;
                    }
                    self.note_failure(
                        &req,
                        &model,
                        attempts,
                        ErrorCategory::InvalidResponse,
                        "empty success",
                        &mut last_failure,
                    )
                    .await;
                    effort = effort.downgrade();
                    tool_steps = (tool_steps * 7 / 10).max(1);
                }
                Ok(response) => {
                    let message = response
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown agent error".into());
                    let category = ErrorCategory::classify(&message);
                    self.note_failure(&req, &model, attempts, category, &message, &mut last_failure)
                        .await;
                    if !category.is_retryable() {
                        break;
                    }
                    if category == ErrorCategory::ContextOverflow {
                        if let Err(e) = self.sessions.compact(&req.group.folder).await {
                            warn!(error = %e, "compaction before retry failed");
                        }
                    }
                    effort = effort.downgrade();
                    tool_steps = (tool_steps * 7 / 10).max(1);
                }
                Err(RunnerError::Preempted) => return Err(DotclawError::Preempted),
                Err(RunnerError::Cancelled) => return Err(DotclawError::Cancelled),
                Err(e) => {
                    let category = match &e {
                        RunnerError::Timeout(_) | RunnerError::DaemonTimeout(_) => {
                            ErrorCategory::Timeout
                        }
                        RunnerError::Stale(_) => ErrorCategory::InvalidResponse,
                        _ => ErrorCategory::Transient,
                    };
                    let message = e.to_string();
                    self.note_failure(&req, &model, attempts, category, &message, &mut last_failure)
                        .await;
                    effort = effort.downgrade();
                    tool_steps = (tool_steps * 7 / 10).max(1);
                }
            }
        }

        let (category, message) = last_failure
            .unwrap_or((ErrorCategory::Transient, "no model available".into()));
        Err(DotclawError::AgentRun { category, message })
    }

    async fn note_failure(
        &self,
        req: &ExecRequest,
        model: &str,
        attempts: u32,
        category: ErrorCategory,
        message: &str,
        last_failure: &mut Option<(ErrorCategory, String)>,
    ) {
        warn!(
            request = %req.request_id,
            model,
            %category,
            "agent attempt failed"
        );
        self.cooldowns.register_failure(model, category, now_ms());
        self.trace_run(req, model, attempts, None, Some((category, message))).await;
        *last_failure = Some((category, sanitize(message)));
    }

    async fn trace_run(
        &self,
        req: &ExecRequest,
        model: &str,
        attempts: u32,
        response: Option<&AgentResponse>,
        failure: Option<(ErrorCategory, &str)>,
    ) {
        let record = TraceRecord {
            ts: now_ms(),
            chat_id: req.chat_jid.clone(),
            group_folder: req.group.folder.clone(),
            model: model.to_string(),
            latency_ms: response.map(|r| r.latency_ms).unwrap_or_default(),
            tokens_prompt: response.map(|r| r.tokens_prompt).unwrap_or_default(),
            tokens_completion: response.map(|r| r.tokens_completion).unwrap_or_default(),
            tool_calls: response.map(|r| r.tool_calls.len() as u32).unwrap_or_default(),
            memory_recall_count: response.map(|r| r.memory_recall_count).unwrap_or_default(),
            attempts,
            error: failure.map(|(_, message)| sanitize(message)),
            category: failure.map(|(category, _)| category.to_string()),
        };
        self.trace.append(&record).await;
    }
}

/// Strip anything that looks like a credential before a message reaches
/// telemetry or chat.
fn sanitize(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for token in message.split_whitespace() {
        let looks_secret = token.len() > 20
            && (token.starts_with("sk-")
                || token.starts_with("Bearer")
                || token.chars().filter(|c| c.is_alphanumeric()).count() > 32);
        if looks_secret {
            out.push_str("[redacted]");
        } else {
            out.push_str(token);
        }
        out.push(' ');
    }
    out.trim_end().to_string()
}
