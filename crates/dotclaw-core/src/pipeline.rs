//! The message pipeline.
//!
//! Admission → durable persist → per-chat batch claim → hygiene →
//! catch-up assembly → prompt budget → execution → delivery, with
//! re-queue on transient failure, humanized failure surfacing,
//! interrupt-on-new-message, explicit cancel phrases, and admin command
//! routing. Backpressure falls out of the queue contract: a chat with a
//! claimed batch cannot claim another until the first resolves.

use std::sync::{Arc, Weak};

use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dotclaw_channels::{OutboundMessage, ProviderRegistry, format::format_message_chunks};
use dotclaw_platform::DataPaths;
use dotclaw_store::{HostStore, MemoryStore, RetryPolicy, StoredMessage};
use dotclaw_types::config::RuntimeConfig;
use dotclaw_types::group::Group;
use dotclaw_types::job::{BackgroundJob, JobState};
use dotclaw_types::message::{IncomingMessage, QueueItem};
use dotclaw_types::routing::Profile;
use dotclaw_types::task::TaskStatus;
use dotclaw_types::{DotclawError, ErrorCategory};

use crate::admin::{AdminCommand, is_cancel_phrase, parse_admin_command};
use crate::executor::{AgentExecutor, ExecRequest};
use crate::groups::GroupRegistry;
use crate::lanes::Lane;
use crate::now_ms;
use crate::recall::RecallBackend;
use crate::router::RequestRouter;
use crate::streaming::{deliver_stream, discard_stream, finalize_stream};

/// The pipeline service.
pub struct MessagePipeline {
    store: HostStore,
    memory: MemoryStore,
    executor: Arc<AgentExecutor>,
    router: Arc<RequestRouter>,
    recall: Arc<dyn RecallBackend>,
    providers: ProviderRegistry,
    groups: Arc<GroupRegistry>,
    paths: DataPaths,
    cfg: Arc<RuntimeConfig>,
    bot_name: String,
    /// chat id → cancel token of the in-flight run.
    active_runs: DashMap<String, CancellationToken>,
    /// chat id marker for a live drain task.
    drains: DashMap<String, ()>,
    shutdown: CancellationToken,
    me: Weak<Self>,
}

impl MessagePipeline {
    /// Wire the pipeline from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: HostStore,
        memory: MemoryStore,
        executor: Arc<AgentExecutor>,
        router: Arc<RequestRouter>,
        recall: Arc<dyn RecallBackend>,
        providers: ProviderRegistry,
        groups: Arc<GroupRegistry>,
        paths: DataPaths,
        cfg: Arc<RuntimeConfig>,
        bot_name: String,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store,
            memory,
            executor,
            router,
            recall,
            providers,
            groups,
            paths,
            cfg,
            bot_name,
            active_runs: DashMap::new(),
            drains: DashMap::new(),
            shutdown,
            me: me.clone(),
        })
    }

    /// Periodic sweep that revives drains for chats with queued work and
    /// reaps abandoned claims. Runs until shutdown.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(1_000));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }
            let now = now_ms();
            match self.store.reap_expired_claims(now).await {
                Ok(0) => {}
                Ok(n) => warn!(reaped = n, "returned abandoned queue claims"),
                Err(e) => warn!(error = %e, "claim reaper failed"),
            }
            if let Ok(chats) = self.store.chats_with_queued(now).await {
                for chat_id in chats {
                    self.signal_drain(&chat_id);
                }
            }
        }
    }

    /// Entry point for provider adapters.
    pub async fn handle_incoming(&self, msg: IncomingMessage) {
        // Explicit cancel phrases act on the active foreground run.
        if is_cancel_phrase(&msg.content) {
            if let Some(entry) = self.active_runs.get(&msg.chat_id) {
                entry.value().cancel();
                info!(chat_id = %msg.chat_id, "user canceled active run");
                self.send_text(&msg.chat_id, "Okay, I stopped.").await;
            }
            return;
        }

        let Some(group) = self.groups.by_chat_id(&msg.chat_id) else {
            debug!(chat_id = %msg.chat_id, "message for unregistered chat dropped");
            return;
        };

        if let Some(command) = parse_admin_command(&msg.content, &self.bot_name) {
            if group.is_main() {
                let reply = self.handle_admin(&group, &command).await;
                self.send_text(&msg.chat_id, &reply).await;
                return;
            }
            // Non-main chats fall through to normal admission.
        }

        if msg.is_group && !msg.mentions_bot && !trigger_matches(&group, &msg.content) {
            return;
        }

        let item = QueueItem::from_incoming(&msg);
        if let Err(e) = self.store.enqueue(item, group.name.clone()).await {
            warn!(error = %e, "failed to enqueue message");
            return;
        }
        self.signal_drain(&msg.chat_id);
    }

    /// Spawn the per-chat drain task when none is live.
    fn signal_drain(&self, chat_id: &str) {
        use dashmap::mapref::entry::Entry;
        match self.drains.entry(chat_id.to_string()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(());
                let Some(pipeline) = self.me.upgrade() else {
                    return;
                };
                let chat_id = chat_id.to_string();
                tokio::spawn(async move {
                    pipeline.run_drain(&chat_id).await;
                });
            }
        }
    }

    /// Drain loop for one chat: batch, process, repeat until empty.
    async fn run_drain(&self, chat_id: &str) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            // Batching window: let near-simultaneous messages coalesce.
            tokio::time::sleep(std::time::Duration::from_millis(
                self.cfg.pipeline.batch_window_ms,
            ))
            .await;
            if !self.drain_chat_once(chat_id).await {
                break;
            }
        }
        self.drains.remove(chat_id);
    }

    /// Claim and process one batch. Returns whether a batch was claimed.
    pub async fn drain_chat_once(&self, chat_id: &str) -> bool {
        let p = &self.cfg.pipeline;
        let batch = match self
            .store
            .claim_batch(
                chat_id,
                p.batch_window_ms,
                p.max_batch_size,
                now_ms(),
                p.claim_deadline_ms,
            )
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "batch claim failed");
                return false;
            }
        };
        if batch.is_empty() {
            return false;
        }
        let Some(group) = self.groups.by_chat_id(chat_id) else {
            // Group unregistered between enqueue and claim.
            let ids = batch.into_iter().map(|i| i.id).collect();
            let _ = self.store.fail(ids, "group unregistered".into()).await;
            return true;
        };
        self.process_batch(&group, batch).await;
        true
    }

    async fn process_batch(&self, group: &Group, batch: Vec<QueueItem>) {
        let chat_id = batch[0].chat_id.clone();
        let ids: Vec<String> = batch.iter().map(|i| i.id.clone()).collect();
        let last_ts = batch.last().map(|i| i.timestamp).unwrap_or_default();
        let newest = batch.last().expect("non-empty batch");
        let (user_id, user_name) = (newest.sender_id.clone(), newest.sender_name.clone());

        let prompt = self.assemble_prompt(&chat_id, &batch).await;
        let queue_depth = self
            .store
            .queued_after(&chat_id, last_ts)
            .await
            .unwrap_or(0) as usize;

        // Background hand-off: long asynchronous prompts become jobs.
        let decision = self.router.route(&prompt, queue_depth).await;
        if decision.profile == Profile::Background {
            let job_id = format!("job-{}", uuid::Uuid::new_v4());
            let job = BackgroundJob {
                id: job_id.clone(),
                group_folder: group.folder.clone(),
                chat_jid: chat_id.clone(),
                prompt: prompt.clone(),
                status: JobState::Queued,
                output: None,
                output_path: None,
                created_at: now_ms(),
                started_at: None,
                finished_at: None,
            };
            if let Err(e) = self.store.create_job(job).await {
                warn!(error = %e, "failed to enqueue background job");
            } else {
                let _ = self.store.mark_done(ids).await;
                let _ = self.store.set_last_agent_timestamp(&chat_id, last_ts).await;
                self.send_text(
                    &chat_id,
                    &format!("That looks involved. I'm on it in the background ({job_id})."),
                )
                .await;
                return;
            }
        }

        let request_id = format!("req-{}", uuid::Uuid::new_v4());
        let run_cancel = self.shutdown.child_token();
        self.active_runs.insert(chat_id.clone(), run_cancel.clone());

        // Streaming delivery watches the conventional stream directory
        // for this request while the container runs.
        let stream_dir = self
            .paths
            .group_ipc_dir(&group.folder)
            .join("stream")
            .join(&request_id);
        let _ = tokio::fs::create_dir_all(&stream_dir).await;
        let stream_task = {
            let provider = self.providers.route(&chat_id).ok();
            let stream_cfg = self.cfg.streaming.clone();
            let stream_cancel = run_cancel.child_token();
            let dir = stream_dir.clone();
            let chat = chat_id.clone();
            let stop = stream_cancel.clone();
            (
                stop,
                tokio::spawn(async move {
                    match provider {
                        Some(provider) => {
                            deliver_stream(provider, &chat, &dir, &stream_cfg, &stream_cancel).await
                        }
                        None => Default::default(),
                    }
                }),
            )
        };

        let request = ExecRequest {
            request_id,
            group: group.clone(),
            chat_jid: chat_id.clone(),
            prompt,
            user_id,
            user_name,
            lane: Lane::Interactive,
            queue_depth,
            persist_session: true,
        };

        // Run the executor while watching for newer messages; an
        // interrupt cancels the run and the loop keeps polling until the
        // executor future actually resolves.
        let interrupt_enabled = self.cfg.pipeline.interrupt_on_new_message;
        let exec_fut = self.executor.execute(request, &run_cancel);
        tokio::pin!(exec_fut);
        let mut interrupted = false;
        let result = loop {
            tokio::select! {
                result = &mut exec_fut => break result,
                _ = tokio::time::sleep(std::time::Duration::from_millis(200)), if interrupt_enabled && !interrupted => {
                    if self.store.queued_after(&chat_id, last_ts).await.unwrap_or(0) > 0 {
                        debug!(chat_id = %chat_id, "newer message arrived, interrupting run");
                        interrupted = true;
                        run_cancel.cancel();
                    }
                }
            }
        };

        let (stream_stop, stream_join) = stream_task;
        stream_stop.cancel();
        let streamed = stream_join.await.unwrap_or_default();
        self.active_runs.remove(&chat_id);
        let _ = tokio::fs::remove_dir_all(&stream_dir).await;

        let provider = self.providers.route(&chat_id).ok();
        match result {
            Ok(outcome) => {
                if let Some(provider) = provider.as_deref() {
                    let finalized = finalize_stream(
                        provider,
                        &chat_id,
                        &streamed,
                        &outcome.reply,
                        &self.cfg.streaming,
                    )
                    .await;
                    if !finalized {
                        for chunk in
                            format_message_chunks(&outcome.reply, self.cfg.streaming.max_edit_length)
                        {
                            let _ = provider.send(&OutboundMessage::text(&chat_id, chunk)).await;
                        }
                    }
                }
                let _ = self.store.mark_done(ids).await;
                let _ = self.store.set_last_agent_timestamp(&chat_id, last_ts).await;
            }
            Err(DotclawError::Preempted) | Err(DotclawError::Cancelled) if interrupted => {
                // Newer message: hand the claim back and let the next
                // pass claim the expanded batch. Partial streamed output
                // is deleted per the interrupt policy.
                if let Some(provider) = provider.as_deref() {
                    discard_stream(provider, &chat_id, &streamed).await;
                }
                let _ = self.store.release_claims(ids).await;
            }
            Err(DotclawError::Cancelled) => {
                let _ = self.store.fail(ids, "canceled by user".into()).await;
            }
            Err(DotclawError::AgentRun { category, message }) => {
                self.handle_run_failure(&chat_id, ids, &batch, category, &message).await;
            }
            Err(e) => {
                self.handle_run_failure(&chat_id, ids, &batch, ErrorCategory::Transient, &e.to_string())
                    .await;
            }
        }
    }

    async fn handle_run_failure(
        &self,
        chat_id: &str,
        ids: Vec<String>,
        batch: &[QueueItem],
        category: ErrorCategory,
        message: &str,
    ) {
        let p = &self.cfg.pipeline;
        let max_attempt = batch.iter().map(|i| i.attempt).max().unwrap_or(0);
        let retryable = category.is_retryable() && max_attempt < p.max_retries;
        warn!(chat_id, %category, retryable, "run failed: {message}");

        if retryable {
            let policy = RetryPolicy {
                base_ms: p.retry_base_ms,
                max_ms: p.retry_max_ms,
            };
            let _ = self
                .store
                .requeue(ids, format!("{category}: {message}"), policy, now_ms())
                .await;
        } else {
            let _ = self
                .store
                .fail(ids, format!("{category}: {message}"))
                .await;
            self.send_text(chat_id, category.humanize()).await;
        }
    }

    /// Catch-up plus batch content, hygienically cleaned and budgeted.
    async fn assemble_prompt(&self, chat_id: &str, batch: &[QueueItem]) -> String {
        let last_agent_ts = self
            .store
            .chat_state(chat_id)
            .await
            .ok()
            .flatten()
            .map(|s| s.last_agent_timestamp)
            .unwrap_or(0);

        let mut history = self
            .store
            .messages_since(chat_id, last_agent_ts)
            .await
            .unwrap_or_default();
        if history.is_empty() {
            history = batch
                .iter()
                .map(|i| StoredMessage {
                    sender_name: i.sender_name.clone(),
                    content: i.content.clone(),
                    timestamp: i.timestamp,
                })
                .collect();
        }

        let cleaned = clean_turns(history);
        let lines: Vec<String> = cleaned.iter().map(format_turn).collect();
        let (kept, omitted) = budget_lines(&lines, self.cfg.pipeline.prompt_max_chars);
        let mut prompt = String::new();
        if omitted > 0 {
            prompt.push_str(&format!("[{omitted} earlier messages omitted]\n"));
        }
        prompt.push_str(&kept.join("\n"));
        prompt
    }

    async fn send_text(&self, chat_id: &str, text: &str) {
        if let Ok(provider) = self.providers.route(chat_id) {
            for chunk in format_message_chunks(text, self.cfg.streaming.max_edit_length) {
                if let Err(e) = provider.send(&OutboundMessage::text(chat_id, chunk)).await {
                    warn!(error = %e, "provider send failed");
                }
            }
        }
    }

    // ── Admin commands ───────────────────────────────────────────────

    async fn handle_admin(&self, _group: &Group, command: &AdminCommand) -> String {
        match (command.command.as_str(), command.args.as_slice()) {
            ("groups", _) => {
                let groups = self.groups.list();
                if groups.is_empty() {
                    "No groups registered.".to_string()
                } else {
                    groups
                        .iter()
                        .map(|g| format!("{} - {} ({})", g.folder, g.name, g.chat_id))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            ("add-group", [chat_id, name, folder]) => {
                let group = Group {
                    chat_id: chat_id.clone(),
                    name: name.clone(),
                    folder: folder.clone(),
                    trigger: None,
                    extra_mounts: vec![],
                    env: Default::default(),
                };
                match self.groups.register(group).await {
                    Ok(()) => format!("Registered {name} as {folder}."),
                    Err(e) => format!("Could not register group: {e}"),
                }
            }
            ("add-group", _) => "Usage: add-group <chatId> <name> <folder>".to_string(),
            ("remove-group", [chat_id]) => match self.groups.remove(chat_id).await {
                Ok(Some(g)) => format!("Removed {} ({}).", g.name, g.folder),
                Ok(None) => "No such group.".to_string(),
                Err(e) => format!("Could not remove group: {e}"),
            },
            ("remove-group", _) => "Usage: remove-group <chatId>".to_string(),
            ("set-model", [model]) => match self.router.set_model(model).await {
                Ok(()) => format!("Model set to {model}."),
                Err(e) => format!("Could not set model: {e}"),
            },
            ("set-model", _) => "Usage: set-model <modelId>".to_string(),
            ("model", _) => {
                let cfg = self.router.model_config();
                format!("Active model: {} (fallbacks: {})", cfg.model, cfg.fallbacks.join(", "))
            }
            ("tasks", _) => match self.store.list_tasks(None).await {
                Ok(tasks) if tasks.is_empty() => "No scheduled tasks.".to_string(),
                Ok(tasks) => tasks
                    .iter()
                    .map(|t| {
                        format!(
                            "{} [{}] {} (next {})",
                            t.id,
                            t.status.as_str(),
                            t.prompt.chars().take(60).collect::<String>(),
                            t.next_run
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("Could not list tasks: {e}"),
            },
            ("pause-task", [id]) => self.set_task_status(id, TaskStatus::Paused).await,
            ("resume-task", [id]) => self.set_task_status(id, TaskStatus::Active).await,
            ("cancel-task", [id]) => self.set_task_status(id, TaskStatus::Canceled).await,
            ("run-task", [id]) => {
                match self.store.update_task(id, None, None, None).await {
                    Err(e) => format!("No such task: {e}"),
                    Ok(()) => match self
                        .store
                        .finish_task_run(id, "manual run requested".into(), 0, Some(now_ms()))
                        .await
                    {
                        Ok(()) => format!("Task {id} will run on the next scheduler tick."),
                        Err(e) => format!("Could not trigger task: {e}"),
                    },
                }
            }
            ("memory", _) => {
                let stats = self.recall.stats("main").await;
                format!(
                    "{} memories ({} embedded), types: {:?}",
                    stats.total, stats.embedded, stats.by_type
                )
            }
            ("forget", [id]) => match self.memory.forget("main", id).await {
                Ok(true) => format!("Forgot {id}."),
                Ok(false) => "No such memory.".to_string(),
                Err(e) => format!("Could not forget: {e}"),
            },
            ("jobs", _) => match self.store.list_jobs("main").await {
                Ok(jobs) if jobs.is_empty() => "No background jobs.".to_string(),
                Ok(jobs) => jobs
                    .iter()
                    .take(10)
                    .map(|j| format!("{} [{}]", j.id, j.status.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("Could not list jobs: {e}"),
            },
            ("status", _) => {
                let model = self.router.model_config().model;
                format!(
                    "Running. Model {model}, {} group(s), bot @{}.",
                    self.groups.list().len(),
                    self.bot_name
                )
            }
            _ => "Commands: groups, add-group, remove-group, model, set-model, tasks, \
                  pause-task, resume-task, cancel-task, run-task, memory, forget, jobs, status"
                .to_string(),
        }
    }

    async fn set_task_status(&self, id: &str, status: TaskStatus) -> String {
        match self.store.set_task_status(id, status).await {
            Ok(()) => format!("Task {id} is now {}.", status.as_str()),
            Err(e) => format!("Could not update task: {e}"),
        }
    }
}

fn trigger_matches(group: &Group, content: &str) -> bool {
    match &group.trigger {
        Some(pattern) => regex::Regex::new(pattern)
            .map(|re| re.is_match(content))
            .unwrap_or(false),
        None => false,
    }
}

/// A cleaned conversational turn.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanTurn {
    /// Sender display name.
    pub sender_name: String,
    /// Normalized content.
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

/// Hygiene pass over raw stored messages.
///
/// Drops malformed turns (empty content, non-positive timestamps), drops
/// stale `[streaming]` placeholders that precede real turns, collapses
/// successive prefix extensions from the same sender (partial streaming
/// updates), and normalizes JSON tool-result envelopes into a
/// `Tool result (NAME): …` line.
pub fn clean_turns(raw: Vec<StoredMessage>) -> Vec<CleanTurn> {
    let mut out: Vec<CleanTurn> = Vec::new();
    for msg in raw {
        if msg.content.trim().is_empty() || msg.timestamp <= 0 {
            continue;
        }
        let content = normalize_tool_result(msg.content.trim());
        if content.starts_with("[streaming]") {
            continue;
        }
        if let Some(prev) = out.last_mut()
            && prev.sender_name == msg.sender_name
            && content.starts_with(prev.content.as_str())
        {
            // Prefix extension: the newer turn supersedes the older one.
            prev.content = content;
            prev.timestamp = msg.timestamp;
            continue;
        }
        out.push(CleanTurn {
            sender_name: msg.sender_name,
            content,
            timestamp: msg.timestamp,
        });
    }
    out
}

/// Turn `{"tool": "NAME", "result": …}` envelopes into readable lines.
fn normalize_tool_result(content: &str) -> String {
    if !content.starts_with('{') {
        return content.to_string();
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else {
        return content.to_string();
    };
    let name = value
        .get("tool")
        .or_else(|| value.get("toolName"))
        .and_then(|v| v.as_str());
    let Some(name) = name else {
        return content.to_string();
    };
    let result = match value.get("result") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let mut flat = result.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() > 400 {
        let mut cut = 400;
        while !flat.is_char_boundary(cut) {
            cut -= 1;
        }
        flat.truncate(cut);
        flat.push('…');
    }
    format!("Tool result ({name}): {flat}")
}

/// Format one turn as `[date time] name: content`.
fn format_turn(turn: &CleanTurn) -> String {
    let when = Utc
        .timestamp_millis_opt(turn.timestamp)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("[{when}] {}: {}", turn.sender_name, turn.content)
}

/// Keep the most recent lines that fit the character budget. Returns the
/// kept lines (oldest first) and how many were omitted.
fn budget_lines(lines: &[String], max_chars: usize) -> (Vec<String>, usize) {
    let mut total = 0;
    let mut kept = Vec::new();
    for line in lines.iter().rev() {
        let cost = line.len() + 1;
        if total + cost > max_chars && !kept.is_empty() {
            break;
        }
        total += cost;
        kept.push(line.clone());
        if total > max_chars {
            break;
        }
    }
    kept.reverse();
    let omitted = lines.len() - kept.len();
    (kept, omitted)
}
