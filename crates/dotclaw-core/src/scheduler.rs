//! The task scheduler.
//!
//! A single poller claims due tasks atomically (`running_since` is the
//! claim marker) and launches each under the `scheduled` lane. Cron
//! schedules use seconds-resolution cron expressions evaluated in UTC;
//! intervals are milliseconds; one-shots fire once. Failures back off
//! exponentially up to the retry cap, after which the schedule advances
//! (or a one-shot goes terminal). Ticks never overlap: the next tick
//! starts only after the previous one has dispatched.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dotclaw_channels::{OutboundMessage, ProviderRegistry, format::format_message_chunks};
use dotclaw_store::HostStore;
use dotclaw_types::config::SchedulerConfig;
use dotclaw_types::task::{ContextMode, ScheduleType, ScheduledTask, TaskStatus};
use dotclaw_types::{DotclawError, Result};

use crate::executor::{AgentExecutor, ExecRequest};
use crate::groups::GroupRegistry;
use crate::lanes::Lane;
use crate::now_ms;

/// Base backoff for failing tasks.
const TASK_RETRY_BASE_MS: i64 = 30_000;
/// Backoff cap for failing tasks.
const TASK_RETRY_MAX_MS: i64 = 15 * 60_000;

/// Compute a task's next run strictly after `now_ms_at`.
///
/// - `cron`: next matching instant of the expression (UTC).
/// - `interval`: `now + value` (value is milliseconds).
/// - `once`: `Some(value)` when still in the future, else `None`.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    schedule_value: &str,
    now_ms_at: i64,
) -> Result<Option<i64>> {
    match schedule_type {
        ScheduleType::Cron => {
            let schedule = Schedule::from_str(schedule_value).map_err(|e| {
                DotclawError::ConfigInvalid {
                    reason: format!("cron expression: {e}"),
                }
            })?;
            let after = Utc
                .timestamp_millis_opt(now_ms_at)
                .single()
                .unwrap_or_else(Utc::now);
            Ok(schedule.after(&after).next().map(|dt| dt.timestamp_millis()))
        }
        ScheduleType::Interval => {
            let interval: i64 =
                schedule_value
                    .parse()
                    .map_err(|_| DotclawError::ConfigInvalid {
                        reason: format!("interval must be milliseconds: {schedule_value}"),
                    })?;
            if interval <= 0 {
                return Err(DotclawError::ConfigInvalid {
                    reason: "interval must be positive".into(),
                });
            }
            Ok(Some(now_ms_at + interval))
        }
        ScheduleType::Once => {
            let at: i64 = schedule_value
                .parse()
                .map_err(|_| DotclawError::ConfigInvalid {
                    reason: format!("one-shot time must be epoch ms: {schedule_value}"),
                })?;
            Ok(if at > now_ms_at { Some(at) } else { None })
        }
    }
}

/// Exponential backoff for a failing task attempt.
fn retry_delay_ms(attempt: u32) -> i64 {
    (TASK_RETRY_BASE_MS.saturating_mul(1 << attempt.min(16))).min(TASK_RETRY_MAX_MS)
}

/// The scheduler service.
pub struct TaskScheduler {
    store: HostStore,
    executor: Arc<AgentExecutor>,
    providers: ProviderRegistry,
    groups: Arc<GroupRegistry>,
    cfg: SchedulerConfig,
    max_edit_length: usize,
}

impl TaskScheduler {
    /// Wire the scheduler.
    pub fn new(
        store: HostStore,
        executor: Arc<AgentExecutor>,
        providers: ProviderRegistry,
        groups: Arc<GroupRegistry>,
        cfg: SchedulerConfig,
        max_edit_length: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            providers,
            groups,
            cfg,
            max_edit_length,
        })
    }

    /// Create a new task and persist it. Returns the task id.
    pub async fn schedule(
        &self,
        group_folder: &str,
        chat_jid: &str,
        prompt: &str,
        schedule_type: ScheduleType,
        schedule_value: &str,
        context_mode: ContextMode,
    ) -> Result<String> {
        let now = now_ms();
        let next_run = compute_next_run(schedule_type, schedule_value, now)?.ok_or_else(|| {
            DotclawError::ConfigInvalid {
                reason: "schedule has no future occurrence".into(),
            }
        })?;
        let id = format!("task-{}", uuid::Uuid::new_v4());
        let task = ScheduledTask {
            id: id.clone(),
            group_folder: group_folder.to_string(),
            chat_jid: chat_jid.to_string(),
            prompt: prompt.to_string(),
            schedule_type,
            schedule_value: schedule_value.to_string(),
            context_mode,
            next_run,
            status: TaskStatus::Active,
            attempt: 0,
            last_result: None,
            running_since: None,
            state_json: None,
            created_at: now,
        };
        self.store.create_task(task).await?;
        info!(task_id = %id, group = group_folder, "scheduled task");
        Ok(id)
    }

    /// Run until shutdown: recover stale claims, claim due tasks, run
    /// them. Ticks are total-ordered; a tick only begins after the
    /// previous dispatch loop finished.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        info!("task scheduler started");
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(
            self.cfg.poll_interval_ms,
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("task scheduler shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.tick(&cancel).await;
                }
            }
        }
    }

    /// One scheduler tick.
    pub async fn tick(&self, cancel: &CancellationToken) {
        let now = now_ms();
        match self
            .store
            .recover_stale_tasks(now - self.cfg.task_timeout_ms as i64)
            .await
        {
            Ok(0) => {}
            Ok(n) => warn!(revived = n, "recovered stale task claims"),
            Err(e) => error!(error = %e, "stale task recovery failed"),
        }

        let due = match self.store.claim_due_tasks(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "due task claim failed");
                return;
            }
        };
        for task in due {
            debug!(task_id = %task.id, "running due task");
            self.run_claimed_task(task, cancel).await;
        }
    }

    /// Execute one claimed task and persist its outcome.
    async fn run_claimed_task(&self, task: ScheduledTask, cancel: &CancellationToken) {
        let Some(group) = self.groups.by_folder(&task.group_folder) else {
            warn!(task_id = %task.id, "task group no longer registered, canceling");
            let _ = self
                .store
                .finish_task_run(&task.id, "group unregistered".into(), task.attempt, None)
                .await;
            return;
        };

        let request = ExecRequest {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            group,
            chat_jid: task.chat_jid.clone(),
            prompt: task.prompt.clone(),
            user_id: "scheduler".into(),
            user_name: "Scheduler".into(),
            lane: Lane::Scheduled,
            queue_depth: 0,
            persist_session: task.context_mode == ContextMode::Recent,
        };

        let now = now_ms();
        match self.executor.execute(request, cancel).await {
            Ok(outcome) => {
                self.deliver(&task.chat_jid, &outcome.reply).await;
                let next = compute_next_run(task.schedule_type, &task.schedule_value, now)
                    .unwrap_or(None);
                let result = format!("ok: {}", truncate(&outcome.reply, 300));
                if let Err(e) = self.store.finish_task_run(&task.id, result, 0, next).await {
                    error!(error = %e, "failed to persist task outcome");
                }
            }
            Err(e) => {
                let attempt = task.attempt + 1;
                let retryable = !matches!(
                    &e,
                    DotclawError::AgentRun { category, .. } if !category.is_retryable()
                );
                let next = if retryable && attempt <= self.cfg.max_retries {
                    // Backoff retry, same schedule slot.
                    Some(now + retry_delay_ms(attempt))
                } else {
                    // Give up on this occurrence: advance to the next
                    // schedule tick; one-shots go terminal.
                    compute_next_run(task.schedule_type, &task.schedule_value, now).unwrap_or(None)
                };
                let reset_attempt = if next.is_some() && !(retryable && attempt <= self.cfg.max_retries)
                {
                    0
                } else {
                    attempt
                };
                warn!(task_id = %task.id, error = %e, attempt, "task run failed");
                let result = format!("error: {}", truncate(&e.to_string(), 300));
                if let Err(persist) = self
                    .store
                    .finish_task_run(&task.id, result, reset_attempt, next)
                    .await
                {
                    error!(error = %persist, "failed to persist task failure");
                }
            }
        }
    }

    async fn deliver(&self, chat_jid: &str, reply: &str) {
        if reply.trim().is_empty() {
            return;
        }
        if let Ok(provider) = self.providers.route(chat_jid) {
            for chunk in format_message_chunks(reply, self.max_edit_length) {
                if let Err(e) = provider.send(&OutboundMessage::text(chat_jid, chunk)).await {
                    warn!(error = %e, "task delivery failed");
                }
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::CooldownRegistry;
    use crate::lanes::{GroupLocks, LaneGate};
    use crate::recall::RecallBackend;
    use crate::router::{HeuristicClassifier, RequestRouter};
    use crate::runner::testing::{StubRunner, agent_error, success};
    use crate::session::SessionManager;
    use crate::trace::TraceWriter;
    use async_trait::async_trait;
    use dotclaw_channels::MockProvider;
    use dotclaw_platform::DataPaths;
    use dotclaw_platform::fs::write_json_atomic;
    use dotclaw_types::config::{
        ContainerConfig, LaneConfig, ModelConfig, RecallConfig, RouterConfig, SessionConfig,
    };
    use dotclaw_types::group::Group;
    use dotclaw_types::memory::MemoryStats;

    struct NoRecall;

    #[async_trait]
    impl RecallBackend for NoRecall {
        async fn build_recall(&self, _: &str, _: &str, _: &str, _: u32, _: u32) -> Vec<String> {
            Vec::new()
        }
        async fn build_user_profile(&self, _: &str, _: &str) -> Option<String> {
            None
        }
        async fn stats(&self, _: &str) -> MemoryStats {
            MemoryStats::default()
        }
    }

    struct World {
        scheduler: Arc<TaskScheduler>,
        store: HostStore,
        provider: Arc<MockProvider>,
        _dir: tempfile::TempDir,
    }

    async fn world(runner: Arc<StubRunner>) -> World {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().to_path_buf());
        paths.ensure_layout().await.unwrap();

        let store = HostStore::open(paths.messages_db()).await.unwrap();
        let cooldowns = CooldownRegistry::empty(paths.cooldowns_file());
        write_json_atomic(
            &paths.model_file(),
            &ModelConfig {
                model: "model-a".into(),
                fallbacks: vec![],
                allowlist: vec![],
            },
        )
        .await
        .unwrap();
        let router = Arc::new(
            RequestRouter::load(
                RouterConfig::default(),
                RecallConfig::default(),
                paths.model_file(),
                Arc::clone(&cooldowns),
                Arc::new(HeuristicClassifier),
            )
            .await
            .unwrap(),
        );
        let executor = AgentExecutor::new(
            runner,
            router,
            cooldowns,
            LaneGate::new(LaneConfig::default()),
            GroupLocks::new(),
            Arc::new(SessionManager::new(paths.clone(), SessionConfig::default())),
            Arc::new(NoRecall),
            TraceWriter::new(paths.clone()),
            ContainerConfig::default(),
            RouterConfig::default(),
            dotclaw_types::config::ToolPolicy::default(),
        );

        let groups = GroupRegistry::load(paths).await.unwrap();
        groups
            .register(Group {
                chat_id: "mock:-1".into(),
                name: "Main".into(),
                folder: "main".into(),
                trigger: None,
                extra_mounts: vec![],
                env: Default::default(),
            })
            .await
            .unwrap();

        let provider = Arc::new(MockProvider::named("mock"));
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());

        let scheduler = TaskScheduler::new(
            store.clone(),
            executor,
            providers,
            groups,
            SchedulerConfig {
                poll_interval_ms: 1_000,
                task_timeout_ms: 60_000,
                max_retries: 2,
            },
            3_800,
        );
        World {
            scheduler,
            store,
            provider,
            _dir: dir,
        }
    }

    #[test]
    fn next_run_for_each_schedule_kind() {
        // Cron: every day at 09:00:00 UTC (7-field, seconds first).
        let next = compute_next_run(ScheduleType::Cron, "0 0 9 * * * *", 1_700_000_000_000)
            .unwrap()
            .unwrap();
        assert!(next > 1_700_000_000_000);

        let next = compute_next_run(ScheduleType::Interval, "60000", 1_000).unwrap();
        assert_eq!(next, Some(61_000));

        assert_eq!(
            compute_next_run(ScheduleType::Once, "5000", 1_000).unwrap(),
            Some(5_000)
        );
        assert_eq!(compute_next_run(ScheduleType::Once, "500", 1_000).unwrap(), None);
    }

    #[test]
    fn invalid_schedules_are_rejected() {
        assert!(compute_next_run(ScheduleType::Cron, "not a cron", 0).is_err());
        assert!(compute_next_run(ScheduleType::Interval, "-5", 0).is_err());
        assert!(compute_next_run(ScheduleType::Interval, "abc", 0).is_err());
        assert!(compute_next_run(ScheduleType::Once, "soon", 0).is_err());
    }

    #[test]
    fn retry_backoff_is_capped() {
        assert_eq!(retry_delay_ms(1), 60_000);
        assert!(retry_delay_ms(2) > retry_delay_ms(1));
        assert_eq!(retry_delay_ms(20), TASK_RETRY_MAX_MS);
    }

    #[tokio::test]
    async fn interval_task_runs_and_reschedules() {
        let w = world(StubRunner::ok("daily summary done")).await;
        let id = w
            .scheduler
            .schedule(
                "main",
                "mock:-1",
                "write the daily summary",
                ScheduleType::Interval,
                "60000",
                ContextMode::None,
            )
            .await
            .unwrap();

        // Not yet due.
        w.scheduler.tick(&CancellationToken::new()).await;
        assert!(w.provider.sent_texts().is_empty());

        // Force it due, tick, and observe delivery plus rescheduling.
        w.store
            .finish_task_run(&id, "seed".into(), 0, Some(now_ms() - 10))
            .await
            .unwrap();
        w.scheduler.tick(&CancellationToken::new()).await;

        assert!(
            w.provider.sent_texts().iter().any(|t| t.contains("daily summary done")),
            "{:?}",
            w.provider.sent_texts()
        );
        let task = w.store.task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert!(task.running_since.is_none());
        assert!(task.next_run > now_ms());
        assert!(task.last_result.as_deref().unwrap().starts_with("ok:"));
    }

    #[tokio::test]
    async fn once_task_goes_terminal_after_success() {
        let w = world(StubRunner::ok("reminder sent")).await;
        let future = now_ms() + 60_000;
        let id = w
            .scheduler
            .schedule(
                "main",
                "mock:-1",
                "remind me",
                ScheduleType::Once,
                &future.to_string(),
                ContextMode::None,
            )
            .await
            .unwrap();
        w.store
            .finish_task_run(&id, "seed".into(), 0, Some(now_ms() - 10))
            .await
            .unwrap();
        w.scheduler.tick(&CancellationToken::new()).await;

        let task = w.store.task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn failing_task_backs_off_then_advances_schedule() {
        let runner = StubRunner::new(|_, _| Ok(agent_error("503 upstream down")));
        let w = world(runner).await;
        let id = w
            .scheduler
            .schedule(
                "main",
                "mock:-1",
                "flaky job",
                ScheduleType::Interval,
                "3600000",
                ContextMode::None,
            )
            .await
            .unwrap();

        // Attempts 1 and 2: backoff retries.
        for expected_attempt in 1..=2u32 {
            w.store
                .finish_task_run(
                    &id,
                    "seed".into(),
                    expected_attempt - 1,
                    Some(now_ms() - 10),
                )
                .await
                .unwrap();
            w.scheduler.tick(&CancellationToken::new()).await;
            let task = w.store.task(&id).await.unwrap().unwrap();
            assert_eq!(task.attempt, expected_attempt);
            assert!(task.last_result.as_deref().unwrap().starts_with("error:"));
            // Backoff, not the hourly schedule.
            assert!(task.next_run < now_ms() + 30 * 60_000);
        }

        // Attempt 3 exceeds max_retries=2: advance to the next interval
        // occurrence and reset the attempt counter.
        w.store
            .finish_task_run(&id, "seed".into(), 2, Some(now_ms() - 10))
            .await
            .unwrap();
        w.scheduler.tick(&CancellationToken::new()).await;
        let task = w.store.task(&id).await.unwrap().unwrap();
        assert_eq!(task.attempt, 0);
        assert!(task.next_run > now_ms() + 50 * 60_000);
        assert_eq!(task.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn once_task_exhausting_retries_goes_terminal() {
        let runner = StubRunner::new(|_, _| Ok(agent_error("502 bad gateway")));
        let w = world(runner).await;

        // A one-shot whose scheduled time has passed and whose retries
        // are already exhausted: the next failure has no further
        // occurrence and the task goes terminal.
        let task = ScheduledTask {
            id: "task-once".into(),
            group_folder: "main".into(),
            chat_jid: "mock:-1".into(),
            prompt: "one shot".into(),
            schedule_type: ScheduleType::Once,
            schedule_value: (now_ms() - 5_000).to_string(),
            context_mode: ContextMode::None,
            next_run: now_ms() - 10,
            status: TaskStatus::Active,
            attempt: 2,
            last_result: None,
            running_since: None,
            state_json: None,
            created_at: now_ms(),
        };
        w.store.create_task(task).await.unwrap();
        w.scheduler.tick(&CancellationToken::new()).await;

        let task = w.store.task("task-once").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.last_result.as_deref().unwrap().starts_with("error:"));
    }

    #[tokio::test]
    async fn unregistered_group_cancels_the_task() {
        let w = world(StubRunner::ok("x")).await;
        let id = w
            .scheduler
            .schedule(
                "ghost",
                "mock:-1",
                "orphan",
                ScheduleType::Interval,
                "60000",
                ContextMode::None,
            )
            .await
            .unwrap();
        w.store
            .finish_task_run(&id, "seed".into(), 0, Some(now_ms() - 10))
            .await
            .unwrap();
        w.scheduler.tick(&CancellationToken::new()).await;

        let task = w.store.task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn stale_claims_are_recovered_on_tick() {
        let w = world(StubRunner::ok("recovered run")).await;
        let id = w
            .scheduler
            .schedule(
                "main",
                "mock:-1",
                "stuck task",
                ScheduleType::Interval,
                "60000",
                ContextMode::None,
            )
            .await
            .unwrap();
        // Simulate a crash: claimed long ago, never finished.
        w.store
            .finish_task_run(&id, "seed".into(), 0, Some(now_ms() - 100_000))
            .await
            .unwrap();
        w.store.claim_due_tasks(now_ms() - 90_000).await.unwrap();

        // The tick revives the stale claim and runs the task.
        w.scheduler.tick(&CancellationToken::new()).await;
        let task = w.store.task(&id).await.unwrap().unwrap();
        assert!(task.running_since.is_none());
        assert!(task.last_result.as_deref().unwrap().starts_with("ok:"));
    }
}
