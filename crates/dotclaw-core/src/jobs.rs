//! Background job runner.
//!
//! Durable asynchronous agent runs detached from the interactive
//! pipeline. A small worker pool claims queued jobs and runs them under
//! the `scheduled` lane. Outputs larger than the inline threshold are
//! written to `groups/<folder>/jobs/<id>/output.md`; the chat gets a
//! short summary with the file reference. Jobs can be cancelled while
//! queued or running.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dotclaw_channels::{OutboundMessage, ProviderRegistry};
use dotclaw_platform::DataPaths;
use dotclaw_store::HostStore;
use dotclaw_types::config::JobsConfig;
use dotclaw_types::job::{BackgroundJob, JobState};

use crate::executor::{AgentExecutor, ExecRequest};
use crate::groups::GroupRegistry;
use crate::lanes::Lane;
use crate::now_ms;

/// How often idle workers poll for queued jobs.
const IDLE_POLL_MS: u64 = 2_000;

/// The job runner service.
pub struct BackgroundJobRunner {
    store: HostStore,
    executor: Arc<AgentExecutor>,
    providers: ProviderRegistry,
    groups: Arc<GroupRegistry>,
    paths: DataPaths,
    cfg: JobsConfig,
    /// job id → cancel token while running.
    running: DashMap<String, CancellationToken>,
}

impl BackgroundJobRunner {
    /// Wire the runner.
    pub fn new(
        store: HostStore,
        executor: Arc<AgentExecutor>,
        providers: ProviderRegistry,
        groups: Arc<GroupRegistry>,
        paths: DataPaths,
        cfg: JobsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            executor,
            providers,
            groups,
            paths,
            cfg,
            running: DashMap::new(),
        })
    }

    /// Enqueue a new job. Returns its id.
    pub async fn enqueue(
        &self,
        group_folder: &str,
        chat_jid: &str,
        prompt: &str,
    ) -> dotclaw_types::Result<String> {
        let id = format!("job-{}", uuid::Uuid::new_v4());
        let job = BackgroundJob {
            id: id.clone(),
            group_folder: group_folder.to_string(),
            chat_jid: chat_jid.to_string(),
            prompt: prompt.to_string(),
            status: JobState::Queued,
            output: None,
            output_path: None,
            created_at: now_ms(),
            started_at: None,
            finished_at: None,
        };
        self.store.create_job(job).await?;
        info!(job_id = %id, group = group_folder, "queued background job");
        Ok(id)
    }

    /// Cancel a job: running jobs get their token cancelled, queued jobs
    /// go terminal directly. Returns whether anything was cancelled.
    pub async fn cancel(&self, job_id: &str) -> dotclaw_types::Result<bool> {
        if let Some(entry) = self.running.get(job_id) {
            entry.value().cancel();
            return Ok(true);
        }
        Ok(self.store.cancel_job(job_id, now_ms()).await?.is_some())
    }

    /// Run `cfg.workers` claim loops until shutdown.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        info!(workers = self.cfg.workers, "background job runner started");
        let mut handles = Vec::new();
        for worker in 0..self.cfg.workers {
            let runner = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                runner.worker_loop(worker, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn worker_loop(&self, worker: u32, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.store.claim_next_job(now_ms()).await {
                Ok(Some(job)) => {
                    debug!(worker, job_id = %job.id, "claimed background job");
                    self.run_job(job, &cancel).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(IDLE_POLL_MS)) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    error!(error = %e, "job claim failed");
                    tokio::time::sleep(std::time::Duration::from_millis(IDLE_POLL_MS)).await;
                }
            }
        }
    }

    /// Run one claimed job to a terminal state.
    pub async fn run_job(&self, job: BackgroundJob, shutdown: &CancellationToken) {
        let Some(group) = self.groups.by_folder(&job.group_folder) else {
            let _ = self
                .store
                .finish_job(&job.id, JobState::Failed, Some("group unregistered".into()), None, now_ms())
                .await;
            return;
        };

        let job_cancel = shutdown.child_token();
        self.running.insert(job.id.clone(), job_cancel.clone());

        let request = ExecRequest {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            group,
            chat_jid: job.chat_jid.clone(),
            prompt: job.prompt.clone(),
            user_id: "jobs".into(),
            user_name: "Background".into(),
            lane: Lane::Scheduled,
            queue_depth: 0,
            persist_session: false,
        };
        let result = self.executor.execute(request, &job_cancel).await;
        self.running.remove(&job.id);

        match result {
            Ok(outcome) => {
                let (inline, output_path) = if outcome.reply.len() > self.cfg.inline_output_chars {
                    match self.write_output(&job, &outcome.reply).await {
                        Ok(rel) => (None, Some(rel)),
                        Err(e) => {
                            warn!(error = %e, "large job output fell back inline");
                            (Some(outcome.reply.clone()), None)
                        }
                    }
                } else {
                    (Some(outcome.reply.clone()), None)
                };

                let summary = match &output_path {
                    Some(rel) => format!(
                        "Background job finished. Full output in {rel} ({} chars).",
                        outcome.reply.len()
                    ),
                    None => outcome.reply.clone(),
                };
                let _ = self
                    .store
                    .finish_job(&job.id, JobState::Completed, inline, output_path, now_ms())
                    .await;
                self.notify(&job.chat_jid, &summary).await;
            }
            Err(dotclaw_types::DotclawError::Cancelled) => {
                let _ = self
                    .store
                    .finish_job(&job.id, JobState::Canceled, None, None, now_ms())
                    .await;
                self.notify(&job.chat_jid, "Background job canceled.").await;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "background job failed");
                let _ = self
                    .store
                    .finish_job(&job.id, JobState::Failed, Some(e.to_string()), None, now_ms())
                    .await;
                self.notify(
                    &job.chat_jid,
                    "Background job failed. I logged the details.",
                )
                .await;
            }
        }
    }

    /// Write large output to the job directory; returns the path
    /// relative to the group folder.
    async fn write_output(&self, job: &BackgroundJob, output: &str) -> std::io::Result<String> {
        let dir = self.paths.job_dir(&job.group_folder, &job.id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("output.md");
        tokio::fs::write(&path, output).await?;
        Ok(format!("jobs/{}/output.md", job.id))
    }

    async fn notify(&self, chat_jid: &str, text: &str) {
        if let Ok(provider) = self.providers.route(chat_jid) {
            if let Err(e) = provider.send(&OutboundMessage::text(chat_jid, text)).await {
                warn!(error = %e, "job notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::CooldownRegistry;
    use crate::lanes::{GroupLocks, LaneGate};
    use crate::recall::RecallBackend;
    use crate::router::{HeuristicClassifier, RequestRouter};
    use crate::runner::testing::{StubRunner, success};
    use crate::session::SessionManager;
    use crate::trace::TraceWriter;
    use async_trait::async_trait;
    use dotclaw_channels::MockProvider;
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
        runner: Arc<BackgroundJobRunner>,
        store: HostStore,
        provider: Arc<MockProvider>,
        paths: DataPaths,
        _dir: tempfile::TempDir,
    }

    async fn world(stub: Arc<StubRunner>, inline_chars: usize) -> World {
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
            stub,
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

        let groups = GroupRegistry::load(paths.clone()).await.unwrap();
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

        let runner = BackgroundJobRunner::new(
            store.clone(),
            executor,
            providers,
            groups,
            paths.clone(),
            JobsConfig {
                workers: 1,
                inline_output_chars: inline_chars,
            },
        );
        World {
            runner,
            store,
            provider,
            paths,
            _dir: dir,
        }
    }

    async fn claim_and_run(w: &World) {
        let job = w.store.claim_next_job(now_ms()).await.unwrap().unwrap();
        w.runner.run_job(job, &CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn small_output_completes_inline_and_notifies() {
        let w = world(StubRunner::ok("short report"), 3_000).await;
        let id = w.runner.enqueue("main", "mock:-1", "do research").await.unwrap();
        claim_and_run(&w).await;

        let job = w.store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Completed);
        assert_eq!(job.output.as_deref(), Some("short report"));
        assert!(job.output_path.is_none());
        assert!(w.provider.sent_texts().iter().any(|t| t.contains("short report")));
    }

    #[tokio::test]
    async fn large_output_goes_to_a_file_with_summary() {
        let big = "x".repeat(500);
        let reply = big.clone();
        let stub = StubRunner::new(move |_, inv| Ok(success(&reply, &inv.model)));
        let w = world(stub, 100).await;
        let id = w.runner.enqueue("main", "mock:-1", "long research").await.unwrap();
        claim_and_run(&w).await;

        let job = w.store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Completed);
        let rel = job.output_path.unwrap();
        assert_eq!(rel, format!("jobs/{id}/output.md"));
        let content = tokio::fs::read_to_string(w.paths.group_dir("main").join(&rel))
            .await
            .unwrap();
        assert_eq!(content, big);
        // The chat got a short pointer, not the whole output.
        assert!(
            w.provider
                .sent_texts()
                .iter()
                .any(|t| t.contains("Full output in jobs/")),
            "{:?}",
            w.provider.sent_texts()
        );
    }

    #[tokio::test]
    async fn queued_job_can_be_canceled() {
        let w = world(StubRunner::ok("unused"), 3_000).await;
        let id = w.runner.enqueue("main", "mock:-1", "cancel me").await.unwrap();
        assert!(w.runner.cancel(&id).await.unwrap());
        let job = w.store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Canceled);
        // Nothing left to claim.
        assert!(w.store.claim_next_job(now_ms()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_job_cancellation_goes_terminal() {
        let stub = StubRunner::with_delay(5_000, |_, inv| Ok(success("late", &inv.model)));
        let w = world(stub, 3_000).await;
        let id = w.runner.enqueue("main", "mock:-1", "slow job").await.unwrap();

        let job = w.store.claim_next_job(now_ms()).await.unwrap().unwrap();
        let runner = Arc::clone(&w.runner);
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runner.run_job(job, &shutdown).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(w.runner.cancel(&id).await.unwrap());
        handle.await.unwrap();

        let job = w.store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Canceled);
        assert!(w.provider.sent_texts().iter().any(|t| t.contains("canceled")));
    }

    #[tokio::test]
    async fn failed_run_marks_job_failed() {
        let stub = StubRunner::new(|_, _| {
            Ok(crate::runner::testing::agent_error("401 invalid api key"))
        });
        let w = world(stub, 3_000).await;
        let id = w.runner.enqueue("main", "mock:-1", "doomed").await.unwrap();
        claim_and_run(&w).await;

        let job = w.store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Failed);
        assert!(w.provider.sent_texts().iter().any(|t| t.contains("failed")));
    }
}
