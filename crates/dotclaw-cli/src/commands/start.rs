//! `dotclaw start` -- compose and run the host.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dotclaw_channels::{Provider, ProviderError, ProviderHost, ProviderRegistry};
use dotclaw_core::cooldown::CooldownRegistry;
use dotclaw_core::executor::AgentExecutor;
use dotclaw_core::groups::GroupRegistry;
use dotclaw_core::ipc::IpcDispatcher;
use dotclaw_core::jobs::BackgroundJobRunner;
use dotclaw_core::lanes::{GroupLocks, LaneGate};
use dotclaw_core::maintenance::Maintenance;
use dotclaw_core::pipeline::MessagePipeline;
use dotclaw_core::recall::{HybridRecall, RecallBackend};
use dotclaw_core::router::{HeuristicClassifier, RequestRouter};
use dotclaw_core::runner::DockerRunner;
use dotclaw_core::scheduler::TaskScheduler;
use dotclaw_core::session::SessionManager;
use dotclaw_core::trace::TraceWriter;
use dotclaw_platform::DataPaths;
use dotclaw_platform::fs::read_json_opt;
use dotclaw_store::{HostStore, MemoryStore, WorkflowStore};
use dotclaw_types::config::{RuntimeConfig, ToolPolicy};
use dotclaw_types::message::IncomingMessage;

/// Bridges provider adapters into the pipeline.
struct PipelineHost {
    pipeline: Arc<MessagePipeline>,
}

#[async_trait]
impl ProviderHost for PipelineHost {
    async fn deliver_inbound(&self, msg: IncomingMessage) -> Result<(), ProviderError> {
        self.pipeline.handle_incoming(msg).await;
        Ok(())
    }
}

/// Provider adapters are loaded out of process; the in-tree registry
/// starts empty and adapters register through the plugin surface.
fn load_providers() -> ProviderRegistry {
    ProviderRegistry::new()
}

pub async fn run(paths: DataPaths) -> anyhow::Result<()> {
    super::init::ensure_defaults(&paths).await?;

    let cfg = match tokio::fs::read_to_string(paths.runtime_config_file()).await {
        Ok(raw) => RuntimeConfig::from_json(&raw).context("loading runtime.json")?,
        Err(_) => RuntimeConfig::default(),
    };
    let cfg = Arc::new(cfg);
    info!(root = %paths.root().display(), mode = ?cfg.container.mode, "starting dotclaw host");

    // Stores.
    let store = HostStore::open(paths.messages_db())
        .await
        .context("opening messages.db")?;
    let memory = MemoryStore::open(paths.memory_db())
        .await
        .context("opening memory.db")?;
    let workflows = WorkflowStore::new(&store);

    // Services.
    let cooldowns = CooldownRegistry::load(paths.cooldowns_file()).await;
    let router = Arc::new(
        RequestRouter::load(
            cfg.router.clone(),
            cfg.recall.clone(),
            paths.model_file(),
            Arc::clone(&cooldowns),
            Arc::new(HeuristicClassifier),
        )
        .await
        .context("loading model.json")?,
    );
    let recall = Arc::new(HybridRecall::new(memory.clone(), None, cfg.recall.clone()));
    let recall_dyn: Arc<dyn RecallBackend> = recall.clone();
    let sessions = Arc::new(SessionManager::new(paths.clone(), cfg.session.clone()));
    let runner = Arc::new(DockerRunner::new(paths.clone(), cfg.container.clone()));

    let mut tool_policy: ToolPolicy = read_json_opt(&paths.tool_policy_file())
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    if let Ok(Some(budgets)) = read_json_opt(&paths.tool_budgets_file()).await {
        tool_policy.budgets = budgets;
    }

    let executor = AgentExecutor::new(
        runner,
        Arc::clone(&router),
        Arc::clone(&cooldowns),
        LaneGate::new(cfg.lanes.clone()),
        GroupLocks::new(),
        Arc::clone(&sessions),
        Arc::clone(&recall_dyn),
        TraceWriter::new(paths.clone()),
        cfg.container.clone(),
        cfg.router.clone(),
        tool_policy,
    );

    let groups = GroupRegistry::load(paths.clone())
        .await
        .context("loading registered groups")?;
    for group in groups.list() {
        paths.ensure_group_layout(&group.folder).await?;
    }

    let providers = load_providers();
    if providers.all().next().is_none() {
        warn!("no provider adapters registered; serving IPC, scheduler, and jobs only");
    }

    let shutdown = CancellationToken::new();
    let bot_name = std::env::var("DOTCLAW_BOT_NAME").unwrap_or_else(|_| "dotclaw_bot".into());

    let pipeline = MessagePipeline::new(
        store.clone(),
        memory.clone(),
        Arc::clone(&executor),
        Arc::clone(&router),
        Arc::clone(&recall_dyn),
        providers.clone(),
        Arc::clone(&groups),
        paths.clone(),
        Arc::clone(&cfg),
        bot_name,
        shutdown.clone(),
    );
    let scheduler = TaskScheduler::new(
        store.clone(),
        Arc::clone(&executor),
        providers.clone(),
        Arc::clone(&groups),
        cfg.scheduler.clone(),
        cfg.streaming.max_edit_length,
    );
    let jobs = BackgroundJobRunner::new(
        store.clone(),
        Arc::clone(&executor),
        providers.clone(),
        Arc::clone(&groups),
        paths.clone(),
        cfg.jobs.clone(),
    );
    let maintenance = Maintenance::new(
        paths.clone(),
        sessions,
        workflows.clone(),
        recall,
        cfg.maintenance.clone(),
    );
    let dispatcher = IpcDispatcher::new(
        paths.clone(),
        Arc::clone(&groups),
        providers.clone(),
        store,
        memory,
        router,
        Arc::clone(&scheduler),
        None,
        std::time::Duration::from_millis(cfg.container.daemon_poll_ms),
    );

    // Long-running tasks.
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(Arc::clone(&pipeline).run_sweeper()));
    tasks.push(tokio::spawn(scheduler.start(shutdown.clone())));
    tasks.push(tokio::spawn(jobs.start(shutdown.clone())));
    tasks.push(tokio::spawn(maintenance.start(shutdown.clone())));
    tasks.push(tokio::spawn(dispatcher.start(shutdown.clone())));

    let host: Arc<dyn ProviderHost> = Arc::new(PipelineHost {
        pipeline: Arc::clone(&pipeline),
    });
    for provider in providers.all() {
        let provider: Arc<dyn Provider> = Arc::clone(provider);
        let host = Arc::clone(&host);
        let cancel = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = provider.start(host, cancel).await {
                warn!(provider = provider.name(), error = %e, "provider stopped");
            }
        }));
    }

    info!("host running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    cooldowns.flush().await;
    workflows.close();
    Ok(())
}
