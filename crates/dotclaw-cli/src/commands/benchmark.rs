//! `dotclaw benchmark` -- baseline and trace-harness benchmarks.
//!
//! `baseline` replays synthetic traffic through the real executor wired
//! to a no-op runner (everything but the container is exercised);
//! `harness` checks enforced thresholds against a trace file. Both exit
//! non-zero when a threshold fails.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clap::Subcommand;
use comfy_table::Table;
use tokio_util::sync::CancellationToken;

use dotclaw_core::cooldown::CooldownRegistry;
use dotclaw_core::executor::{AgentExecutor, ExecRequest};
use dotclaw_core::lanes::{GroupLocks, Lane, LaneGate};
use dotclaw_core::recall::HybridRecall;
use dotclaw_core::router::{HeuristicClassifier, RequestRouter};
use dotclaw_core::runner::{ContainerRunner, RunnerError};
use dotclaw_core::session::SessionManager;
use dotclaw_core::trace::{TraceRecord, TraceWriter};
use dotclaw_platform::DataPaths;
use dotclaw_store::MemoryStore;
use dotclaw_types::agent::{AgentInvocation, AgentResponse};
use dotclaw_types::config::RuntimeConfig;
use dotclaw_types::group::Group;

/// Benchmark subcommands.
#[derive(Subcommand)]
pub enum BenchmarkCmd {
    /// Synthetic pipeline baseline against a no-op runner.
    Baseline {
        /// Number of runs.
        #[arg(long, default_value_t = 50)]
        iterations: u32,

        /// Fail when the p95 latency exceeds this, in milliseconds.
        #[arg(long)]
        max_p95_ms: Option<u64>,
    },
    /// Check thresholds against a trace file.
    Harness {
        /// Trace file; defaults to today's.
        #[arg(long)]
        file: Option<std::path::PathBuf>,

        /// Maximum allowed p95 run latency, in milliseconds.
        #[arg(long, default_value_t = 60_000)]
        max_p95_ms: u64,

        /// Maximum allowed failure rate in [0, 1].
        #[arg(long, default_value_t = 0.2)]
        max_failure_rate: f64,
    },
}

/// Runner that answers instantly; isolates host overhead from the model.
struct NoopRunner;

#[async_trait]
impl ContainerRunner for NoopRunner {
    async fn run(
        &self,
        _group: &Group,
        invocation: &AgentInvocation,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<AgentResponse, RunnerError> {
        Ok(AgentResponse {
            status: "success".into(),
            result: Some(format!("ack {}", invocation.id)),
            error: None,
            new_session_id: None,
            model: Some(invocation.model.clone()),
            latency_ms: 0,
            tool_calls: vec![],
            tokens_prompt: 1,
            tokens_completion: 1,
            memory_recall_count: 0,
            stream_dir: None,
        })
    }
}

pub async fn run(paths: DataPaths, cmd: BenchmarkCmd) -> anyhow::Result<()> {
    match cmd {
        BenchmarkCmd::Baseline {
            iterations,
            max_p95_ms,
        } => baseline(iterations, max_p95_ms).await,
        BenchmarkCmd::Harness {
            file,
            max_p95_ms,
            max_failure_rate,
        } => harness(paths, file, max_p95_ms, max_failure_rate).await,
    }
}

async fn baseline(iterations: u32, max_p95_ms: Option<u64>) -> anyhow::Result<()> {
    // Fully isolated world so the benchmark never touches live data.
    let dir = std::env::temp_dir().join(format!("dotclaw-bench-{}", uuid::Uuid::new_v4()));
    let paths = DataPaths::at(dir.clone());
    paths.ensure_layout().await?;
    let _cleanup = scopeguard(dir);
    let cfg = RuntimeConfig::default();

    let cooldowns = CooldownRegistry::empty(paths.cooldowns_file());
    let router = Arc::new(
        RequestRouter::load(
            cfg.router.clone(),
            cfg.recall.clone(),
            paths.model_file(),
            Arc::clone(&cooldowns),
            Arc::new(HeuristicClassifier),
        )
        .await?,
    );
    let memory = MemoryStore::open(paths.memory_db()).await?;
    let recall = Arc::new(HybridRecall::new(memory, None, cfg.recall.clone()));
    let executor = AgentExecutor::new(
        Arc::new(NoopRunner),
        router,
        cooldowns,
        LaneGate::new(cfg.lanes.clone()),
        GroupLocks::new(),
        Arc::new(SessionManager::new(paths.clone(), cfg.session.clone())),
        recall,
        TraceWriter::new(paths.clone()),
        cfg.container.clone(),
        cfg.router.clone(),
        dotclaw_types::config::ToolPolicy::default(),
    );

    let group = Group {
        chat_id: "bench:1".into(),
        name: "Benchmark".into(),
        folder: "main".into(),
        trigger: None,
        extra_mounts: vec![],
        env: Default::default(),
    };
    let cancel = CancellationToken::new();
    let mut latencies = Vec::with_capacity(iterations as usize);
    for i in 0..iterations {
        let request = ExecRequest {
            request_id: format!("req-bench-{i}"),
            group: group.clone(),
            chat_jid: "bench:1".into(),
            prompt: format!("benchmark turn number {i}: summarize the project status"),
            user_id: "bench".into(),
            user_name: "Bench".into(),
            lane: Lane::Interactive,
            queue_depth: 0,
            persist_session: false,
        };
        let started = Instant::now();
        executor
            .execute(request, &cancel)
            .await
            .map_err(|e| anyhow::anyhow!("baseline run failed: {e}"))?;
        latencies.push(started.elapsed().as_micros() as u64);
    }
    latencies.sort_unstable();

    let p = |q: f64| latencies[((latencies.len() - 1) as f64 * q) as usize];
    let mean: u64 = latencies.iter().sum::<u64>() / latencies.len() as u64;
    let p95_ms = p(0.95) as f64 / 1000.0;

    let mut table = Table::new();
    table.set_header(["metric", "value"]);
    table.add_row(["iterations".to_string(), iterations.to_string()]);
    table.add_row(["mean".to_string(), format!("{:.2} ms", mean as f64 / 1000.0)]);
    table.add_row(["p50".to_string(), format!("{:.2} ms", p(0.50) as f64 / 1000.0)]);
    table.add_row(["p95".to_string(), format!("{p95_ms:.2} ms")]);
    table.add_row(["p99".to_string(), format!("{:.2} ms", p(0.99) as f64 / 1000.0)]);
    println!("{table}");

    if let Some(max) = max_p95_ms
        && p95_ms > max as f64
    {
        anyhow::bail!("p95 {p95_ms:.2}ms exceeds threshold {max}ms");
    }
    Ok(())
}

/// Remove the benchmark scratch directory when the run finishes.
fn scopeguard(dir: std::path::PathBuf) -> impl Drop {
    struct Cleanup(std::path::PathBuf);
    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
    Cleanup(dir)
}

async fn harness(
    paths: DataPaths,
    file: Option<std::path::PathBuf>,
    max_p95_ms: u64,
    max_failure_rate: f64,
) -> anyhow::Result<()> {
    let path = file.unwrap_or_else(|| paths.trace_file(chrono::Utc::now()));
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot read trace file {}: {e}", path.display()))?;

    let mut latencies = Vec::new();
    let mut failures = 0usize;
    let mut total = 0usize;
    for line in raw.lines() {
        let Ok(record) = serde_json::from_str::<TraceRecord>(line) else {
            continue;
        };
        total += 1;
        if record.category.is_some() {
            failures += 1;
        } else {
            latencies.push(record.latency_ms);
        }
    }
    if total == 0 {
        anyhow::bail!("no trace records in {}", path.display());
    }

    latencies.sort_unstable();
    let p95 = latencies
        .get(((latencies.len().saturating_sub(1)) as f64 * 0.95) as usize)
        .copied()
        .unwrap_or(0);
    let failure_rate = failures as f64 / total as f64;

    let mut table = Table::new();
    table.set_header(["metric", "value", "threshold"]);
    table.add_row(["runs".to_string(), total.to_string(), String::new()]);
    table.add_row([
        "p95 latency".to_string(),
        format!("{p95} ms"),
        format!("{max_p95_ms} ms"),
    ]);
    table.add_row([
        "failure rate".to_string(),
        format!("{:.1}%", failure_rate * 100.0),
        format!("{:.1}%", max_failure_rate * 100.0),
    ]);
    println!("{table}");

    if p95 > max_p95_ms {
        anyhow::bail!("p95 latency {p95}ms exceeds {max_p95_ms}ms");
    }
    if failure_rate > max_failure_rate {
        anyhow::bail!(
            "failure rate {:.3} exceeds {:.3}",
            failure_rate,
            max_failure_rate
        );
    }
    println!("Thresholds satisfied.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotclaw_platform::fs::append_line;

    #[tokio::test]
    async fn harness_passes_on_healthy_traces() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().to_path_buf());
        let file = dir.path().join("trace.jsonl");
        for i in 0..10 {
            let record = TraceRecord {
                ts: i,
                chat_id: "c".into(),
                group_folder: "main".into(),
                model: "m".into(),
                latency_ms: 1_000 + i as u64,
                attempts: 1,
                ..Default::default()
            };
            append_line(&file, &serde_json::to_string(&record).unwrap())
                .await
                .unwrap();
        }
        harness(paths, Some(file), 60_000, 0.2).await.unwrap();
    }

    #[tokio::test]
    async fn harness_fails_on_latency_violation() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().to_path_buf());
        let file = dir.path().join("trace.jsonl");
        let record = TraceRecord {
            latency_ms: 90_000,
            attempts: 1,
            ..Default::default()
        };
        append_line(&file, &serde_json::to_string(&record).unwrap())
            .await
            .unwrap();
        assert!(harness(paths, Some(file), 60_000, 0.2).await.is_err());
    }

    #[tokio::test]
    async fn harness_fails_on_failure_rate() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().to_path_buf());
        let file = dir.path().join("trace.jsonl");
        for i in 0..4 {
            let record = TraceRecord {
                latency_ms: 100,
                attempts: 1,
                category: if i < 2 { Some("transient".into()) } else { None },
                ..Default::default()
            };
            append_line(&file, &serde_json::to_string(&record).unwrap())
                .await
                .unwrap();
        }
        assert!(harness(paths, Some(file), 60_000, 0.2).await.is_err());
    }

    #[tokio::test]
    async fn harness_fails_on_missing_or_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().to_path_buf());
        assert!(
            harness(paths.clone(), Some(dir.path().join("none.jsonl")), 1, 1.0)
                .await
                .is_err()
        );
        let empty = dir.path().join("empty.jsonl");
        tokio::fs::write(&empty, "").await.unwrap();
        assert!(harness(paths, Some(empty), 1, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn baseline_runs_through_the_executor() {
        baseline(3, None).await.unwrap();
    }

    #[tokio::test]
    async fn baseline_threshold_can_fail() {
        // A zero-millisecond p95 threshold cannot be met.
        assert!(baseline(3, Some(0)).await.is_err());
    }
}
