//! Daemon-mode container driving.
//!
//! One long-lived container per group stays warm and consumes requests
//! from `agent_requests/` in the group's IPC directory:
//!
//! - request: `agent_requests/<id>.json` (written atomically by the host)
//! - status:  `daemon_status.json` (`{state, requestId, startedAt, pid}`)
//! - response: `agent_requests/<id>.response.json` (written by the daemon)
//! - cancel sentinel: `agent_requests/<id>.cancel`
//!
//! The daemon may be mid-write when the host reads, so response reads
//! tolerate partial JSON by retrying the parse, treat a missing file as
//! transient, and extend the wait deadline while the status file shows
//! the request actively processing (bounded by `max_extension_ms`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dotclaw_platform::DataPaths;
use dotclaw_platform::env::forwarded_env;
use dotclaw_platform::fs::{read_json_opt, write_json_atomic};
use dotclaw_types::agent::{AgentInvocation, AgentResponse, DaemonState, DaemonStatus};
use dotclaw_types::config::ContainerConfig;
use dotclaw_types::group::Group;

use super::RunnerError;
use super::ephemeral::ArgBuilder;
use super::mounts::{build_mounts, load_allowlist};

/// Grace period after a cancel sentinel before the daemon is force-reset.
const CANCEL_ACK_GRACE: Duration = Duration::from_secs(2);

/// Response polling backoff: starts here, doubles, capped by
/// `daemon_poll_ms`.
const POLL_BASE: Duration = Duration::from_millis(30);

/// Drives one long-lived container per group.
pub struct DaemonManager {
    paths: DataPaths,
    cfg: ContainerConfig,
    started: dashmap::DashSet<String>,
}

impl DaemonManager {
    /// Build a manager over the data root.
    pub fn new(paths: DataPaths, cfg: ContainerConfig) -> Self {
        Self {
            paths,
            cfg,
            started: dashmap::DashSet::new(),
        }
    }

    fn container_name(folder: &str) -> String {
        format!("dotclaw-daemon-{folder}")
    }

    fn requests_dir(&self, folder: &str) -> PathBuf {
        self.paths.group_ipc_dir(folder).join("agent_requests")
    }

    fn status_path(&self, folder: &str) -> PathBuf {
        self.paths.group_ipc_dir(folder).join("daemon_status.json")
    }

    /// Run one invocation through the group's daemon.
    pub async fn run(
        &self,
        group: &Group,
        invocation: &AgentInvocation,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, RunnerError> {
        self.ensure_daemon(group).await?;

        let dir = self.requests_dir(&group.folder);
        let request_path = dir.join(format!("{}.json", invocation.id));
        let response_path = dir.join(format!("{}.response.json", invocation.id));
        // A failover retry reuses the request id; a leftover response from
        // the previous attempt must not satisfy this one.
        let _ = tokio::fs::remove_file(&response_path).await;
        write_json_atomic(&request_path, invocation).await?;

        let outcome = wait_for_agent_response(
            &response_path,
            &self.status_path(&group.folder),
            &invocation.id,
            Duration::from_millis(self.cfg.timeout_ms),
            Duration::from_millis(self.cfg.max_extension_ms),
            Duration::from_millis(self.cfg.daemon_poll_ms),
            cancel,
        )
        .await;

        match outcome {
            Ok(response) => {
                let _ = tokio::fs::remove_file(&request_path).await;
                Ok(response)
            }
            Err(e @ (RunnerError::DaemonTimeout(_) | RunnerError::Cancelled)) => {
                self.signal_cancel(&group.folder, &invocation.id).await;
                if !self.await_cancel_ack(&group.folder, &invocation.id).await {
                    warn!(group = %group.folder, "daemon ignored cancel, force-resetting");
                    self.force_reset(&group.folder).await;
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Start the group's daemon container if it is not already running.
    async fn ensure_daemon(&self, group: &Group) -> Result<(), RunnerError> {
        if self.started.contains(&group.folder) {
            return Ok(());
        }

        let allowlist = load_allowlist(&self.paths).await;
        let mounts = build_mounts(&self.paths, group, &self.cfg, &allowlist).await?;
        let env = forwarded_env(&group.env);

        let mut b = ArgBuilder::new();
        b.push("run");
        b.push("-d");
        b.push("--name");
        b.push(Self::container_name(&group.folder));
        b.push("--restart=unless-stopped");
        b.push("--cap-drop=ALL");
        b.push("--security-opt=no-new-privileges");
        b.push(format!("--pids-limit={}", self.cfg.pids_limit));
        if let Some(memory) = &self.cfg.memory {
            b.push("--memory");
            b.push(memory.clone());
        }
        if let Some(cpus) = self.cfg.cpus {
            b.push("--cpus");
            b.push(cpus.to_string());
        }
        for mount in &mounts {
            b.push("-v");
            b.push(mount.to_volume_arg());
        }
        let mut names: Vec<&String> = env.keys().collect();
        names.sort();
        for name in names {
            b.push("--env");
            b.push(format!("{name}={}", env[name]));
        }
        b.push("--env");
        b.push("DOTCLAW_DAEMON=1".to_string());
        b.push(self.cfg.image.clone());

        let output = Command::new("docker")
            .args(b.build())
            .output()
            .await
            .map_err(|e| RunnerError::Spawn(format!("docker run -d: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Another path already started it; that is fine.
            if !stderr.contains("already in use") {
                return Err(RunnerError::Spawn(format!(
                    "daemon start failed: {}",
                    stderr.chars().take(300).collect::<String>()
                )));
            }
        }
        debug!(group = %group.folder, "daemon container running");
        self.started.insert(group.folder.clone());
        Ok(())
    }

    /// Write the cancel sentinel for a request.
    async fn signal_cancel(&self, folder: &str, request_id: &str) {
        let sentinel = self.requests_dir(folder).join(format!("{request_id}.cancel"));
        if let Err(e) = tokio::fs::write(&sentinel, b"cancel").await {
            warn!(error = %e, "failed to write cancel sentinel");
        }
    }

    /// Wait briefly for the daemon to stop processing the request.
    async fn await_cancel_ack(&self, folder: &str, request_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + CANCEL_ACK_GRACE;
        let status_path = self.status_path(folder);
        while tokio::time::Instant::now() < deadline {
            match read_json_opt::<DaemonStatus>(&status_path).await {
                Ok(Some(status))
                    if status.state == DaemonState::Processing
                        && status.request_id.as_deref() == Some(request_id) => {}
                _ => return true,
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    /// Kill and forget the group's daemon; the next run restarts it.
    async fn force_reset(&self, folder: &str) {
        let name = Self::container_name(folder);
        let _ = Command::new("docker").args(["rm", "-f", &name]).output().await;
        self.started.remove(folder);
    }
}

/// Await a daemon response file.
///
/// Polls with exponential backoff (base 30 ms, capped at `poll_cap`).
/// ENOENT and partial JSON are transient. While the status file reports
/// this request as `processing`, the deadline extends, bounded by
/// `max_extension` past the original timeout.
pub async fn wait_for_agent_response(
    response_path: &Path,
    status_path: &Path,
    request_id: &str,
    timeout: Duration,
    max_extension: Duration,
    poll_cap: Duration,
    cancel: &CancellationToken,
) -> Result<AgentResponse, RunnerError> {
    let start = tokio::time::Instant::now();
    let hard_deadline = start + timeout + max_extension;
    let mut deadline = start + timeout;
    let mut backoff = POLL_BASE;

    loop {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        match tokio::fs::read_to_string(response_path).await {
            Ok(raw) => match serde_json::from_str::<AgentResponse>(&raw) {
                Ok(response) => return Ok(response),
                // Mid-write; keep polling until it converges.
                Err(e) => debug!(error = %e, "partial daemon response, retrying"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            // Still actively processing? Extend, up to the hard ceiling.
            let processing = matches!(
                read_json_opt::<DaemonStatus>(status_path).await,
                Ok(Some(status))
                    if status.state == DaemonState::Processing
                        && status.request_id.as_deref() == Some(request_id)
            );
            if processing && now < hard_deadline {
                deadline = (now + timeout).min(hard_deadline);
                debug!(request_id, "daemon still processing, extending deadline");
            } else {
                return Err(RunnerError::DaemonTimeout(
                    start.elapsed().as_millis() as u64
                ));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
        }
        backoff = (backoff * 2).min(poll_cap.max(POLL_BASE));
    }
}
