//! Container runner.
//!
//! Executes agent runs inside Docker sandboxes in one of two modes:
//!
//! - **Ephemeral** ([`ephemeral`]): one `docker run --rm` per request,
//!   payload on stdin, response extracted from stdout sentinels.
//! - **Daemon** ([`daemon`]): a long-lived warm container per group fed
//!   through the group's IPC directory, with a status file, atomic
//!   response files, and cancel sentinels.
//!
//! All commands are constructed programmatically with
//! `tokio::process::Command`; no shell interpolation anywhere. Mount
//! sets are validated in [`mounts`] before a container ever sees them.

pub mod daemon;
pub mod ephemeral;
pub mod mounts;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use dotclaw_platform::DataPaths;
use dotclaw_types::agent::{AgentInvocation, AgentResponse};
use dotclaw_types::config::{ContainerConfig, ContainerMode};
use dotclaw_types::group::Group;

/// Runner-layer failures.
///
/// Only infrastructure problems live here; an agent-reported model error
/// comes back as a successful [`AgentResponse`] with `status = "error"`
/// and is classified one layer up.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RunnerError {
    /// The run was preempted by a newer message for the same chat.
    #[error("container preempted by a newer message")]
    Preempted,

    /// The response file existed but never converged to valid JSON.
    #[error("stale or unparseable response: {0}")]
    Stale(String),

    /// The daemon did not produce a response before the (possibly
    /// extended) deadline.
    #[error("daemon response timed out after {0}ms")]
    DaemonTimeout(u64),

    /// The ephemeral container exceeded its deadline and was killed.
    #[error("container timed out after {0}ms")]
    Timeout(u64),

    /// The run was cancelled.
    #[error("container run cancelled")]
    Cancelled,

    /// Spawning or driving the container process failed.
    #[error("container spawn failed: {0}")]
    Spawn(String),

    /// A requested mount failed validation.
    #[error("mount rejected: {0}")]
    MountRejected(String),

    /// Filesystem-level failure around the IPC files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Whether the same run may be retried at the runner layer.
    pub fn is_retryable_same_run(&self) -> bool {
        matches!(self, Self::Stale(_) | Self::DaemonTimeout(_))
    }
}

/// The seam the executor drives; mocked in host tests.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Run one agent invocation for `group`.
    async fn run(
        &self,
        group: &Group,
        invocation: &AgentInvocation,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, RunnerError>;
}

/// Docker-backed runner dispatching on the configured mode.
pub struct DockerRunner {
    mode: ContainerMode,
    ephemeral: ephemeral::EphemeralRunner,
    daemon: daemon::DaemonManager,
}

impl DockerRunner {
    /// Build a runner over the data root.
    pub fn new(paths: DataPaths, cfg: ContainerConfig) -> Self {
        Self {
            mode: cfg.mode,
            ephemeral: ephemeral::EphemeralRunner::new(paths.clone(), cfg.clone()),
            daemon: daemon::DaemonManager::new(paths, cfg),
        }
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn run(
        &self,
        group: &Group,
        invocation: &AgentInvocation,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, RunnerError> {
        match self.mode {
            ContainerMode::Ephemeral => self.ephemeral.run(group, invocation, cancel).await,
            ContainerMode::Daemon => self.daemon.run(group, invocation, cancel).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_retry_classification() {
        assert!(RunnerError::Stale("x".into()).is_retryable_same_run());
        assert!(RunnerError::DaemonTimeout(100).is_retryable_same_run());
        assert!(!RunnerError::Preempted.is_retryable_same_run());
        assert!(!RunnerError::Timeout(100).is_retryable_same_run());
        assert!(!RunnerError::Cancelled.is_retryable_same_run());
    }
}
