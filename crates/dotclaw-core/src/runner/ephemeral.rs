//! Ephemeral container runs.
//!
//! One `docker run --rm` per request: capabilities dropped,
//! `no-new-privileges`, pids/memory/cpu caps, optional read-only root
//! with tmpfs, and the validated mount set. The invocation payload goes
//! to the container on stdin; the response JSON comes back on stdout
//! between the output sentinels.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dotclaw_platform::DataPaths;
use dotclaw_platform::env::forwarded_env;
use dotclaw_types::agent::{AgentInvocation, AgentResponse, extract_sentinel_output};
use dotclaw_types::config::ContainerConfig;
use dotclaw_types::group::Group;

use super::RunnerError;
use super::mounts::{MountSpec, build_mounts, load_allowlist};

/// Cap on captured stdout/stderr.
const MAX_OUTPUT_BYTES: usize = 4 * 1_048_576;

/// Build validated argument lists for container commands.
pub(crate) struct ArgBuilder {
    args: Vec<String>,
}

impl ArgBuilder {
    pub(crate) fn new() -> Self {
        Self { args: Vec::new() }
    }

    pub(crate) fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    pub(crate) fn build(self) -> Vec<String> {
        self.args
    }
}

/// Compose the `docker run` argument list for one ephemeral run.
pub fn build_run_args(
    cfg: &ContainerConfig,
    mounts: &[MountSpec],
    env: &std::collections::HashMap<String, String>,
) -> Vec<String> {
    let mut b = ArgBuilder::new();
    b.push("run");
    b.push("--rm");
    b.push("-i");

    if cfg.privileged {
        // Legacy compatibility toggle; everything below still applies.
        b.push("--privileged");
    }
    b.push("--cap-drop=ALL");
    b.push("--security-opt=no-new-privileges");
    b.push(format!("--pids-limit={}", cfg.pids_limit));

    if let Some(memory) = &cfg.memory {
        b.push("--memory");
        b.push(memory.clone());
    }
    if let Some(cpus) = cfg.cpus {
        b.push("--cpus");
        b.push(cpus.to_string());
    }
    if cfg.read_only_root {
        b.push("--read-only");
        b.push("--tmpfs");
        b.push(format!("/tmp:rw,size={}", cfg.tmpfs_size));
        b.push("--tmpfs");
        b.push(format!("/home:rw,size={}", cfg.tmpfs_size));
    }

    let uid = cfg.uid.unwrap_or_else(current_uid);
    let gid = cfg.gid.unwrap_or_else(current_gid);
    b.push("--user");
    b.push(format!("{uid}:{gid}"));

    for mount in mounts {
        b.push("-v");
        b.push(mount.to_volume_arg());
    }
    let mut names: Vec<&String> = env.keys().collect();
    names.sort();
    for name in names {
        b.push("--env");
        b.push(format!("{name}={}", env[name]));
    }

    b.push(cfg.image.clone());
    b.build()
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

#[cfg(unix)]
fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    1000
}

#[cfg(not(unix))]
fn current_gid() -> u32 {
    1000
}

/// Runs one container per request.
pub struct EphemeralRunner {
    paths: DataPaths,
    cfg: ContainerConfig,
}

impl EphemeralRunner {
    /// Build a runner over the data root.
    pub fn new(paths: DataPaths, cfg: ContainerConfig) -> Self {
        Self { paths, cfg }
    }

    /// Run one invocation; kills the container on timeout or cancel.
    pub async fn run(
        &self,
        group: &Group,
        invocation: &AgentInvocation,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, RunnerError> {
        let allowlist = load_allowlist(&self.paths).await;
        let mounts = build_mounts(&self.paths, group, &self.cfg, &allowlist).await?;
        let env = forwarded_env(&group.env);
        let args = build_run_args(&self.cfg, &mounts, &env);

        debug!(group = %group.folder, request = %invocation.id, "spawning ephemeral container");
        let mut child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("docker run: {e}")))?;

        let payload =
            serde_json::to_vec(invocation).map_err(|e| RunnerError::Stale(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let timeout = Duration::from_millis(self.cfg.timeout_ms);
        let output = tokio::select! {
            out = child.wait_with_output() => {
                out.map_err(|e| RunnerError::Spawn(format!("container process: {e}")))?
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(request = %invocation.id, "ephemeral container timed out, killing");
                return Err(RunnerError::Timeout(self.cfg.timeout_ms));
            }
            _ = cancel.cancelled() => {
                return Err(RunnerError::Cancelled);
            }
        };

        let stdout = truncate_output(&output.stdout);
        if !output.status.success() {
            let stderr = truncate_output(&output.stderr);
            return Err(RunnerError::Spawn(format!(
                "container exited with {:?}: {}",
                output.status.code(),
                stderr.chars().take(500).collect::<String>()
            )));
        }

        parse_sentinel_response(&stdout)
    }
}

/// Extract and parse the response JSON from mixed stdout.
pub fn parse_sentinel_response(stdout: &str) -> Result<AgentResponse, RunnerError> {
    let body = extract_sentinel_output(stdout)
        .ok_or_else(|| RunnerError::Stale("missing output sentinels".into()))?;
    serde_json::from_str(body).map_err(|e| RunnerError::Stale(format!("response json: {e}")))
}

fn truncate_output(bytes: &[u8]) -> String {
    let truncated = if bytes.len() > MAX_OUTPUT_BYTES {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    String::from_utf8_lossy(truncated).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotclaw_types::agent::{OUTPUT_END, OUTPUT_START};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn mounts() -> Vec<MountSpec> {
        vec![MountSpec {
            host: PathBuf::from("/data/groups/main"),
            container: "/workspace/group".into(),
            read_only: false,
        }]
    }

    #[test]
    fn run_args_carry_the_security_baseline() {
        let cfg = ContainerConfig::default();
        let args = build_run_args(&cfg, &mounts(), &HashMap::new());
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"--security-opt=no-new-privileges".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--pids-limit=")));
        assert!(!args.contains(&"--privileged".to_string()));
        // Image is the final argument.
        assert_eq!(args.last().unwrap(), &cfg.image);
    }

    #[test]
    fn optional_caps_and_read_only_root() {
        let mut cfg = ContainerConfig::default();
        cfg.memory = Some("1g".into());
        cfg.cpus = Some(1.5);
        cfg.read_only_root = true;
        cfg.tmpfs_size = "32m".into();

        let args = build_run_args(&cfg, &mounts(), &HashMap::new());
        let joined = args.join(" ");
        assert!(joined.contains("--memory 1g"));
        assert!(joined.contains("--cpus 1.5"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--tmpfs /tmp:rw,size=32m"));
    }

    #[test]
    fn privileged_is_opt_in() {
        let mut cfg = ContainerConfig::default();
        cfg.privileged = true;
        let args = build_run_args(&cfg, &mounts(), &HashMap::new());
        assert!(args.contains(&"--privileged".to_string()));
    }

    #[test]
    fn env_is_forwarded_sorted_and_volumes_present() {
        let mut env = HashMap::new();
        env.insert("DOTCLAW_B".to_string(), "2".to_string());
        env.insert("DOTCLAW_A".to_string(), "1".to_string());
        let args = build_run_args(&ContainerConfig::default(), &mounts(), &env);
        let joined = args.join(" ");
        assert!(joined.contains("-v /data/groups/main:/workspace/group"));
        let a = joined.find("DOTCLAW_A=1").unwrap();
        let b = joined.find("DOTCLAW_B=2").unwrap();
        assert!(a < b);
    }

    #[test]
    fn uid_gid_defaults_to_current_user() {
        let args = build_run_args(&ContainerConfig::default(), &mounts(), &HashMap::new());
        let pos = args.iter().position(|a| a == "--user").unwrap();
        let user = &args[pos + 1];
        assert!(user.contains(':'), "{user}");
    }

    #[test]
    fn sentinel_parse_roundtrip() {
        let out = format!(
            "agent log noise\n{OUTPUT_START}\n{{\"status\":\"success\",\"result\":\"hi\"}}\n{OUTPUT_END}\n"
        );
        let resp = parse_sentinel_response(&out).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.result.as_deref(), Some("hi"));
    }

    #[test]
    fn sentinel_parse_failures_are_stale() {
        assert!(matches!(
            parse_sentinel_response("no markers"),
            Err(RunnerError::Stale(_))
        ));
        let out = format!("{OUTPUT_START}{{truncated{OUTPUT_END}");
        assert!(matches!(
            parse_sentinel_response(&out),
            Err(RunnerError::Stale(_))
        ));
    }
}
