//! Mount construction and validation.
//!
//! Every run mounts the group folder (read-write, unless the group is
//! non-main and `non_main_read_only` is set), the session directory, the
//! group's IPC subdirectory, and the config directory (read-only). Extra
//! group-configured mounts are validated against an external allowlist
//! file of permitted host prefixes, a file that is itself never mounted.
//! Symlinks are resolved before validation; `..` components and absolute
//! container paths are rejected outright.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use dotclaw_platform::DataPaths;
use dotclaw_platform::fs::read_json_opt;
use dotclaw_types::config::ContainerConfig;
use dotclaw_types::group::Group;

use super::RunnerError;

/// Container paths for the fixed mounts.
pub const GROUP_MOUNT: &str = "/workspace/group";
/// Session directory mount point.
pub const SESSION_MOUNT: &str = "/workspace/session";
/// Group IPC mount point.
pub const IPC_MOUNT: &str = "/workspace/ipc";
/// Read-only config mount point.
pub const CONFIG_MOUNT: &str = "/workspace/config";
/// Root for validated extra mounts.
pub const EXTRA_MOUNT_ROOT: &str = "/workspace/extra";

/// One bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host path (already canonicalized for extra mounts).
    pub host: PathBuf,
    /// Absolute container path.
    pub container: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl MountSpec {
    /// Docker `-v` argument form.
    pub fn to_volume_arg(&self) -> String {
        let suffix = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{}", self.host.display(), self.container, suffix)
    }
}

/// Shape of `config/mount-allowlist.json`.
#[derive(Debug, Clone, Deserialize, Default)]
struct MountAllowlist {
    #[serde(default)]
    allowed: Vec<PathBuf>,
}

/// Load the external mount allowlist (empty when the file is missing;
/// which means every extra mount is rejected).
pub async fn load_allowlist(paths: &DataPaths) -> Vec<PathBuf> {
    read_json_opt::<MountAllowlist>(&paths.mount_allowlist_file())
        .await
        .ok()
        .flatten()
        .map(|a| a.allowed)
        .unwrap_or_default()
}

/// Build the full mount set for one run.
pub async fn build_mounts(
    paths: &DataPaths,
    group: &Group,
    cfg: &ContainerConfig,
    allowlist: &[PathBuf],
) -> Result<Vec<MountSpec>, RunnerError> {
    let group_read_only = cfg.non_main_read_only && !group.is_main();
    let mut mounts = vec![
        MountSpec {
            host: paths.group_dir(&group.folder),
            container: GROUP_MOUNT.into(),
            read_only: group_read_only,
        },
        MountSpec {
            host: paths.group_sessions_dir(&group.folder),
            container: SESSION_MOUNT.into(),
            read_only: false,
        },
        MountSpec {
            host: paths.group_ipc_dir(&group.folder),
            container: IPC_MOUNT.into(),
            read_only: false,
        },
        MountSpec {
            host: paths.config_dir(),
            container: CONFIG_MOUNT.into(),
            read_only: true,
        },
    ];

    for raw in &group.extra_mounts {
        mounts.push(validate_extra_mount(raw, allowlist).await?);
    }
    Ok(mounts)
}

/// Validate one `host[:container]` extra-mount entry.
///
/// The host part is canonicalized (resolving symlinks) and must fall
/// under an allowlisted prefix. The optional container part must be a
/// plain relative path; it lands under [`EXTRA_MOUNT_ROOT`].
async fn validate_extra_mount(
    raw: &str,
    allowlist: &[PathBuf],
) -> Result<MountSpec, RunnerError> {
    let (host_raw, container_raw) = match raw.split_once(':') {
        Some((h, c)) => (h, Some(c)),
        None => (raw, None),
    };

    if host_raw.split('/').any(|c| c == "..") {
        return Err(RunnerError::MountRejected(format!(
            "path traversal in mount: {raw}"
        )));
    }

    let host = tokio::fs::canonicalize(host_raw)
        .await
        .map_err(|e| RunnerError::MountRejected(format!("unresolvable mount {host_raw}: {e}")))?;

    let allowed = allowlist.iter().any(|prefix| host.starts_with(prefix));
    if !allowed {
        return Err(RunnerError::MountRejected(format!(
            "mount not in allowlist: {}",
            host.display()
        )));
    }

    let container_rel = match container_raw {
        Some(c) => {
            let p = Path::new(c);
            let plain = !c.is_empty()
                && p.is_relative()
                && p.components().all(|comp| matches!(comp, Component::Normal(_)));
            if !plain {
                return Err(RunnerError::MountRejected(format!(
                    "container path must be plain relative: {c}"
                )));
            }
            c.to_string()
        }
        None => host
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RunnerError::MountRejected(format!("unnameable mount: {raw}")))?,
    };

    Ok(MountSpec {
        host,
        container: format!("{EXTRA_MOUNT_ROOT}/{container_rel}"),
        read_only: false,
    })
}
