//! Container environment scoping.
//!
//! Secrets come from the host environment only. Containers receive just
//! the allowlisted names: the model/provider keys the agent needs plus
//! anything prefixed `DOTCLAW_`. Per-group overrides pass through the
//! same filter.

use std::collections::HashMap;

/// Exact env names always forwarded when present.
const FORWARDED_NAMES: &[&str] = &["OPENROUTER_API_KEY", "BRAVE_SEARCH_API_KEY"];

/// Prefix for operator-defined forwarded variables.
const FORWARDED_PREFIX: &str = "DOTCLAW_";

/// Whether a single env name may be forwarded into a container.
pub fn is_forwardable(name: &str) -> bool {
    FORWARDED_NAMES.contains(&name) || name.starts_with(FORWARDED_PREFIX)
}

/// Collect the forwardable subset of the host environment, with
/// `overrides` (already scoped to a group) applied on top. Override names
/// outside the allowlist are dropped, not errored: a group config must
/// not be able to leak arbitrary host variables.
pub fn forwarded_env(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars()
        .filter(|(name, _)| is_forwardable(name))
        .collect();
    for (name, value) in overrides {
        if is_forwardable(name) {
            env.insert(name.clone(), value.clone());
        }
    }
    env
}
