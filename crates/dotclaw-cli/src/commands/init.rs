//! `dotclaw init` -- create the data layout and default config files.

use anyhow::Context;

use dotclaw_platform::DataPaths;
use dotclaw_platform::fs::write_json_atomic;
use dotclaw_types::config::{ModelConfig, RuntimeConfig};

pub async fn run(paths: DataPaths) -> anyhow::Result<()> {
    ensure_defaults(&paths).await?;
    println!("Initialized data root at {}", paths.root().display());
    Ok(())
}

/// Create directories and any missing default config files. Idempotent;
/// existing files are never overwritten.
pub async fn ensure_defaults(paths: &DataPaths) -> anyhow::Result<()> {
    paths
        .ensure_layout()
        .await
        .context("creating data directories")?;

    if !paths.runtime_config_file().exists() {
        write_json_atomic(&paths.runtime_config_file(), &RuntimeConfig::default())
            .await
            .context("writing default runtime.json")?;
    }
    if !paths.model_file().exists() {
        let mut model = ModelConfig::default();
        if let Ok(env_model) = std::env::var("OPENROUTER_MODEL")
            && !env_model.is_empty()
        {
            model.model = env_model;
        }
        write_json_atomic(&paths.model_file(), &model)
            .await
            .context("writing default model.json")?;
    }
    if !paths.behavior_file().exists() {
        write_json_atomic(&paths.behavior_file(), &serde_json::json!({}))
            .await
            .context("writing default behavior.json")?;
    }
    if !paths.tool_policy_file().exists() {
        write_json_atomic(
            &paths.tool_policy_file(),
            &serde_json::json!({"allow": [], "deny": []}),
        )
        .await
        .context("writing default tool-policy.json")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_is_idempotent_and_preserves_edits() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().join("root"));
        ensure_defaults(&paths).await.unwrap();
        assert!(paths.runtime_config_file().exists());
        assert!(paths.model_file().exists());

        // A user edit survives a second init.
        tokio::fs::write(&paths.model_file(), r#"{"model": "custom/model"}"#)
            .await
            .unwrap();
        ensure_defaults(&paths).await.unwrap();
        let raw = tokio::fs::read_to_string(&paths.model_file()).await.unwrap();
        assert!(raw.contains("custom/model"));
    }
}
