//! `dotclaw bootstrap` -- guided first-time setup.

use dotclaw_platform::DataPaths;

const ENV_TEMPLATE: &str = "\
# dotclaw secrets. Only allowlisted names are forwarded into containers.
# Model provider key (required):
#OPENROUTER_API_KEY=
# Web search (optional):
#BRAVE_SEARCH_API_KEY=
# Provider tokens (host-side only, never forwarded):
#TELEGRAM_BOT_TOKEN=
#DISCORD_BOT_TOKEN=
";

pub async fn run(paths: DataPaths) -> anyhow::Result<()> {
    super::init::ensure_defaults(&paths).await?;

    let env_path = paths.root().join(".env");
    if !env_path.exists() {
        tokio::fs::write(&env_path, ENV_TEMPLATE).await?;
        println!("Wrote {}", env_path.display());
    }

    println!(
        "\nData root ready at {}.\n\n\
         Next steps:\n\
         1. Fill in {} with your API keys.\n\
         2. Build the agent image: dotclaw build\n\
         3. Check the setup: dotclaw doctor\n\
         4. Run the host: dotclaw start\n\
         5. Register your first chat from the main group:\n\
            /dotclaw add-group \"telegram:<chatId>\" \"My Chat\" main",
        paths.root().display(),
        env_path.display(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_writes_env_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::at(dir.path().join("root"));
        run(paths.clone()).await.unwrap();

        let env_path = paths.root().join(".env");
        let body = tokio::fs::read_to_string(&env_path).await.unwrap();
        assert!(body.contains("OPENROUTER_API_KEY"));

        // User edits survive a re-run.
        tokio::fs::write(&env_path, "OPENROUTER_API_KEY=sk-real\n")
            .await
            .unwrap();
        run(paths.clone()).await.unwrap();
        let body = tokio::fs::read_to_string(&env_path).await.unwrap();
        assert!(body.contains("sk-real"));
    }
}
