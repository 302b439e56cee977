//! `dotclaw build` -- build the agent container image.

use clap::Args;

use dotclaw_platform::DataPaths;
use dotclaw_platform::fs::read_json_opt;
use dotclaw_types::config::RuntimeConfig;

/// Arguments for `dotclaw build`.
#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory containing the agent Dockerfile.
    #[arg(default_value = "./container")]
    pub context: std::path::PathBuf,

    /// Image tag; defaults to the configured container image.
    #[arg(long)]
    pub tag: Option<String>,

    /// Disable the build cache.
    #[arg(long)]
    pub no_cache: bool,
}

pub async fn run(paths: DataPaths, args: BuildArgs) -> anyhow::Result<()> {
    let cfg: RuntimeConfig = read_json_opt(&paths.runtime_config_file())
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    let tag = args.tag.unwrap_or(cfg.container.image);

    let mut docker_args: Vec<String> = vec!["build".into(), "-t".into(), tag.clone()];
    if args.no_cache {
        docker_args.push("--no-cache".into());
    }
    docker_args.push(args.context.display().to_string());

    tracing::info!(tag = %tag, context = %args.context.display(), "building agent image");
    let status = tokio::process::Command::new("docker")
        .args(&docker_args)
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("docker build failed with {:?}", status.code());
    }
    println!("Built {tag}");
    Ok(())
}
