//! `dotclaw doctor` -- environment and configuration diagnostics.
//!
//! Exits non-zero when a required check fails; warnings do not affect
//! the exit code.

use comfy_table::Table;

use dotclaw_platform::DataPaths;
use dotclaw_store::{HostStore, MemoryStore};
use dotclaw_types::config::RuntimeConfig;

enum Verdict {
    Ok(String),
    Warn(String),
    Fail(String),
}

pub async fn run(paths: DataPaths) -> anyhow::Result<()> {
    let mut checks: Vec<(&str, Verdict)> = Vec::new();

    // Data root writable.
    checks.push(("data root", {
        let probe = paths.root().join(".doctor-probe");
        match tokio::fs::create_dir_all(paths.root()).await {
            Ok(()) => match tokio::fs::write(&probe, b"ok").await {
                Ok(()) => {
                    let _ = tokio::fs::remove_file(&probe).await;
                    Verdict::Ok(paths.root().display().to_string())
                }
                Err(e) => Verdict::Fail(format!("not writable: {e}")),
            },
            Err(e) => Verdict::Fail(format!("cannot create: {e}")),
        }
    }));

    // Runtime config parses (missing file means defaults).
    checks.push(("runtime.json", {
        match tokio::fs::read_to_string(paths.runtime_config_file()).await {
            Ok(raw) => match RuntimeConfig::from_json(&raw) {
                Ok(_) => Verdict::Ok("valid".into()),
                Err(e) => Verdict::Fail(e.to_string()),
            },
            Err(_) => Verdict::Warn("missing, defaults apply (run `dotclaw init`)".into()),
        }
    }));

    // SQLite stores open and migrate.
    checks.push(("messages.db", match HostStore::open(paths.messages_db()).await {
        Ok(_) => Verdict::Ok("schema ok".into()),
        Err(e) => Verdict::Fail(e.to_string()),
    }));
    checks.push(("memory.db", match MemoryStore::open(paths.memory_db()).await {
        Ok(_) => Verdict::Ok("schema ok".into()),
        Err(e) => Verdict::Fail(e.to_string()),
    }));

    // Container runtime on PATH.
    checks.push(("docker", match which::which("docker") {
        Ok(path) => Verdict::Ok(path.display().to_string()),
        Err(_) => Verdict::Fail("docker not found on PATH".into()),
    }));

    // Model provider key.
    checks.push(("OPENROUTER_API_KEY", {
        match std::env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.is_empty() => Verdict::Ok("set".into()),
            _ => Verdict::Warn("not set; agent runs will fail auth".into()),
        }
    }));

    // Cooldown file (corrupt is survivable but worth knowing).
    checks.push(("cooldowns.json", {
        match tokio::fs::read_to_string(paths.cooldowns_file()).await {
            Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(_) => Verdict::Ok("valid".into()),
                Err(e) => Verdict::Warn(format!("corrupt, will start empty: {e}")),
            },
            Err(_) => Verdict::Ok("none yet".into()),
        }
    }));

    let mut table = Table::new();
    table.set_header(["check", "status", "detail"]);
    let mut failures = 0;
    for (name, verdict) in &checks {
        let (status, detail) = match verdict {
            Verdict::Ok(d) => ("ok", d.clone()),
            Verdict::Warn(d) => ("warn", d.clone()),
            Verdict::Fail(d) => {
                failures += 1;
                ("FAIL", d.clone())
            }
        };
        table.add_row([*name, status, detail.as_str()]);
    }
    println!("{table}");

    if failures > 0 {
        anyhow::bail!("{failures} check(s) failed");
    }
    println!("All required checks passed.");
    Ok(())
}
