//! The supervisor: a separate process that watches the agent's on-disk
//! health signal and its own state, applying bounded, filesystem/signal
//! scoped remediation. Never shares memory with the agent process and
//! never blocks on it.

mod remediation;
mod state;
mod update;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use flatline_kernel::config::RuntimePaths;
use flatline_kernel::health::HealthSnapshot;
use flatline_kernel::registry::ToolRegistry;
use tracing::{info, warn};

use state::SupervisorState;

#[derive(Parser, Debug)]
#[command(name = "flatline-supervisor", about = "Watchdog for the flatline agent runtime")]
struct Cli {
    /// Runtime root directory (defaults to ~/.wintermute).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Poll interval in seconds.
    #[arg(long, default_value_t = 30)]
    poll_secs: u64,

    /// Release index URL to poll for binary self-updates. Self-update
    /// is disabled when unset.
    #[arg(long)]
    update_index_url: Option<String>,

    /// Minimum idle time before an update is allowed to proceed.
    #[arg(long, default_value_t = 600)]
    update_min_idle_secs: u64,

    /// How long to watch the new binary's health.json before rolling back.
    #[arg(long, default_value_t = 120)]
    update_watch_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(default_root);
    let paths = RuntimePaths::resolve(root);
    paths.ensure_dirs()?;

    let state = SupervisorState::open(&paths.flatline_dir.join("state.db"))?;
    info!(root = %paths.root.display(), poll_secs = cli.poll_secs, "supervisor started");

    let http_client = reqwest::Client::new();
    let mut interval = tokio::time::interval(Duration::from_secs(cli.poll_secs));
    loop {
        interval.tick().await;
        if let Err(e) = run_cycle(&paths, &state) {
            warn!(error = %e, "supervisor cycle failed");
        }
        if let Some(index_url) = &cli.update_index_url {
            if let Err(e) = maybe_run_update_cycle(&paths, &state, &http_client, index_url, &cli).await {
                warn!(error = %e, "self-update cycle failed");
            }
        }
    }
}

/// Checks the release index; if a new version exists, downloads and
/// verifies it, waits for an idle window, applies the replace/watch/
/// rollback sequence, and exits with status 10 on success so an outer
/// process supervisor (systemd, the `start` retry loop) relaunches the
/// new binary. Never exits on a failed or rolled-back update.
async fn maybe_run_update_cycle(
    paths: &RuntimePaths,
    state: &SupervisorState,
    client: &reqwest::Client,
    index_url: &str,
    cli: &Cli,
) -> anyhow::Result<()> {
    let current_version = env!("CARGO_PKG_VERSION");
    let Some(entry) = update::check_for_update(client, index_url, current_version).await? else {
        return Ok(());
    };

    let health = read_health(&paths.health_json);
    let last_active = match health.as_ref() {
        Some(h) if h.active_session_count > 0 => Some(chrono::Utc::now()),
        _ => None,
    };
    if !update::in_idle_window(last_active, Duration::from_secs(cli.update_min_idle_secs)) {
        info!(version = %entry.version, "update available but session is active, deferring");
        return Ok(());
    }

    let current_binary = std::env::current_exe()?;
    let staged_binary = paths.flatline_dir.join("updates").join(format!("flatline-supervisor-{}", entry.version));
    update::download_and_verify(client, &entry, &staged_binary).await?;

    info!(from = current_version, to = %entry.version, "applying self-update");
    update::apply_update(
        paths,
        state,
        &current_binary,
        &staged_binary,
        current_version,
        &entry.version,
        || read_health(&paths.health_json),
        Duration::from_secs(cli.update_watch_secs),
    )
    .await?;

    info!(version = %entry.version, "self-update applied, restarting");
    std::process::exit(10);
}

fn default_root() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".wintermute")
}

fn run_cycle(paths: &RuntimePaths, state: &SupervisorState) -> anyhow::Result<()> {
    let health = read_health(&paths.health_json);
    let agent_config = read_agent_config(&paths.agent_toml);
    let tool_health = read_tool_health(&paths.tools_dir);

    let daily_burn_fraction = health
        .as_ref()
        .map(|h| h.daily_tokens_spent as f64 / h.daily_tokens_limit.max(1) as f64)
        .unwrap_or(0.0);

    let diagnoses = remediation::diagnose(
        health.as_ref(),
        agent_config.as_ref().map(|c| c.scheduled_tasks.as_slice()).unwrap_or(&[]),
        &tool_health,
        daily_burn_fraction,
    );

    for diagnosis in &diagnoses {
        info!(pattern = diagnosis.pattern, action = %diagnosis.action, "applying remediation");
        if let Err(e) = remediation::apply(paths, state, diagnosis) {
            warn!(pattern = diagnosis.pattern, error = %e, "remediation action failed");
        }
    }

    Ok(())
}

fn read_health(path: &std::path::Path) -> Option<HealthSnapshot> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn read_agent_config(path: &std::path::Path) -> Option<flatline_kernel::config::AgentConfig> {
    let text = std::fs::read_to_string(path).ok()?;
    toml::from_str(&text).ok()
}

fn read_tool_health(tools_dir: &std::path::Path) -> Vec<(String, flatline_kernel::registry::ToolHealth)> {
    let Ok(registry) = ToolRegistry::new(tools_dir.to_path_buf(), vec![]) else {
        return Vec::new();
    };
    registry
        .snapshot()
        .values()
        .map(|d| (d.name.clone(), d.meta.clone()))
        .collect()
}
