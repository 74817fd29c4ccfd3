//! Construction and wiring of every kernel component into one running
//! process, plus the `init`/`status`/`reset` subcommands.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::info;

use flatline_kernel::approval::ApprovalManager;
use flatline_kernel::budget::{DailyBudget, SessionBudget};
use flatline_kernel::config::{self, AgentConfig, Config, RuntimePaths};
use flatline_kernel::heartbeat::{self, HeartbeatDeps};
use flatline_kernel::memory::MemoryStore;
use flatline_kernel::redactor::Redactor;
use flatline_kernel::registry::ToolRegistry;
use flatline_kernel::router::{EchoProvider, ModelRouter};
use flatline_kernel::session::{self, OutboundMessage, SessionConfig, SessionEvent};
use flatline_sandbox::{AllowlistSnapshot, EgressFilter};

pub fn default_root() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".wintermute")
}

/// Single source of truth for the egress proxy's bind address: the
/// sandbox's `HTTP_PROXY`/`HTTPS_PROXY` env vars must point at the same
/// address the filter actually serves on.
const EGRESS_PROXY_ADDR: &str = "127.0.0.1:18080";

pub fn init(paths: &RuntimePaths) -> anyhow::Result<()> {
    paths.ensure_dirs()?;

    if !paths.config_toml.exists() {
        std::fs::write(&paths.config_toml, toml::to_string_pretty(&Config::default())?)?;
    }
    if !paths.agent_toml.exists() {
        std::fs::write(&paths.agent_toml, toml::to_string_pretty(&AgentConfig::default())?)?;
    }
    if !paths.env_file.exists() {
        std::fs::write(&paths.env_file, "# credential values, one KEY=value per line\n")?;
    }
    if !paths.identity_md.exists() {
        std::fs::write(&paths.identity_md, "# Identity\n\nNot yet generated; starts on first heartbeat tick.\n")?;
    }
    if !paths.user_md.exists() {
        std::fs::write(&paths.user_md, "# User profile\n\nNot yet generated.\n")?;
    }

    MemoryStore::open(&paths.memory_db, false)?;

    for (dir, label) in [(&paths.root, "runtime root"), (&paths.tools_dir, "tools directory")] {
        if !dir.join(".git").exists() {
            let _ = std::process::Command::new("git").arg("init").current_dir(dir).status();
            info!(dir = %dir.display(), %label, "initialized git repository");
        }
    }

    info!(root = %paths.root.display(), "flatline initialized. Build the sandbox image separately: docker build -t flatline-sandbox:latest .");
    Ok(())
}

pub async fn status(paths: &RuntimePaths) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&paths.health_json).unwrap_or_else(|_| "{}".to_owned());
    println!("{text}");
    Ok(())
}

pub async fn reset(paths: &RuntimePaths) -> anyhow::Result<()> {
    let config = config::load_config(&paths.config_toml)?;
    let executor = build_executor(paths, &config).await?;
    executor.reset().await?;
    info!("sandbox reset");
    Ok(())
}

async fn build_executor(
    paths: &RuntimePaths,
    config: &Config,
) -> anyhow::Result<Arc<dyn flatline_sandbox::Executor>> {
    let executor_config = flatline_sandbox::ExecutorConfig {
        workspace_dir: paths.workspace_dir.clone(),
        tools_dir: paths.tools_dir.clone(),
        base_image: config.executor.base_image.clone(),
        egress_proxy_addr: EGRESS_PROXY_ADDR.parse()?,
        memory_limit_bytes: config.executor.memory_limit_mb * 1024 * 1024,
        cpu_limit_nanos: (config.executor.cpu_limit_cores * 1_000_000_000.0) as u64,
        process_limit: config.executor.process_limit,
        inner_timeout_grace: std::time::Duration::from_secs(5),
        outer_timeout_grace: std::time::Duration::from_secs(10),
    };
    Ok(flatline_sandbox::select_executor(executor_config).await.into())
}

/// Start the full runtime: sandbox, one interactive session reading
/// stdin lines, and the heartbeat task. Exits gracefully on SIGTERM/Ctrl-C.
pub async fn start(paths: RuntimePaths) -> anyhow::Result<()> {
    let config = Arc::new(config::load_config(&paths.config_toml)?);
    let agent_config = Arc::new(RwLock::new(config::load_agent_config(&paths.agent_toml)?));

    let memory = Arc::new(MemoryStore::open(&paths.memory_db, false)?);
    let executor: Arc<dyn flatline_sandbox::Executor> = build_executor(&paths, &config).await?;
    let registry = Arc::new(ToolRegistry::new(paths.tools_dir.clone(), flatline_kernel::registry::core_tool_descriptors())?);
    registry.watch_for_changes()?;

    let credential_values = read_credential_values(&paths.env_file);
    let redactor = Arc::new(Redactor::new(credential_values));

    let egress_snapshot = AllowlistSnapshot {
        static_domains: config.domains.allowlist.iter().cloned().collect(),
        trust_domains: memory.trusted_domains()?.into_iter().collect(),
        block_domains: config.domains.blocklist.iter().cloned().collect(),
    };
    let egress = Arc::new(EgressFilter::new(egress_snapshot));
    let egress_addr: std::net::SocketAddr = EGRESS_PROXY_ADDR.parse()?;
    let egress_for_serve = (*egress).clone();
    tokio::spawn(async move {
        if let Err(e) = egress_for_serve.serve(egress_addr).await {
            tracing::error!(error = %e, "egress proxy stopped serving");
        }
    });

    let mut router = ModelRouter::new("default".into());
    router.register_provider("default", Arc::new(EchoProvider));
    let router = Arc::new(router);

    let daily_budget = DailyBudget::new(config.budget.max_tokens_per_day);
    let approvals = Arc::new(ApprovalManager::new());
    let known_container_images = Arc::new(RwLock::new(HashSet::new()));
    let identity_doc = Arc::new(RwLock::new(std::fs::read_to_string(&paths.identity_md).unwrap_or_default()));
    let lessons_doc = Arc::new(RwLock::new(std::fs::read_to_string(&paths.lessons_md).ok()));
    let user_profile = Arc::new(RwLock::new(std::fs::read_to_string(&paths.user_md).ok()));

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(64);
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            println!("[{}] {}", msg.session_id, msg.text);
        }
    });

    let active_session_count = Arc::new(AtomicUsize::new(1));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat_deps = HeartbeatDeps {
        config: config.clone(),
        agent_config: agent_config.clone(),
        memory: memory.clone(),
        executor: executor.clone(),
        registry: registry.clone(),
        router: router.clone(),
        approvals: approvals.clone(),
        daily_budget: daily_budget.clone(),
        outbound_tx: outbound_tx.clone(),
        notify_session_id: "default".into(),
        paths: paths.clone(),
        active_session_count: active_session_count.clone(),
        identity_doc: identity_doc.clone(),
        user_profile: user_profile.clone(),
    };
    let start_time = Instant::now();
    tokio::spawn(heartbeat::run_heartbeat(heartbeat_deps, start_time, shutdown_rx));

    let session_budget = SessionBudget::new(config.budget.max_tokens_per_session, daily_budget.clone());
    let session_config = SessionConfig {
        session_id: "default".into(),
        user_id: "local".into(),
        router,
        registry,
        executor,
        memory,
        budget: session_budget,
        budget_limits: config.budget.clone(),
        approval_manager: approvals,
        redactor,
        domains: config.domains.clone(),
        egress,
        known_container_images,
        identity_doc,
        lessons_doc,
        user_profile,
        outbound_tx,
    };

    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(32);
    let session_handle = tokio::spawn(session::run_session(session_config, event_rx));

    info!("flatline running. Type a message and press enter; Ctrl-C to stop.");
    let stdin_tx = event_tx.clone();
    let stdin_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        use tokio::io::AsyncBufReadExt;
        while let Ok(Some(line)) = lines.next_line().await {
            if stdin_tx.send(SessionEvent::UserMessage(line)).await.is_err() {
                break;
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = event_tx.send(SessionEvent::Shutdown).await;
    stdin_task.abort();
    let _ = session_handle.await;

    Ok(())
}

fn read_credential_values(env_file: &std::path::Path) -> Vec<String> {
    let Ok(text) = std::fs::read_to_string(env_file) else { return Vec::new() };
    text.lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(_, v)| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect()
}
