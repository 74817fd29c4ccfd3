//! `flatline`: the binary that wires the kernel, sandbox, and heartbeat
//! into a running process, plus operator subcommands.

mod backup;
mod wiring;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "flatline", about = "Agent runtime kernel")]
struct Cli {
    /// Runtime root directory (defaults to ~/.wintermute).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seed the directory layout, config files, and memory schema.
    Init,
    /// Start the agent runtime: sandbox, session router, heartbeat.
    Start,
    /// Print a point-in-time health summary.
    Status,
    /// Recreate the sandbox boundary from its base state.
    Reset,
    /// Snapshot/list/restore the on-disk state.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    Create,
    List,
    Restore { index: usize },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let root = cli.root.unwrap_or_else(wiring::default_root);
    let paths = flatline_kernel::config::RuntimePaths::resolve(root);

    match cli.command {
        Command::Init => wiring::init(&paths),
        Command::Start => wiring::start(paths).await,
        Command::Status => wiring::status(&paths).await,
        Command::Reset => wiring::reset(&paths).await,
        Command::Backup { action } => match action {
            BackupAction::Create => backup::create(&paths).map(|p| info!(path = %p.display(), "backup created")),
            BackupAction::List => {
                for (i, entry) in backup::list(&paths)?.iter().enumerate() {
                    println!("{i}: {}", entry.display());
                }
                Ok(())
            }
            BackupAction::Restore { index } => backup::restore(&paths, index),
        },
    }
    .map_err(|e| {
        error!(error = %e, "command failed");
        e
    })
}
