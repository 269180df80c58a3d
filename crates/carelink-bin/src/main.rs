//! CareLink - local-first message store with offline delivery.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use carelink_core::{init_logging, Config, Paths};

/// CareLink command-line interface.
#[derive(Parser)]
#[command(name = "carelink")]
#[command(about = "Local-first message store with offline outbox and sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, database and logs. Defaults to ~/.carelink
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow connectivity, sync and sweep until interrupted
    Run,
    /// Run one sync pass
    Sync,
    /// Evict expired messages and exhausted outbox items
    Sweep {
        /// Override the configured retention window
        #[arg(long)]
        max_age_days: Option<u32>,
    },
    /// Show storage usage, outbox depth and schema version
    Status,
    /// Apply pending migrations, or roll back for development
    Migrate {
        /// Revert to this schema version instead
        #[arg(long)]
        rollback_to: Option<i64>,
    },
    /// Queue a text message for delivery
    Send {
        #[arg(long)]
        room: String,
        #[arg(long)]
        sender: String,
        text: String,
    },
    /// Re-queue a message that failed delivery
    Retry { cid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level, Some(&paths.log_file()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => app::run(config, paths).await?,
        Commands::Sync => app::sync_once(config, paths).await?,
        Commands::Sweep { max_age_days } => app::sweep(config, paths, max_age_days).await?,
        Commands::Status => app::status(config, paths).await?,
        Commands::Migrate { rollback_to } => app::migrate(paths, rollback_to).await?,
        Commands::Send { room, sender, text } => {
            app::send(config, paths, room, sender, text).await?
        }
        Commands::Retry { cid } => app::retry(config, paths, cid).await?,
    }

    Ok(())
}
