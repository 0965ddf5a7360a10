//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific
//! modules.

mod jobs;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::repository::{migrations, SqlitePool};

#[derive(Parser)]
#[command(name = "stacflow")]
#[command(about = "Job and work-item orchestration engine for chained STAC service pipelines")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides STACFLOW_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and database
    Init,

    /// Run the engine: work API, scheduler pump, update consumers, failer
    Serve {
        /// Bind address, e.g. "4006", "0.0.0.0", or "0.0.0.0:4006"
        #[arg(short, long, default_value = "127.0.0.1:4006")]
        bind: String,
    },

    /// Run only the timeout sweeper against an existing database
    Failer {
        /// Sweep once and exit instead of looping
        #[arg(long)]
        once: bool,
    },

    /// Inspect and manage jobs
    Jobs {
        #[command(subcommand)]
        command: jobs::JobCommands,
    },
}

/// Resolve settings, then run the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }

    match cli.command {
        Commands::Init => cmd_init(&settings).await,
        Commands::Serve { bind } => serve::cmd_serve(settings, &bind).await,
        Commands::Failer { once } => serve::cmd_failer(settings, once).await,
        Commands::Jobs { command } => jobs::run(settings, command).await,
    }
}

async fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    use console::style;
    std::fs::create_dir_all(&settings.data_dir)?;
    let pool = SqlitePool::new(&settings.resolved_database_url());
    migrations::ensure_schema(&pool).await?;
    println!(
        "{} Initialized database at {}",
        style("✓").green(),
        settings.resolved_database_url()
    );
    Ok(())
}
