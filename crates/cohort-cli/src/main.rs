use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "cohort", version, about = "Study administration CLI")]
struct Cli {
    /// Path to the config file (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconciliation cycles over the roster
    Cycle {
        #[command(subcommand)]
        action: commands::cycle::CycleAction,
    },
    /// Participant inspection
    Participant {
        #[command(subcommand)]
        action: commands::participant::ParticipantAction,
    },
    /// Gift-code pool management
    Pool {
        #[command(subcommand)]
        action: commands::pool::PoolAction,
    },
    /// Study catalog inspection
    Catalog {
        #[command(subcommand)]
        action: commands::catalog::CatalogAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();
    let result = match cli.command {
        Commands::Cycle { action } => commands::cycle::run(action, config_path),
        Commands::Participant { action } => commands::participant::run(action, config_path),
        Commands::Pool { action } => commands::pool::run(action, config_path),
        Commands::Catalog { action } => commands::catalog::run(action),
        Commands::Config { action } => commands::config::run(action, config_path),
        Commands::Completions { shell } => commands::completions::run(shell),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
