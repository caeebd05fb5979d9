use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

use wexlot_crm::config::CrmToml;

#[derive(Parser)]
#[command(name = "wexlot")]
#[command(version, about = "Admin back-end for the WeXlot sales CRM")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to wexlot.toml (defaults to .wexlot/wexlot.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path. Overrides [store].sqlite_path.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the admin HTTP/WebSocket server
    Serve {
        /// Port to serve on. Overrides [server].port.
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS, open login when no password is set)
        #[arg(long)]
        dev: bool,
    },
    /// Write a default wexlot.toml and create the local database
    Init {
        /// Overwrite an existing wexlot.toml
        #[arg(long)]
        force: bool,
    },
    /// Print the Postgres migration for the hosted store
    MigrationSql {
        /// Also print the row-level security policies
        #[arg(long)]
        rls: bool,
    },
    /// Load every collection once and report counts or the load error
    Status,
    /// Print pipeline totals and per-rep figures
    Dashboard,
    /// View configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration with secrets masked
    Show,
    /// Print the configuration file path in use
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // These run before (or without) a valid configuration.
    match &cli.command {
        Commands::Init { force } => return cmd::cmd_init(&cli, *force),
        Commands::MigrationSql { rls } => {
            cmd::cmd_migration_sql(*rls);
            return Ok(());
        }
        _ => {}
    }

    let mut config = CrmToml::resolve(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.store.sqlite_path = db.clone();
    }
    let _log_guard = wexlot_crm::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve { port, dev } => cmd::cmd_serve(config, *port, *dev).await?,
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::Dashboard => cmd::cmd_dashboard(&config).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, &config, command.clone())?,
        Commands::Init { .. } | Commands::MigrationSql { .. } => {}
    }

    Ok(())
}
