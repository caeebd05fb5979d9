//! Store setup and inspection commands for `wexlot init`, `wexlot migration-sql`,
//! `wexlot status`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use wexlot_crm::config::{CONFIG_DIR, CONFIG_FILE, CrmToml, StoreBackend};
use wexlot_crm::crm::incidents::IncidentLog;
use wexlot_crm::crm::schema::{POSTGRES_MIGRATION, rls_policy_sql};
use wexlot_crm::crm::store::{ChangeFeed, SqliteStore, open_store};
use wexlot_crm::crm::sync::CrmSync;

use super::super::Cli;

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE))
}

pub fn cmd_init(cli: &Cli, force: bool) -> Result<()> {
    let path = config_path(cli);
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
    } else {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        CrmToml::default().save(&path)?;
        println!("Wrote default config to {}", path.display());
    }

    let mut config = CrmToml::load(&path)?;
    if let Some(db) = &cli.db {
        config.store.sqlite_path = db.clone();
    }

    match config.store.backend {
        StoreBackend::Sqlite => {
            SqliteStore::new(&config.store.sqlite_path, ChangeFeed::default())
                .context("Failed to initialize CRM database")?;
            println!(
                "CRM database initialized at {}",
                config.store.sqlite_path.display()
            );
        }
        StoreBackend::Rest => {
            println!(
                "Hosted store configured. Apply the schema with: {}",
                console::style("wexlot migration-sql --rls").bold()
            );
        }
    }
    Ok(())
}

pub fn cmd_migration_sql(rls: bool) {
    println!("{}", POSTGRES_MIGRATION.trim_end());
    if rls {
        println!();
        println!("{}", rls_policy_sql().trim_end());
    }
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Open the configured store and run one full refresh.
pub(crate) async fn load_once(config: &CrmToml) -> Result<(Arc<CrmSync>, Arc<IncidentLog>)> {
    let store = open_store(&config.store, ChangeFeed::default())?;
    let sync = Arc::new(CrmSync::new(Arc::clone(&store)));
    let incidents = Arc::new(IncidentLog::new(store));

    let bar = spinner("Loading CRM data...");
    let loaded = sync.refresh_data().await;
    // The incident log is optional for older schemas
    let _ = incidents.refresh().await;
    bar.finish_and_clear();

    if let Err(e) = loaded {
        println!("  {} {}", console::style("Error:").red().bold(), e.sync_message());
        if e.store_error().is_some_and(|s| s.is_missing_relation()) {
            println!(
                "  Run {} and apply it to the database.",
                console::style("wexlot migration-sql").bold()
            );
        }
        return Err(e.into());
    }
    Ok((sync, incidents))
}

pub async fn cmd_status(config: &CrmToml) -> Result<()> {
    let (sync, incidents) = load_once(config).await?;
    let status = sync.status();
    let counts = status.counts;

    println!();
    println!("{}", console::style("WeXlot CRM Status").bold().cyan());
    println!("  Backend: {}", sync.store().backend());
    if config.store.backend == StoreBackend::Sqlite {
        println!("  Database: {}", config.store.sqlite_path.display());
    }
    println!();
    println!("{:<14} {:>6}", "Table", "Rows");
    println!("{:<14} {:>6}", "--------------", "------");
    for (name, count) in [
        ("staff", counts.staff),
        ("contacts", counts.contacts),
        ("companies", counts.companies),
        ("deals", counts.deals),
        ("activities", counts.activities),
        ("interactions", counts.interactions),
        ("platforms", counts.platforms),
    ] {
        println!("{:<14} {:>6}", name, count);
    }
    match incidents.error() {
        None => println!("{:<14} {:>6}", "incidents", incidents.incidents().len()),
        Some(e) => {
            tracing::debug!(error = %e, "incident log unavailable");
            println!("{:<14} {:>6}", "incidents", console::style("n/a").dim());
        }
    }
    if let Some(at) = &status.last_refreshed {
        println!();
        println!("  Loaded at {}", at);
    }
    println!();
    Ok(())
}
