//! Configuration view command for `wexlot config`.

use anyhow::{Context, Result};
use wexlot_crm::config::{CONFIG_DIR, CONFIG_FILE, CrmToml};

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, config: &CrmToml, command: Option<ConfigCommands>) -> Result<()> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("WeXlot Configuration");
            println!("====================");
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No wexlot.toml found at {}; using defaults", path.display());
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            let rendered =
                toml::to_string_pretty(&config.redacted()).context("Failed to render config")?;
            println!("{}", rendered.trim_end());
            println!();
        }
        Some(ConfigCommands::Path) => {
            println!("{}", path.display());
        }
    }
    Ok(())
}
