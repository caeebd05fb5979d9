//! Configuration for the WeXlot CRM service.
//!
//! Settings come from `.wexlot/wexlot.toml` (or `--config`), fall back to
//! defaults when the file is absent, and are then overridden by environment
//! variables. A `.env` file in the working directory is loaded first.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [store]
//! backend = "rest"
//! url = "https://project.supabase.co"
//! api_key = "anon-key"
//!
//! [admin]
//! username = "admin"
//! password = "change-me"
//!
//! [logging]
//! level = "info"
//! json = false
//! dir = ".wexlot/logs"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_DIR: &str = ".wexlot";
pub const CONFIG_FILE: &str = "wexlot.toml";

const REDACTED: &str = "********";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Local SQLite file
    #[default]
    Sqlite,
    /// Hosted PostgREST surface
    Rest,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Sqlite => write!(f, "sqlite"),
            StoreBackend::Rest => write!(f, "rest"),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "rest" | "supabase" => Ok(StoreBackend::Rest),
            _ => anyhow::bail!("Invalid store backend '{}'. Valid values: sqlite, rest", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS and an open login gate
    #[serde(default)]
    pub dev_mode: bool,
    /// Shared secret expected in `x-webhook-secret` on change notifications
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("crm.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sqlite_path: default_sqlite_path(),
            url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSection {
    #[serde(default = "default_admin_user")]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_admin_user() -> String {
    "admin".to_string()
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            username: default_admin_user(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files; stderr only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrmToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub admin: AdminSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CrmToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse wexlot.toml")
    }

    /// Load `wexlot.toml` from `config_dir`, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize wexlot.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Resolve the effective configuration: file (explicit path or default
    /// location), then `.env`, then process environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(Path::new(CONFIG_DIR))?,
        };
        // A missing .env is the normal case
        let _ = dotenvy::dotenv();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(backend) = non_empty("WEXLOT_STORE_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.store.backend = backend,
                Err(e) => tracing::warn!("Ignoring WEXLOT_STORE_BACKEND: {}", e),
            }
        }
        if let Some(url) = non_empty("WEXLOT_STORE_URL").or_else(|| non_empty("SUPABASE_URL")) {
            self.store.url = Some(url);
        }
        if let Some(key) = non_empty("SUPABASE_ANON_KEY") {
            self.store.api_key = Some(key);
        }
        if let Some(user) = non_empty("WEXLOT_ADMIN_USER") {
            self.admin.username = user;
        }
        if let Some(password) = non_empty("WEXLOT_ADMIN_PASSWORD") {
            self.admin.password = Some(password);
        }
        if let Some(secret) = non_empty("WEXLOT_WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(secret);
        }
        if let Some(port) = non_empty("WEXLOT_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring WEXLOT_PORT '{}': not a port number", port),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Rest {
            if self.store.url.is_none() {
                anyhow::bail!(
                    "store.backend = \"rest\" requires store.url (or WEXLOT_STORE_URL / SUPABASE_URL)"
                );
            }
            if self.store.api_key.is_none() {
                anyhow::bail!(
                    "store.backend = \"rest\" requires store.api_key (or SUPABASE_ANON_KEY)"
                );
            }
        }
        Ok(())
    }

    /// Serving the admin API needs credentials unless dev mode is on.
    pub fn require_admin_password(&self) -> Result<()> {
        if self.server.dev_mode || self.admin.password.is_some() {
            return Ok(());
        }
        anyhow::bail!(
            "No admin password configured. Set [admin].password or WEXLOT_ADMIN_PASSWORD, or serve with --dev"
        )
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |v: &mut Option<String>| {
            if v.is_some() {
                *v = Some(REDACTED.to_string());
            }
        };
        mask(&mut copy.store.api_key);
        mask(&mut copy.admin.password);
        mask(&mut copy.server.webhook_secret);
        copy
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = CrmToml::parse("").unwrap();
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.sqlite_path, PathBuf::from(".wexlot/crm.db"));
        assert_eq!(config.admin.username, "admin");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[server]
port = 8080
dev_mode = true

[store]
backend = "rest"
url = "https://abc.supabase.co"
api_key = "anon"

[logging]
json = true
"#;
        let config = CrmToml::parse(content).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.server.dev_mode);
        assert_eq!(config.store.backend, StoreBackend::Rest);
        assert!(config.logging.json);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_invalid_backend() {
        assert!(CrmToml::parse("[store]\nbackend = \"mongo\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = CrmToml::parse("[server]\nport = 8080").unwrap();
        config.apply_env(env(&[
            ("SUPABASE_URL", "https://abc.supabase.co"),
            ("SUPABASE_ANON_KEY", "anon"),
            ("WEXLOT_STORE_BACKEND", "rest"),
            ("WEXLOT_ADMIN_PASSWORD", "s3cret"),
            ("WEXLOT_PORT", "9000"),
        ]));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.store.backend, StoreBackend::Rest);
        assert_eq!(config.store.url.as_deref(), Some("https://abc.supabase.co"));
        assert_eq!(config.admin.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_wexlot_store_url_wins_over_supabase_url() {
        let mut config = CrmToml::default();
        config.apply_env(env(&[
            ("SUPABASE_URL", "https://a.supabase.co"),
            ("WEXLOT_STORE_URL", "https://b.example.com"),
        ]));
        assert_eq!(config.store.url.as_deref(), Some("https://b.example.com"));
    }

    #[test]
    fn test_bad_env_port_is_ignored() {
        let mut config = CrmToml::default();
        config.apply_env(env(&[("WEXLOT_PORT", "eighty"), ("WEXLOT_ADMIN_USER", "")]));
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.admin.username, "admin");
    }

    #[test]
    fn test_rest_backend_requires_url_and_key() {
        let config = CrmToml::parse("[store]\nbackend = \"rest\"").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("store.url"));
    }

    #[test]
    fn test_admin_password_required_outside_dev_mode() {
        let mut config = CrmToml::default();
        assert!(config.require_admin_password().is_err());
        config.server.dev_mode = true;
        assert!(config.require_admin_password().is_ok());
        config.server.dev_mode = false;
        config.admin.password = Some("pw".into());
        assert!(config.require_admin_password().is_ok());
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = CrmToml::default();
        config.admin.password = Some("pw".into());
        config.store.api_key = Some("key".into());
        let shown = config.redacted();
        assert_eq!(shown.admin.password.as_deref(), Some(REDACTED));
        assert_eq!(shown.store.api_key.as_deref(), Some(REDACTED));
        assert_eq!(shown.server.webhook_secret, None);
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = CrmToml::default();
        config.server.port = 4000;
        config.save(&path).unwrap();

        let loaded = CrmToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.server.port, 4000);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = CrmToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.server.port, 3141);
    }
}
