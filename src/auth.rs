//! Credential gate and bearer sessions for the admin API.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::CrmToml;

/// Decides whether a username/password pair may open a session.
pub trait AuthGate: Send + Sync {
    fn authorize(&self, username: &str, password: &str) -> bool;

    fn describe(&self) -> &'static str;
}

/// A single configured admin account.
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Comparison time depends only on the lengths.
fn same_bytes(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl AuthGate for StaticCredentials {
    fn authorize(&self, username: &str, password: &str) -> bool {
        let user_ok = same_bytes(username.trim(), &self.username);
        let pass_ok = same_bytes(password, &self.password);
        user_ok & pass_ok
    }

    fn describe(&self) -> &'static str {
        "static"
    }
}

/// Accepts everyone. Only installed in dev mode.
pub struct OpenGate;

impl AuthGate for OpenGate {
    fn authorize(&self, _username: &str, _password: &str) -> bool {
        true
    }

    fn describe(&self) -> &'static str {
        "open"
    }
}

/// Pick the gate for the loaded configuration: the configured admin account
/// when a password is set, otherwise an open gate in dev mode.
pub fn gate_for(config: &CrmToml) -> anyhow::Result<Arc<dyn AuthGate>> {
    match &config.admin.password {
        Some(password) => Ok(Arc::new(StaticCredentials::new(
            config.admin.username.clone(),
            password.clone(),
        ))),
        None => {
            config.require_admin_password()?;
            tracing::warn!("no admin password set; dev mode accepts any login");
            Ok(Arc::new(OpenGate))
        }
    }
}

/// Issued bearer tokens. In memory only: a restart logs everyone out.
#[derive(Default)]
pub struct Sessions {
    tokens: Mutex<HashSet<String>>,
}

impl Sessions {
    pub fn issue(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.lock().insert(token.clone());
        token
    }

    pub fn is_valid(&self, token: &str) -> bool {
        self.lock().contains(token)
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.lock().remove(token)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials() {
        let gate = StaticCredentials::new("admin", "s3cret");
        assert!(gate.authorize("admin", "s3cret"));
        assert!(gate.authorize(" admin ", "s3cret"));
        assert!(!gate.authorize("admin", "s3cret "));
        assert!(!gate.authorize("root", "s3cret"));
        assert!(!gate.authorize("admin", ""));
    }

    #[test]
    fn test_gate_for_config() {
        let mut config = CrmToml::default();
        assert!(gate_for(&config).is_err());

        config.server.dev_mode = true;
        assert_eq!(gate_for(&config).unwrap().describe(), "open");

        config.admin.password = Some("pw".into());
        let gate = gate_for(&config).unwrap();
        assert_eq!(gate.describe(), "static");
        assert!(gate.authorize("admin", "pw"));
        assert!(!gate.authorize("admin", "nope"));
    }

    #[test]
    fn test_sessions_issue_and_revoke() {
        let sessions = Sessions::default();
        let token = sessions.issue();
        assert!(sessions.is_valid(&token));
        assert!(!sessions.is_valid("forged"));
        assert!(sessions.revoke(&token));
        assert!(!sessions.is_valid(&token));
    }
}
