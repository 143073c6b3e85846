//! Connection Configuration Store
//!
//! Persists the connection document (url, credentials, auto-connect flag,
//! default subjects) in profile storage, validates it, and reports edits
//! made by sibling instances of the same profile.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::error::StorageResult;
use super::storage::{ProfileStorage, StorageEvent};
use crate::transport::ws::check_url;
use crate::transport::{validate_pattern, ConnectOptions, Credentials};

/// Storage key of the connection document
pub const CONFIG_KEY: &str = "connection";

fn default_url() -> String {
    "ws://localhost:8080".to_string()
}

/// Persisted connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub token: String,
    pub auto_connect: bool,
    /// Patterns a monitor subscribes to once connected
    pub subjects: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            user: String::new(),
            pass: String::new(),
            token: String::new(),
            auto_connect: false,
            subjects: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create a config for a URL with no credentials
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set user/password credentials
    pub fn user_pass(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = user.into();
        self.pass = pass.into();
        self
    }

    /// Set token credentials
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the auto-connect flag
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Add a default subject
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }

    /// Credentials forwarded to the broker; a token wins over user/pass
    pub fn credentials(&self) -> Credentials {
        if !self.token.is_empty() {
            Credentials::Token(self.token.clone())
        } else if !self.user.is_empty() && !self.pass.is_empty() {
            Credentials::UserPass {
                user: self.user.clone(),
                pass: self.pass.clone(),
            }
        } else {
            Credentials::None
        }
    }

    /// Handshake options for this config
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new(self.url.clone()).credentials(self.credentials())
    }
}

/// A single validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigViolation {
    #[error("Broker URL is required")]
    MissingUrl,

    #[error("Broker URL is invalid: {0}")]
    InvalidUrl(String),

    #[error("Authentication is required: provide a token or both user and password")]
    MissingAuth,

    #[error("Default subject '{subject}' is invalid: {reason}")]
    InvalidSubject { subject: String, reason: String },
}

/// Outcome of [`ConfigStore::validate_config`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ConfigViolation>,
}

impl ValidationReport {
    /// Human-readable messages, one per violation
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

/// An edit of the connection document made by another instance
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub previous: Option<ConnectionConfig>,
    pub current: ConnectionConfig,
}

/// Reads, writes and validates the persisted connection document
#[derive(Clone)]
pub struct ConfigStore {
    storage: Arc<dyn ProfileStorage>,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn ProfileStorage>) -> Self {
        Self { storage }
    }

    /// Persisted config, or the default when missing or unreadable
    pub fn get_config(&self) -> ConnectionConfig {
        match self.storage.get(CONFIG_KEY) {
            Ok(Some(doc)) => parse_document(&doc).unwrap_or_default(),
            Ok(None) => ConnectionConfig::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read connection config, using defaults");
                ConnectionConfig::default()
            }
        }
    }

    /// Persist a config; callers validate first
    pub fn save_config(&self, config: &ConnectionConfig) -> StorageResult<()> {
        let doc = serde_json::to_string(config)?;
        self.storage.set(CONFIG_KEY, &doc)?;
        tracing::debug!(url = %config.url, auto_connect = config.auto_connect, "Connection config saved");
        Ok(())
    }

    /// Validate, then persist only a valid config
    ///
    /// The report is returned either way; an invalid config leaves storage
    /// untouched.
    pub fn save_if_valid(&self, config: &ConnectionConfig) -> StorageResult<ValidationReport> {
        let report = Self::validate_config(config);
        if report.valid {
            self.save_config(config)?;
        } else {
            tracing::debug!(errors = report.errors.len(), "Invalid connection config not saved");
        }
        Ok(report)
    }

    /// Drop the persisted config so defaults apply again
    pub fn reset(&self) -> StorageResult<()> {
        self.storage.remove(CONFIG_KEY)
    }

    /// Check every rule and collect all violations
    pub fn validate_config(config: &ConnectionConfig) -> ValidationReport {
        let mut errors = Vec::new();

        if config.url.trim().is_empty() {
            errors.push(ConfigViolation::MissingUrl);
        } else if let Err(e) = check_url(config.url.trim()) {
            errors.push(ConfigViolation::InvalidUrl(e.to_string()));
        }

        let has_token = !config.token.trim().is_empty();
        let has_user_pass = !config.user.trim().is_empty() && !config.pass.is_empty();
        if !has_token && !has_user_pass {
            errors.push(ConfigViolation::MissingAuth);
        }

        for subject in &config.subjects {
            if let Err(e) = validate_pattern(subject) {
                errors.push(ConfigViolation::InvalidSubject {
                    subject: subject.clone(),
                    reason: e.to_string(),
                });
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Follow edits made by other instances of this profile
    pub fn watch(&self) -> ConfigWatcher {
        ConfigWatcher {
            events: self.storage.events(),
            origin: self.storage.origin(),
        }
    }
}

fn parse_document(doc: &str) -> Option<ConnectionConfig> {
    match serde_json::from_str(doc) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(error = %e, "Stored connection config is unreadable");
            None
        }
    }
}

/// Stream of [`ConfigChange`]s originating outside this instance
pub struct ConfigWatcher {
    events: broadcast::Receiver<StorageEvent>,
    origin: Uuid,
}

impl ConfigWatcher {
    /// Wait for the next external edit; `None` once storage is gone
    pub async fn next(&mut self) -> Option<ConfigChange> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if event.key != CONFIG_KEY || event.origin == self.origin {
                        continue;
                    }
                    return Some(ConfigChange {
                        previous: event.old_value.as_deref().and_then(parse_document),
                        current: event
                            .new_value
                            .as_deref()
                            .and_then(parse_document)
                            .unwrap_or_default(),
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Config watcher lagged behind storage events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::storage::MemoryStorage;

    fn store() -> (ConfigStore, MemoryStorage) {
        let storage = MemoryStorage::new();
        (ConfigStore::new(Arc::new(storage.clone())), storage)
    }

    #[test]
    fn test_default_when_missing() {
        let (store, _) = store();
        let config = store.get_config();
        assert!(!config.auto_connect);
        assert!(config.subjects.is_empty());
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn test_default_when_unparseable() {
        let (store, storage) = store();
        storage.set(CONFIG_KEY, "not json").unwrap();
        assert_eq!(store.get_config(), ConnectionConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let (store, _) = store();
        let config = ConnectionConfig::new("wss://broker.example.com")
            .token("abc")
            .auto_connect(true)
            .subject("metrics.>");

        store.save_config(&config).unwrap();
        assert_eq!(store.get_config(), config);

        store.reset().unwrap();
        assert_eq!(store.get_config(), ConnectionConfig::default());
    }

    #[test]
    fn test_document_uses_camel_case() {
        let (store, storage) = store();
        store
            .save_config(&ConnectionConfig::new("ws://localhost:8080").auto_connect(true))
            .unwrap();
        let doc = storage.get(CONFIG_KEY).unwrap().unwrap();
        assert!(doc.contains("\"autoConnect\":true"));
        assert!(doc.contains("\"subjects\":[]"));
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let (store, storage) = store();
        storage
            .set(CONFIG_KEY, r#"{"url":"ws://h:1","token":"t"}"#)
            .unwrap();
        let config = store.get_config();
        assert_eq!(config.url, "ws://h:1");
        assert_eq!(config.token, "t");
        assert!(!config.auto_connect);
    }

    #[test]
    fn test_valid_configs() {
        for config in [
            ConnectionConfig::new("ws://localhost:8080").user_pass("a", "b"),
            ConnectionConfig::new("wss://broker.example.com/ws").token("t"),
            ConnectionConfig::new("ws://10.0.0.1:4222")
                .token("t")
                .subject("orders.*")
                .subject("metrics.>"),
        ] {
            let report = ConfigStore::validate_config(&config);
            assert!(report.valid, "{:?}", report);
            assert!(report.errors.is_empty());
        }
    }

    #[test]
    fn test_missing_url_and_auth_reports_both() {
        let config = ConnectionConfig::new("");
        let report = ConfigStore::validate_config(&config);
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec![ConfigViolation::MissingUrl, ConfigViolation::MissingAuth]
        );
        assert_eq!(report.messages().len(), 2);
    }

    #[test]
    fn test_wrong_scheme_rejected() {
        let config = ConnectionConfig::new("http://localhost:8080").token("t");
        let report = ConfigStore::validate_config(&config);
        assert!(matches!(report.errors[..], [ConfigViolation::InvalidUrl(_)]));
    }

    #[test]
    fn test_incomplete_user_pass_is_missing_auth() {
        let config = ConnectionConfig::new("ws://localhost:8080").user_pass("a", "");
        let report = ConfigStore::validate_config(&config);
        assert_eq!(report.errors, vec![ConfigViolation::MissingAuth]);
    }

    #[test]
    fn test_invalid_default_subject() {
        let config = ConnectionConfig::new("ws://localhost:8080")
            .token("t")
            .subject("orders.>.eu");
        let report = ConfigStore::validate_config(&config);
        assert!(matches!(
            report.errors[..],
            [ConfigViolation::InvalidSubject { .. }]
        ));
    }

    #[test]
    fn test_credentials_prefer_token() {
        let config = ConnectionConfig::new("ws://x:1").user_pass("a", "b").token("t");
        assert_eq!(config.credentials(), Credentials::Token("t".to_string()));

        let config = ConnectionConfig::new("ws://x:1").user_pass("a", "b");
        assert!(matches!(config.credentials(), Credentials::UserPass { .. }));

        assert_eq!(ConnectionConfig::default().credentials(), Credentials::None);
    }

    #[tokio::test]
    async fn test_save_if_valid_keeps_invalid_out_of_storage() {
        let (store, storage) = store();
        let saved = ConnectionConfig::new("ws://localhost:8080").user_pass("a", "b");
        assert!(store.save_if_valid(&saved).unwrap().valid);

        let sibling = ConfigStore::new(Arc::new(storage.handle()));
        let mut watcher = sibling.watch();

        let broken = ConnectionConfig::new("http://localhost:8080");
        let report = store.save_if_valid(&broken).unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(store.get_config(), saved);

        // No event reached other instances
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), watcher.next());
        assert!(pending.await.is_err());
    }

    #[tokio::test]
    async fn test_watch_sees_sibling_edits_only() {
        let tab_a = MemoryStorage::new();
        let tab_b = tab_a.handle();
        let store_a = ConfigStore::new(Arc::new(tab_a));
        let store_b = ConfigStore::new(Arc::new(tab_b));

        let mut watcher = store_a.watch();

        // Own write is not reported
        store_a
            .save_config(&ConnectionConfig::new("ws://a:1"))
            .unwrap();
        // Sibling write is
        store_b
            .save_config(&ConnectionConfig::new("ws://b:1").auto_connect(true))
            .unwrap();

        let change = watcher.next().await.unwrap();
        assert_eq!(change.previous.unwrap().url, "ws://a:1");
        assert_eq!(change.current.url, "ws://b:1");
        assert!(change.current.auto_connect);
    }
}
