//! Settings
//!
//! Process-level settings for the wirelink binary: where the profile lives,
//! how reconnects back off, how logs look. Loaded from a TOML file with
//! environment variable overrides.
//!
//! The connection document itself (url, credentials, auto-connect) is not a
//! setting; it lives in the profile and is managed by
//! [`ConfigStore`](crate::store::ConfigStore).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::ReconnectPolicy;

/// Main settings structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub profile: ProfileSettings,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Profile storage location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSettings {
    #[serde(default = "default_profile_dir")]
    pub dir: String,

    /// How often to look for edits made by other processes (ms)
    #[serde(default = "default_watch_interval")]
    pub watch_interval_ms: u64,
}

fn default_profile_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("wirelink").to_string_lossy().to_string())
        .unwrap_or_else(|| "./wirelink_profile".to_string())
}

fn default_watch_interval() -> u64 {
    500
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            dir: default_profile_dir(),
            watch_interval_ms: default_watch_interval(),
        }
    }
}

impl ProfileSettings {
    /// Profile directory with a leading `~/` expanded
    pub fn path(&self) -> PathBuf {
        match (self.dir.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&self.dir),
        }
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }
}

/// Automatic reconnect backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectSettings {
    pub fn to_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms)),
            max_attempts: self.max_attempts,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingSettings {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Settings {
    /// Load settings from a file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|error| SettingsError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Defaults plus environment variable overrides
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        settings
    }

    /// Load settings with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, SettingsError> {
        let mut settings = Self::load(path)?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        for path in Self::default_paths() {
            if path.exists() {
                match Self::load_with_env(&path) {
                    Ok(settings) => {
                        tracing::info!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load settings from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::debug!("Using default settings with environment overrides");
        Self::from_env()
    }

    /// Candidate settings files, most specific first
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("wirelink").join("config.toml")),
            Some(PathBuf::from("./wirelink.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Apply environment variable overrides to existing settings
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("WIRELINK_PROFILE_DIR") {
            self.profile.dir = dir;
        }

        if let Some(level) = lookup("WIRELINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("WIRELINK_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse settings file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate default settings file content
pub fn generate_default_settings() -> String {
    r#"# wirelink settings
#
# Environment variables override these settings:
# - WIRELINK_PROFILE_DIR
# - WIRELINK_LOG_LEVEL
# - WIRELINK_LOG_FORMAT

[profile]
# Directory holding the profile (connection config and other keys)
dir = "~/.local/share/wirelink"

# How often to check for edits made by other processes (ms)
watch_interval_ms = 500

[reconnect]
# Delay before the first reconnect attempt (ms)
initial_delay_ms = 1000

# Upper bound for the exponential backoff (ms)
max_delay_ms = 30000

# Attempts per dropped link before giving up
max_attempts = 5

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
