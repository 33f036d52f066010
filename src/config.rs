use std::env;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime configuration, loaded from a TOML file with environment
/// variable overrides applied on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dialog: DialogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Upper bound for a single inbound protocol frame.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogConfig {
    /// Seconds a dialog stays on screen when the request carries no timeout.
    #[serde(default = "default_dialog_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Title used for notifications that do not supply their own.
    #[serde(default = "default_notification_title")]
    pub notification_title: String,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_dialog_timeout_secs(),
            notification_title: default_notification_title(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Command line flags win over both the config file and the environment.
    pub fn apply_cli_overrides(&mut self, timeout_secs: Option<u64>) {
        if let Some(timeout) = timeout_secs {
            self.dialog.default_timeout_secs = timeout;
        }
    }

    fn apply_env_overrides(&mut self) {
        let timeout = env::var("PING_PRINCIPAL_RS_TIMEOUT").ok();
        let title = env::var("PING_PRINCIPAL_RS_NOTIFICATION_TITLE").ok();
        self.apply_env_values(timeout.as_deref(), title.as_deref());
    }

    fn apply_env_values(&mut self, timeout: Option<&str>, title: Option<&str>) {
        if let Some(value) = timeout {
            if let Ok(parsed) = value.parse::<u64>() {
                if parsed > 0 {
                    self.dialog.default_timeout_secs = parsed;
                }
            }
        }
        if let Some(value) = title {
            if !value.trim().is_empty() {
                self.dialog.notification_title = value.trim().to_owned();
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dialog.default_timeout_secs == 0 {
            bail!("dialog.default_timeout_secs must be greater than zero");
        }
        if self.dialog.notification_title.trim().is_empty() {
            bail!("dialog.notification_title must not be empty");
        }
        if self.server.max_message_bytes == 0 {
            bail!("server.max_message_bytes must be greater than zero");
        }
        Ok(())
    }
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_dialog_timeout_secs() -> u64 {
    300
}

fn default_notification_title() -> String {
    "Ping Principal".to_owned()
}
