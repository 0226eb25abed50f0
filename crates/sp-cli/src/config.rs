//! Configuration loading for the soar-packs CLI.
//!
//! The configuration file lists integration instances by name:
//!
//! ```yaml
//! state_dir: ~/.local/state/soar-packs
//! instances:
//!   armis-prod:
//!     integration: armis
//!     params:
//!       server_url: https://acme.armis.com
//!       api_key: ${ARMIS_API_KEY}
//! ```
//!
//! `${VAR}` references and a leading `~` are expanded before parsing.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sp_connectors::IntegrationKind;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding checkpoints and downloaded files.
    #[serde(default)]
    pub state_dir: Option<String>,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
}

/// One configured integration instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub integration: IntegrationKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Integration parameters, passed to the integration as-is.
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn default_true() -> bool {
    true
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

/// Logging settings; command-line flags take precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parses configuration text after expanding environment references.
    pub fn parse(contents: &str) -> Result<Self> {
        let expanded = shellexpand::env(contents)
            .map_err(|e| anyhow!("Failed to expand variable '{}': {}", e.var_name, e.cause))?;
        let config: Self = serde_yaml::from_str(&expanded)?;
        Ok(config)
    }

    pub fn instance(&self, name: &str) -> Result<&InstanceConfig> {
        match self.instances.get(name) {
            Some(instance) => Ok(instance),
            None if self.instances.is_empty() => {
                bail!("Unknown instance '{}'. No instances are configured", name)
            }
            None => bail!(
                "Unknown instance '{}'. Configured: {}",
                name,
                self.instances.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }

    /// State directory: flag, then config file, then the platform default.
    pub fn resolve_state_dir(&self, flag: Option<&Path>) -> PathBuf {
        if let Some(dir) = flag {
            return dir.to_path_buf();
        }
        if let Some(dir) = &self.state_dir {
            return PathBuf::from(shellexpand::tilde(dir).into_owned());
        }
        default_state_dir()
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("com", "soar-packs", "soar-packs") {
        dirs.config_dir().join("config.yaml")
    } else {
        PathBuf::from("config/soar-packs.yaml")
    }
}

pub fn default_state_dir() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("com", "soar-packs", "soar-packs") {
        dirs.data_local_dir().join("state")
    } else {
        PathBuf::from(".soar-packs")
    }
}
