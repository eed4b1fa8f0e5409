//! Application (process) configuration
//!
//! Loaded in layers: built-in defaults, the YAML/TOML/JSON service file, then
//! `MBMASTER_*` environment variables (nested keys split on `__`, e.g.
//! `MBMASTER_RECONNECT__MAX_DELAY_SECS=30`). Command-line flags win over all.

use std::path::{Path, PathBuf};

use figment::providers::Serialized;
use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};
use crate::runtime::reconnect::ReconnectPolicy;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/mbmaster.yaml";
/// Environment variable prefix
pub const ENV_PREFIX: &str = "MBMASTER";

/// Application configuration root structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    "mbmaster".to_string()
}

/// Log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily rolling files; console only when absent
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Location of the persisted connection tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    /// Write the tree back on shutdown
    #[serde(default = "default_save_on_exit")]
    pub save_on_exit: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            save_on_exit: default_save_on_exit(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("config/connections.yaml")
}

fn default_save_on_exit() -> bool {
    true
}

/// Command-line overrides applied on top of file and environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub state_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl AppConfig {
    /// Load from defaults, the config file and the environment
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut figment = common::config_loader::layered_figment::<AppConfig>(Some(path), ENV_PREFIX)?;

        if let Some(state_path) = &overrides.state_path {
            figment = figment.merge(Serialized::default("state.path", state_path));
        }
        if let Some(level) = &overrides.log_level {
            figment = figment.merge(Serialized::default("logging.level", level));
        }

        let config: AppConfig = figment
            .extract()
            .map_err(|e| MasterError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(MasterError::config("service.name cannot be empty"));
        }
        self.reconnect.validate()
    }

    /// Logging settings in the shape expected by `common::logging`
    pub fn log_config(&self) -> common::LogConfig {
        common::LogConfig {
            service_name: self.service.name.clone(),
            level: self.logging.level.clone(),
            log_dir: common::logging::resolve_log_dir(self.logging.dir.as_deref()),
            console: true,
            enable_json: self.logging.json,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load(
            Some(Path::new("/nonexistent/mbmaster.yaml")),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(config.service.name, "mbmaster");
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.state.path, PathBuf::from("config/connections.yaml"));
    }

    #[test]
    fn test_file_and_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "logging:\n  level: debug\nreconnect:\n  initial_delay_secs: 2\n  step_secs: 3\n  max_delay_secs: 20\n"
        )
        .unwrap();

        let overrides = Overrides {
            state_path: Some(PathBuf::from("/tmp/tree.json")),
            log_level: Some("warn".to_string()),
        };
        let config = AppConfig::load(Some(file.path()), &overrides).unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.state.path, PathBuf::from("/tmp/tree.json"));
        assert_eq!(config.reconnect.step_secs, 3);
        assert_eq!(config.reconnect.max_delay_secs, 20);
    }

    #[test]
    fn test_invalid_reconnect_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "reconnect:\n  initial_delay_secs: 10\n  step_secs: 2\n  max_delay_secs: 5\n"
        )
        .unwrap();
        let result = AppConfig::load(Some(file.path()), &Overrides::default());
        assert!(matches!(result, Err(MasterError::Config(_))));
    }
}
