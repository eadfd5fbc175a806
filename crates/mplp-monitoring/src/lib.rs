//! Logging setup for the MPLP coordination services.

use serde::{Deserialize, Serialize};
use std::env;
use tracing::{info, warn};

pub mod logging;

pub use logging::{init_logging, init_test_logging, LogExt};

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Log level filter (e.g., "info,mplp_core=debug"); `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Emit JSON instead of pretty logs on stdout
    #[serde(default)]
    pub enable_json_logging: bool,
    /// Also write JSON logs to this file, rotated daily
    #[serde(default)]
    pub log_file: Option<String>,
    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_service_name() -> String {
    "mplp".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            enable_json_logging: false,
            log_file: None,
            environment: default_environment(),
        }
    }
}

impl MonitoringConfig {
    /// Load configuration from `MPLP_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through a variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("MPLP_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(filter) = lookup("MPLP_LOG_FILTER") {
            config.log_filter = filter;
        }
        if let Some(json) = lookup("MPLP_LOG_JSON") {
            match json.parse::<bool>() {
                Ok(json) => config.enable_json_logging = json,
                Err(_) => warn!("Invalid MPLP_LOG_JSON: {}, using default", json),
            }
        }
        if let Some(file) = lookup("MPLP_LOG_FILE") {
            config.log_file = Some(file).filter(|f| !f.is_empty());
        }
        if let Some(environment) = lookup("MPLP_ENVIRONMENT") {
            config.environment = environment;
        }

        config
    }
}

/// Initialize monitoring system
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    init_logging(config)?;
    info!(environment = %config.environment, "Monitoring initialized");
    Ok(())
}

/// Shutdown the monitoring system
pub fn shutdown() {
    info!("Shutting down monitoring system");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let config = MonitoringConfig::default();
        assert_eq!(config.service_name, "mplp");
        assert_eq!(config.log_filter, "info");
        assert!(!config.enable_json_logging);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("MPLP_SERVICE_NAME", "coordinator"),
            ("MPLP_LOG_FILTER", "debug,mplp_core=trace"),
            ("MPLP_LOG_JSON", "true"),
            ("MPLP_LOG_FILE", "/var/log/mplp/core.log"),
        ]
        .into_iter()
        .collect();

        let config = MonitoringConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.service_name, "coordinator");
        assert_eq!(config.log_filter, "debug,mplp_core=trace");
        assert!(config.enable_json_logging);
        assert_eq!(config.log_file.as_deref(), Some("/var/log/mplp/core.log"));
        assert_eq!(config.environment, "dev");
    }

    #[test]
    fn test_invalid_json_flag_keeps_default() {
        let config = MonitoringConfig::from_lookup(|name| {
            (name == "MPLP_LOG_JSON").then(|| "sometimes".to_string())
        });
        assert!(!config.enable_json_logging);
    }
}
