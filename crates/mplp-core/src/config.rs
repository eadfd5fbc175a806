//! Runtime configuration for the coordination core

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::CoreError;

/// How the workflow engine maps steps onto transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    /// One transaction spans the whole instance; a failure compensates every completed step
    PerInstance,
    /// Each step commits its own transaction; a failure leaves earlier steps in place
    PerStep,
}

impl FromStr for TransactionScope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_instance" | "per-instance" | "instance" => Ok(TransactionScope::PerInstance),
            "per_step" | "per-step" | "step" => Ok(TransactionScope::PerStep),
            other => Err(CoreError::ConfigurationError(format!(
                "Unsupported transaction scope: {}",
                other
            ))),
        }
    }
}

/// Coordination configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Transaction granularity for workflow instances
    #[serde(default = "default_transaction_scope")]
    pub transaction_scope: TransactionScope,

    /// Steps run concurrently per instance when the definition sets no bound
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Timeout for transactions opened without an explicit one
    #[serde(default)]
    pub default_transaction_timeout_ms: Option<u64>,

    /// Timeout for step invocations whose step sets none
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,

    /// Interval of the expired-transaction sweep; disabled when unset
    #[serde(default = "default_timeout_sweep_interval_ms")]
    pub timeout_sweep_interval_ms: Option<u64>,
}

fn default_transaction_scope() -> TransactionScope {
    TransactionScope::PerInstance
}

fn default_max_concurrent_steps() -> usize {
    4
}

fn default_timeout_sweep_interval_ms() -> Option<u64> {
    Some(1000)
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            transaction_scope: default_transaction_scope(),
            max_concurrent_steps: default_max_concurrent_steps(),
            default_transaction_timeout_ms: None,
            default_step_timeout_ms: None,
            timeout_sweep_interval_ms: default_timeout_sweep_interval_ms(),
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from `MPLP_*` environment variables
    pub fn load() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through a variable lookup, keeping defaults for
    /// missing or unparseable values
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(scope) = lookup("MPLP_TRANSACTION_SCOPE") {
            match scope.parse() {
                Ok(scope) => config.transaction_scope = scope,
                Err(e) => warn!("Invalid MPLP_TRANSACTION_SCOPE: {}, using default", e),
            }
        }

        if let Some(max) = lookup("MPLP_MAX_CONCURRENT_STEPS") {
            match max.parse::<usize>() {
                Ok(max) if max > 0 => config.max_concurrent_steps = max,
                _ => warn!("Invalid MPLP_MAX_CONCURRENT_STEPS: {}, using default", max),
            }
        }

        if let Some(value) = lookup("MPLP_TRANSACTION_TIMEOUT_MS") {
            match parse_optional_millis(&value) {
                Some(ms) => config.default_transaction_timeout_ms = ms,
                None => warn!("Invalid MPLP_TRANSACTION_TIMEOUT_MS: {}, using default", value),
            }
        }

        if let Some(value) = lookup("MPLP_STEP_TIMEOUT_MS") {
            match parse_optional_millis(&value) {
                Some(ms) => config.default_step_timeout_ms = ms,
                None => warn!("Invalid MPLP_STEP_TIMEOUT_MS: {}, using default", value),
            }
        }

        if let Some(value) = lookup("MPLP_TIMEOUT_SWEEP_INTERVAL_MS") {
            match parse_optional_millis(&value) {
                Some(ms) => config.timeout_sweep_interval_ms = ms,
                None => warn!(
                    "Invalid MPLP_TIMEOUT_SWEEP_INTERVAL_MS: {}, using default",
                    value
                ),
            }
        }

        config
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_steps == 0 {
            return Err(CoreError::ConfigurationError(
                "max_concurrent_steps must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("default_transaction_timeout_ms", self.default_transaction_timeout_ms),
            ("default_step_timeout_ms", self.default_step_timeout_ms),
            ("timeout_sweep_interval_ms", self.timeout_sweep_interval_ms),
        ] {
            if value == Some(0) {
                return Err(CoreError::ConfigurationError(format!(
                    "{} must be positive when set",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Default transaction timeout
    pub fn default_transaction_timeout(&self) -> Option<Duration> {
        self.default_transaction_timeout_ms.map(Duration::from_millis)
    }

    /// Default step timeout
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_ms.map(Duration::from_millis)
    }

    /// Timeout sweep interval
    pub fn timeout_sweep_interval(&self) -> Option<Duration> {
        self.timeout_sweep_interval_ms.map(Duration::from_millis)
    }
}

/// `"none"` or `"off"` clears the value; `None` means unparseable
fn parse_optional_millis(value: &str) -> Option<Option<u64>> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("off") => Some(None),
        v => v.parse::<u64>().ok().filter(|ms| *ms > 0).map(Some),
    }
}
