//! Provider controller configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use infrakit_common::telemetry::LogFormat;
use infrakit_common::{Error, Result};

fn default_concurrency() -> usize {
    4
}

fn default_error_backoff_secs() -> u64 {
    60
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_connection_params_retry_secs() -> u64 {
    30
}

/// Settings for one provider's controller instance
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionConfig {
    /// Provider id; requests labeled with another id are ignored
    #[serde(default)]
    pub provider_id: String,

    /// Display name published in the provider status
    #[serde(default)]
    pub name: String,

    /// Description published in the provider status
    #[serde(default)]
    pub description: String,

    /// Maximum number of requests reconciled in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Requeue interval after a fatal step failure
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,

    /// Interval between provider health checks
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Requeue interval while connection parameters are missing
    #[serde(default = "default_connection_params_retry_secs")]
    pub connection_params_retry_secs: u64,

    /// Re-run the orphan sweep at this interval; start-up only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            provider_id: String::new(),
            name: String::new(),
            description: String::new(),
            concurrency: default_concurrency(),
            error_backoff_secs: default_error_backoff_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            connection_params_retry_secs: default_connection_params_retry_secs(),
            sweep_interval_secs: None,
            log_format: LogFormat::default(),
        }
    }
}

impl ProvisionConfig {
    /// Config for `provider_id` with every other field defaulted
    pub fn for_provider(provider_id: impl Into<String>) -> Self {
        let provider_id = provider_id.into();
        Self {
            name: provider_id.clone(),
            provider_id,
            ..Default::default()
        }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.provider_id.is_empty() {
            return Err(Error::Config("providerId cannot be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.health_check_interval_secs == 0 {
            return Err(Error::Config("healthCheckIntervalSecs must be at least 1".into()));
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(Error::Config("sweepIntervalSecs must be at least 1".into()));
        }
        Ok(())
    }

    /// Backoff applied after a fatal step failure
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    /// Interval between health checks
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Requeue interval while connection parameters are missing
    pub fn connection_params_retry(&self) -> Duration {
        Duration::from_secs(self.connection_params_retry_secs)
    }

    /// Periodic orphan sweep interval
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}
