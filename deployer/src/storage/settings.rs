//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::monitoring::rules::AlertThresholds;
use crate::rollback::service::RollbackOptions;
use crate::utils::{duration_secs, BackoffPolicy};

/// Deployer settings, read from `settings.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,

    /// Overrides the default storage base directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<String>,

    #[serde(default)]
    pub deployer: DeployerSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub rollback: RollbackOptions,

    #[serde(default)]
    pub server: ServerSettings,
}

impl Settings {
    /// Read settings; a missing file yields the defaults
    pub async fn load(file: &File) -> Result<Self, DeployerError> {
        let settings: Settings = file.read_json_opt().await?.unwrap_or_default();
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), DeployerError> {
        if !(0.0..=1.0).contains(&self.deployer.canary_fraction) {
            return Err(DeployerError::ConfigError(format!(
                "deployer.canary_fraction {} is outside [0, 1]",
                self.deployer.canary_fraction
            )));
        }
        if self.health.backoff.multiplier < 1.0 {
            return Err(DeployerError::ConfigError(
                "health.backoff.multiplier must be at least 1".to_string(),
            ));
        }
        if self.deployer.filter_cache_capacity == 0 {
            return Err(DeployerError::ConfigError(
                "deployer.filter_cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub json: bool,

    /// Also write daily-rolling files under the storage `logs/` directory
    #[serde(default)]
    pub file: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            file: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployerSettings {
    #[serde(default = "default_required_fields")]
    pub required_payload_fields: Vec<String>,

    #[serde(default = "default_canary_fraction")]
    pub canary_fraction: f64,

    #[serde(default = "default_canary_observation", with = "duration_secs")]
    pub canary_observation: Duration,

    #[serde(default = "default_true")]
    pub preflight_connectivity: bool,

    #[serde(default = "default_filter_cache_capacity")]
    pub filter_cache_capacity: usize,
}

fn default_required_fields() -> Vec<String> {
    vec!["version".to_string()]
}

fn default_canary_fraction() -> f64 {
    0.1
}

fn default_canary_observation() -> Duration {
    Duration::from_secs(30)
}

fn default_filter_cache_capacity() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for DeployerSettings {
    fn default() -> Self {
        Self {
            required_payload_fields: default_required_fields(),
            canary_fraction: default_canary_fraction(),
            canary_observation: default_canary_observation(),
            preflight_connectivity: true,
            filter_cache_capacity: default_filter_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSettings {
    /// How long metric points are kept
    #[serde(default = "default_retention", with = "duration_secs")]
    pub retention: Duration,

    /// Interval of the rule evaluation and pruning sweep
    #[serde(default = "default_sweep_interval", with = "duration_secs")]
    pub sweep_interval: Duration,

    #[serde(default)]
    pub thresholds: AlertThresholds,
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            sweep_interval: default_sweep_interval(),
            thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
        }
    }
}
