//! Application configuration options

use std::time::Duration;

use crate::deploy::executor::DeployerOptions;
use crate::monitoring::service::MonitoringOptions;
use crate::rollback::service::RollbackOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::strategy::RetryPolicy;
use crate::utils::BackoffPolicy;
use crate::workers::monitor;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub lifecycle: LifecycleOptions,

    pub storage: StorageLayout,

    pub deployer: DeployerOptions,

    /// Backoff between health check attempts
    pub health_backoff: BackoffPolicy,

    /// Capacity of the filter verdict cache
    pub filter_cache_capacity: usize,

    pub monitoring: MonitoringOptions,

    pub monitor_worker: monitor::Options,

    pub rollback: RollbackOptions,

    /// Enable the HTTP API
    pub enable_server: bool,

    pub server: ServerOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageLayout::default(),
            deployer: DeployerOptions::default(),
            health_backoff: BackoffPolicy::default(),
            filter_cache_capacity: crate::targets::filter::DEFAULT_CACHE_CAPACITY,
            monitoring: MonitoringOptions::default(),
            monitor_worker: monitor::Options::default(),
            rollback: RollbackOptions::default(),
            enable_server: false,
            server: ServerOptions::default(),
        }
    }
}

impl AppOptions {
    /// Options from a settings file rooted at `layout`
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: layout,
            deployer: DeployerOptions {
                required_payload_fields: settings.deployer.required_payload_fields.clone(),
                canary_fraction: settings.deployer.canary_fraction,
                canary_observation: settings.deployer.canary_observation,
                preflight_connectivity: settings.deployer.preflight_connectivity,
                retry: RetryPolicy {
                    backoff: settings.health.backoff.clone(),
                    ..Default::default()
                },
            },
            health_backoff: settings.health.backoff.clone(),
            filter_cache_capacity: settings.deployer.filter_cache_capacity,
            monitoring: MonitoringOptions {
                retention: settings.monitoring.retention,
                thresholds: settings.monitoring.thresholds.clone(),
            },
            monitor_worker: monitor::Options {
                interval: settings.monitoring.sweep_interval,
            },
            rollback: settings.rollback.clone(),
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP API server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
