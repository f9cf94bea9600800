//! Periodic monitoring sweep: prunes whatever aged out of the retention
//! window and evaluates alert rules

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deploy::executor::EnterpriseDeployer;
use crate::monitoring::service::MonitoringService;

/// Monitor worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Run one sweep; returns the number of alerts raised
pub async fn sweep(monitoring: &MonitoringService, deployer: &EnterpriseDeployer) -> usize {
    let pruned = monitoring.prune();
    let released = deployer.prune_expired(monitoring.options().retention).await;
    let alerts = monitoring.evaluate_rules();
    for alert in &alerts {
        warn!(
            rule = ?alert.rule,
            severity = ?alert.severity,
            "Alert raised: {}",
            alert.message
        );
    }
    debug!(
        "Monitor sweep pruned {} points and {} deployments, raised {} alerts",
        pruned,
        released,
        alerts.len()
    );
    alerts.len()
}

/// Run the monitor worker
pub async fn run<S, F>(
    options: &Options,
    monitoring: &MonitoringService,
    deployer: &EnterpriseDeployer,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Monitor worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Monitor worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        sweep(monitoring, deployer).await;
    }
}
