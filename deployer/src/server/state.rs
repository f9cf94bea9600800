//! Server state

use std::sync::Arc;

use crate::deploy::executor::EnterpriseDeployer;
use crate::monitoring::service::MonitoringService;
use crate::targets::manager::TargetManager;

/// Server state shared across handlers
pub struct ServerState {
    pub deployer: Arc<EnterpriseDeployer>,
    pub monitoring: Arc<MonitoringService>,
    pub targets: Arc<TargetManager>,
}

impl ServerState {
    pub fn new(
        deployer: Arc<EnterpriseDeployer>,
        monitoring: Arc<MonitoringService>,
        targets: Arc<TargetManager>,
    ) -> Self {
        Self {
            deployer,
            monitoring,
            targets,
        }
    }
}
