//! Deployment notifications

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::DeployerError;
use crate::monitoring::events::{DeploymentObserver, LifecycleEvent};

/// Outbound notification channel (chat, email, ...)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &str, payload: &serde_json::Value) -> Result<(), DeployerError>;
}

/// Writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &str, payload: &serde_json::Value) -> Result<(), DeployerError> {
        info!(event = event, "Notification: {}", payload);
        Ok(())
    }
}

/// Forwards start, completion, failure and cancellation to a notifier
pub struct NotificationObserver {
    notifier: Arc<dyn Notifier>,
}

impl NotificationObserver {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl DeploymentObserver for NotificationObserver {
    async fn on_event(&self, event: &LifecycleEvent) {
        let notify = matches!(
            event,
            LifecycleEvent::Started { .. }
                | LifecycleEvent::Completed { .. }
                | LifecycleEvent::Failed { .. }
                | LifecycleEvent::Cancelled { .. }
        );
        if !notify {
            return;
        }

        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize {} notification: {}", event.name(), e);
                return;
            }
        };
        if let Err(e) = self.notifier.notify(event.name(), &payload).await {
            warn!(
                deployment_id = %event.deployment_id(),
                "Notifier failed for {}: {}",
                event.name(),
                e
            );
        }
    }
}
