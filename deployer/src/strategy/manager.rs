//! Strategy registry and recommendation

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::errors::DeployerError;
use crate::models::target::DistributionTarget;
use crate::strategy::DeploymentStrategy;

/// Key returned when no single strategy fits the fleet
pub const HYBRID_STRATEGY: &str = "hybrid";

/// Fleets above this size are recommended the hybrid approach
pub const LARGE_SCALE_THRESHOLD: usize = 500;

/// Plurality share below which the recommendation falls back to hybrid
pub const MIN_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecommendation {
    pub strategy: String,
    /// Share of targets using the plurality strategy (0.0-1.0)
    pub confidence: f64,
    pub reasons: Vec<String>,
    /// Strategy keys in use with their target counts, most used first
    pub distribution: Vec<(String, usize)>,
}

/// Connectivity problem found during pre-flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityIssue {
    pub target_id: String,
    pub message: String,
}

/// Registry mapping strategy keys to implementations
pub struct StrategyManager {
    strategies: RwLock<HashMap<String, Arc<dyn DeploymentStrategy>>>,
}

impl StrategyManager {
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
        }
    }

    /// Register a strategy under its own key, replacing any previous one
    pub fn register(&self, strategy: Arc<dyn DeploymentStrategy>) {
        let key = strategy.key().to_string();
        let mut strategies = self.strategies.write().unwrap_or_else(|e| e.into_inner());
        if strategies.insert(key.clone(), strategy).is_some() {
            warn!("Replaced existing strategy registration: {}", key);
        } else {
            info!("Registered deployment strategy: {}", key);
        }
    }

    pub fn unregister(&self, key: &str) -> Option<Arc<dyn DeploymentStrategy>> {
        let mut strategies = self.strategies.write().unwrap_or_else(|e| e.into_inner());
        strategies.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn DeploymentStrategy>> {
        let strategies = self.strategies.read().unwrap_or_else(|e| e.into_inner());
        strategies.get(key).cloned()
    }

    /// Strategy for a target, or `NotFound`
    pub fn for_target(
        &self,
        target: &DistributionTarget,
    ) -> Result<Arc<dyn DeploymentStrategy>, DeployerError> {
        self.get(&target.strategy).ok_or_else(|| {
            DeployerError::NotFound(format!(
                "no strategy registered for key '{}' (target {})",
                target.strategy, target.id
            ))
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        let strategies = self.strategies.read().unwrap_or_else(|e| e.into_inner());
        strategies.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let strategies = self.strategies.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = strategies.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Recommend a strategy from the target mix
    pub fn recommend_strategy(&self, targets: &[DistributionTarget]) -> StrategyRecommendation {
        recommend_strategy(targets)
    }

    /// Probe every target's connectivity, at most `concurrency` at a time
    pub async fn validate_connectivity_all(
        &self,
        targets: &[DistributionTarget],
        concurrency: usize,
    ) -> Vec<ConnectivityIssue> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let checks = targets.iter().map(|target| {
            let semaphore = semaphore.clone();
            let strategy = self.get(&target.strategy);
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                let Some(strategy) = strategy else {
                    return Some(ConnectivityIssue {
                        target_id: target.id.clone(),
                        message: format!("no strategy registered for '{}'", target.strategy),
                    });
                };
                match strategy.validate_connectivity(target).await {
                    Ok(()) => {
                        debug!(target_id = %target.id, "Connectivity check passed");
                        None
                    }
                    Err(e) => Some(ConnectivityIssue {
                        target_id: target.id.clone(),
                        message: e.to_string(),
                    }),
                }
            }
        });

        join_all(checks).await.into_iter().flatten().collect()
    }
}

impl Default for StrategyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Plurality strategy among the targets, falling back to hybrid when the
/// fleet is mixed (confidence below 50%) or very large (more than 500 targets).
pub fn recommend_strategy(targets: &[DistributionTarget]) -> StrategyRecommendation {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for target in targets {
        *counts.entry(target.strategy.as_str()).or_default() += 1;
    }

    let mut distribution: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(key, count)| (key.to_string(), count))
        .collect();
    // most used first, ties broken by key for a stable answer
    distribution.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let Some((top_key, top_count)) = distribution.first().cloned() else {
        return StrategyRecommendation {
            strategy: HYBRID_STRATEGY.to_string(),
            confidence: 0.0,
            reasons: vec!["No targets to analyse".to_string()],
            distribution,
        };
    };

    let confidence = top_count as f64 / targets.len() as f64;
    let mut reasons = vec![format!(
        "{} of {} targets use the '{}' strategy",
        top_count,
        targets.len(),
        top_key
    )];

    let mut strategy = top_key;
    if confidence < MIN_CONFIDENCE {
        reasons.push(format!(
            "No strategy covers at least {:.0}% of targets",
            MIN_CONFIDENCE * 100.0
        ));
        strategy = HYBRID_STRATEGY.to_string();
    }
    if targets.len() > LARGE_SCALE_THRESHOLD {
        reasons.push(format!(
            "{} targets exceeds the large-scale threshold of {}",
            targets.len(),
            LARGE_SCALE_THRESHOLD
        ));
        strategy = HYBRID_STRATEGY.to_string();
    }

    StrategyRecommendation {
        strategy,
        confidence,
        reasons,
        distribution,
    }
}
