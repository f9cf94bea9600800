//! Target registry

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::DeployerError;
use crate::models::target::{DistributionTarget, TargetType};

/// Source of target records (LDAP, Kubernetes, SSH config, ...)
#[async_trait]
pub trait TargetDiscovery: Send + Sync {
    fn name(&self) -> &str;

    async fn discover(&self) -> Result<Vec<DistributionTarget>, DeployerError>;
}

/// Query over the registered targets; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetQuery {
    #[serde(default)]
    pub target_type: Option<TargetType>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    /// Target must carry every listed tag
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TargetQuery {
    pub fn matches(&self, target: &DistributionTarget) -> bool {
        fn eq_opt(want: &Option<String>, have: &Option<String>) -> bool {
            match want {
                None => true,
                Some(w) => have.as_deref().is_some_and(|h| h.eq_ignore_ascii_case(w)),
            }
        }

        self.target_type.is_none_or(|t| t == target.target_type)
            && self
                .strategy
                .as_deref()
                .is_none_or(|s| s == target.strategy)
            && eq_opt(&self.environment, &target.metadata.environment)
            && eq_opt(&self.organization, &target.metadata.organization)
            && self.tags.iter().all(|tag| {
                target
                    .metadata
                    .tags
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(tag))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_strategy: BTreeMap<String, usize>,
    pub by_environment: BTreeMap<String, usize>,
}

/// Outcome of reconciling one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub added: usize,
    pub updated: usize,
    pub rejected: usize,
    pub failed_providers: Vec<String>,
}

/// Holds discovered target records keyed by id
pub struct TargetManager {
    targets: RwLock<HashMap<String, DistributionTarget>>,
}

impl TargetManager {
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Check a record has the fields the orchestrator relies on
    pub fn validate(target: &DistributionTarget) -> Result<(), DeployerError> {
        if target.id.trim().is_empty() {
            return Err(DeployerError::ValidationError("target id is empty".to_string()));
        }
        if target.name.trim().is_empty() {
            return Err(DeployerError::ValidationError(format!(
                "target {} has an empty name",
                target.id
            )));
        }
        if target.strategy.trim().is_empty() {
            return Err(DeployerError::ValidationError(format!(
                "target {} has no strategy key",
                target.id
            )));
        }
        Ok(())
    }

    /// Insert or reconcile a target by id.
    ///
    /// Returns `true` when the target was new. `discovered_at` of an existing
    /// record is kept; `last_seen` is refreshed.
    pub fn upsert(&self, mut target: DistributionTarget) -> Result<bool, DeployerError> {
        Self::validate(&target)?;
        let now = Utc::now();
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());

        let is_new = match targets.get(&target.id) {
            Some(existing) => {
                target.discovered_at = existing.discovered_at.or(Some(now));
                false
            }
            None => {
                target.discovered_at = target.discovered_at.or(Some(now));
                true
            }
        };
        target.last_seen = Some(now);
        targets.insert(target.id.clone(), target);
        Ok(is_new)
    }

    pub fn remove(&self, target_id: &str) -> Option<DistributionTarget> {
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        targets.remove(target_id)
    }

    pub fn get(&self, target_id: &str) -> Option<DistributionTarget> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        targets.get(target_id).cloned()
    }

    /// Resolve ids in order, skipping unknown ones
    pub fn get_many(&self, target_ids: &[String]) -> Vec<DistributionTarget> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        target_ids
            .iter()
            .filter_map(|id| targets.get(id).cloned())
            .collect()
    }

    /// All targets sorted by id
    pub fn list(&self) -> Vec<DistributionTarget> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<DistributionTarget> = targets.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn query(&self, query: &TargetQuery) -> Vec<DistributionTarget> {
        self.list()
            .into_iter()
            .filter(|t| query.matches(t))
            .collect()
    }

    pub fn len(&self) -> usize {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TargetStats {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = TargetStats {
            total: targets.len(),
            ..Default::default()
        };
        for target in targets.values() {
            *stats
                .by_type
                .entry(target.target_type.as_str().to_string())
                .or_default() += 1;
            *stats.by_strategy.entry(target.strategy.clone()).or_default() += 1;
            let env = target
                .metadata
                .environment
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            *stats.by_environment.entry(env).or_default() += 1;
        }
        stats
    }

    /// Run every provider and reconcile the results by id.
    ///
    /// A failing provider is reported and skipped; invalid records are rejected.
    pub async fn discover(&self, providers: &[Arc<dyn TargetDiscovery>]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for provider in providers {
            let discovered = match provider.discover().await {
                Ok(targets) => targets,
                Err(e) => {
                    warn!("Discovery provider {} failed: {}", provider.name(), e);
                    report.failed_providers.push(provider.name().to_string());
                    continue;
                }
            };

            debug!("Provider {} returned {} targets", provider.name(), discovered.len());
            for target in discovered {
                let id = target.id.clone();
                match self.upsert(target) {
                    Ok(true) => report.added += 1,
                    Ok(false) => report.updated += 1,
                    Err(e) => {
                        warn!("Rejected target '{}' from {}: {}", id, provider.name(), e);
                        report.rejected += 1;
                    }
                }
            }
        }

        info!(
            "Discovery finished: {} added, {} updated, {} rejected",
            report.added, report.updated, report.rejected
        );
        report
    }
}

impl Default for TargetManager {
    fn default() -> Self {
        Self::new()
    }
}
