//! Target filter evaluation
//!
//! Exclude filters are evaluated first: a matching exclude removes the target
//! no matter what else matches. Include filters combine with OR; when the set
//! has no include filter every non-excluded target is retained. String
//! comparisons ignore case and numeric comparisons fail closed.

use serde_json::Value;
use tracing::debug;

use crate::models::filter::{
    CriterionStats, FilterCriterion, FilterLogic, FilterMatchStats, FilterOperator, FilterStats,
    FilterType, TargetFilter,
};
use crate::models::target::DistributionTarget;
use crate::targets::cache::FilterCache;
use crate::utils::{json_checksum, sha256_hash};

pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Look up the value a criterion tests.
///
/// Well-known fields resolve first; `metadata.<key>` and bare keys fall back
/// to the provider-specific metadata map.
pub fn resolve_field(target: &DistributionTarget, field: &str) -> Option<Value> {
    let meta = &target.metadata;
    let string = |s: &Option<String>| s.clone().map(Value::String);

    match field {
        "id" => Some(Value::String(target.id.clone())),
        "name" => Some(Value::String(target.name.clone())),
        "type" => Some(Value::String(target.target_type.as_str().to_string())),
        "strategy" => Some(Value::String(target.strategy.clone())),
        "connection" | "connection.type" => {
            Some(Value::String(target.connection.kind().to_string()))
        }
        "organization" | "metadata.organization" => string(&meta.organization),
        "environment" | "metadata.environment" => string(&meta.environment),
        "developer" | "metadata.developer" => string(&meta.developer),
        "machine" | "metadata.machine" => string(&meta.machine),
        "tags" | "metadata.tags" => Some(Value::Array(
            meta.tags.iter().cloned().map(Value::String).collect(),
        )),
        other => {
            let key = other.strip_prefix("metadata.").unwrap_or(other);
            meta.custom.get(key).cloned()
        }
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Positive form of an operator applied to one scalar
fn scalar_matches(actual: &Value, operator: FilterOperator, expected: &Value) -> bool {
    match operator {
        FilterOperator::GreaterThan | FilterOperator::LessThan => {
            let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) else {
                return false;
            };
            if operator == FilterOperator::GreaterThan {
                a > e
            } else {
                a < e
            }
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let Some(a) = as_text(actual) else {
                return false;
            };
            match expected {
                Value::Array(options) => options
                    .iter()
                    .filter_map(as_text)
                    .any(|option| option == a),
                other => as_text(other).is_some_and(|e| e == a),
            }
        }
        _ => {
            let (Some(a), Some(e)) = (as_text(actual), as_text(expected)) else {
                return false;
            };
            match operator {
                FilterOperator::Equals | FilterOperator::NotEquals => a == e,
                FilterOperator::Contains | FilterOperator::NotContains => a.contains(&e),
                FilterOperator::StartsWith => a.starts_with(&e),
                FilterOperator::EndsWith => a.ends_with(&e),
                _ => false,
            }
        }
    }
}

fn is_negation(operator: FilterOperator) -> bool {
    matches!(
        operator,
        FilterOperator::NotEquals | FilterOperator::NotContains | FilterOperator::NotIn
    )
}

/// Evaluate one criterion; list-valued fields match when any element does
pub fn criterion_matches(target: &DistributionTarget, criterion: &FilterCriterion) -> bool {
    let positive = match resolve_field(target, &criterion.field) {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| scalar_matches(item, criterion.operator, &criterion.value)),
        Some(actual) => scalar_matches(&actual, criterion.operator, &criterion.value),
    };

    if is_negation(criterion.operator) {
        !positive
    } else {
        positive
    }
}

/// Evaluate one filter's criteria under its logic; an empty filter never matches
pub fn filter_matches(target: &DistributionTarget, filter: &TargetFilter) -> bool {
    if filter.criteria.is_empty() {
        return false;
    }
    match filter.logic {
        FilterLogic::And => filter.criteria.iter().all(|c| criterion_matches(target, c)),
        FilterLogic::Or => filter.criteria.iter().any(|c| criterion_matches(target, c)),
    }
}

/// Verdict for one target against a filter set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Included,
    Excluded,
    NotMatched,
}

impl Verdict {
    pub fn retained(&self) -> bool {
        matches!(self, Verdict::Included)
    }
}

pub fn verdict(target: &DistributionTarget, filters: &[TargetFilter]) -> Verdict {
    let (excludes, includes): (Vec<&TargetFilter>, Vec<&TargetFilter>) = filters
        .iter()
        .partition(|f| f.filter_type == FilterType::Exclude);

    if excludes.iter().any(|f| filter_matches(target, f)) {
        return Verdict::Excluded;
    }
    if includes.is_empty() || includes.iter().any(|f| filter_matches(target, f)) {
        Verdict::Included
    } else {
        Verdict::NotMatched
    }
}

/// Stable key for a filter set
pub fn filter_set_key(filters: &[TargetFilter]) -> String {
    match serde_json::to_value(filters) {
        Ok(value) => json_checksum(&value),
        Err(_) => sha256_hash(format!("{:?}", filters).as_bytes()),
    }
}

fn target_key(target: &DistributionTarget) -> String {
    match serde_json::to_value(target) {
        Ok(value) => json_checksum(&value),
        Err(_) => sha256_hash(target.id.as_bytes()),
    }
}

/// Filter evaluation with result and statistics caching
pub struct FilterEngine {
    verdicts: FilterCache<Verdict>,
    stats: FilterCache<FilterStats>,
}

impl FilterEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            verdicts: FilterCache::new(capacity),
            stats: FilterCache::new(capacity.clamp(1, 256)),
        }
    }

    /// Whether the target is retained by the filter set
    pub fn evaluate(&self, target: &DistributionTarget, filters: &[TargetFilter]) -> bool {
        self.verdict_with_key(target, filters, &filter_set_key(filters))
            .retained()
    }

    fn verdict_with_key(
        &self,
        target: &DistributionTarget,
        filters: &[TargetFilter],
        set_key: &str,
    ) -> Verdict {
        let key = format!("{}:{}", set_key, target_key(target));
        self.verdicts
            .get_or_insert_with(&key, || verdict(target, filters))
    }

    /// Retain targets passing the filter set, preserving order
    pub fn apply(
        &self,
        targets: &[DistributionTarget],
        filters: &[TargetFilter],
    ) -> Vec<DistributionTarget> {
        if filters.is_empty() {
            return targets.to_vec();
        }
        let set_key = filter_set_key(filters);
        let retained: Vec<DistributionTarget> = targets
            .iter()
            .filter(|t| self.verdict_with_key(t, filters, &set_key).retained())
            .cloned()
            .collect();
        debug!(
            "Filters retained {}/{} targets",
            retained.len(),
            targets.len()
        );
        retained
    }

    /// Match statistics for the filter set over the targets; repeated calls
    /// with the same inputs return the cached result
    pub fn get_filter_stats(
        &self,
        targets: &[DistributionTarget],
        filters: &[TargetFilter],
    ) -> FilterStats {
        let mut fingerprint = filter_set_key(filters);
        for target in targets {
            fingerprint.push_str(&target_key(target));
        }
        let key = sha256_hash(fingerprint.as_bytes());

        self.stats
            .get_or_insert_with(&key, || compute_stats(targets, filters))
    }

    pub fn clear_cache(&self) {
        self.verdicts.clear();
        self.stats.clear();
    }
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

fn compute_stats(targets: &[DistributionTarget], filters: &[TargetFilter]) -> FilterStats {
    let mut matched = 0;
    let mut excluded = 0;
    for target in targets {
        match verdict(target, filters) {
            Verdict::Included => matched += 1,
            Verdict::Excluded => excluded += 1,
            Verdict::NotMatched => {}
        }
    }

    let mut filter_stats = Vec::with_capacity(filters.len());
    let mut criteria_stats = Vec::new();
    for (index, filter) in filters.iter().enumerate() {
        let label = filter.label(index);
        filter_stats.push(FilterMatchStats {
            filter: label.clone(),
            filter_type: filter.filter_type,
            matches: targets.iter().filter(|t| filter_matches(t, filter)).count(),
        });
        for criterion in &filter.criteria {
            criteria_stats.push(CriterionStats {
                filter: label.clone(),
                field: criterion.field.clone(),
                operator: criterion.operator,
                matches: targets
                    .iter()
                    .filter(|t| criterion_matches(t, criterion))
                    .count(),
            });
        }
    }

    FilterStats {
        total_targets: targets.len(),
        matched_targets: matched,
        excluded_targets: excluded,
        filters: filter_stats,
        criteria: criteria_stats,
    }
}
