//! Batch planning for the rollout algorithms

use crate::models::target::DistributionTarget;

/// Fraction of targets deployed first in a canary rollout
pub const DEFAULT_CANARY_FRACTION: f64 = 0.1;

/// Split targets into consecutive batches of at most `batch_size`.
///
/// A batch size of 0 is treated as 1.
pub fn partition_batches<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    items
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// `ceil(fraction * total)`, at least 1 and at most `total`
pub fn canary_size(total: usize, fraction: f64) -> usize {
    if total == 0 {
        return 0;
    }
    let size = (total as f64 * fraction).ceil() as usize;
    size.clamp(1, total)
}

/// Whether `failed / processed` is strictly above `threshold`
pub fn threshold_exceeded(failed: usize, processed: usize, threshold: f64) -> bool {
    if processed == 0 {
        return false;
    }
    (failed as f64 / processed as f64) > threshold
}

/// Ordering rank of an environment label for staged rollouts
fn stage_rank(environment: Option<&str>) -> usize {
    match environment.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("dev") | Some("development") | Some("local") => 0,
        Some("test") | Some("qa") => 1,
        Some("staging") | Some("stage") | Some("preprod") => 2,
        Some("prod") | Some("production") => 3,
        _ => 4,
    }
}

/// Group targets into environment stages, least critical first.
///
/// Order within a stage follows the input order. Empty stages are dropped.
pub fn staged_groups(targets: &[DistributionTarget]) -> Vec<(String, Vec<DistributionTarget>)> {
    const NAMES: [&str; 5] = ["development", "test", "staging", "production", "other"];

    let mut stages: Vec<Vec<DistributionTarget>> = vec![Vec::new(); NAMES.len()];
    for target in targets {
        let rank = stage_rank(target.metadata.environment.as_deref());
        stages[rank].push(target.clone());
    }

    NAMES
        .iter()
        .zip(stages)
        .filter(|(_, group)| !group.is_empty())
        .map(|(name, group)| (name.to_string(), group))
        .collect()
}
