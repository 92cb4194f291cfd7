//! Time-decayed, multi-factor node reputation used to weight leader
//! selection in the round engine (`qnet-consensus`).

use parking_lot::RwLock;
use qnet_core::NodeId;
use std::collections::HashMap;

const HISTORY_SIZE: usize = 100;
const DEFAULT_REPUTATION: f64 = 0.5;
const MIN_RESPONSE_TIME_SAMPLES: usize = 5;
const MIN_BLOCK_QUALITY_SAMPLES: usize = 2;
const DECAY_FACTOR: f64 = 0.95;
const REGRESSION_FACTOR: f64 = 0.95;
const MEAN_SCORE: f64 = 0.5;
const SMOOTHING_FACTOR: f64 = 0.2;

const WEIGHT_PARTICIPATION: f64 = 0.4;
const WEIGHT_RESPONSE_TIME: f64 = 0.3;
const WEIGHT_BLOCK_QUALITY: f64 = 0.3;

#[derive(Debug, Default)]
struct NodeHistory {
    score: f64,
    participation: Vec<bool>,
    response_times: Vec<f64>,
    block_quality: Vec<f64>,
}

impl NodeHistory {
    fn fresh() -> Self {
        Self {
            score: DEFAULT_REPUTATION,
            ..Default::default()
        }
    }
}

fn push_capped<T>(history: &mut Vec<T>, value: T) {
    history.push(value);
    if history.len() > HISTORY_SIZE {
        let excess = history.len() - HISTORY_SIZE;
        history.drain(0..excess);
    }
}

fn decayed_average(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut weighted_sum = 0.0;
    let mut weight_sum = 0.0;
    let n = samples.len();
    for (i, value) in samples.iter().enumerate() {
        let weight = DECAY_FACTOR.powi((n - i - 1) as i32);
        weighted_sum += weight * value;
        weight_sum += weight;
    }
    if weight_sum > 0.0 {
        Some(weighted_sum / weight_sum)
    } else {
        None
    }
}

/// Tracks per-node participation, response-time and block-quality history
/// and derives a smoothed `[0, 1]` reputation score from it.
pub struct ReputationLedger {
    own_node: NodeId,
    nodes: RwLock<HashMap<NodeId, NodeHistory>>,
}

impl ReputationLedger {
    /// The local node starts with a perfect score, mirroring a node's trust
    /// in its own honesty.
    pub fn new(own_node: NodeId) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            own_node.clone(),
            NodeHistory {
                score: 1.0,
                ..Default::default()
            },
        );
        Self {
            own_node,
            nodes: RwLock::new(nodes),
        }
    }

    pub fn own_node(&self) -> &NodeId {
        &self.own_node
    }

    pub fn add_node(&self, node: &NodeId) {
        let mut nodes = self.nodes.write();
        nodes.entry(node.clone()).or_insert_with(NodeHistory::fresh);
    }

    pub fn record_participation(&self, node: &NodeId, participated: bool) {
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(node.clone()).or_insert_with(NodeHistory::fresh);
        push_capped(&mut entry.participation, participated);
        Self::recompute(entry);
    }

    pub fn record_response_time(&self, node: &NodeId, seconds: f64) {
        if seconds < 0.0 {
            return;
        }
        let mut nodes = self.nodes.write();
        let global_min_max = {
            let mut min = f64::MAX;
            let mut max = f64::MIN;
            for h in nodes.values() {
                for t in &h.response_times {
                    min = min.min(*t);
                    max = max.max(*t);
                }
            }
            (min, max)
        };
        let entry = nodes.entry(node.clone()).or_insert_with(NodeHistory::fresh);
        push_capped(&mut entry.response_times, seconds);
        Self::recompute_with_bounds(entry, global_min_max);
    }

    pub fn record_block_quality(&self, node: &NodeId, quality: f64) {
        if !(0.0..=1.0).contains(&quality) {
            return;
        }
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(node.clone()).or_insert_with(NodeHistory::fresh);
        push_capped(&mut entry.block_quality, quality);
        Self::recompute(entry);
    }

    pub fn reputation(&self, node: &NodeId) -> f64 {
        let nodes = self.nodes.read();
        nodes.get(node).map(|h| h.score).unwrap_or(DEFAULT_REPUTATION)
    }

    pub fn all_reputations(&self) -> HashMap<NodeId, f64> {
        self.nodes
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.score))
            .collect()
    }

    /// `new = max(0.1, score - score * severity)`.
    pub fn apply_penalty(&self, node: &NodeId, severity: f64) {
        let severity = severity.clamp(0.0, 1.0);
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(node.clone()).or_insert_with(NodeHistory::fresh);
        let penalty = entry.score * severity;
        entry.score = (entry.score - penalty).max(0.1);
    }

    /// `new = min(1.0, score + (1 - score) * magnitude)`.
    pub fn apply_reward(&self, node: &NodeId, magnitude: f64) {
        let magnitude = magnitude.clamp(0.0, 1.0);
        let mut nodes = self.nodes.write();
        let entry = nodes.entry(node.clone()).or_insert_with(NodeHistory::fresh);
        let reward = (1.0 - entry.score) * magnitude;
        entry.score = (entry.score + reward).min(1.0);
    }

    fn recompute(entry: &mut NodeHistory) {
        Self::recompute_with_bounds(entry, (f64::MAX, f64::MIN));
    }

    /// Blends available factors (participation always available once there is
    /// history; response time needs >=5 samples; block quality needs >=2),
    /// renormalising weights over whichever factors have enough data, then
    /// regresses 5% toward the population mean and applies a 20% EMA against
    /// the previous score.
    fn recompute_with_bounds(entry: &mut NodeHistory, global_bounds: (f64, f64)) {
        let participation_score = decayed_average(
            &entry
                .participation
                .iter()
                .map(|p| if *p { 1.0 } else { 0.0 })
                .collect::<Vec<_>>(),
        );

        let response_time_score = if entry.response_times.len() >= MIN_RESPONSE_TIME_SAMPLES {
            let (min_time, max_time) = global_bounds;
            if min_time.is_finite() && max_time.is_finite() {
                if (max_time - min_time).abs() < f64::EPSILON {
                    Some(1.0)
                } else {
                    let inverted: Vec<f64> = entry
                        .response_times
                        .iter()
                        .map(|t| 1.0 - (t - min_time) / (max_time - min_time))
                        .collect();
                    decayed_average(&inverted)
                }
            } else {
                None
            }
        } else {
            None
        };

        let block_quality_score = if entry.block_quality.len() >= MIN_BLOCK_QUALITY_SAMPLES {
            decayed_average(&entry.block_quality)
        } else {
            None
        };

        let mut total_weight = 0.0;
        let mut weighted_score = 0.0;
        if let Some(p) = participation_score {
            total_weight += WEIGHT_PARTICIPATION;
            weighted_score += p * WEIGHT_PARTICIPATION;
        }
        if let Some(r) = response_time_score {
            total_weight += WEIGHT_RESPONSE_TIME;
            weighted_score += r * WEIGHT_RESPONSE_TIME;
        }
        if let Some(b) = block_quality_score {
            total_weight += WEIGHT_BLOCK_QUALITY;
            weighted_score += b * WEIGHT_BLOCK_QUALITY;
        }

        if total_weight == 0.0 {
            return;
        }
        let normalized = weighted_score / total_weight;

        let regressed = REGRESSION_FACTOR * normalized + (1.0 - REGRESSION_FACTOR) * MEAN_SCORE;
        let smoothed = SMOOTHING_FACTOR * regressed + (1.0 - SMOOTHING_FACTOR) * entry.score;
        entry.score = smoothed.clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_node_gets_default_reputation() {
        let ledger = ReputationLedger::new("self".to_string());
        assert_eq!(ledger.reputation(&"stranger".to_string()), DEFAULT_REPUTATION);
    }

    #[test]
    fn own_node_starts_at_perfect_score() {
        let ledger = ReputationLedger::new("self".to_string());
        assert_eq!(ledger.reputation(&"self".to_string()), 1.0);
    }

    #[test]
    fn consistent_participation_raises_score_toward_one() {
        let ledger = ReputationLedger::new("self".to_string());
        let node = "peer-a".to_string();
        for _ in 0..50 {
            ledger.record_participation(&node, true);
        }
        assert!(ledger.reputation(&node) > DEFAULT_REPUTATION);
    }

    #[test]
    fn consistent_absence_lowers_score_toward_zero() {
        let ledger = ReputationLedger::new("self".to_string());
        let node = "peer-b".to_string();
        for _ in 0..50 {
            ledger.record_participation(&node, false);
        }
        assert!(ledger.reputation(&node) < DEFAULT_REPUTATION);
    }

    #[test]
    fn penalty_never_drops_score_below_floor() {
        let ledger = ReputationLedger::new("self".to_string());
        let node = "peer-c".to_string();
        for _ in 0..10 {
            ledger.apply_penalty(&node, 1.0);
        }
        assert!(ledger.reputation(&node) >= 0.1);
    }

    #[test]
    fn reward_never_exceeds_one() {
        let ledger = ReputationLedger::new("self".to_string());
        let node = "peer-d".to_string();
        for _ in 0..10 {
            ledger.apply_reward(&node, 1.0);
        }
        assert!(ledger.reputation(&node) <= 1.0);
    }

    #[test]
    fn response_time_requires_minimum_samples() {
        let ledger = ReputationLedger::new("self".to_string());
        let node = "peer-e".to_string();
        for _ in 0..3 {
            ledger.record_response_time(&node, 0.1);
        }
        // Below MIN_RESPONSE_TIME_SAMPLES, so total_weight stays 0 and the
        // score holds at default.
        assert_eq!(ledger.reputation(&node), DEFAULT_REPUTATION);
    }
}
