//! Commit-reveal round engine: collects commits and reveals for the current
//! height, determines whether enough valid reveals survived to finalise,
//! and picks a reputation-weighted deterministic leader from them.

use parking_lot::RwLock;
use qnet_core::NodeId;
use qnet_reputation::ReputationLedger;
use std::collections::HashMap;

/// Blend of reputation score vs. uniform-random weight when picking a
/// leader; 1.0 would be pure reputation, 0.0 pure chance.
const REPUTATION_INFLUENCE: f64 = 0.7;
const PARTICIPATION_REWARD: f64 = 0.05;
const LEADER_REWARD: f64 = 0.10;
const NON_PARTICIPATION_PENALTY: f64 = 0.05;

#[derive(Debug, Clone)]
struct Commit {
    commit_hash: [u8; 32],
    signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Finalized { leader: NodeId, beacon: [u8; 32] },
    Stalled,
}

#[derive(Default)]
struct HeightState {
    commits: HashMap<NodeId, Commit>,
    reveals: HashMap<NodeId, Vec<u8>>,
}

/// Runs the commit → reveal → finalise state machine for a single height at
/// a time; the orchestrator advances `height` once a round is finalised or
/// stalled.
pub struct RoundEngine {
    rounds: RwLock<HashMap<u64, HeightState>>,
    consecutive_stalls: RwLock<u32>,
}

impl Default for RoundEngine {
    fn default() -> Self {
        Self {
            rounds: RwLock::new(HashMap::new()),
            consecutive_stalls: RwLock::new(0),
        }
    }
}

impl RoundEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a commit for height `h`; a resubmission only replaces the
    /// stored entry if its signature sorts strictly greater byte-wise than
    /// the one on file, giving a total, deterministic "newer wins" order
    /// without depending on wall-clock time.
    pub fn add_commit(&self, h: u64, node: NodeId, commit_hash: [u8; 32], signature: Vec<u8>) {
        let mut rounds = self.rounds.write();
        let state = rounds.entry(h).or_default();
        match state.commits.get(&node) {
            Some(existing) if existing.signature >= signature => {}
            _ => {
                state.commits.insert(
                    node,
                    Commit {
                        commit_hash,
                        signature,
                    },
                );
            }
        }
    }

    /// Accepts a reveal iff `node` submitted a matching commit in this
    /// round; otherwise the caller should penalise the node for an invalid
    /// reveal (`reputation.apply_penalty(node, 0.2)`).
    pub fn add_reveal(&self, h: u64, node: NodeId, value: Vec<u8>, reputation: &ReputationLedger) -> bool {
        let mut rounds = self.rounds.write();
        let state = rounds.entry(h).or_default();
        let Some(commit) = state.commits.get(&node) else {
            reputation.apply_penalty(&node, 0.2);
            return false;
        };
        let digest: [u8; 32] = blake3::hash(&value).into();
        if digest != commit.commit_hash {
            reputation.apply_penalty(&node, 0.2);
            return false;
        }
        state.reveals.insert(node, value);
        true
    }

    /// `min_reveals = max(2, eligible/3)`.
    fn min_reveals(eligible_count: usize) -> usize {
        (eligible_count / 3).max(2)
    }

    /// Attempts to finalise height `h` against `eligible_nodes`, applying
    /// the reward/penalty schedule from the spec's round-finalisation rule
    /// on success.
    pub fn finalise(
        &self,
        h: u64,
        eligible_nodes: &[NodeId],
        reputation: &ReputationLedger,
    ) -> RoundOutcome {
        let valid_reveals: Vec<(NodeId, Vec<u8>)> = {
            let rounds = self.rounds.read();
            let Some(state) = rounds.get(&h) else {
                return self.record_stall();
            };
            let mut v: Vec<(NodeId, Vec<u8>)> = eligible_nodes
                .iter()
                .filter_map(|n| state.reveals.get(n).map(|r| (n.clone(), r.clone())))
                .collect();
            v.sort_by(|a, b| a.0.cmp(&b.0));
            v
        };

        if valid_reveals.len() < Self::min_reveals(eligible_nodes.len()) {
            return self.record_stall();
        }

        let beacon = compute_beacon(h, &valid_reveals);
        let candidates: Vec<NodeId> = valid_reveals.iter().map(|(n, _)| n.clone()).collect();
        let Some(leader) = select_leader(&candidates, &beacon, reputation) else {
            return self.record_stall();
        };

        for node in &candidates {
            reputation.apply_reward(node, PARTICIPATION_REWARD);
        }
        reputation.apply_reward(&leader, LEADER_REWARD);
        for node in eligible_nodes {
            if !candidates.contains(node) {
                reputation.apply_penalty(node, NON_PARTICIPATION_PENALTY);
            }
        }

        *self.consecutive_stalls.write() = 0;
        RoundOutcome::Finalized { leader, beacon }
    }

    fn record_stall(&self) -> RoundOutcome {
        *self.consecutive_stalls.write() += 1;
        RoundOutcome::Stalled
    }

    /// After 3+ consecutive stalled heights, the caller should widen the
    /// commit/reveal windows by this multiplier until a round succeeds.
    pub fn timer_multiplier(&self) -> f64 {
        if *self.consecutive_stalls.read() >= 3 {
            1.5
        } else {
            1.0
        }
    }

    pub fn clear_height(&self, h: u64) {
        self.rounds.write().remove(&h);
    }
}

fn compute_beacon(h: u64, valid_reveals: &[(NodeId, Vec<u8>)]) -> [u8; 32] {
    if valid_reveals.is_empty() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"fallback");
        hasher.update(&h.to_be_bytes());
        return hasher.finalize().into();
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(&h.to_be_bytes());
    for (_, value) in valid_reveals {
        hasher.update(value);
    }
    hasher.finalize().into()
}

/// Deterministic, reputation-weighted leader selection: each candidate's
/// weight blends its reputation score with a uniform baseline by
/// `REPUTATION_INFLUENCE`, the weights are renormalised to sum to exactly
/// 1.0 (forcing the last entry to absorb float rounding), and a PRNG seeded
/// from `H(beacon)` picks a point in `[0, 1)` to index into the resulting
/// cumulative distribution.
fn select_leader(candidates: &[NodeId], beacon: &[u8; 32], reputation: &ReputationLedger) -> Option<NodeId> {
    if candidates.is_empty() {
        return None;
    }
    let uniform = 1.0 / candidates.len() as f64;
    let mut weights: Vec<f64> = candidates
        .iter()
        .map(|n| REPUTATION_INFLUENCE * reputation.reputation(n) + (1.0 - REPUTATION_INFLUENCE) * uniform)
        .collect();
    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        for w in &mut weights {
            *w /= total;
        }
    }

    let mut cumulative = Vec::with_capacity(weights.len());
    let mut running = 0.0;
    for w in &weights {
        running += w;
        cumulative.push(running);
    }
    if let Some(last) = cumulative.last_mut() {
        *last = 1.0;
    }

    let seed_digest = blake3::hash(beacon);
    let seed = u64::from_be_bytes(seed_digest.as_bytes()[0..8].try_into().unwrap());
    let u = deterministic_unit_interval(seed);

    let idx = match cumulative.binary_search_by(|c| c.partial_cmp(&u).unwrap()) {
        Ok(i) => i,
        Err(i) => i.min(cumulative.len() - 1),
    };
    Some(candidates[idx].clone())
}

/// splitmix64 step, mapped into `[0, 1)`. Stands in for a deterministic PRNG
/// seeded from the round beacon; any node computing the same beacon derives
/// the same draw.
fn deterministic_unit_interval(mut seed: u64) -> f64 {
    seed = seed.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = seed;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_for(value: &[u8]) -> [u8; 32] {
        blake3::hash(value).into()
    }

    #[test]
    fn reveal_without_commit_is_rejected_and_penalised() {
        let engine = RoundEngine::new();
        let reputation = ReputationLedger::new("self".to_string());
        let ok = engine.add_reveal(1, "node-a".to_string(), b"value".to_vec(), &reputation);
        assert!(!ok);
        assert!(reputation.reputation(&"node-a".to_string()) < 0.5);
    }

    #[test]
    fn reveal_mismatching_commit_is_rejected() {
        let engine = RoundEngine::new();
        let reputation = ReputationLedger::new("self".to_string());
        engine.add_commit(1, "node-a".to_string(), commit_for(b"value"), vec![1]);
        let ok = engine.add_reveal(1, "node-a".to_string(), b"other".to_vec(), &reputation);
        assert!(!ok);
    }

    #[test]
    fn below_min_reveals_stalls() {
        let engine = RoundEngine::new();
        let reputation = ReputationLedger::new("self".to_string());
        engine.add_commit(1, "node-a".to_string(), commit_for(b"v"), vec![1]);
        engine.add_reveal(1, "node-a".to_string(), b"v".to_vec(), &reputation);
        let outcome = engine.finalise(1, &["node-a".to_string(), "node-b".to_string()], &reputation);
        assert_eq!(outcome, RoundOutcome::Stalled);
    }

    #[test]
    fn enough_valid_reveals_finalises_with_a_leader() {
        let engine = RoundEngine::new();
        let reputation = ReputationLedger::new("self".to_string());
        let eligible = vec!["node-a".to_string(), "node-b".to_string(), "node-c".to_string()];
        for node in &eligible {
            engine.add_commit(1, node.clone(), commit_for(node.as_bytes()), vec![1]);
            engine.add_reveal(1, node.clone(), node.as_bytes().to_vec(), &reputation);
        }
        let outcome = engine.finalise(1, &eligible, &reputation);
        match outcome {
            RoundOutcome::Finalized { leader, .. } => assert!(eligible.contains(&leader)),
            RoundOutcome::Stalled => panic!("expected finalisation"),
        }
    }

    #[test]
    fn leader_selection_is_deterministic_given_same_inputs() {
        let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let reputation = ReputationLedger::new("self".to_string());
        let beacon = [7u8; 32];
        let l1 = select_leader(&candidates, &beacon, &reputation);
        let l2 = select_leader(&candidates, &beacon, &reputation);
        assert_eq!(l1, l2);
    }

    #[test]
    fn repeated_stalls_widen_the_timer() {
        let engine = RoundEngine::new();
        let reputation = ReputationLedger::new("self".to_string());
        let eligible = vec!["node-a".to_string(), "node-b".to_string()];
        for h in 0..3 {
            engine.finalise(h, &eligible, &reputation);
        }
        assert_eq!(engine.timer_multiplier(), 1.5);
    }
}
