//! Partition detection from peer chain-tip summaries: tracks how long peers
//! have reported a taller chain than ours, and whether peers agree on a
//! different hash at our own height.

use parking_lot::RwLock;
use qnet_core::{BlockHash, NodeId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Peers below this reputation are recorded but can never by themselves
/// trigger a partition call or a fork adoption.
const MIN_TRUSTED_REPUTATION: f64 = 0.2;
const MIN_DATA_POINTS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Healthy,
    Partitioned,
}

#[derive(Debug, Clone)]
pub struct PeerTipSummary {
    pub peer: NodeId,
    pub height: u64,
    pub hash: BlockHash,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: PartitionStatus,
    pub diverging_peers: Vec<NodeId>,
    /// Peer to sync from when `status` is `Partitioned` and the cause is a
    /// height lag rather than a hash disagreement.
    pub sync_target: Option<NodeId>,
}

struct PeerState {
    observations: u32,
    taller_since: Option<Instant>,
}

pub struct PartitionDetector {
    recovery_cooldown: Duration,
    peers: RwLock<HashMap<NodeId, PeerState>>,
}

impl PartitionDetector {
    pub fn new(recovery_cooldown: Duration) -> Self {
        Self {
            recovery_cooldown,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Folds a batch of peer tip reports into the health report for this
    /// instant. Call on every gossip tick; `local_height`/`local_hash` are
    /// this node's current tip.
    pub fn evaluate(
        &self,
        local_height: u64,
        local_hash: BlockHash,
        reports: &[PeerTipSummary],
        reputations: &HashMap<NodeId, f64>,
    ) -> HealthReport {
        let now = Instant::now();
        let mut peers = self.peers.write();

        let mut taller_trusted = 0usize;
        let mut total_trusted = 0usize;
        let mut longest_taller_trusted: Option<(NodeId, Duration)> = None;
        let mut diverging_peers = Vec::new();
        let mut hash_counts: HashMap<BlockHash, Vec<NodeId>> = HashMap::new();

        for report in reports {
            let state = peers.entry(report.peer.clone()).or_insert(PeerState {
                observations: 0,
                taller_since: None,
            });
            state.observations += 1;
            if state.observations < MIN_DATA_POINTS {
                continue;
            }

            let trusted = reputations.get(&report.peer).copied().unwrap_or(0.5) >= MIN_TRUSTED_REPUTATION;

            if report.height > local_height {
                let since = *state.taller_since.get_or_insert(now);
                if trusted {
                    taller_trusted += 1;
                    let elapsed = now.duration_since(since);
                    if longest_taller_trusted
                        .as_ref()
                        .map(|(_, d)| elapsed > *d)
                        .unwrap_or(true)
                    {
                        longest_taller_trusted = Some((report.peer.clone(), elapsed));
                    }
                }
            } else {
                state.taller_since = None;
            }

            if trusted {
                total_trusted += 1;
            }

            if report.height == local_height && report.hash != local_hash {
                hash_counts.entry(report.hash).or_default().push(report.peer.clone());
                if trusted {
                    diverging_peers.push(report.peer.clone());
                }
            }
        }

        let height_partition = total_trusted > 0
            && taller_trusted * 2 > total_trusted
            && longest_taller_trusted
                .as_ref()
                .map(|(_, d)| *d >= self.recovery_cooldown)
                .unwrap_or(false);

        let hash_partition = hash_counts.values().any(|peers_for_hash| {
            peers_for_hash
                .iter()
                .filter(|p| reputations.get(*p).copied().unwrap_or(0.5) >= MIN_TRUSTED_REPUTATION)
                .count()
                >= 2
        });

        let status = if height_partition || hash_partition {
            PartitionStatus::Partitioned
        } else {
            PartitionStatus::Healthy
        };

        let sync_target = if height_partition {
            longest_taller_trusted.map(|(peer, _)| peer)
        } else {
            None
        };

        HealthReport {
            status,
            diverging_peers,
            sync_target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reputations(peers: &[&str], score: f64) -> HashMap<NodeId, f64> {
        peers.iter().map(|p| (p.to_string(), score)).collect()
    }

    #[test]
    fn no_reports_stay_healthy() {
        let detector = PartitionDetector::new(Duration::from_millis(1));
        let report = detector.evaluate(10, [0u8; 32], &[], &HashMap::new());
        assert_eq!(report.status, PartitionStatus::Healthy);
    }

    #[test]
    fn two_trusted_peers_with_different_hash_at_same_height_trigger_partition() {
        let detector = PartitionDetector::new(Duration::from_secs(60));
        let reports = vec![
            PeerTipSummary {
                peer: "peer-a".to_string(),
                height: 10,
                hash: [9u8; 32],
                timestamp: 0,
            },
            PeerTipSummary {
                peer: "peer-b".to_string(),
                height: 10,
                hash: [9u8; 32],
                timestamp: 0,
            },
        ];
        let reps = reputations(&["peer-a", "peer-b"], 0.9);
        let report = detector.evaluate(10, [1u8; 32], &reports, &reps);
        assert_eq!(report.status, PartitionStatus::Partitioned);
        assert_eq!(report.diverging_peers.len(), 2);
    }

    #[test]
    fn low_reputation_peers_cannot_trigger_a_fork_alone() {
        let detector = PartitionDetector::new(Duration::from_secs(60));
        let reports = vec![
            PeerTipSummary {
                peer: "peer-a".to_string(),
                height: 10,
                hash: [9u8; 32],
                timestamp: 0,
            },
            PeerTipSummary {
                peer: "peer-b".to_string(),
                height: 10,
                hash: [9u8; 32],
                timestamp: 0,
            },
        ];
        let reps = reputations(&["peer-a", "peer-b"], 0.1);
        let report = detector.evaluate(10, [1u8; 32], &reports, &reps);
        assert_eq!(report.status, PartitionStatus::Healthy);
    }

    #[test]
    fn sustained_majority_height_lag_triggers_partition_after_cooldown() {
        let detector = PartitionDetector::new(Duration::from_millis(5));
        let reports = vec![
            PeerTipSummary {
                peer: "peer-a".to_string(),
                height: 20,
                hash: [0u8; 32],
                timestamp: 0,
            },
            PeerTipSummary {
                peer: "peer-b".to_string(),
                height: 20,
                hash: [0u8; 32],
                timestamp: 0,
            },
        ];
        let reps = reputations(&["peer-a", "peer-b"], 0.9);
        let first = detector.evaluate(10, [1u8; 32], &reports, &reps);
        assert_eq!(first.status, PartitionStatus::Healthy);
        std::thread::sleep(Duration::from_millis(10));
        let second = detector.evaluate(10, [1u8; 32], &reports, &reps);
        assert_eq!(second.status, PartitionStatus::Partitioned);
        assert!(second.sync_target.is_some());
    }
}
