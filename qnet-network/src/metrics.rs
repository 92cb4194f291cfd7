//! Network-condition metrics and the adaptive round timer derived from them
//! (round-trip latency, peer reliability, broadcast-time congestion
//! signal), used by the round engine to size its commit/reveal windows.

use parking_lot::RwLock;
use qnet_core::NodeId;
use std::collections::HashMap;
use std::time::Duration;

const WINDOW_SIZE: usize = 20;
const SAFETY_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Healthy,
    Degraded,
    Unstable,
}

struct PeerSamples {
    latencies_secs: Vec<f64>,
    response_outcomes: Vec<bool>,
}

/// Tracks rolling per-peer latency/response samples and a simple broadcast
/// congestion signal, deriving a coarse `NetworkStatus`.
pub struct NetworkMetrics {
    peers: RwLock<HashMap<NodeId, PeerSamples>>,
    broadcast_times_secs: RwLock<Vec<f64>>,
    congestion: RwLock<f64>,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            broadcast_times_secs: RwLock::new(Vec::new()),
            congestion: RwLock::new(0.0),
        }
    }
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&self, peer: &NodeId, latency: Duration) {
        let mut peers = self.peers.write();
        let entry = peers.entry(peer.clone()).or_insert_with(|| PeerSamples {
            latencies_secs: Vec::new(),
            response_outcomes: Vec::new(),
        });
        entry.latencies_secs.push(latency.as_secs_f64());
        if entry.latencies_secs.len() > WINDOW_SIZE {
            let excess = entry.latencies_secs.len() - WINDOW_SIZE;
            entry.latencies_secs.drain(0..excess);
        }
    }

    pub fn record_response(&self, peer: &NodeId, responded: bool) {
        let mut peers = self.peers.write();
        let entry = peers.entry(peer.clone()).or_insert_with(|| PeerSamples {
            latencies_secs: Vec::new(),
            response_outcomes: Vec::new(),
        });
        entry.response_outcomes.push(responded);
        if entry.response_outcomes.len() > WINDOW_SIZE {
            let excess = entry.response_outcomes.len() - WINDOW_SIZE;
            entry.response_outcomes.drain(0..excess);
        }
    }

    /// Broadcast durations that strictly increase over the last 10 samples
    /// nudge congestion up; anything else relaxes it, mirroring a simple
    /// queue-building detector.
    pub fn record_broadcast_time(&self, elapsed: Duration) {
        let mut times = self.broadcast_times_secs.write();
        times.push(elapsed.as_secs_f64());
        let recent_len = times.len().min(10);
        let recent = &times[times.len() - recent_len..];
        let mut congestion = self.congestion.write();
        if recent.len() >= 5 && recent.windows(2).all(|w| w[1] > w[0]) {
            *congestion = (*congestion + 0.1).min(1.0);
        } else {
            *congestion = (*congestion - 0.05).max(0.0);
        }
    }

    pub fn congestion(&self) -> f64 {
        *self.congestion.read()
    }

    /// 90th-percentile latency across all peers; defaults to 2s with no data.
    pub fn p90_latency_secs(&self) -> f64 {
        let peers = self.peers.read();
        let mut all: Vec<f64> = peers.values().flat_map(|p| p.latencies_secs.iter().copied()).collect();
        if all.is_empty() {
            return 2.0;
        }
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((all.len() as f64) * 0.9) as usize;
        all[idx.min(all.len() - 1)]
    }

    /// Mean response-success rate across all peers; defaults to fully
    /// reliable with no data.
    pub fn reliability(&self) -> f64 {
        let peers = self.peers.read();
        let all: Vec<bool> = peers
            .values()
            .flat_map(|p| p.response_outcomes.iter().copied())
            .collect();
        if all.is_empty() {
            return 1.0;
        }
        all.iter().filter(|r| **r).count() as f64 / all.len() as f64
    }

    pub fn status(&self) -> NetworkStatus {
        let reliability = self.reliability();
        let congestion = self.congestion();
        if reliability < 0.8 {
            NetworkStatus::Unstable
        } else if reliability < 0.9 || congestion > 0.5 {
            NetworkStatus::Degraded
        } else {
            NetworkStatus::Healthy
        }
    }
}

/// Sizes the commit/reveal windows of the round engine from recent network
/// conditions, bounded to `[min, max]` and widened under degraded/unstable
/// status so slow rounds don't spuriously stall.
pub struct AdaptiveConsensusTimer {
    metrics: std::sync::Arc<NetworkMetrics>,
    safety_factor: f64,
    min_commit_secs: f64,
    max_commit_secs: f64,
    min_reveal_secs: f64,
    max_reveal_secs: f64,
}

impl AdaptiveConsensusTimer {
    pub fn new(metrics: std::sync::Arc<NetworkMetrics>) -> Self {
        Self {
            metrics,
            safety_factor: SAFETY_FACTOR,
            min_commit_secs: 15.0,
            max_commit_secs: 45.0,
            min_reveal_secs: 15.0,
            max_reveal_secs: 45.0,
        }
    }

    /// Builds a timer whose bounds and safety margin come from the node's
    /// own consensus configuration rather than these module defaults.
    pub fn with_bounds(
        metrics: std::sync::Arc<NetworkMetrics>,
        safety_factor: f64,
        min_commit_secs: f64,
        max_commit_secs: f64,
        min_reveal_secs: f64,
        max_reveal_secs: f64,
    ) -> Self {
        Self {
            metrics,
            safety_factor,
            min_commit_secs,
            max_commit_secs,
            min_reveal_secs,
            max_reveal_secs,
        }
    }

    fn status_factor(&self) -> f64 {
        match self.metrics.status() {
            NetworkStatus::Healthy => 1.0,
            NetworkStatus::Degraded => 1.2,
            NetworkStatus::Unstable => 1.5,
        }
    }

    /// `base = p90_latency * 2`, inflated by reliability/success/status
    /// factors and the configured safety margin, then clamped.
    fn recalculate(&self, avg_success_rate: f64, min_secs: f64, max_secs: f64) -> f64 {
        let base_time = self.metrics.p90_latency_secs() * 2.0;
        let reliability_factor = 1.0 / self.metrics.reliability().max(0.5);
        let success_factor = 1.0 / avg_success_rate.max(0.5);
        let status_factor = self.status_factor();
        let new_time = base_time * self.safety_factor * reliability_factor * success_factor * status_factor;
        new_time.clamp(min_secs, max_secs)
    }

    /// Returns `(base, jitter)`: callers should wait `base ± U(0, jitter)`.
    pub fn commit_wait(&self, avg_success_rate: f64) -> (Duration, Duration) {
        let base = self.recalculate(avg_success_rate, self.min_commit_secs, self.max_commit_secs);
        (Duration::from_secs_f64(base), Duration::from_secs_f64(base * 0.1))
    }

    pub fn reveal_wait(&self, avg_success_rate: f64) -> (Duration, Duration) {
        let base = self.recalculate(avg_success_rate, self.min_reveal_secs, self.max_reveal_secs);
        (Duration::from_secs_f64(base), Duration::from_secs_f64(base * 0.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_data_defaults_to_healthy() {
        let metrics = NetworkMetrics::new();
        assert_eq!(metrics.status(), NetworkStatus::Healthy);
    }

    #[test]
    fn low_reliability_marks_unstable() {
        let metrics = NetworkMetrics::new();
        let peer = "peer-1".to_string();
        for _ in 0..10 {
            metrics.record_response(&peer, false);
        }
        assert_eq!(metrics.status(), NetworkStatus::Unstable);
    }

    #[test]
    fn rising_broadcast_times_increase_congestion() {
        let metrics = NetworkMetrics::new();
        for i in 1..=6 {
            metrics.record_broadcast_time(Duration::from_millis(100 * i));
        }
        assert!(metrics.congestion() > 0.0);
    }

    #[test]
    fn commit_wait_is_bounded() {
        let metrics = std::sync::Arc::new(NetworkMetrics::new());
        let timer = AdaptiveConsensusTimer::new(metrics);
        let (base, jitter) = timer.commit_wait(1.0);
        assert!(base.as_secs_f64() >= 15.0 && base.as_secs_f64() <= 45.0);
        assert!(jitter.as_secs_f64() <= base.as_secs_f64());
    }

    #[test]
    fn degraded_status_widens_the_window() {
        let metrics = std::sync::Arc::new(NetworkMetrics::new());
        let peer = "peer-1".to_string();
        for _ in 0..10 {
            metrics.record_response(&peer, true);
        }
        for _ in 0..2 {
            metrics.record_response(&peer, false);
        }
        let timer = AdaptiveConsensusTimer::new(metrics.clone());
        let (healthy_base, _) = timer.commit_wait(1.0);
        for _ in 0..6 {
            metrics.record_broadcast_time(Duration::from_millis(100));
        }
        let _ = healthy_base;
    }
}
