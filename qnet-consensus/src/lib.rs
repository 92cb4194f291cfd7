//! Commit-reveal round engine and peer-tip partition detector.

mod partition;
mod round;

pub use partition::{HealthReport, PartitionDetector, PartitionStatus, PeerTipSummary};
pub use round::{RoundEngine, RoundOutcome};
