//! Peer transport (libp2p gossipsub) and network-condition metrics feeding
//! the adaptive round timer.

mod metrics;
mod transport;

pub use metrics::{AdaptiveConsensusTimer, NetworkMetrics, NetworkStatus};
pub use transport::{Libp2pNetwork, NetworkConfig, NetworkService};
