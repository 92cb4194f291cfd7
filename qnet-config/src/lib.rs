//! Layered, immutable node configuration: a TOML file plus `QNET__`-prefixed
//! environment overrides, covering every option group enumerated in the
//! node specification (network, consensus, node, storage, activation,
//! regional).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    pub network_id: String,
    pub port: u16,
    pub api_port: u16,
    pub max_peers: u32,
    pub min_peers: u32,
    pub bootstrap_nodes: Vec<String>,
    pub use_upnp: bool,
    pub use_broadcast: bool,
    pub discovery_interval_secs: u64,
    pub dns_seeds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSection {
    pub round_interval_secs: u64,
    pub reputation_influence: f64,
    pub safety_factor: f64,
    pub partition_detection_interval_secs: u64,
    pub recovery_cooldown_secs: u64,
    pub min_commit_time_secs: u64,
    pub max_commit_time_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTypeOption {
    Light,
    Full,
    Super,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub node_type: NodeTypeOption,
    pub mining_enabled: bool,
    pub max_tx_per_block: usize,
    pub max_block_size_kb: usize,
    pub mempool_max_bytes: usize,
    pub mempool_max_pending_per_sender: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    pub data_dir: String,
    pub keys_dir: String,
    pub max_chain_length: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationSection {
    pub burn_address: String,
    pub required_burn_light: u64,
    pub required_burn_full: u64,
    pub required_burn_super: u64,
    pub token_mint: String,
    pub oracle_endpoint: String,
    pub transfer_cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionalSection {
    pub node_region: Option<String>,
    pub prefer_regional_peers: bool,
    pub max_inter_regional_connections: u32,
    pub regional_latency_threshold_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicsSection {
    pub max_supply: u64,
    pub base_reward: u64,
    pub halving_interval_blocks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: NetworkSection,
    pub consensus: ConsensusSection,
    pub node: NodeSection,
    pub storage: StorageSection,
    pub activation: ActivationSection,
    pub regional: RegionalSection,
    pub economics: EconomicsSection,
}

impl NodeConfig {
    /// Loads from a TOML file, then layers `QNET__SECTION__KEY`-style
    /// environment overrides on top (e.g. `QNET__NETWORK__PORT=9090`).
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("QNET").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Default values documented inline, used by `qnet-cli init` to write a
    /// starter file and by tests that need a config without touching disk.
    pub fn example() -> Self {
        Self {
            network: NetworkSection {
                network_id: "qnet-mainnet".into(),
                port: 9876,
                api_port: 8080,
                max_peers: 50,
                min_peers: 3,
                bootstrap_nodes: vec![],
                use_upnp: true,
                use_broadcast: true,
                discovery_interval_secs: 300,
                dns_seeds: vec![],
            },
            consensus: ConsensusSection {
                round_interval_secs: 10,
                reputation_influence: 0.7,
                safety_factor: 1.5,
                partition_detection_interval_secs: 300,
                recovery_cooldown_secs: 600,
                min_commit_time_secs: 15,
                max_commit_time_secs: 45,
            },
            node: NodeSection {
                node_type: NodeTypeOption::Full,
                mining_enabled: true,
                max_tx_per_block: 1000,
                max_block_size_kb: 500,
                mempool_max_bytes: 64 * 1024 * 1024,
                mempool_max_pending_per_sender: 64,
            },
            storage: StorageSection {
                data_dir: "./data".into(),
                keys_dir: "./keys".into(),
                max_chain_length: None,
            },
            activation: ActivationSection {
                burn_address: "QNET_BURN_1111111111111111111111".into(),
                required_burn_light: 500,
                required_burn_full: 1500,
                required_burn_super: 5000,
                token_mint: "QNC".into(),
                oracle_endpoint: "https://burn-oracle.qnet.example/verify".into(),
                transfer_cooldown_secs: 3600,
            },
            regional: RegionalSection {
                node_region: None,
                prefer_regional_peers: false,
                max_inter_regional_connections: 10,
                regional_latency_threshold_ms: 250,
            },
            economics: EconomicsSection {
                max_supply: 2_100_000_000_000_000,
                base_reward: 16384_000000,
                halving_interval_blocks: 5_256_000,
            },
        }
    }
}

/// Process exit codes for the node binary, per the external-interface spec.
pub mod exit_code {
    pub const CLEAN_SHUTDOWN: i32 = 0;
    pub const CONFIG_ERROR: i32 = 64;
    pub const KEY_OR_ACTIVATION_ERROR: i32 = 65;
    pub const STORAGE_CORRUPTION: i32 = 70;
    pub const NETWORK_UNREACHABLE: i32 = 75;
    pub const SIGINT: i32 = 130;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_round_trips_through_toml() {
        let cfg = NodeConfig::example();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, cfg.network.port);
        assert_eq!(parsed.node.node_type, NodeTypeOption::Full);
    }
}
