//! Wires every `qnet-*` component into one running node: loads
//! configuration, opens storage, loads or generates the node's identity,
//! then drives the consensus [`Orchestrator`] and the [`qnet_rpc`] server
//! side by side until shutdown.

mod keys;
mod oracle;
mod orchestrator;
mod peer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use qnet_activation::ActivationRegistry;
use qnet_config::NodeConfig;
use qnet_consensus::{PartitionDetector, RoundEngine};
use qnet_core::{CryptoProvider, TokenEconomics};
use qnet_crypto::DefaultCryptoProvider;
use qnet_mempool::{node_shards, MempoolLimits, NodeType as ShardNodeType, ShardedMempool, TransactionRouter};
use qnet_network::{AdaptiveConsensusTimer, Libp2pNetwork, NetworkConfig as P2pConfig, NetworkMetrics, NetworkService};
use qnet_reputation::ReputationLedger;
use qnet_rewards::LazyRewardLedger;
use qnet_rpc::RpcState;
use qnet_storage::SledStore;
use tracing::{error, info};

pub use orchestrator::Orchestrator;

use keys::NodeKeys;
use oracle::HttpBurnOracle;
use peer::HttpPeerClient;

/// Why `run_node` returned cleanly, so the caller can pick the right exit
/// code without re-deriving it from log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    CtrlC,
}

/// A failure during the startup sequence, tagged with the stage it occurred
/// in so the caller can map it onto the process exit codes from
/// [`qnet_config::exit_code`].
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(anyhow::Error),
    #[error("key or activation error: {0}")]
    KeyOrActivation(anyhow::Error),
    #[error("storage error: {0}")]
    Storage(anyhow::Error),
    #[error("network error: {0}")]
    Network(anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => qnet_config::exit_code::CONFIG_ERROR,
            StartupError::KeyOrActivation(_) => qnet_config::exit_code::KEY_OR_ACTIVATION_ERROR,
            StartupError::Storage(_) => qnet_config::exit_code::STORAGE_CORRUPTION,
            StartupError::Network(_) => qnet_config::exit_code::NETWORK_UNREACHABLE,
        }
    }
}

fn shard_node_type(cfg_type: qnet_config::NodeTypeOption) -> ShardNodeType {
    match cfg_type {
        qnet_config::NodeTypeOption::Light => ShardNodeType::Light,
        qnet_config::NodeTypeOption::Full => ShardNodeType::Full,
        qnet_config::NodeTypeOption::Super => ShardNodeType::Super,
    }
}

pub async fn run_node(config_path: PathBuf) -> Result<ShutdownReason, StartupError> {
    init_logging();

    let cfg = NodeConfig::load(&config_path)
        .map_err(StartupError::Config)?;
    info!("starting qnet node with config {:?}", config_path);
    let config = Arc::new(cfg);

    let crypto = Arc::new(DefaultCryptoProvider::new());
    let keys = NodeKeys::load_or_generate(std::path::Path::new(&config.storage.keys_dir), crypto.as_ref())
        .map_err(StartupError::KeyOrActivation)?;
    let node_id = qnet_core::address_to_string(&keys.address);

    let storage = Arc::new(
        SledStore::open(std::path::Path::new(&config.storage.data_dir))
            .map_err(|e| StartupError::Storage(anyhow::anyhow!(e.to_string())))?,
    );

    let reputation = Arc::new(ReputationLedger::new(node_id.clone()));
    let network_metrics = Arc::new(NetworkMetrics::new());
    let timer = Arc::new(AdaptiveConsensusTimer::with_bounds(
        network_metrics.clone(),
        config.consensus.safety_factor,
        config.consensus.min_commit_time_secs as f64,
        config.consensus.max_commit_time_secs as f64,
        config.consensus.min_commit_time_secs as f64,
        config.consensus.max_commit_time_secs as f64,
    ));
    let partition = Arc::new(PartitionDetector::new(Duration::from_secs(
        config.consensus.recovery_cooldown_secs,
    )));
    let round = Arc::new(RoundEngine::new());
    let mempool = Arc::new(ShardedMempool::new());
    let router = Arc::new(TransactionRouter::new());
    let activation = Arc::new(ActivationRegistry::new());
    let rewards = Arc::new(LazyRewardLedger::new());
    let leaders = Arc::new(RwLock::new(std::collections::HashMap::new()));
    let burn_oracle = Arc::new(HttpBurnOracle::new(config.activation.oracle_endpoint.clone()));
    let peer_client = Arc::new(HttpPeerClient::new());

    let mut network: Box<dyn NetworkService> = Box::new(
        Libp2pNetwork::new(P2pConfig {
            listen_addr: format!("/ip4/0.0.0.0/tcp/{}", config.network.port),
            seed_nodes: config.network.bootstrap_nodes.clone(),
        })
        .map_err(StartupError::Network)?,
    );
    network.start().await.map_err(StartupError::Network)?;

    let economics = TokenEconomics {
        max_supply: config.economics.max_supply,
        base_reward: config.economics.base_reward,
        halving_interval_blocks: config.economics.halving_interval_blocks,
    };

    let orchestrator = Arc::new(
        Orchestrator::new(
            config.clone(),
            crypto.clone(),
            storage.clone(),
            reputation.clone(),
            network_metrics.clone(),
            timer.clone(),
            partition.clone(),
            round.clone(),
            mempool.clone(),
            activation.clone(),
            rewards.clone(),
            leaders.clone(),
            peer_client,
            network,
            keys,
            economics,
        )
        .map_err(|e| StartupError::Storage(anyhow::anyhow!(e.to_string())))?,
    );

    let shards = node_shards(&node_id, shard_node_type(config.node.node_type));
    debug_assert_eq!(shards, orchestrator.shards, "node's own shard assignment must be reproducible from its id alone");

    let rpc_state = RpcState {
        storage,
        round,
        reputation,
        mempool,
        router,
        shards,
        mempool_limits: MempoolLimits {
            max_bytes: config.node.mempool_max_bytes,
            max_pending_per_sender: config.node.mempool_max_pending_per_sender,
        },
        activation,
        rewards,
        config: config.clone(),
        crypto: crypto as Arc<dyn CryptoProvider>,
        burn_oracle: burn_oracle as Arc<dyn qnet_activation::BurnOracle>,
        leaders,
    };
    let rpc_addr = format!("0.0.0.0:{}", config.network.api_port)
        .parse()
        .map_err(|e| StartupError::Config(anyhow::anyhow!("invalid api_port: {e}")))?;

    tokio::select! {
        _ = orchestrator.run_forever() => {
            unreachable!("the consensus round loop only ends by process termination")
        }
        result = qnet_rpc::serve(rpc_addr, rpc_state) => {
            result.map_err(StartupError::Network)?;
            Ok(ShutdownReason::CtrlC)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, stopping");
            Ok(ShutdownReason::CtrlC)
        }
    }
}

fn init_logging() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("failed to install global tracing subscriber: {e}");
    }
}
