//! Drives the per-height commit → reveal → finalise round loop, feeding
//! every other component and composing the cross-component transitions none
//! of them are allowed to do on their own: block append, reward credit, and
//! mempool eviction happen here, under one lock, or not at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock};
use qnet_activation::ActivationRegistry;
use qnet_config::NodeConfig;
use qnet_consensus::{HealthReport, PartitionDetector, PartitionStatus, PeerTipSummary, RoundEngine, RoundOutcome};
use qnet_core::{
    now_ms, Address, Block, BlockHeader, ChainState, CryptoProvider, ExecutionEngine, NodeId,
    QNetError, QNetResult, Recipient, Transaction, TokenEconomics, TxKind,
};
use qnet_mempool::{node_shards, NodeType as ShardNodeType, ShardedMempool};
use qnet_network::{AdaptiveConsensusTimer, NetworkMetrics, NetworkService};
use qnet_reputation::ReputationLedger;
use qnet_rewards::LazyRewardLedger;
use qnet_storage::SledStore;
use rand::RngCore;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::keys::NodeKeys;
use crate::peer::{with_retry, PeerClient};

/// Reward for participating honestly in a round is paid out through
/// reputation (`RoundEngine`); block production pays the coinbase. Blocks
/// produced slower than this many seconds earn a lower quality score.
const QUALITY_TARGET_SECS: f64 = 5.0;

fn shard_node_type(cfg_type: qnet_config::NodeTypeOption) -> ShardNodeType {
    match cfg_type {
        qnet_config::NodeTypeOption::Light => ShardNodeType::Light,
        qnet_config::NodeTypeOption::Full => ShardNodeType::Full,
        qnet_config::NodeTypeOption::Super => ShardNodeType::Super,
    }
}

pub struct Orchestrator<C: CryptoProvider> {
    pub config: Arc<NodeConfig>,
    pub crypto: Arc<C>,
    pub storage: Arc<SledStore>,
    pub reputation: Arc<ReputationLedger>,
    pub network_metrics: Arc<NetworkMetrics>,
    pub timer: Arc<AdaptiveConsensusTimer>,
    pub partition: Arc<PartitionDetector>,
    pub round: Arc<RoundEngine>,
    pub mempool: Arc<ShardedMempool>,
    pub activation: Arc<ActivationRegistry>,
    pub rewards: Arc<LazyRewardLedger>,
    pub leaders: Arc<RwLock<HashMap<u64, NodeId>>>,
    pub peer_client: Arc<dyn PeerClient>,
    pub network: AsyncMutex<Box<dyn NetworkService>>,
    pub keys: NodeKeys,
    pub node_id: NodeId,
    pub economics: TokenEconomics,
    pub shards: Vec<u32>,
    state: SyncMutex<ChainState>,
}

impl<C: CryptoProvider> Orchestrator<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<NodeConfig>,
        crypto: Arc<C>,
        storage: Arc<SledStore>,
        reputation: Arc<ReputationLedger>,
        network_metrics: Arc<NetworkMetrics>,
        timer: Arc<AdaptiveConsensusTimer>,
        partition: Arc<PartitionDetector>,
        round: Arc<RoundEngine>,
        mempool: Arc<ShardedMempool>,
        activation: Arc<ActivationRegistry>,
        rewards: Arc<LazyRewardLedger>,
        leaders: Arc<RwLock<HashMap<u64, NodeId>>>,
        peer_client: Arc<dyn PeerClient>,
        network: Box<dyn NetworkService>,
        keys: NodeKeys,
        economics: TokenEconomics,
    ) -> QNetResult<Self> {
        let node_id = qnet_core::address_to_string(&keys.address);
        let shards = node_shards(&node_id, shard_node_type(config.node.node_type));
        let state = storage.load_state()?.unwrap_or_default();
        reputation.add_node(&node_id);
        Ok(Self {
            config,
            crypto,
            storage,
            reputation,
            network_metrics,
            timer,
            partition,
            round,
            mempool,
            activation,
            rewards,
            leaders,
            peer_client,
            network: AsyncMutex::new(network),
            keys,
            node_id,
            economics,
            shards,
            state: SyncMutex::new(state),
        })
    }

    pub fn address(&self) -> Address {
        self.keys.address
    }

    fn eligible_nodes(&self) -> Vec<NodeId> {
        self.reputation.all_reputations().into_keys().collect()
    }

    fn known_peer_urls(&self) -> Vec<String> {
        self.storage
            .list_peers()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !matches!(self.storage.is_blacklisted(&p.address), Ok(true)))
            .map(|p| p.address)
            .collect()
    }

    fn chain_tip_header(&self) -> QNetResult<BlockHeader> {
        let height = self.storage.chain_tip_height()?;
        if height == 0 {
            if let Some(genesis) = self.storage.get_block_by_height(0)? {
                return Ok(genesis.header);
            }
            return Ok(genesis_header());
        }
        let block = self
            .storage
            .get_block_by_height(height)?
            .ok_or_else(|| QNetError::Fatal(format!("missing block at recorded tip height {height}")))?;
        Ok(block.header)
    }

    /// Runs the round loop until the process is stopped; a single round's
    /// failure is logged and the loop continues at the next height.
    pub async fn run_forever(self: Arc<Self>) {
        loop {
            if let Err(e) = self.run_round().await {
                error!("consensus round failed: {e}");
                tokio::time::sleep(Duration::from_secs(self.config.consensus.round_interval_secs)).await;
            }
        }
    }

    async fn run_round(&self) -> QNetResult<()> {
        let tip = self.chain_tip_header()?;
        let height = tip.height + 1;

        if let Some(report) = self.check_partition(&tip).await? {
            warn!(
                "partition detected at height {}: {} diverging peer(s)",
                tip.height,
                report.diverging_peers.len()
            );
            if report.diverging_peers.is_empty() {
                if let Some(target) = report.sync_target.clone() {
                    self.sync_from_peer(&target, tip.height).await?;
                } else {
                    tokio::time::sleep(Duration::from_secs(self.config.consensus.round_interval_secs)).await;
                }
            } else {
                error!(
                    "chain hash disagreement among trusted peers at height {}; halting block acceptance for operator review",
                    tip.height
                );
                tokio::time::sleep(Duration::from_secs(self.config.consensus.round_interval_secs)).await;
            }
            return Ok(());
        }

        let (commit_value, nonce) = random_commit_material();
        let commit_hash: [u8; 32] = blake3::hash(&commit_material(&commit_value, &nonce)).into();
        let commit_sig = self
            .crypto
            .sign_message(&self.keys.material.secret_key, commit_signing_message(height, &commit_hash).as_slice())
            .map_err(|e| QNetError::Fatal(format!("signing commit: {e}")))?;
        self.round
            .add_commit(height, self.node_id.clone(), commit_hash, commit_sig.clone());
        self.broadcast_commit(height, commit_hash, &commit_sig).await;

        let reliability = self.network_metrics.reliability();
        let (commit_base, commit_jitter) = self.timer.commit_wait(reliability);
        tokio::time::sleep(commit_base + jitter(commit_jitter)).await;

        let reveal_value = commit_material(&commit_value, &nonce);
        self.round
            .add_reveal(height, self.node_id.clone(), reveal_value.clone(), &self.reputation);
        self.broadcast_reveal(height, &reveal_value).await;

        let (reveal_base, reveal_jitter) = self.timer.reveal_wait(reliability);
        tokio::time::sleep(reveal_base + jitter(reveal_jitter)).await;

        let eligible = self.eligible_nodes();
        let outcome = self.round.finalise(height, &eligible, &self.reputation);
        self.round.clear_height(height);

        match outcome {
            RoundOutcome::Stalled => {
                debug!("round stalled at height {height}");
                tokio::time::sleep(Duration::from_secs_f64(
                    self.config.consensus.round_interval_secs as f64 * self.round.timer_multiplier(),
                ))
                .await;
                Ok(())
            }
            RoundOutcome::Finalized { leader, beacon } => {
                self.leaders.write().insert(height, leader.clone());
                if leader == self.node_id {
                    self.produce_block(height, beacon, &tip).await
                } else {
                    self.await_block_from_leader(height, &leader).await
                }
            }
        }
    }

    async fn check_partition(&self, tip: &BlockHeader) -> QNetResult<Option<HealthReport>> {
        let peers = self.known_peer_urls();
        if peers.is_empty() {
            return Ok(None);
        }
        let mut reports = Vec::with_capacity(peers.len());
        for peer in &peers {
            match with_retry(|| self.peer_client.fetch_tip(peer)).await {
                Ok(summary) => reports.push(summary),
                Err(e) => debug!("could not fetch tip from {peer}: {e}"),
            }
        }
        let reputations = self.reputation.all_reputations();
        let health = self.partition.evaluate(tip.height, tip.hash(), &reports, &reputations);
        if health.status == PartitionStatus::Partitioned {
            Ok(Some(health))
        } else {
            Ok(None)
        }
    }

    /// Pulls blocks from `peer` starting at `from_height + 1`, applying each
    /// through the execution engine; the first block that fails the
    /// validator stops the sync and leaves the chain exactly as it was
    /// (partial syncs are never committed).
    async fn sync_from_peer(&self, peer: &str, from_height: u64) -> QNetResult<()> {
        let blocks = with_retry(|| self.peer_client.fetch_blocks(peer, from_height + 1, 500)).await?;
        if blocks.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().clone();
        let mut prev = self.chain_tip_header()?;
        let engine = ExecutionEngine::new(self.crypto.as_ref(), self.economics, self.config.node.max_block_size_kb as u64 * 1024);
        for block in &blocks {
            if let Err(e) = block.check_structure(&prev) {
                error!("sync from {peer} halted: block {} failed structural validation: {e}", block.header.height);
                return Err(QNetError::Fatal(format!(
                    "partition recovery from {peer} rejected at height {}: {e}",
                    block.header.height
                )));
            }
            if let Err(e) = engine.apply_block(&mut state, block) {
                error!("sync from {peer} halted: block {} failed execution: {e}", block.header.height);
                return Err(QNetError::Fatal(format!(
                    "partition recovery from {peer} rejected at height {}: {e}",
                    block.header.height
                )));
            }
            prev = block.header.clone();
        }
        for block in &blocks {
            self.storage.insert_block(block)?;
        }
        self.storage.save_state(&state)?;
        *self.state.lock() = state;
        info!("adopted {} block(s) from {peer} during partition recovery", blocks.len());
        Ok(())
    }

    async fn broadcast_commit(&self, height: u64, commit_hash: [u8; 32], signature: &[u8]) {
        for peer in self.known_peer_urls() {
            let peer_client = self.peer_client.clone();
            let node_id = self.node_id.clone();
            let signature = signature.to_vec();
            if let Err(e) = with_retry(|| peer_client.broadcast_commit(&peer, height, &node_id, commit_hash, &signature)).await {
                debug!("commit broadcast to {peer} failed: {e}");
            }
        }
    }

    async fn broadcast_reveal(&self, height: u64, value: &[u8]) {
        for peer in self.known_peer_urls() {
            let peer_client = self.peer_client.clone();
            let node_id = self.node_id.clone();
            if let Err(e) = with_retry(|| peer_client.broadcast_reveal(&peer, height, &node_id, value)).await {
                debug!("reveal broadcast to {peer} failed: {e}");
            }
        }
    }

    /// Not the leader this height: poll the store briefly for the block the
    /// leader should broadcast in. If it never arrives, the next round just
    /// retries at the same height.
    async fn await_block_from_leader(&self, height: u64, leader: &NodeId) -> QNetResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.consensus.round_interval_secs);
        while tokio::time::Instant::now() < deadline {
            if self.storage.chain_tip_height()? >= height {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        debug!("no block observed from leader {leader} for height {height} within the round window");
        Ok(())
    }

    async fn produce_block(
        &self,
        height: u64,
        beacon: [u8; 32],
        prev: &BlockHeader,
    ) -> QNetResult<()> {
        let started = std::time::Instant::now();
        let mut state = self.state.lock().clone();
        let engine = ExecutionEngine::new(
            self.crypto.as_ref(),
            self.economics,
            self.config.node.max_block_size_kb as u64 * 1024,
        );

        let candidates = self
            .mempool
            .transactions_for_block(&self.shards, self.config.node.max_tx_per_block.saturating_sub(1));
        let mut accepted = Vec::with_capacity(candidates.len());
        for tx in candidates {
            match engine.verify_transaction(&state, &tx) {
                Ok(()) => accepted.push(tx),
                Err(e) => {
                    debug!("dropping transaction {} from block: {e}", hex::encode(tx.hash()));
                    self.mempool.remove_transaction(&tx.hash());
                }
            }
        }

        let reward = self.economics.base_reward(height);
        let coinbase = Transaction {
            sender: qnet_core::ZERO_ADDRESS,
            receiver: Recipient::Account(self.keys.address),
            amount: reward,
            gas_price: 0,
            gas_limit: 0,
            nonce: 0,
            timestamp: now_ms(),
            data: vec![],
            kind: TxKind::Coinbase,
            signature: vec![],
        };

        let mut transactions = Vec::with_capacity(accepted.len() + 1);
        transactions.push(coinbase);
        transactions.extend(accepted);

        let merkle_root = qnet_core::merkle_root(&transactions);
        let header = BlockHeader {
            height,
            prev_hash: prev.hash(),
            timestamp: now_ms(),
            merkle_root,
            producer: self.keys.address,
            producer_pubkey: self.keys.material.public_key.clone(),
            beacon,
            round_number: height,
            nonce: 0,
        };
        let producer_signature = self
            .crypto
            .sign_message(&self.keys.material.secret_key, &header.signing_bytes())
            .map_err(|e| QNetError::Fatal(format!("signing block header: {e}")))?;
        let block = Block {
            header,
            transactions,
            producer_signature,
        };

        if let Err(e) = self.validate_own_block(&block, prev) {
            self.reputation.apply_penalty(&self.node_id, 0.2);
            return Err(e);
        }

        engine.apply_block(&mut state, &block)?;
        self.storage.insert_block(&block)?;
        self.storage.save_state(&state)?;
        *self.state.lock() = state;

        for tx in block.transactions.iter().skip(1) {
            self.mempool.remove_transaction(&tx.hash());
        }

        self.rewards.accumulate_reward(&self.node_id, reward);
        let elapsed = started.elapsed().as_secs_f64().max(0.001);
        let quality = (QUALITY_TARGET_SECS / elapsed).clamp(0.1, 1.0);
        self.reputation.record_block_quality(&self.node_id, quality);
        self.reputation.apply_reward(&self.node_id, 0.2);

        self.gossip_block(block).await;
        info!("produced block {height} with {} transaction(s)", self.storage.get_block_by_height(height)?.map(|b| b.transactions.len()).unwrap_or(0));
        Ok(())
    }

    /// Producer-side structural + authorisation check: the header chains
    /// correctly, and the signing key belongs to an active full/super
    /// activation (a light node, or an unactivated key, must never produce).
    fn validate_own_block(&self, block: &Block, prev: &BlockHeader) -> QNetResult<()> {
        block.check_structure(prev)?;
        let verified = self
            .crypto
            .verify_signature(
                &block.header.producer_pubkey,
                &block.header.signing_bytes(),
                &block.producer_signature,
            )
            .map_err(|e| QNetError::Fatal(e.to_string()))?;
        if !verified {
            return Err(QNetError::Fatal("producer signature does not verify".into()));
        }
        if !self.activation.is_node_active(&block.header.producer_pubkey) {
            return Err(QNetError::Unauthorized(
                "producer has no active node-activation record".into(),
            ));
        }
        Ok(())
    }

    async fn gossip_block(&self, block: Block) {
        let mut network = self.network.lock().await;
        if let Err(e) = network.broadcast_block(block).await {
            warn!("block gossip failed: {e}");
        }
    }
}

fn genesis_header() -> BlockHeader {
    BlockHeader {
        height: 0,
        prev_hash: [0u8; 32],
        timestamp: 0,
        merkle_root: [0u8; 32],
        producer: qnet_core::ZERO_ADDRESS,
        producer_pubkey: vec![],
        beacon: [0u8; 32],
        round_number: 0,
        nonce: 0,
    }
}

fn random_commit_material() -> (Vec<u8>, Vec<u8>) {
    let mut value = vec![0u8; 32];
    let mut nonce = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut value);
    rand::thread_rng().fill_bytes(&mut nonce);
    (value, nonce)
}

fn commit_material(value: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + nonce.len());
    out.extend_from_slice(value);
    out.extend_from_slice(nonce);
    out
}

fn commit_signing_message(height: u64, commit_hash: &[u8; 32]) -> Vec<u8> {
    format!("{height}:{}", hex::encode(commit_hash)).into_bytes()
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = max.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().next_u64() % millis)
}
