//! Hash-sharded mempool and transaction router.
//!
//! Every transaction is assigned to one of [`TOTAL_SHARDS`] shards by the
//! first four bytes of `H(tx_hash)`; every node is assigned a handful of
//! shards by the first four bytes of `H(node_id)`. A transaction only needs
//! to reach the nodes that own its shard, bounding per-node mempool memory
//! and gossip fan-out independently of total network size.

use parking_lot::RwLock;
use qnet_core::{Address, NodeId, QNetError, QNetResult, Transaction, TxHash};
use std::collections::{HashMap, HashSet};

pub const TOTAL_SHARDS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Light,
    Full,
    Super,
}

impl NodeType {
    /// Light nodes hold no shard (they submit but never store mempool
    /// state); full nodes hold one; super nodes hold three for redundancy.
    pub fn shard_count(&self) -> u32 {
        match self {
            NodeType::Light => 0,
            NodeType::Full => 1,
            NodeType::Super => 3,
        }
    }
}

fn first_four_bytes_mod(bytes: &[u8], modulus: u32) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(buf) % modulus
}

pub fn transaction_shard(tx_hash: &TxHash) -> u32 {
    let digest = blake3::hash(tx_hash);
    first_four_bytes_mod(digest.as_bytes(), TOTAL_SHARDS)
}

/// Shards assigned to a node: a base shard derived from its id, then spaced
/// evenly around the shard ring so a node's shards don't cluster.
pub fn node_shards(node_id: &NodeId, node_type: NodeType) -> Vec<u32> {
    let k = node_type.shard_count();
    if k == 0 {
        return Vec::new();
    }
    let digest = blake3::hash(node_id.as_bytes());
    let base = first_four_bytes_mod(digest.as_bytes(), TOTAL_SHARDS);
    let spacing = TOTAL_SHARDS / k;
    (0..k).map(|i| (base + i * spacing) % TOTAL_SHARDS).collect()
}

/// A mempool partitioned by shard id. Each shard is an independent
/// hash→transaction map so inserts/removals on different shards never
/// contend.
/// Admission cap: a global byte budget for the whole pool, plus a per-sender
/// bound on how many distinct nonces it may hold pending at once, so one
/// sender flooding the pool cannot starve out the rest.
#[derive(Debug, Clone, Copy)]
pub struct MempoolLimits {
    pub max_bytes: usize,
    pub max_pending_per_sender: usize,
}

impl Default for MempoolLimits {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            max_pending_per_sender: 64,
        }
    }
}

#[derive(Default)]
pub struct ShardedMempool {
    shards: RwLock<HashMap<u32, HashMap<TxHash, Transaction>>>,
    total_bytes: RwLock<usize>,
    sender_nonces: RwLock<HashMap<Address, HashSet<u64>>>,
}

impl ShardedMempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a transaction the node itself produced (coinbase credit,
    /// activation, reward claim) unconditionally; these are never subject
    /// to the external-submission admission rules below.
    pub fn add_transaction(&self, tx: Transaction) {
        let shard = transaction_shard(&tx.hash());
        let mut shards = self.shards.write();
        shards.entry(shard).or_default().insert(tx.hash(), tx);
    }

    /// Runs the external-submission admission contract: reject a shard this
    /// node does not serve, reject an already-present hash, reject once the
    /// byte budget or a sender's pending-nonce window is exhausted.
    pub fn admit(
        &self,
        tx: Transaction,
        assigned_shards: &[u32],
        limits: &MempoolLimits,
    ) -> QNetResult<TxHash> {
        let hash = tx.hash();
        let shard = transaction_shard(&hash);
        if !assigned_shards.contains(&shard) {
            return Err(QNetError::InvalidInput(format!(
                "shard {shard} is not served by this node"
            )));
        }
        if self.contains(&hash) {
            return Err(QNetError::Conflict(
                "transaction already present in the mempool".into(),
            ));
        }
        let size = bincode::serialized_size(&tx)
            .map_err(|e| QNetError::InvalidInput(format!("cannot size transaction: {e}")))?
            as usize;
        {
            let total = self.total_bytes.read();
            if *total + size > limits.max_bytes {
                return Err(QNetError::InvalidInput(
                    "mempool byte budget exhausted".into(),
                ));
            }
        }
        {
            let mut senders = self.sender_nonces.write();
            let pending = senders.entry(tx.sender).or_default();
            if pending.len() >= limits.max_pending_per_sender && !pending.contains(&tx.nonce) {
                return Err(QNetError::InvalidInput(format!(
                    "sender already has {} pending transaction(s), at the nonce window limit of {}",
                    pending.len(),
                    limits.max_pending_per_sender
                )));
            }
            pending.insert(tx.nonce);
        }
        *self.total_bytes.write() += size;
        let mut shards = self.shards.write();
        shards.entry(shard).or_default().insert(hash, tx);
        Ok(hash)
    }

    pub fn remove_transaction(&self, hash: &TxHash) -> Option<Transaction> {
        let shard = transaction_shard(hash);
        let tx = {
            let mut shards = self.shards.write();
            let bucket = shards.get_mut(&shard)?;
            let tx = bucket.remove(hash);
            if bucket.is_empty() {
                shards.remove(&shard);
            }
            tx
        }?;
        if let Ok(size) = bincode::serialized_size(&tx) {
            let mut total = self.total_bytes.write();
            *total = total.saturating_sub(size as usize);
        }
        if let Some(pending) = self.sender_nonces.write().get_mut(&tx.sender) {
            pending.remove(&tx.nonce);
        }
        Some(tx)
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        let shard = transaction_shard(hash);
        self.shards
            .read()
            .get(&shard)
            .map(|b| b.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.shards.read().values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_len(&self, shard: u32) -> usize {
        self.shards.read().get(&shard).map(|b| b.len()).unwrap_or(0)
    }

    /// Draws up to `max_total` transactions from the given `shards`,
    /// splitting the budget evenly across shards so no single shard can
    /// starve the others out of a block.
    pub fn transactions_for_block(&self, shards: &[u32], max_total: usize) -> Vec<Transaction> {
        if shards.is_empty() || max_total == 0 {
            return Vec::new();
        }
        let per_shard_budget = (max_total / shards.len()).max(1);
        let pools = self.shards.read();
        let mut out = Vec::with_capacity(max_total);
        for shard in shards {
            let Some(bucket) = pools.get(shard) else {
                continue;
            };
            let mut txs: Vec<&Transaction> = bucket.values().collect();
            txs.sort_by(|a, b| {
                b.gas_price
                    .cmp(&a.gas_price)
                    .then_with(|| a.sender.cmp(&b.sender))
                    .then_with(|| a.nonce.cmp(&b.nonce))
                    .then_with(|| a.timestamp.cmp(&b.timestamp))
            });
            for tx in txs.into_iter().take(per_shard_budget) {
                if out.len() >= max_total {
                    return out;
                }
                out.push(tx.clone());
            }
        }
        out
    }
}

/// Maps shards to the nodes that own them, so a transaction can be routed
/// to exactly the nodes that need to see it.
#[derive(Default)]
pub struct TransactionRouter {
    node_shards: RwLock<HashMap<NodeId, Vec<u32>>>,
    shard_nodes: RwLock<HashMap<u32, Vec<NodeId>>>,
}

impl TransactionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node(&self, node_id: NodeId, node_type: NodeType) {
        let shards = node_shards(&node_id, node_type);
        let mut by_node = self.node_shards.write();
        let mut by_shard = self.shard_nodes.write();
        if let Some(previous) = by_node.remove(&node_id) {
            for shard in previous {
                if let Some(nodes) = by_shard.get_mut(&shard) {
                    nodes.retain(|n| n != &node_id);
                }
            }
        }
        for &shard in &shards {
            by_shard.entry(shard).or_default().push(node_id.clone());
        }
        by_node.insert(node_id, shards);
    }

    pub fn unregister_node(&self, node_id: &NodeId) {
        let mut by_node = self.node_shards.write();
        let mut by_shard = self.shard_nodes.write();
        if let Some(shards) = by_node.remove(node_id) {
            for shard in shards {
                if let Some(nodes) = by_shard.get_mut(&shard) {
                    nodes.retain(|n| n != node_id);
                }
            }
        }
    }

    /// Nodes responsible for storing/forwarding a given transaction.
    pub fn route(&self, tx_hash: &TxHash) -> Vec<NodeId> {
        let shard = transaction_shard(tx_hash);
        self.shard_nodes
            .read()
            .get(&shard)
            .cloned()
            .unwrap_or_default()
    }

    pub fn shards_for_node(&self, node_id: &NodeId) -> Vec<u32> {
        self.node_shards.read().get(node_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qnet_core::{Recipient, TxKind};

    fn sample_tx(nonce: u64) -> Transaction {
        Transaction {
            sender: [nonce as u8; 32],
            receiver: Recipient::Account([2u8; 32]),
            amount: 1,
            gas_price: 1,
            gas_limit: 1,
            nonce,
            timestamp: 0,
            data: vec![],
            kind: TxKind::Transfer,
            signature: vec![1],
        }
    }

    #[test]
    fn shard_assignment_is_deterministic() {
        let tx = sample_tx(1);
        let h = tx.hash();
        assert_eq!(transaction_shard(&h), transaction_shard(&h));
    }

    #[test]
    fn shard_falls_within_range() {
        for i in 0..50 {
            let shard = transaction_shard(&sample_tx(i).hash());
            assert!(shard < TOTAL_SHARDS);
        }
    }

    #[test]
    fn light_nodes_own_no_shards() {
        assert!(node_shards(&"light-1".to_string(), NodeType::Light).is_empty());
    }

    #[test]
    fn super_nodes_own_three_spaced_shards() {
        let shards = node_shards(&"super-1".to_string(), NodeType::Super);
        assert_eq!(shards.len(), 3);
        let spacing = TOTAL_SHARDS / 3;
        assert_eq!(shards[1], (shards[0] + spacing) % TOTAL_SHARDS);
    }

    #[test]
    fn mempool_add_remove_roundtrip() {
        let pool = ShardedMempool::new();
        let tx = sample_tx(1);
        let hash = tx.hash();
        pool.add_transaction(tx.clone());
        assert!(pool.contains(&hash));
        assert_eq!(pool.len(), 1);
        let removed = pool.remove_transaction(&hash).unwrap();
        assert_eq!(removed.hash(), hash);
        assert!(!pool.contains(&hash));
    }

    #[test]
    fn admission_rejects_a_shard_this_node_does_not_serve() {
        let pool = ShardedMempool::new();
        let tx = sample_tx(1);
        let shard = transaction_shard(&tx.hash());
        let foreign_shards: Vec<u32> = (0..TOTAL_SHARDS).filter(|s| *s != shard).collect();
        let err = pool
            .admit(tx, &foreign_shards, &MempoolLimits::default())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn admission_accepts_a_served_shard_and_rejects_the_duplicate() {
        let pool = ShardedMempool::new();
        let tx = sample_tx(1);
        let shard = transaction_shard(&tx.hash());
        let limits = MempoolLimits::default();
        pool.admit(tx.clone(), &[shard], &limits).unwrap();
        assert_eq!(pool.len(), 1);
        let err = pool.admit(tx, &[shard], &limits).unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(pool.len(), 1, "a replayed submission must not create a second entry");
    }

    #[test]
    fn admission_enforces_the_byte_budget() {
        let pool = ShardedMempool::new();
        let tx = sample_tx(1);
        let shard = transaction_shard(&tx.hash());
        let limits = MempoolLimits {
            max_bytes: 1,
            max_pending_per_sender: 64,
        };
        let err = pool.admit(tx, &[shard], &limits).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn admission_enforces_the_per_sender_nonce_window() {
        let pool = ShardedMempool::new();
        let limits = MempoolLimits {
            max_bytes: 64 * 1024 * 1024,
            max_pending_per_sender: 1,
        };
        let mut tx_a = sample_tx(1);
        tx_a.sender = [9u8; 32];
        let shard_a = transaction_shard(&tx_a.hash());
        pool.admit(tx_a, &[shard_a], &limits).unwrap();

        let mut tx_b = sample_tx(2);
        tx_b.sender = [9u8; 32];
        let shard_b = transaction_shard(&tx_b.hash());
        let err = pool.admit(tx_b, &[shard_b], &limits).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn block_budget_splits_evenly_across_shards() {
        let pool = ShardedMempool::new();
        for i in 0..20 {
            pool.add_transaction(sample_tx(i));
        }
        let shards: Vec<u32> = (0..TOTAL_SHARDS).collect();
        let drawn = pool.transactions_for_block(&shards, 10);
        assert!(drawn.len() <= 10);
    }

    #[test]
    fn router_sends_transaction_only_to_owning_nodes() {
        let router = TransactionRouter::new();
        router.register_node("full-1".to_string(), NodeType::Full);
        router.register_node("full-2".to_string(), NodeType::Full);
        let tx = sample_tx(1);
        let targets = router.route(&tx.hash());
        for node in &targets {
            let shards = router.shards_for_node(node);
            assert!(shards.contains(&transaction_shard(&tx.hash())));
        }
    }

    #[test]
    fn unregister_removes_node_from_shard_index() {
        let router = TransactionRouter::new();
        router.register_node("full-1".to_string(), NodeType::Full);
        router.unregister_node(&"full-1".to_string());
        assert!(router.shards_for_node(&"full-1".to_string()).is_empty());
    }
}
