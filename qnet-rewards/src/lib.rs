//! Lazy reward accumulation: nodes accrue rewards in memory and only a
//! claim produces an on-chain [`Transaction`], so steady-state participation
//! does not spam the chain with one transfer per node per round.

use parking_lot::RwLock;
use qnet_core::{now_ms, Address, NodeId, Recipient, SystemPrincipal, Transaction, TxKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Below this accumulated amount a claim is refused; keeps reward-claim
/// transactions from being dwarfed by their own gas cost.
pub const MIN_CLAIM_AMOUNT: u64 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewardRecord {
    pub unclaimed: u64,
    pub total_earned: u64,
    pub last_update_ms: u64,
}

/// One entry of a node's append-only claim history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimEntry {
    pub amount: u64,
    pub timestamp_ms: u64,
    pub wallet: Address,
}

#[derive(Default)]
pub struct LazyRewardLedger {
    records: RwLock<HashMap<NodeId, RewardRecord>>,
    claim_history: RwLock<HashMap<NodeId, Vec<ClaimEntry>>>,
}

impl LazyRewardLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate_reward(&self, node_id: &NodeId, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut records = self.records.write();
        let entry = records.entry(node_id.clone()).or_default();
        entry.unclaimed = entry.unclaimed.saturating_add(amount);
        entry.total_earned = entry.total_earned.saturating_add(amount);
        entry.last_update_ms = now_ms();
    }

    /// Equal split of `total_amount` across `nodes`; the remainder from
    /// integer division is dropped, matching a ledger that never mints more
    /// than it was given to distribute.
    pub fn distribute_ping_rewards(&self, nodes: &[NodeId], total_amount: u64) {
        if nodes.is_empty() {
            return;
        }
        let share = total_amount / nodes.len() as u64;
        if share == 0 {
            return;
        }
        for node in nodes {
            self.accumulate_reward(node, share);
        }
    }

    pub fn distribute_transaction_fees(&self, fees_by_node: &[(NodeId, u64)]) {
        for (node, fee) in fees_by_node {
            self.accumulate_reward(node, *fee);
        }
    }

    pub fn unclaimed(&self, node_id: &NodeId) -> u64 {
        self.records.read().get(node_id).map(|r| r.unclaimed).unwrap_or(0)
    }

    pub fn total_earned(&self, node_id: &NodeId) -> u64 {
        self.records
            .read()
            .get(node_id)
            .map(|r| r.total_earned)
            .unwrap_or(0)
    }

    pub fn can_claim(&self, node_id: &NodeId) -> bool {
        self.unclaimed(node_id) >= MIN_CLAIM_AMOUNT
    }

    /// Zeroes the node's unclaimed balance and returns a `RewardDistribution`
    /// transaction crediting `payout_address` with the claimed amount. The
    /// caller is responsible for submitting it through the mempool.
    pub fn claim_rewards(
        &self,
        node_id: &NodeId,
        payout_address: Address,
        nonce: u64,
    ) -> Option<Transaction> {
        let mut records = self.records.write();
        let entry = records.get_mut(node_id)?;
        if entry.unclaimed < MIN_CLAIM_AMOUNT {
            return None;
        }
        let amount = entry.unclaimed;
        entry.unclaimed = 0;
        entry.last_update_ms = now_ms();
        drop(records);
        self.claim_history.write().entry(node_id.clone()).or_default().push(ClaimEntry {
            amount,
            timestamp_ms: now_ms(),
            wallet: payout_address,
        });
        let mut data = Vec::new();
        data.extend_from_slice(b"REWARD_CLAIM");
        data.push(0);
        data.extend_from_slice(node_id.as_bytes());
        data.push(0);
        data.extend_from_slice(&amount.to_be_bytes());
        Some(Transaction {
            sender: qnet_core::ZERO_ADDRESS,
            receiver: Recipient::Account(payout_address),
            amount,
            gas_price: 0,
            gas_limit: 0,
            nonce,
            timestamp: now_ms(),
            data,
            kind: TxKind::RewardDistribution,
            signature: Vec::new(),
        })
    }

    /// Rewards-pool sink used when a claim transaction needs a `Recipient`
    /// rather than a resolved address (e.g. before the node's wallet is known).
    pub fn rewards_pool_recipient() -> Recipient {
        Recipient::System(SystemPrincipal::RewardsPool)
    }

    pub fn claim_history(&self, node_id: &NodeId) -> Vec<ClaimEntry> {
        self.claim_history.read().get(node_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_adds_to_both_unclaimed_and_total() {
        let ledger = LazyRewardLedger::new();
        let node = "node-a".to_string();
        ledger.accumulate_reward(&node, 3);
        ledger.accumulate_reward(&node, 4);
        assert_eq!(ledger.unclaimed(&node), 7);
        assert_eq!(ledger.total_earned(&node), 7);
    }

    #[test]
    fn claim_below_minimum_is_refused() {
        let ledger = LazyRewardLedger::new();
        let node = "node-b".to_string();
        assert!(!ledger.can_claim(&node));
        assert!(ledger.claim_rewards(&node, [1u8; 32], 0).is_none());
    }

    #[test]
    fn claim_zeroes_unclaimed_but_keeps_total_earned() {
        let ledger = LazyRewardLedger::new();
        let node = "node-c".to_string();
        ledger.accumulate_reward(&node, 10);
        let tx = ledger.claim_rewards(&node, [2u8; 32], 5).unwrap();
        assert_eq!(tx.amount, 10);
        assert_eq!(tx.kind, TxKind::RewardDistribution);
        assert_eq!(ledger.unclaimed(&node), 0);
        assert_eq!(ledger.total_earned(&node), 10);
    }

    #[test]
    fn ping_rewards_split_equally_and_drop_remainder() {
        let ledger = LazyRewardLedger::new();
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        ledger.distribute_ping_rewards(&nodes, 10);
        assert_eq!(ledger.unclaimed(&"a".to_string()), 3);
        assert_eq!(ledger.unclaimed(&"c".to_string()), 3);
    }

    #[test]
    fn claim_appends_to_history() {
        let ledger = LazyRewardLedger::new();
        let node = "node-d".to_string();
        ledger.accumulate_reward(&node, 5);
        ledger.claim_rewards(&node, [3u8; 32], 0).unwrap();
        let history = ledger.claim_history(&node);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, 5);
        assert_eq!(history[0].wallet, [3u8; 32]);
    }

    #[test]
    fn transaction_fees_credit_the_named_node() {
        let ledger = LazyRewardLedger::new();
        ledger.distribute_transaction_fees(&[("x".to_string(), 5), ("y".to_string(), 2)]);
        assert_eq!(ledger.unclaimed(&"x".to_string()), 5);
        assert_eq!(ledger.unclaimed(&"y".to_string()), 2);
    }
}
