//! Embedded ordered key-value persistence over [`sled`], organised into the
//! column families named in the node's external-interface spec: `blocks`,
//! `headers`, `tx_index`, `state`, `activations_by_burn`,
//! `activations_by_wallet`, `reward_ledger`, `reputation`, `peers`.
//!
//! Every write that must be atomic across two trees (activation's dual
//! wallet/burn index) goes through a single [`sled::Transactional`] batch so
//! a crash between the two inserts cannot happen.

use qnet_activation::{ActivationRecord, NodeType};
use qnet_core::{Block, BlockHash, ChainState, NodeId, QNetError, QNetResult, Transaction, TxHash};
use qnet_rewards::RewardRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

fn encode<T: Serialize>(value: &T) -> QNetResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| QNetError::Fatal(format!("encode failed: {e}")))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> QNetResult<T> {
    bincode::deserialize(bytes).map_err(|e| QNetError::Fatal(format!("decode failed: {e}")))
}

fn sled_err(e: sled::Error) -> QNetError {
    QNetError::Fatal(format!("storage error: {e}"))
}

/// A single peer's last-known state, persisted across restarts so the node
/// does not start from a cold peer set every time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub address: String,
    pub last_seen_ms: u64,
    pub verified: bool,
    pub reputation: Option<f64>,
    pub last_known_height: Option<u64>,
    pub last_known_tip: Option<BlockHash>,
}

/// Embedded store backing the chain, application state, activation
/// registry, reward ledger, reputation snapshot and peer registry. Readers
/// on committed heights never block behind writers; writers serialise by
/// height (enforced by the orchestrator, which is the sole caller of
/// `insert_block`).
pub struct SledStore {
    db: sled::Db,
    blocks: sled::Tree,
    block_hash_index: sled::Tree,
    tx_index: sled::Tree,
    state: sled::Tree,
    activations_by_burn: sled::Tree,
    activations_by_wallet: sled::Tree,
    reward_ledger: sled::Tree,
    reputation: sled::Tree,
    peers: sled::Tree,
    blacklist: sled::Tree,
}

impl SledStore {
    pub fn open(data_dir: &Path) -> QNetResult<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| QNetError::Fatal(format!("cannot create data dir: {e}")))?;
        let db = sled::open(data_dir).map_err(sled_err)?;
        info!("opened sled store at {:?}", data_dir);
        Ok(Self {
            blocks: db.open_tree("blocks").map_err(sled_err)?,
            block_hash_index: db.open_tree("headers").map_err(sled_err)?,
            tx_index: db.open_tree("tx_index").map_err(sled_err)?,
            state: db.open_tree("state").map_err(sled_err)?,
            activations_by_burn: db.open_tree("activations_by_burn").map_err(sled_err)?,
            activations_by_wallet: db.open_tree("activations_by_wallet").map_err(sled_err)?,
            reward_ledger: db.open_tree("reward_ledger").map_err(sled_err)?,
            reputation: db.open_tree("reputation").map_err(sled_err)?,
            peers: db.open_tree("peers").map_err(sled_err)?,
            blacklist: db.open_tree("blacklist").map_err(sled_err)?,
            db,
        })
    }

    /// In-memory store for tests; data does not survive process exit.
    pub fn temporary() -> QNetResult<Self> {
        let db = sled::Config::default().temporary(true).open().map_err(sled_err)?;
        Ok(Self {
            blocks: db.open_tree("blocks").map_err(sled_err)?,
            block_hash_index: db.open_tree("headers").map_err(sled_err)?,
            tx_index: db.open_tree("tx_index").map_err(sled_err)?,
            state: db.open_tree("state").map_err(sled_err)?,
            activations_by_burn: db.open_tree("activations_by_burn").map_err(sled_err)?,
            activations_by_wallet: db.open_tree("activations_by_wallet").map_err(sled_err)?,
            reward_ledger: db.open_tree("reward_ledger").map_err(sled_err)?,
            reputation: db.open_tree("reputation").map_err(sled_err)?,
            peers: db.open_tree("peers").map_err(sled_err)?,
            blacklist: db.open_tree("blacklist").map_err(sled_err)?,
            db,
        })
    }

    pub fn flush(&self) -> QNetResult<()> {
        self.db.flush().map_err(sled_err)?;
        Ok(())
    }

    // ---- blocks -----------------------------------------------------

    /// Appends `block`, indexing it by height, by hash, and indexing every
    /// contained transaction by its own hash. The caller (orchestrator) is
    /// responsible for height ordering; this call overwrites silently at a
    /// given height, matching the append-only discipline where height is
    /// never re-appended except by the orchestrator's own replace-tip path.
    pub fn insert_block(&self, block: &Block) -> QNetResult<()> {
        let height_key = block.header.height.to_be_bytes();
        let encoded = encode(block)?;
        self.blocks.insert(height_key, encoded).map_err(sled_err)?;
        self.block_hash_index
            .insert(block.hash(), height_key.to_vec())
            .map_err(sled_err)?;
        for (idx, tx) in block.transactions.iter().enumerate() {
            let locator = encode(&(block.header.height, idx as u32))?;
            self.tx_index.insert(tx.hash(), locator).map_err(sled_err)?;
        }
        Ok(())
    }

    pub fn get_block_by_height(&self, height: u64) -> QNetResult<Option<Block>> {
        match self.blocks.get(height.to_be_bytes()).map_err(sled_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_block_by_hash(&self, hash: &BlockHash) -> QNetResult<Option<Block>> {
        match self.block_hash_index.get(hash).map_err(sled_err)? {
            Some(height_bytes) => {
                let height = u64::from_be_bytes(height_bytes.as_ref().try_into().map_err(|_| {
                    QNetError::Fatal("corrupt height index entry".into())
                })?);
                self.get_block_by_height(height)
            }
            None => Ok(None),
        }
    }

    pub fn chain_tip_height(&self) -> QNetResult<u64> {
        match self.blocks.last().map_err(sled_err)? {
            Some((key, _)) => Ok(u64::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .map_err(|_| QNetError::Fatal("corrupt block key".into()))?,
            )),
            None => Ok(0),
        }
    }

    pub fn get_chain(&self, start: u64, limit: usize) -> QNetResult<Vec<Block>> {
        let mut out = Vec::with_capacity(limit.min(100));
        for entry in self.blocks.range(start.to_be_bytes()..) {
            let (_, bytes) = entry.map_err(sled_err)?;
            out.push(decode(&bytes)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn get_transaction(&self, hash: &TxHash) -> QNetResult<Option<Transaction>> {
        let Some(locator_bytes) = self.tx_index.get(hash).map_err(sled_err)? else {
            return Ok(None);
        };
        let (height, idx): (u64, u32) = decode(&locator_bytes)?;
        let Some(block) = self.get_block_by_height(height)? else {
            return Ok(None);
        };
        Ok(block.transactions.get(idx as usize).cloned())
    }

    /// Linear scan over a bounded window; fine at the node's target scale
    /// (a full index by address is a reasonable future addition, not
    /// required by the spec's external interface).
    pub fn get_address_transactions(
        &self,
        addr: &qnet_core::Address,
        limit: usize,
        offset: usize,
    ) -> QNetResult<Vec<Transaction>> {
        let mut matches = Vec::new();
        let mut skipped = 0usize;
        for entry in self.blocks.iter().rev() {
            let (_, bytes) = entry.map_err(sled_err)?;
            let block: Block = decode(&bytes)?;
            for tx in block.transactions.into_iter().rev() {
                let touches = &tx.sender == addr
                    || matches!(&tx.receiver, qnet_core::Recipient::Account(a) if a == addr);
                if !touches {
                    continue;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                matches.push(tx);
                if matches.len() >= limit {
                    return Ok(matches);
                }
            }
        }
        Ok(matches)
    }

    // ---- application state -------------------------------------------

    pub fn save_state(&self, state: &ChainState) -> QNetResult<()> {
        self.state.insert("tip", encode(state)?).map_err(sled_err)?;
        Ok(())
    }

    pub fn load_state(&self) -> QNetResult<Option<ChainState>> {
        match self.state.get("tip").map_err(sled_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ---- activation registry -------------------------------------------

    /// Atomically writes both indexes in one sled transaction, mirroring the
    /// in-memory registry's atomic dual insert.
    pub fn put_activation(&self, record: &ActivationRecord) -> QNetResult<()> {
        let encoded = encode(record)?;
        (&self.activations_by_burn, &self.activations_by_wallet)
            .transaction(|(by_burn, by_wallet)| {
                by_burn.insert(record.burn_tx_hash.as_bytes(), encoded.clone())?;
                by_wallet.insert(&record.wallet, encoded.clone())?;
                Ok::<_, sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|e| QNetError::Fatal(format!("activation persist failed: {e}")))?;
        Ok(())
    }

    pub fn get_activation_by_burn(&self, burn_tx_hash: &str) -> QNetResult<Option<ActivationRecord>> {
        match self.activations_by_burn.get(burn_tx_hash).map_err(sled_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_activation_by_wallet(
        &self,
        wallet: &qnet_core::Address,
    ) -> QNetResult<Option<ActivationRecord>> {
        match self.activations_by_wallet.get(wallet).map_err(sled_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn active_counts_by_type(&self) -> QNetResult<HashMap<NodeType, u64>> {
        let mut counts = HashMap::new();
        for entry in self.activations_by_burn.iter() {
            let (_, bytes) = entry.map_err(sled_err)?;
            let record: ActivationRecord = decode(&bytes)?;
            *counts.entry(record.node_type).or_insert(0) += 1;
        }
        Ok(counts)
    }

    // ---- reward ledger --------------------------------------------------

    pub fn put_reward_record(&self, node_id: &NodeId, record: &RewardRecord) -> QNetResult<()> {
        self.reward_ledger
            .insert(node_id.as_bytes(), encode(record)?)
            .map_err(sled_err)?;
        Ok(())
    }

    pub fn get_reward_record(&self, node_id: &NodeId) -> QNetResult<Option<RewardRecord>> {
        match self.reward_ledger.get(node_id.as_bytes()).map_err(sled_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ---- reputation snapshot --------------------------------------------

    pub fn save_reputation_snapshot(&self, snapshot: &HashMap<NodeId, f64>) -> QNetResult<()> {
        self.reputation.insert("snapshot", encode(snapshot)?).map_err(sled_err)?;
        Ok(())
    }

    pub fn load_reputation_snapshot(&self) -> QNetResult<HashMap<NodeId, f64>> {
        match self.reputation.get("snapshot").map_err(sled_err)? {
            Some(bytes) => decode(&bytes),
            None => Ok(HashMap::new()),
        }
    }

    // ---- peers ------------------------------------------------------

    pub fn upsert_peer(&self, peer: &PeerEntry) -> QNetResult<()> {
        self.peers
            .insert(peer.address.as_bytes(), encode(peer)?)
            .map_err(sled_err)?;
        Ok(())
    }

    pub fn get_peer(&self, address: &str) -> QNetResult<Option<PeerEntry>> {
        match self.peers.get(address.as_bytes()).map_err(sled_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_peers(&self) -> QNetResult<Vec<PeerEntry>> {
        let mut out = Vec::new();
        for entry in self.peers.iter() {
            let (_, bytes) = entry.map_err(sled_err)?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    pub fn blacklist_host(&self, host: &str) -> QNetResult<()> {
        self.blacklist.insert(host.as_bytes(), &[1u8]).map_err(sled_err)?;
        Ok(())
    }

    pub fn is_blacklisted(&self, host: &str) -> QNetResult<bool> {
        Ok(self.blacklist.contains_key(host.as_bytes()).map_err(sled_err)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qnet_core::{BlockHeader, Recipient, TxKind};

    fn coinbase_block(height: u64, prev_hash: BlockHash) -> Block {
        let tx = Transaction {
            sender: qnet_core::ZERO_ADDRESS,
            receiver: Recipient::Account([1u8; 32]),
            amount: 10,
            gas_price: 0,
            gas_limit: 0,
            nonce: 0,
            timestamp: 0,
            data: vec![],
            kind: TxKind::Coinbase,
            signature: vec![],
        };
        let header = BlockHeader {
            height,
            prev_hash,
            timestamp: 0,
            merkle_root: qnet_core::merkle_root(&[tx.clone()]),
            producer: [2u8; 32],
            producer_pubkey: vec![],
            beacon: [0u8; 32],
            round_number: height,
            nonce: 0,
        };
        Block {
            header,
            transactions: vec![tx],
            producer_signature: vec![],
        }
    }

    #[test]
    fn insert_and_fetch_block_by_height_and_hash() {
        let store = SledStore::temporary().unwrap();
        let block = coinbase_block(1, [0u8; 32]);
        let hash = block.hash();
        store.insert_block(&block).unwrap();
        let by_height = store.get_block_by_height(1).unwrap().unwrap();
        assert_eq!(by_height.hash(), hash);
        let by_hash = store.get_block_by_hash(&hash).unwrap().unwrap();
        assert_eq!(by_hash.header.height, 1);
    }

    #[test]
    fn transaction_lookup_resolves_through_tx_index() {
        let store = SledStore::temporary().unwrap();
        let block = coinbase_block(1, [0u8; 32]);
        let tx_hash = block.transactions[0].hash();
        store.insert_block(&block).unwrap();
        let tx = store.get_transaction(&tx_hash).unwrap().unwrap();
        assert_eq!(tx.hash(), tx_hash);
    }

    #[test]
    fn state_round_trips() {
        let store = SledStore::temporary().unwrap();
        assert!(store.load_state().unwrap().is_none());
        let mut state = ChainState::default();
        state.height = 5;
        state.balances.insert([9u8; 32], 42);
        store.save_state(&state).unwrap();
        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded.height, 5);
        assert_eq!(loaded.balance(&[9u8; 32]), 42);
    }

    #[test]
    fn activation_dual_index_stays_consistent() {
        let store = SledStore::temporary().unwrap();
        let record = ActivationRecord {
            burn_tx_hash: "burn-1".into(),
            wallet: [1u8; 32],
            node_pubkey: vec![9, 9],
            node_type: NodeType::Full,
            activation_time_ms: 0,
            block_height: 1,
        };
        store.put_activation(&record).unwrap();
        assert!(store.get_activation_by_burn("burn-1").unwrap().is_some());
        assert!(store.get_activation_by_wallet(&[1u8; 32]).unwrap().is_some());
    }

    #[test]
    fn blacklist_membership() {
        let store = SledStore::temporary().unwrap();
        assert!(!store.is_blacklisted("1.2.3.4").unwrap());
        store.blacklist_host("1.2.3.4").unwrap();
        assert!(store.is_blacklisted("1.2.3.4").unwrap());
    }
}
