use crate::error::{QNetError, QNetResult};
use crate::transaction::Transaction;
use crate::types::{Address, BlockHash};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_hash: BlockHash,
    pub timestamp: u64,
    pub merkle_root: BlockHash,
    pub producer: Address,
    pub producer_pubkey: Vec<u8>,
    pub beacon: BlockHash,
    pub round_number: u64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub producer_signature: Vec<u8>,
}

#[derive(Serialize)]
struct HeaderSigningView<'a> {
    height: u64,
    prev_hash: &'a BlockHash,
    timestamp: u64,
    merkle_root: &'a BlockHash,
    producer: &'a Address,
    producer_pubkey: &'a [u8],
    beacon: &'a BlockHash,
    round_number: u64,
    nonce: u64,
}

impl BlockHeader {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let view = HeaderSigningView {
            height: self.height,
            prev_hash: &self.prev_hash,
            timestamp: self.timestamp,
            merkle_root: &self.merkle_root,
            producer: &self.producer,
            producer_pubkey: &self.producer_pubkey,
            beacon: &self.beacon,
            round_number: self.round_number,
            nonce: self.nonce,
        };
        bincode::serialize(&view).expect("block header is serializable")
    }

    /// `hash = H(header)`.
    pub fn hash(&self) -> BlockHash {
        blake3::hash(&self.signing_bytes()).into()
    }
}

impl Block {
    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    /// Structural checks that do not require chain context: merkle root
    /// matches the body, height/prev_hash chain to `prev`, and the first
    /// transaction is a coinbase. Producer-signature and activation-record
    /// checks are layered on by the orchestrator, which holds the
    /// crypto provider and activation registry.
    pub fn check_structure(&self, prev: &BlockHeader) -> QNetResult<()> {
        if self.header.height != prev.height + 1 {
            return Err(QNetError::Fatal(format!(
                "unexpected height: got {}, expected {}",
                self.header.height,
                prev.height + 1
            )));
        }
        if self.header.prev_hash != prev.hash() {
            return Err(QNetError::Fatal("prev_hash mismatch".into()));
        }
        let expected_root = merkle_root(&self.transactions);
        if self.header.merkle_root != expected_root {
            return Err(QNetError::Fatal("merkle root mismatch".into()));
        }
        match self.transactions.first() {
            Some(tx) if matches!(tx.kind, crate::transaction::TxKind::Coinbase) => {}
            _ => return Err(QNetError::Fatal("missing coinbase at index 0".into())),
        }
        let mut seen = std::collections::HashSet::new();
        for tx in &self.transactions {
            if !seen.insert(tx.hash()) {
                return Err(QNetError::Fatal("duplicate transaction hash in block".into()));
            }
        }
        let mut last_nonce: std::collections::HashMap<Address, u64> = std::collections::HashMap::new();
        for tx in self.transactions.iter().skip(1) {
            if let Some(prev_nonce) = last_nonce.get(&tx.sender) {
                if tx.nonce <= *prev_nonce {
                    return Err(QNetError::Fatal(
                        "per-sender nonce not strictly increasing within block".into(),
                    ));
                }
            }
            last_nonce.insert(tx.sender, tx.nonce);
        }
        Ok(())
    }
}

/// Binary Merkle root over canonical transaction hashes; duplicates the last
/// leaf on an odd count at every level.
pub fn merkle_root(transactions: &[Transaction]) -> BlockHash {
    if transactions.is_empty() {
        return [0u8; 32];
    }
    let mut hashes: Vec<BlockHash> = transactions.iter().map(|tx| tx.hash()).collect();
    while hashes.len() > 1 {
        let mut next = Vec::with_capacity(hashes.len().div_ceil(2));
        for pair in hashes.chunks(2) {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&pair[0]);
            if pair.len() == 2 {
                hasher.update(&pair[1]);
            } else {
                hasher.update(&pair[0]);
            }
            next.push(hasher.finalize().into());
        }
        hashes = next;
    }
    hashes[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxKind;
    use crate::types::{Recipient, SystemPrincipal};

    fn coinbase() -> Transaction {
        Transaction {
            sender: [0u8; 32],
            receiver: Recipient::Account([9u8; 32]),
            amount: 100,
            gas_price: 0,
            gas_limit: 0,
            nonce: 0,
            timestamp: 0,
            data: vec![],
            kind: TxKind::Coinbase,
            signature: vec![],
        }
    }

    #[test]
    fn merkle_single_leaf_equals_tx_hash() {
        let tx = coinbase();
        assert_eq!(merkle_root(&[tx.clone()]), tx.hash());
    }

    #[test]
    fn merkle_duplicates_last_leaf_on_odd_count() {
        let mut a = coinbase();
        a.nonce = 1;
        let mut b = coinbase();
        b.nonce = 2;
        let mut c = coinbase();
        c.nonce = 3;
        let three = merkle_root(&[a.clone(), b.clone(), c.clone()]);
        let four = merkle_root(&[a, b, c.clone(), c]);
        assert_eq!(three, four);
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        let header = BlockHeader {
            height: 1,
            prev_hash: [0u8; 32],
            timestamp: 0,
            merkle_root: [0u8; 32],
            producer: [1u8; 32],
            producer_pubkey: vec![1, 2, 3],
            beacon: [2u8; 32],
            round_number: 1,
            nonce: 0,
        };
        let mut other = header.clone();
        other.nonce = 1;
        assert_ne!(header.hash(), other.hash());
    }

    #[test]
    fn rejects_missing_coinbase() {
        let mut tx = coinbase();
        tx.kind = TxKind::Transfer;
        tx.receiver = Recipient::System(SystemPrincipal::Network);
        let prev = BlockHeader {
            height: 0,
            prev_hash: [0u8; 32],
            timestamp: 0,
            merkle_root: [0u8; 32],
            producer: [0u8; 32],
            producer_pubkey: vec![],
            beacon: [0u8; 32],
            round_number: 0,
            nonce: 0,
        };
        let block = Block {
            header: BlockHeader {
                height: 1,
                prev_hash: prev.hash(),
                timestamp: 0,
                merkle_root: merkle_root(&[tx.clone()]),
                producer: [1u8; 32],
                producer_pubkey: vec![],
                beacon: [0u8; 32],
                round_number: 1,
                nonce: 0,
            },
            transactions: vec![tx],
            producer_signature: vec![],
        };
        assert!(block.check_structure(&prev).is_err());
    }
}
