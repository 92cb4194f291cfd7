use crate::block::{merkle_root, Block};
use crate::economics::TokenEconomics;
use crate::error::{QNetError, QNetResult};
use crate::transaction::{Transaction, TxKind};
use crate::types::{Address, Recipient, SystemPrincipal};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Account-based application state: balances and per-sender nonces, plus the
/// chain-tip height the state was built against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainState {
    pub height: u64,
    pub balances: HashMap<Address, u64>,
    pub nonces: HashMap<Address, u64>,
    pub total_issued: u64,
}

impl ChainState {
    pub fn balance(&self, addr: &Address) -> u64 {
        self.balances.get(addr).copied().unwrap_or(0)
    }

    pub fn next_nonce(&self, addr: &Address) -> u64 {
        self.nonces.get(addr).copied().unwrap_or(0)
    }

    fn credit(&mut self, addr: Address, amount: u64) -> QNetResult<()> {
        let entry = self.balances.entry(addr).or_insert(0);
        *entry = entry
            .checked_add(amount)
            .ok_or_else(|| QNetError::Fatal("balance overflow".into()))?;
        Ok(())
    }

    fn debit(&mut self, addr: &Address, amount: u64) -> QNetResult<()> {
        let entry = self.balances.entry(*addr).or_insert(0);
        if *entry < amount {
            return Err(QNetError::InvalidInput("insufficient balance".into()));
        }
        *entry -= amount;
        Ok(())
    }
}

/// Signature verification and address derivation are provided by the host
/// crate (`qnet-crypto`); the execution engine is generic over it so tests
/// can supply a trivial stand-in.
#[async_trait]
pub trait CryptoProvider: Send + Sync + 'static {
    fn address_from_public_key(&self, pk: &[u8]) -> anyhow::Result<Address>;
    fn verify_signature(&self, pk: &[u8], msg: &[u8], sig: &[u8]) -> anyhow::Result<bool>;
    fn sign_message(&self, sk: &[u8], msg: &[u8]) -> anyhow::Result<Vec<u8>>;
}

pub struct ExecutionEngine<'a, C: CryptoProvider> {
    pub crypto: &'a C,
    pub economics: TokenEconomics,
    pub max_gas_per_block: u64,
}

impl<'a, C: CryptoProvider> ExecutionEngine<'a, C> {
    pub fn new(crypto: &'a C, economics: TokenEconomics, max_gas_per_block: u64) -> Self {
        Self {
            crypto,
            economics,
            max_gas_per_block,
        }
    }

    /// Applies a fully-validated block to `state`, crediting the producer
    /// with the height-dependent base reward via the coinbase transaction
    /// already present at index 0.
    pub fn apply_block(&self, state: &mut ChainState, block: &Block) -> QNetResult<()> {
        if block.header.merkle_root != merkle_root(&block.transactions) {
            return Err(QNetError::Fatal("invalid merkle root".into()));
        }
        if block.header.height != state.height + 1 {
            return Err(QNetError::Fatal("unexpected height".into()));
        }
        let mut total_gas = 0u64;
        for (idx, tx) in block.transactions.iter().enumerate() {
            if idx == 0 {
                self.apply_coinbase(state, tx, block.header.height)?;
                continue;
            }
            total_gas = total_gas
                .checked_add(tx.gas_limit)
                .ok_or_else(|| QNetError::Fatal("gas overflow".into()))?;
            if total_gas > self.max_gas_per_block {
                return Err(QNetError::Fatal("block gas cap exceeded".into()));
            }
            self.apply_transaction(state, tx)?;
        }
        state.height = block.header.height;
        Ok(())
    }

    fn apply_coinbase(&self, state: &mut ChainState, tx: &Transaction, height: u64) -> QNetResult<()> {
        let expected = self.economics.base_reward(height);
        if tx.amount != expected {
            return Err(QNetError::Fatal(format!(
                "coinbase amount {} does not match expected reward {}",
                tx.amount, expected
            )));
        }
        let receiver = match &tx.receiver {
            Recipient::Account(addr) => *addr,
            Recipient::System(_) => return Err(QNetError::Fatal("coinbase must credit an account".into())),
        };
        state.credit(receiver, tx.amount)?;
        state.total_issued = state.total_issued.saturating_add(tx.amount);
        Ok(())
    }

    /// Validates and applies a single non-coinbase transaction: signature,
    /// strictly-increasing nonce, and sufficient balance for
    /// `amount + gas_price * gas_limit`.
    pub fn apply_transaction(&self, state: &mut ChainState, tx: &Transaction) -> QNetResult<()> {
        self.verify_transaction(state, tx)?;
        let fee = tx.gas_price.saturating_mul(tx.gas_limit);
        state.debit(&tx.sender, tx.amount.saturating_add(fee))?;
        match &tx.receiver {
            Recipient::Account(addr) => state.credit(*addr, tx.amount)?,
            Recipient::System(SystemPrincipal::RewardsPool) => {
                // amount is tracked by the reward ledger, not the account balance
            }
            Recipient::System(_) => {}
        }
        state.nonces.insert(tx.sender, tx.nonce + 1);
        Ok(())
    }

    pub fn verify_transaction(&self, state: &ChainState, tx: &Transaction) -> QNetResult<()> {
        if tx.amount > 0 || matches!(tx.kind, TxKind::Transfer) {
            if !tx.is_system_sender() {
                if tx.nonce != state.next_nonce(&tx.sender) {
                    return Err(QNetError::InvalidInput(format!(
                        "nonce mismatch: expected {}, got {}",
                        state.next_nonce(&tx.sender),
                        tx.nonce
                    )));
                }
                if tx.signature.is_empty() {
                    return Err(QNetError::InvalidInput("missing signature".into()));
                }
            }
        }
        let fee = tx.gas_price.saturating_mul(tx.gas_limit);
        let required = tx.amount.saturating_add(fee);
        if state.balance(&tx.sender) < required && !tx.is_system_sender() {
            return Err(QNetError::InvalidInput("insufficient balance".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ZERO_ADDRESS;

    struct DummyCrypto;

    #[async_trait]
    impl CryptoProvider for DummyCrypto {
        fn address_from_public_key(&self, pk: &[u8]) -> anyhow::Result<Address> {
            Ok(blake3::hash(pk).into())
        }
        fn verify_signature(&self, _pk: &[u8], _msg: &[u8], _sig: &[u8]) -> anyhow::Result<bool> {
            Ok(true)
        }
        fn sign_message(&self, _sk: &[u8], msg: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(msg.to_vec())
        }
    }

    fn economics() -> TokenEconomics {
        TokenEconomics {
            max_supply: 1_000_000_000,
            base_reward: 50,
            halving_interval_blocks: 1_000_000,
        }
    }

    #[test]
    fn apply_block_credits_coinbase_and_advances_height() {
        let crypto = DummyCrypto;
        let engine = ExecutionEngine::new(&crypto, economics(), 10_000_000);
        let mut state = ChainState::default();
        let coinbase = Transaction {
            sender: ZERO_ADDRESS,
            receiver: Recipient::Account([7u8; 32]),
            amount: 50,
            gas_price: 0,
            gas_limit: 0,
            nonce: 0,
            timestamp: 0,
            data: vec![],
            kind: TxKind::Coinbase,
            signature: vec![],
        };
        let block = Block {
            header: crate::block::BlockHeader {
                height: 1,
                prev_hash: [0u8; 32],
                timestamp: 0,
                merkle_root: merkle_root(&[coinbase.clone()]),
                producer: [7u8; 32],
                producer_pubkey: vec![],
                beacon: [0u8; 32],
                round_number: 1,
                nonce: 0,
            },
            transactions: vec![coinbase],
            producer_signature: vec![],
        };
        engine.apply_block(&mut state, &block).unwrap();
        assert_eq!(state.balance(&[7u8; 32]), 50);
        assert_eq!(state.height, 1);
        assert_eq!(state.total_issued, 50);
    }

    #[test]
    fn apply_transaction_rejects_replayed_nonce() {
        let crypto = DummyCrypto;
        let engine = ExecutionEngine::new(&crypto, economics(), 10_000_000);
        let mut state = ChainState::default();
        state.balances.insert([1u8; 32], 1000);
        let tx = Transaction {
            sender: [1u8; 32],
            receiver: Recipient::Account([2u8; 32]),
            amount: 10,
            gas_price: 1,
            gas_limit: 10,
            nonce: 0,
            timestamp: 0,
            data: vec![],
            kind: TxKind::Transfer,
            signature: vec![1],
        };
        engine.apply_transaction(&mut state, &tx).unwrap();
        assert_eq!(state.balance(&[2u8; 32]), 10);
        let err = engine.apply_transaction(&mut state, &tx).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn apply_transaction_rejects_insufficient_balance() {
        let crypto = DummyCrypto;
        let engine = ExecutionEngine::new(&crypto, economics(), 10_000_000);
        let mut state = ChainState::default();
        state.balances.insert([1u8; 32], 5);
        let tx = Transaction {
            sender: [1u8; 32],
            receiver: Recipient::Account([2u8; 32]),
            amount: 10,
            gas_price: 0,
            gas_limit: 1,
            nonce: 0,
            timestamp: 0,
            data: vec![],
            kind: TxKind::Transfer,
            signature: vec![1],
        };
        assert!(engine.apply_transaction(&mut state, &tx).is_err());
    }
}
