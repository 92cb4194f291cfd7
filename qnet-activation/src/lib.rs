//! Node activation registry: enforces one-wallet-one-node via a dual
//! wallet/burn index, verifies burns through an external oracle, and
//! supports moving an activation to new hardware via single-use transfer
//! codes.

use async_trait::async_trait;
use parking_lot::RwLock;
use qnet_core::{
    now_ms, Address, CryptoProvider, QNetError, QNetResult, Recipient, SystemPrincipal,
    Transaction, TxKind,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const TRANSFER_CODE_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Light,
    Full,
    Super,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Light => "light",
            NodeType::Full => "full",
            NodeType::Super => "super",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "light" => Some(NodeType::Light),
            "full" => Some(NodeType::Full),
            "super" => Some(NodeType::Super),
            _ => None,
        }
    }

    /// Every node type burns the same fixed amount in the current economics.
    pub fn burn_amount(&self) -> u64 {
        1500
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub burn_tx_hash: String,
    pub wallet: Address,
    pub node_pubkey: Vec<u8>,
    pub node_type: NodeType,
    pub activation_time_ms: u64,
    pub block_height: u64,
}

impl ActivationRecord {
    /// Canonical bytes a node signs to prove it holds the private key
    /// matching `node_pubkey`, binding the signature to this wallet/type.
    pub fn signing_message(wallet: &Address, node_pubkey: &[u8], node_type: NodeType) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(wallet);
        msg.extend_from_slice(node_pubkey);
        msg.extend_from_slice(node_type.as_str().as_bytes());
        msg
    }
}

#[derive(Debug, Clone)]
struct TransferCode {
    wallet: Address,
    burn_tx_hash: String,
    issued_at_ms: u64,
    used: bool,
}

impl TransferCode {
    fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.issued_at_ms) > TRANSFER_CODE_TTL_MS
    }
}

/// Verifies that a burn transaction of the expected amount, from the
/// expected wallet, exists and is confirmed. The only non-deterministic
/// dependency in activation: a timeout must surface as `Transient`, never
/// as a silent success.
#[async_trait]
pub trait BurnOracle: Send + Sync {
    async fn verify_burn(
        &self,
        burn_tx_hash: &str,
        expected_wallet: Address,
        expected_amount: u64,
        node_type: NodeType,
    ) -> QNetResult<bool>;
}

#[derive(Default)]
pub struct ActivationRegistry {
    by_wallet: RwLock<HashMap<Address, ActivationRecord>>,
    by_burn: RwLock<HashMap<String, ActivationRecord>>,
    transfer_codes: RwLock<HashMap<String, TransferCode>>,
}

impl ActivationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs checks 1–4 of the activation contract (wallet/burn uniqueness,
    /// node-type validity, oracle confirmation); signature verification is
    /// left to `activate`, which has the node pubkey and message in hand.
    pub async fn verify_activation(
        &self,
        oracle: &dyn BurnOracle,
        burn_tx_hash: &str,
        wallet: Address,
        node_type: NodeType,
    ) -> QNetResult<()> {
        if self.by_wallet.read().contains_key(&wallet) {
            return Err(QNetError::Conflict(format!(
                "wallet {} already activated a node",
                qnet_core::address_to_string(&wallet)
            )));
        }
        if self.by_burn.read().contains_key(burn_tx_hash) {
            return Err(QNetError::Conflict(format!(
                "burn transaction {burn_tx_hash} already used"
            )));
        }
        let confirmed = oracle
            .verify_burn(burn_tx_hash, wallet, node_type.burn_amount(), node_type)
            .await?;
        if !confirmed {
            return Err(QNetError::InvalidInput(format!(
                "burn transaction {burn_tx_hash} not confirmed for the expected amount"
            )));
        }
        Ok(())
    }

    /// Verifies the activation signature, then atomically inserts into both
    /// indexes and returns the `NODE_ACTIVATION` transaction to gossip.
    pub async fn activate<C: CryptoProvider + ?Sized>(
        &self,
        oracle: &dyn BurnOracle,
        crypto: &C,
        burn_tx_hash: String,
        wallet: Address,
        node_pubkey: Vec<u8>,
        node_type: NodeType,
        signature: &[u8],
        block_height: u64,
    ) -> QNetResult<Transaction> {
        self.verify_activation(oracle, &burn_tx_hash, wallet, node_type)
            .await?;
        let msg = ActivationRecord::signing_message(&wallet, &node_pubkey, node_type);
        let ok = crypto
            .verify_signature(&node_pubkey, &msg, signature)
            .map_err(|e| QNetError::InvalidInput(e.to_string()))?;
        if !ok {
            return Err(QNetError::Unauthorized(
                "activation signature does not match node_pubkey".into(),
            ));
        }

        let record = ActivationRecord {
            burn_tx_hash: burn_tx_hash.clone(),
            wallet,
            node_pubkey: node_pubkey.clone(),
            node_type,
            activation_time_ms: now_ms(),
            block_height,
        };

        {
            let mut by_wallet = self.by_wallet.write();
            let mut by_burn = self.by_burn.write();
            if by_wallet.contains_key(&wallet) || by_burn.contains_key(&burn_tx_hash) {
                return Err(QNetError::Conflict(
                    "activation raced with a concurrent registration".into(),
                ));
            }
            by_wallet.insert(wallet, record.clone());
            by_burn.insert(burn_tx_hash.clone(), record);
        }

        let mut data = Vec::new();
        data.extend_from_slice(burn_tx_hash.as_bytes());
        data.push(0);
        data.extend_from_slice(&node_pubkey);
        data.push(0);
        data.extend_from_slice(node_type.as_str().as_bytes());

        Ok(Transaction {
            sender: wallet,
            receiver: Recipient::System(SystemPrincipal::Activation),
            amount: 0,
            gas_price: 0,
            gas_limit: 0,
            nonce: 0,
            timestamp: now_ms(),
            data,
            kind: TxKind::NodeActivation,
            signature: signature.to_vec(),
        })
    }

    pub fn get_by_wallet(&self, wallet: &Address) -> Option<ActivationRecord> {
        self.by_wallet.read().get(wallet).cloned()
    }

    pub fn get_by_burn(&self, burn_tx_hash: &str) -> Option<ActivationRecord> {
        self.by_burn.read().get(burn_tx_hash).cloned()
    }

    pub fn is_node_active(&self, node_pubkey: &[u8]) -> bool {
        self.by_burn
            .read()
            .values()
            .any(|r| r.node_pubkey == node_pubkey)
    }

    pub fn active_counts(&self) -> HashMap<&'static str, u64> {
        let mut counts = HashMap::from([("light", 0u64), ("full", 0), ("super", 0)]);
        for record in self.by_burn.read().values() {
            *counts.entry(record.node_type.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Issues a single-use, 24h transfer code for the wallet's existing
    /// activation, letting the node move to new hardware without re-burning.
    pub fn initiate_transfer(&self, wallet: Address) -> QNetResult<String> {
        let record = self
            .by_wallet
            .read()
            .get(&wallet)
            .cloned()
            .ok_or_else(|| QNetError::NotFound("wallet has no activation to transfer".into()))?;
        let mut raw = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
        let code = hex::encode(raw);
        self.transfer_codes.write().insert(
            code.clone(),
            TransferCode {
                wallet,
                burn_tx_hash: record.burn_tx_hash,
                issued_at_ms: now_ms(),
                used: false,
            },
        );
        Ok(code)
    }

    /// Consumes `transfer_code`, rebinding `burn_tx_hash`'s activation to
    /// `new_node_pubkey` in both indexes.
    pub fn complete_transfer(
        &self,
        burn_tx_hash: &str,
        transfer_code: &str,
        new_node_pubkey: Vec<u8>,
    ) -> QNetResult<()> {
        let mut codes = self.transfer_codes.write();
        let entry = codes
            .get_mut(transfer_code)
            .ok_or_else(|| QNetError::NotFound("unknown transfer code".into()))?;
        if entry.used {
            return Err(QNetError::Conflict("transfer code already used".into()));
        }
        if entry.expired(now_ms()) {
            return Err(QNetError::Stale("transfer code expired".into()));
        }
        if entry.burn_tx_hash != burn_tx_hash {
            return Err(QNetError::InvalidInput(
                "transfer code does not match burn transaction".into(),
            ));
        }
        let wallet = entry.wallet;
        entry.used = true;

        let mut by_wallet = self.by_wallet.write();
        let mut by_burn = self.by_burn.write();
        let record = by_burn
            .get_mut(burn_tx_hash)
            .ok_or_else(|| QNetError::NotFound("activation record missing".into()))?;
        record.node_pubkey = new_node_pubkey.clone();
        if let Some(w) = by_wallet.get_mut(&wallet) {
            w.node_pubkey = new_node_pubkey;
        }
        Ok(())
    }

    /// Invalidates an issued transfer code before it is completed, e.g. when
    /// the operator requested a new hardware transfer by mistake.
    pub fn cancel_transfer(&self, transfer_code: &str) -> QNetResult<()> {
        let mut codes = self.transfer_codes.write();
        let entry = codes
            .get_mut(transfer_code)
            .ok_or_else(|| QNetError::NotFound("unknown transfer code".into()))?;
        if entry.used {
            return Err(QNetError::Conflict("transfer code already used".into()));
        }
        entry.used = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qnet_core::Address;

    struct AlwaysConfirms;

    #[async_trait]
    impl BurnOracle for AlwaysConfirms {
        async fn verify_burn(
            &self,
            _burn_tx_hash: &str,
            _expected_wallet: Address,
            _expected_amount: u64,
            _node_type: NodeType,
        ) -> QNetResult<bool> {
            Ok(true)
        }
    }

    struct NeverConfirms;

    #[async_trait]
    impl BurnOracle for NeverConfirms {
        async fn verify_burn(
            &self,
            _burn_tx_hash: &str,
            _expected_wallet: Address,
            _expected_amount: u64,
            _node_type: NodeType,
        ) -> QNetResult<bool> {
            Ok(false)
        }
    }

    struct DummyCrypto;

    #[async_trait]
    impl CryptoProvider for DummyCrypto {
        fn address_from_public_key(&self, pk: &[u8]) -> anyhow::Result<Address> {
            Ok(blake3::hash(pk).into())
        }
        fn verify_signature(&self, _pk: &[u8], _msg: &[u8], sig: &[u8]) -> anyhow::Result<bool> {
            Ok(sig == b"valid")
        }
        fn sign_message(&self, _sk: &[u8], msg: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(msg.to_vec())
        }
    }

    #[tokio::test]
    async fn activation_registers_wallet_and_burn() {
        let registry = ActivationRegistry::new();
        let tx = registry
            .activate(
                &AlwaysConfirms,
                &DummyCrypto,
                "burn-1".into(),
                [1u8; 32],
                vec![9, 9, 9],
                NodeType::Full,
                b"valid",
                10,
            )
            .await
            .unwrap();
        assert_eq!(tx.kind, TxKind::NodeActivation);
        assert!(registry.get_by_wallet(&[1u8; 32]).is_some());
        assert!(registry.get_by_burn("burn-1").is_some());
    }

    #[tokio::test]
    async fn duplicate_wallet_activation_rejected() {
        let registry = ActivationRegistry::new();
        registry
            .activate(
                &AlwaysConfirms,
                &DummyCrypto,
                "burn-1".into(),
                [1u8; 32],
                vec![9],
                NodeType::Full,
                b"valid",
                10,
            )
            .await
            .unwrap();
        let err = registry
            .activate(
                &AlwaysConfirms,
                &DummyCrypto,
                "burn-2".into(),
                [1u8; 32],
                vec![8],
                NodeType::Full,
                b"valid",
                11,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn unconfirmed_burn_is_rejected() {
        let registry = ActivationRegistry::new();
        let err = registry
            .activate(
                &NeverConfirms,
                &DummyCrypto,
                "burn-1".into(),
                [1u8; 32],
                vec![9],
                NodeType::Full,
                b"valid",
                10,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn transfer_moves_binding_to_new_pubkey() {
        let registry = ActivationRegistry::new();
        registry
            .activate(
                &AlwaysConfirms,
                &DummyCrypto,
                "burn-1".into(),
                [1u8; 32],
                vec![9],
                NodeType::Full,
                b"valid",
                10,
            )
            .await
            .unwrap();
        let code = registry.initiate_transfer([1u8; 32]).unwrap();
        registry
            .complete_transfer("burn-1", &code, vec![7, 7])
            .unwrap();
        assert_eq!(registry.get_by_burn("burn-1").unwrap().node_pubkey, vec![7, 7]);
        // the code is single-use
        assert!(registry.complete_transfer("burn-1", &code, vec![6]).is_err());
    }
}
