use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte account address, derived from the holder's public key.
pub type Address = [u8; 32];
pub type TxHash = [u8; 32];
pub type BlockHash = [u8; 32];

/// Nodes are addressed by string id in the reputation, sharding and consensus
/// layers, mirroring the original network's node-address strings.
pub type NodeId = String;

pub const ZERO_ADDRESS: Address = [0u8; 32];

/// Special transaction recipients that are not backed by a keypair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemPrincipal {
    Network,
    RewardsPool,
    Activation,
}

impl SystemPrincipal {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemPrincipal::Network => "network",
            SystemPrincipal::RewardsPool => "REWARDS_POOL",
            SystemPrincipal::Activation => "ACTIVATION",
        }
    }
}

impl fmt::Display for SystemPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A transaction recipient: either an owned account or a reserved system principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Account(Address),
    System(SystemPrincipal),
}

impl Recipient {
    pub fn is_system(&self) -> bool {
        matches!(self, Recipient::System(_))
    }
}

pub fn address_to_string(addr: &Address) -> String {
    bs58::encode(addr).into_string()
}

pub fn address_from_string(s: &str) -> anyhow::Result<Address> {
    let bytes = bs58::decode(s).into_vec()?;
    if bytes.len() != 32 {
        anyhow::bail!("invalid address length");
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
