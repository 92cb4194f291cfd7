//! The node's own producer/signing keypair, persisted under the configured
//! keys directory. Generated once on first start; every later start loads
//! the same identity so the node's address and reputation history survive
//! restarts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use qnet_core::{Address, CryptoProvider};
use qnet_crypto::{generate_ed25519, KeyMaterial};
use serde::{Deserialize, Serialize};

const KEY_FILE: &str = "node.key.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredKeys {
    public_key_hex: String,
    secret_key_hex: String,
}

pub struct NodeKeys {
    pub material: KeyMaterial,
    pub address: Address,
}

impl NodeKeys {
    /// Loads the keypair from `keys_dir/node.key.json`, generating and
    /// persisting a fresh one if the directory is empty.
    pub fn load_or_generate<C: CryptoProvider>(keys_dir: &Path, crypto: &C) -> Result<Self> {
        std::fs::create_dir_all(keys_dir)
            .with_context(|| format!("creating keys dir {}", keys_dir.display()))?;
        let path = key_path(keys_dir);
        let material = if path.exists() {
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let stored: StoredKeys = serde_json::from_slice(&bytes)?;
            KeyMaterial {
                public_key: hex::decode(stored.public_key_hex)?,
                secret_key: hex::decode(stored.secret_key_hex)?,
            }
        } else {
            let fresh = generate_ed25519();
            let stored = StoredKeys {
                public_key_hex: hex::encode(&fresh.public_key),
                secret_key_hex: hex::encode(&fresh.secret_key),
            };
            std::fs::write(&path, serde_json::to_vec_pretty(&stored)?)
                .with_context(|| format!("writing {}", path.display()))?;
            fresh
        };
        let address = crypto
            .address_from_public_key(&material.public_key)
            .map_err(|e| anyhow::anyhow!("deriving node address: {e}"))?;
        Ok(Self { material, address })
    }
}

fn key_path(keys_dir: &Path) -> PathBuf {
    keys_dir.join(KEY_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qnet_crypto::DefaultCryptoProvider;

    #[test]
    fn second_load_reuses_the_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let crypto = DefaultCryptoProvider::new();
        let first = NodeKeys::load_or_generate(dir.path(), &crypto).unwrap();
        let second = NodeKeys::load_or_generate(dir.path(), &crypto).unwrap();
        assert_eq!(first.address, second.address);
        assert_eq!(first.material.public_key, second.material.public_key);
    }
}
