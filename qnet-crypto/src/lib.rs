//! Ed25519 signing/verification and address derivation backing
//! [`qnet_core::CryptoProvider`].

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SIGNATURE_LENGTH};
use qnet_core::{Address, CryptoProvider};
use rand::rngs::OsRng;

#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub public_key: Vec<u8>,
    pub secret_key: Vec<u8>,
}

pub fn generate_ed25519() -> KeyMaterial {
    let mut csprng = OsRng;
    let signing = SigningKey::generate(&mut csprng);
    let verify = signing.verifying_key();
    KeyMaterial {
        public_key: verify.to_bytes().to_vec(),
        secret_key: signing.to_bytes().to_vec(),
    }
}

/// Addresses are the blake3 hash of the holder's ed25519 public key.
pub struct DefaultCryptoProvider;

impl DefaultCryptoProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultCryptoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CryptoProvider for DefaultCryptoProvider {
    fn address_from_public_key(&self, pk: &[u8]) -> anyhow::Result<Address> {
        Ok(blake3::hash(pk).into())
    }

    fn verify_signature(&self, pk: &[u8], msg: &[u8], sig: &[u8]) -> anyhow::Result<bool> {
        let pk_arr: [u8; 32] = pk.try_into().map_err(|_| anyhow::anyhow!("bad pk length"))?;
        let vk = VerifyingKey::from_bytes(&pk_arr)?;
        let sig_arr: [u8; SIGNATURE_LENGTH] = sig
            .try_into()
            .map_err(|_| anyhow::anyhow!("bad sig length"))?;
        let signature = Signature::from_bytes(&sig_arr);
        Ok(vk.verify(msg, &signature).is_ok())
    }

    fn sign_message(&self, sk: &[u8], msg: &[u8]) -> anyhow::Result<Vec<u8>> {
        let sk_arr: [u8; 32] = sk.try_into().map_err(|_| anyhow::anyhow!("bad sk length"))?;
        let signing = SigningKey::from_bytes(&sk_arr);
        Ok(signing.sign(msg).to_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = generate_ed25519();
        let provider = DefaultCryptoProvider::new();
        let msg = b"hello world";
        let sig = provider.sign_message(&kp.secret_key, msg).unwrap();
        assert!(provider
            .verify_signature(&kp.public_key, msg, &sig)
            .unwrap());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = generate_ed25519();
        let provider = DefaultCryptoProvider::new();
        let sig = provider.sign_message(&kp.secret_key, b"hello").unwrap();
        assert!(!provider
            .verify_signature(&kp.public_key, b"goodbye", &sig)
            .unwrap());
    }

    #[test]
    fn address_is_deterministic_hash_of_public_key() {
        let kp = generate_ed25519();
        let provider = DefaultCryptoProvider::new();
        let a1 = provider.address_from_public_key(&kp.public_key).unwrap();
        let a2 = provider.address_from_public_key(&kp.public_key).unwrap();
        assert_eq!(a1, a2);
    }
}
