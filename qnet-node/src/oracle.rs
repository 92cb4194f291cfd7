//! Burn-proof oracle backed by the configured external settlement-chain
//! endpoint. There is no mock or "development mode" implementation: a node
//! that cannot reach its oracle fails activation with `Transient` rather
//! than silently accepting unverified burns.

use async_trait::async_trait;
use qnet_activation::{BurnOracle, NodeType};
use qnet_core::{address_to_string, Address, QNetError, QNetResult};
use serde::Deserialize;

pub struct HttpBurnOracle {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBurnOracle {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            endpoint,
        }
    }
}

#[derive(Deserialize)]
struct OracleResponse {
    confirmed: bool,
}

#[async_trait]
impl BurnOracle for HttpBurnOracle {
    async fn verify_burn(
        &self,
        burn_tx_hash: &str,
        expected_wallet: Address,
        expected_amount: u64,
        node_type: NodeType,
    ) -> QNetResult<bool> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("tx", burn_tx_hash.to_string()),
                ("wallet", address_to_string(&expected_wallet)),
                ("amount", expected_amount.to_string()),
                ("node_type", node_type.as_str().to_string()),
            ])
            .send()
            .await
            .map_err(|e| QNetError::Transient(format!("burn oracle unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(QNetError::Transient(format!(
                "burn oracle returned status {}",
                resp.status()
            )));
        }
        let body: OracleResponse = resp
            .json()
            .await
            .map_err(|e| QNetError::Transient(format!("burn oracle returned malformed body: {e}")))?;
        Ok(body.confirmed)
    }
}
