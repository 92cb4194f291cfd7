//! HTTP client for the narrow peer-to-peer surface the orchestrator needs
//! beyond gossip: pushing commit/reveal shares and pulling a peer's chain
//! tip/blocks during partition recovery. Every peer already exposes this
//! over its own `qnet-rpc` router, so reuse that surface instead of
//! building a second wire protocol on top of libp2p.

use std::time::Duration;

use async_trait::async_trait;
use qnet_consensus::PeerTipSummary;
use qnet_core::{Block, NodeId, QNetError, QNetResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Exponential backoff applied to every peer call: base 1s, factor 2, at
/// most 3 attempts before the caller treats the peer as unreachable this
/// tick. A single slow or down peer must never stall a consensus round.
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_ATTEMPTS: u32 = 3;

pub async fn with_retry<T, F, Fut>(mut f: F) -> QNetResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = QNetResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < RETRY_ATTEMPTS => {
                attempt += 1;
                let delay = RETRY_BASE * 2u32.pow(attempt - 1);
                debug!("peer call failed ({e}), retrying in {delay:?} (attempt {attempt})");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn broadcast_commit(
        &self,
        peer_base_url: &str,
        height: u64,
        node: &NodeId,
        commit_hash: [u8; 32],
        signature: &[u8],
    ) -> QNetResult<()>;

    async fn broadcast_reveal(
        &self,
        peer_base_url: &str,
        height: u64,
        node: &NodeId,
        value: &[u8],
    ) -> QNetResult<()>;

    async fn fetch_tip(&self, peer_base_url: &str) -> QNetResult<PeerTipSummary>;

    async fn fetch_blocks(&self, peer_base_url: &str, start: u64, limit: usize) -> QNetResult<Vec<Block>>;
}

pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builds"),
        }
    }

    fn transient(e: impl std::fmt::Display) -> QNetError {
        QNetError::Transient(e.to_string())
    }
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct CommitBody<'a> {
    height: u64,
    node: &'a NodeId,
    commit_hash: String,
    signature: String,
}

#[derive(Serialize)]
struct RevealBody<'a> {
    height: u64,
    node: &'a NodeId,
    value: String,
}

#[derive(Deserialize)]
struct StatusBody {
    height: u64,
}

#[derive(Deserialize)]
struct BlockListBody {
    blocks: Vec<Block>,
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn broadcast_commit(
        &self,
        peer_base_url: &str,
        height: u64,
        node: &NodeId,
        commit_hash: [u8; 32],
        signature: &[u8],
    ) -> QNetResult<()> {
        let body = CommitBody {
            height,
            node,
            commit_hash: hex::encode(commit_hash),
            signature: hex::encode(signature),
        };
        self.client
            .post(format!("{peer_base_url}/consensus/commit"))
            .json(&body)
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?;
        Ok(())
    }

    async fn broadcast_reveal(
        &self,
        peer_base_url: &str,
        height: u64,
        node: &NodeId,
        value: &[u8],
    ) -> QNetResult<()> {
        let body = RevealBody {
            height,
            node,
            value: hex::encode(value),
        };
        self.client
            .post(format!("{peer_base_url}/consensus/reveal"))
            .json(&body)
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?;
        Ok(())
    }

    async fn fetch_tip(&self, peer_base_url: &str) -> QNetResult<PeerTipSummary> {
        let resp: StatusBody = self
            .client
            .get(format!("{peer_base_url}/chain/status"))
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?
            .json()
            .await
            .map_err(Self::transient)?;
        let blocks: BlockListBody = self
            .client
            .get(format!("{peer_base_url}/chain/blocks"))
            .query(&[("start", resp.height.to_string()), ("limit", "1".to_string())])
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?
            .json()
            .await
            .map_err(Self::transient)?;
        let hash = blocks
            .blocks
            .last()
            .map(|b| b.header.hash())
            .unwrap_or([0u8; 32]);
        Ok(PeerTipSummary {
            peer: peer_base_url.to_string(),
            height: resp.height,
            hash,
            timestamp: qnet_core::now_ms(),
        })
    }

    async fn fetch_blocks(&self, peer_base_url: &str, start: u64, limit: usize) -> QNetResult<Vec<Block>> {
        let body: BlockListBody = self
            .client
            .get(format!("{peer_base_url}/chain/blocks"))
            .query(&[("start", start.to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(Self::transient)?
            .error_for_status()
            .map_err(Self::transient)?
            .json()
            .await
            .map_err(Self::transient)?;
        Ok(body.blocks)
    }
}
