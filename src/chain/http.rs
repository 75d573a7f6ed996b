//! HttpChainClient - reqwest against an Esplora-style indexer

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use super::{parse_txid, AccountResponse, ChainClient, ChainError, MultiAddressRequest, MultiAddressResponse};
use crate::config::ChainEndpoints;

pub struct HttpChainClient {
    http: reqwest::Client,
    endpoints: ChainEndpoints,
}

impl HttpChainClient {
    pub fn new(endpoints: ChainEndpoints) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(endpoints.timeout)
            .build()
            .map_err(|e| ChainError::Network(format!("client: {}", e)))?;
        Ok(Self { http, endpoints })
    }

    pub fn endpoints(&self) -> &ChainEndpoints { &self.endpoints }

    async fn post_raw(&self, url: &str, tx_hex: &str) -> Result<String, ChainError> {
        let res = self.http
            .post(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(tx_hex.to_string())
            .send()
            .await
            .map_err(|e| ChainError::Network(e.to_string()))?;
        let status = res.status();
        let body = res.text().await.map_err(|e| ChainError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(ChainError::Remote { status: status.as_u16(), message: body.trim().to_string() });
        }
        Ok(parse_txid(&body)?.to_string())
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn query_addresses(&self, request: &MultiAddressRequest) -> Result<AccountResponse, ChainError> {
        debug!(request_id = %request.request_id, external = request.sets.external.len(), internal = request.sets.internal.len(), "indexer query");
        let res = self.http
            .post(&self.endpoints.indexer_url)
            .json(&request.body())
            .send()
            .await
            .map_err(|e| ChainError::Network(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(ChainError::Remote { status: status.as_u16(), message: message.trim().to_string() });
        }
        let parsed: MultiAddressResponse = res
            .json()
            .await
            .map_err(|e| ChainError::Malformed(e.to_string()))?;
        parsed.take(&request.request_id)
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, ChainError> {
        match self.post_raw(&self.endpoints.broadcast_url, tx_hex).await {
            Ok(txid) => Ok(txid),
            Err(primary) => {
                let Some(fallback_url) = self.endpoints.fallback_broadcast_url.as_deref() else {
                    return Err(primary);
                };
                warn!(error = %primary, "broadcast failed on primary endpoint, trying fallback");
                self.post_raw(fallback_url, tx_hex).await.map_err(|fallback| ChainError::BroadcastFailed {
                    primary: primary.to_string(),
                    fallback: fallback.to_string(),
                })
            }
        }
    }
}
