//! HttpCoSigner - reqwest against the co-signing service

use async_trait::async_trait;
use bitcoin::Txid;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{
    ActivityRequest, ActivityResponse, BackendXpubRequest, BackendXpubResponse, CoSignRequest, CoSignResponse, CoSigner,
    CoSignerError, HealthCheckRequest, HealthCheckResponse,
};

pub struct HttpCoSigner {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCoSigner {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CoSignerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoSignerError::Network(format!("client: {}", e)))?;
        Ok(Self { http, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R, CoSignerError> {
        let url = format!("{}/{}", self.base_url, path);
        let res = self.http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CoSignerError::Network(e.to_string()))?;
        let status = res.status();
        if status.is_client_error() {
            let message = res.text().await.unwrap_or_default();
            return Err(CoSignerError::Rejected(message.trim().to_string()));
        }
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(CoSignerError::Network(format!("{}: {}", status.as_u16(), message.trim())));
        }
        res.json().await.map_err(|e| CoSignerError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl CoSigner for HttpCoSigner {
    async fn fetch_backend_xpub(&self, request: &BackendXpubRequest) -> Result<String, CoSignerError> {
        let response: BackendXpubResponse = self.post("xpub", request).await?;
        Ok(response.xpub)
    }

    async fn submit(&self, request: &CoSignRequest) -> Result<Txid, CoSignerError> {
        debug!(account = %request.account_id, inputs = request.child_index_array.len(), "co-sign request");
        let response: CoSignResponse = self.post("cosign", request).await?;
        Txid::from_str(response.txid.trim()).map_err(|e| CoSignerError::Malformed(format!("txid '{}': {}", response.txid, e)))
    }

    async fn is_active(&self, request: &ActivityRequest) -> Result<bool, CoSignerError> {
        let response: ActivityResponse = self.post("active", request).await?;
        Ok(response.is_active)
    }

    async fn check_health(&self, request: &HealthCheckRequest) -> Result<bool, CoSignerError> {
        debug!(account = %request.account_id, pos = request.pos, "health check");
        let response: HealthCheckResponse = self.post("health", request).await?;
        Ok(response.is_valid)
    }
}
