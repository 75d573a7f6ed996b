//! CoSigner - the remote service holding the backend key.
//!
//! It receives the user-signed PSBT, the child-index map and a one-time numeric
//! token, adds the backend signature and broadcasts. A rejected token leaves
//! the transaction unbroadcast.

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpCoSigner;

use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::spend::ChildIndexEntry;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoSignerError {
    #[error("Co-signer rejected the request: {0}")]
    Rejected(String),
    #[error("Co-signer unreachable: {0}")]
    Network(String),
    #[error("Malformed co-signer response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoSignRequest {
    pub account_id: String,
    pub token: u32,
    /// User-signed PSBT, hex.
    pub tx_hex: String,
    pub child_index_array: Vec<ChildIndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoSignResponse {
    pub txid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendXpubRequest {
    pub account_id: String,
    pub token: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendXpubResponse {
    pub xpub: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRequest {
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    pub is_active: bool,
}

/// Proof that the user still holds the secondary xpub: a slice of its string
/// form starting at `pos`, compared by the service against its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRequest {
    pub account_id: String,
    pub chunk: String,
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
    pub is_valid: bool,
}

#[async_trait]
pub trait CoSigner: Send + Sync {
    /// Backend account xpub, released against a valid token.
    async fn fetch_backend_xpub(&self, request: &BackendXpubRequest) -> Result<String, CoSignerError>;

    /// Add the backend signature and broadcast. Returns the network txid.
    async fn submit(&self, request: &CoSignRequest) -> Result<Txid, CoSignerError>;

    /// Whether the service has a registered account under this id.
    async fn is_active(&self, request: &ActivityRequest) -> Result<bool, CoSignerError>;

    async fn check_health(&self, request: &HealthCheckRequest) -> Result<bool, CoSignerError>;
}
