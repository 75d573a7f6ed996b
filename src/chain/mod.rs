//! Chain - indexer queries and raw transaction broadcast.
//!
//! ```text
//! ledger::sync ──► ChainClient::query_addresses ──► POST {request_id: {External, Internal, Owned}}
//! spend        ──► ChainClient::broadcast       ──► POST raw hex (text/plain) ─┬─► primary
//!                                                                              └─► fallback (once)
//! ```

#[cfg(feature = "http")]
mod http;
mod wire;

#[cfg(feature = "http")]
pub use http::HttpChainClient;
pub use wire::{
    parse_txid, AccountResponse, AddressSets, AddressTransactions, MultiAddressRequest,
    MultiAddressResponse, WireStatus, WireTransaction, WireTxIo, WireUtxo,
};

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    #[error("Network: {0}")]
    Network(String),
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Broadcast failed on primary ({primary}) and fallback ({fallback})")]
    BroadcastFailed { primary: String, fallback: String },
}

impl ChainError {
    /// Message from the remote side when it supplied one.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            ChainError::Remote { message, .. } if !message.is_empty() => Some(message),
            _ => None,
        }
    }
}

/// Remote indexer + broadcaster.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// One round trip for every address of an account; returns the entry for `request.request_id`.
    async fn query_addresses(&self, request: &MultiAddressRequest) -> Result<AccountResponse, ChainError>;

    /// Broadcast a fully signed transaction, returning its txid.
    async fn broadcast(&self, tx_hex: &str) -> Result<String, ChainError>;
}
