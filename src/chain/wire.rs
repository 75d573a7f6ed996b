//! Indexer wire schemas. Required fields are enforced by serde; anything the
//! engine relies on beyond shape (txids, addresses) is validated in `ledger::sync`.

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use super::ChainError;

/// Per-chain address arrays for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressSets {
    pub external: Vec<String>,
    pub internal: Vec<String>,
    pub owned: Vec<String>,
}

impl AddressSets {
    pub fn is_empty(&self) -> bool {
        self.external.is_empty() && self.internal.is_empty() && self.owned.is_empty()
    }
}

/// A single multi-address query. Serialized as `{request_id: {External, Internal, Owned}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiAddressRequest {
    pub request_id: String,
    pub sets: AddressSets,
}

impl MultiAddressRequest {
    pub fn new(sets: AddressSets) -> Self {
        Self { request_id: hex::encode(rand::random::<[u8; 16]>()), sets }
    }

    pub fn body(&self) -> HashMap<&str, &AddressSets> {
        HashMap::from([(self.request_id.as_str(), &self.sets)])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(alias = "Address")]
    pub address: String,
    pub status: WireStatus,
}

impl WireUtxo {
    pub fn outpoint(&self) -> Result<OutPoint, ChainError> {
        Ok(OutPoint { txid: parse_txid(&self.txid)?, vout: self.vout })
    }
}

/// Input or output of a transaction as reported by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTxIo {
    #[serde(default, alias = "scriptpubkey_address")]
    pub address: Option<String>,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTransaction {
    pub txid: String,
    #[serde(rename = "TransactionType", alias = "transactionType", default)]
    pub transaction_type: Option<String>,
    #[serde(rename = "Amount", alias = "amount", default)]
    pub amount: u64,
    #[serde(rename = "SentAmount", alias = "sentAmount", default)]
    pub sent_amount: Option<u64>,
    #[serde(rename = "ReceivedAmount", alias = "receivedAmount", default)]
    pub received_amount: Option<u64>,
    #[serde(alias = "fees", default)]
    pub fee: u64,
    #[serde(rename = "NumberofConfirmations")]
    pub confirmations: u32,
    #[serde(rename = "Status")]
    pub status: WireStatus,
    #[serde(rename = "SenderAddresses", default)]
    pub sender_addresses: Vec<String>,
    #[serde(rename = "RecipientAddresses", default)]
    pub recipient_addresses: Vec<String>,
    /// Raw inputs/outputs; when present the engine classifies locally.
    #[serde(rename = "Vin", alias = "vin", default)]
    pub inputs: Option<Vec<WireTxIo>>,
    #[serde(rename = "Vout", alias = "vout", default)]
    pub outputs: Option<Vec<WireTxIo>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressTransactions {
    pub address: String,
    pub total_transactions: u32,
    #[serde(default)]
    pub transactions: Vec<WireTransaction>,
}

/// Response for one request id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountResponse {
    /// One array per queried address.
    #[serde(default)]
    pub utxos: Vec<Vec<WireUtxo>>,
    #[serde(default)]
    pub txs: Vec<AddressTransactions>,
}

/// Full indexer reply keyed by request id.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct MultiAddressResponse(pub HashMap<String, AccountResponse>);

impl MultiAddressResponse {
    pub fn take(mut self, request_id: &str) -> Result<AccountResponse, ChainError> {
        self.0
            .remove(request_id)
            .ok_or_else(|| ChainError::Malformed(format!("response has no entry for request {}", request_id)))
    }
}

pub fn parse_txid(value: &str) -> Result<Txid, ChainError> {
    Txid::from_str(value.trim()).map_err(|e| ChainError::Malformed(format!("txid '{}': {}", value, e)))
}
