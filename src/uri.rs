//! BIP21 payment URIs and scanned-string classification.
//!
//! `bitcoin:<address>?amount=<btc>&label=<text>&message=<text>`

use bitcoin::Address;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use url::Url;

use crate::config::Network;

const SCHEME: &str = "bitcoin";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("Not a bitcoin: URI")]
    NotBitcoinUri,
    #[error("Malformed URI: {0}")]
    Malformed(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Unsupported required parameter: {0}")]
    UnsupportedRequired(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_sat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PaymentRequest {
    pub fn new(address: impl Into<String>) -> Self { Self { address: address.into(), ..Default::default() } }
    pub fn with_amount(mut self, amount_sat: u64) -> Self { self.amount_sat = Some(amount_sat); self }
    pub fn with_label(mut self, label: impl Into<String>) -> Self { self.label = Some(label.into()); self }
    pub fn with_message(mut self, message: impl Into<String>) -> Self { self.message = Some(message.into()); self }
}

/// What a scanned string turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScannedKind { PaymentUri, Address }

/// Query values are form-urlencoded (space as `+`).
pub fn encode(request: &PaymentRequest) -> Result<String, UriError> {
    if request.address.is_empty() || request.address.contains(&['?', '#', '/'][..]) {
        return Err(UriError::InvalidAddress(request.address.clone()));
    }
    let mut uri = Url::parse(&format!("{}:{}", SCHEME, request.address)).map_err(|e| UriError::Malformed(e.to_string()))?;
    if request.amount_sat.is_some() || request.label.is_some() || request.message.is_some() {
        let mut query = uri.query_pairs_mut();
        if let Some(amount) = request.amount_sat {
            query.append_pair("amount", &format_btc_amount(amount));
        }
        if let Some(label) = &request.label {
            query.append_pair("label", label);
        }
        if let Some(message) = &request.message {
            query.append_pair("message", message);
        }
    }
    Ok(uri.into())
}

pub fn is_payment_uri(value: &str) -> bool {
    value
        .trim_start()
        .split_once(':')
        .map_or(false, |(scheme, _)| scheme.eq_ignore_ascii_case(SCHEME))
}

pub fn decode(uri: &str) -> Result<PaymentRequest, UriError> {
    let uri = uri.trim();
    if !is_payment_uri(uri) {
        return Err(UriError::NotBitcoinUri);
    }
    let parsed = Url::parse(uri).map_err(|e| UriError::Malformed(e.to_string()))?;
    let address = parsed.path();
    if address.is_empty() {
        return Err(UriError::InvalidAddress(String::new()));
    }

    let mut request = PaymentRequest::new(address);
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "amount" => request.amount_sat = Some(parse_btc_amount(&value)?),
            "label" => request.label = Some(value.into_owned()),
            "message" => request.message = Some(value.into_owned()),
            other if other.starts_with("req-") => return Err(UriError::UnsupportedRequired(other.to_string())),
            _ => {}
        }
    }
    Ok(request)
}

pub fn is_valid_address(address: &str, network: Network) -> bool {
    Address::from_str(address.trim()).map_or(false, |a| a.is_valid_for_network(network.to_bitcoin()))
}

/// Classify a scanned string against the account network.
pub fn address_diff(scanned: &str, network: Network) -> Option<ScannedKind> {
    if is_payment_uri(scanned) {
        let request = decode(scanned).ok()?;
        is_valid_address(&request.address, network).then_some(ScannedKind::PaymentUri)
    } else if is_valid_address(scanned, network) {
        Some(ScannedKind::Address)
    } else {
        None
    }
}

/// Mainnet or testnet, judged from the address encoding alone.
pub fn network_type(scanned: &str) -> Option<Network> {
    let address = if is_payment_uri(scanned) { decode(scanned).ok()?.address } else { scanned.trim().to_string() };
    let parsed = Address::from_str(&address).ok()?;
    if parsed.is_valid_for_network(bitcoin::Network::Bitcoin) {
        Some(Network::Bitcoin)
    } else if parsed.is_valid_for_network(bitcoin::Network::Testnet) {
        Some(Network::Testnet)
    } else {
        None
    }
}

fn format_btc_amount(amount_sat: u64) -> String {
    let whole = amount_sat / 100_000_000;
    let frac = amount_sat % 100_000_000;
    format!("{}.{:08}", whole, frac)
}

fn parse_btc_amount(value: &str) -> Result<u64, UriError> {
    let invalid = || UriError::InvalidAmount(value.to_string());
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    if (whole.is_empty() && frac.is_empty()) || frac.len() > 8 {
        return Err(invalid());
    }
    if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
    let frac: u64 = if frac.is_empty() { 0 } else { format!("{:0<8}", frac).parse().map_err(|_| invalid())? };
    whole.checked_mul(100_000_000).and_then(|w| w.checked_add(frac)).ok_or_else(invalid)
}
