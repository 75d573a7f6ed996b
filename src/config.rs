//! Account configuration - passed from the host application

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Confirmations after which a transaction is final and no longer re-queried.
pub const FINALITY_CONFIRMATIONS: u32 = 6;

/// Consecutive unused addresses scanned past the frontier.
pub const DEFAULT_GAP_LIMIT: u32 = 5;

/// Minimum relay fee rate (sat/vB) used when the preferred tier overdraws.
pub const DEFAULT_MIN_RELAY_FEE_RATE: u64 = 1;

/// Outputs below this value are never created; a smaller change is folded into the fee.
pub const DEFAULT_DUST_LIMIT: u64 = 546;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network { #[default] Bitcoin, Testnet, Signet, Regtest }

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self { Network::Bitcoin => "bitcoin", Network::Testnet => "testnet", Network::Signet => "signet", Network::Regtest => "regtest" }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" | "main" => Some(Network::Bitcoin),
            "testnet" | "test" => Some(Network::Testnet),
            "signet" => Some(Network::Signet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn to_bitcoin(&self) -> bitcoin::Network {
        match self { Network::Bitcoin => bitcoin::Network::Bitcoin, Network::Testnet => bitcoin::Network::Testnet, Network::Signet => bitcoin::Network::Signet, Network::Regtest => bitcoin::Network::Regtest }
    }

    /// BIP44 coin type: 0 on mainnet, 1 on every test network.
    pub fn coin_type(&self) -> u32 {
        match self { Network::Bitcoin => 0, _ => 1 }
    }

    pub fn is_test(&self) -> bool { !matches!(self, Network::Bitcoin) }
}

/// Remote endpoints for the indexer, broadcaster and co-signing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEndpoints {
    /// Multi-address UTXO + transaction query.
    pub indexer_url: String,
    pub broadcast_url: String,
    /// Tried once when the primary broadcast fails.
    pub fallback_broadcast_url: Option<String>,
    pub cosigner_url: Option<String>,
    /// Transport-level timeout. The engine itself never times out a call.
    pub timeout: Duration,
}

impl ChainEndpoints {
    pub fn new(indexer_url: impl Into<String>, broadcast_url: impl Into<String>) -> Self {
        Self {
            indexer_url: indexer_url.into(),
            broadcast_url: broadcast_url.into(),
            fallback_broadcast_url: None,
            cosigner_url: None,
            timeout: Duration::from_secs(30),
        }
    }
    pub fn with_fallback_broadcast(mut self, url: impl Into<String>) -> Self { self.fallback_broadcast_url = Some(url.into()); self }
    pub fn with_cosigner(mut self, url: impl Into<String>) -> Self { self.cosigner_url = Some(url.into()); self }
    pub fn with_timeout(mut self, timeout: Duration) -> Self { self.timeout = timeout; self }
}

/// Account configuration. The host constructs this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    pub network: Network,
    pub gap_limit: u32,
    pub min_relay_fee_rate: u64,
    pub dust_limit: u64,
    /// Test accounts treat the faucet-funded external address 0 as spendable while unconfirmed.
    pub test_account: bool,
    /// Issuer label shown by authenticator apps.
    pub two_factor_issuer: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            gap_limit: DEFAULT_GAP_LIMIT,
            min_relay_fee_rate: DEFAULT_MIN_RELAY_FEE_RATE,
            dust_limit: DEFAULT_DUST_LIMIT,
            test_account: false,
            two_factor_issuer: "MultisigVault".into(),
        }
    }
}

impl AccountConfig {
    pub fn new(network: Network) -> Self { Self { network, ..Default::default() } }
    pub fn mainnet() -> Self { Self::new(Network::Bitcoin) }
    pub fn testnet() -> Self { Self::new(Network::Testnet) }
    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self { self.gap_limit = gap_limit.max(1); self }
    pub fn with_min_relay_fee_rate(mut self, rate: u64) -> Self { self.min_relay_fee_rate = rate.max(1); self }
    pub fn with_dust_limit(mut self, dust_limit: u64) -> Self { self.dust_limit = dust_limit; self }
    pub fn as_test_account(mut self) -> Self { self.test_account = true; self }
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self { self.two_factor_issuer = issuer.into(); self }
}
