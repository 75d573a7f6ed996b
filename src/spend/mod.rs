//! Spend - coin selection, PSBT construction and the two-factor signing protocol.
//!
//! ```text
//! Init ──select──► prerequisites ──build──► UnsignedSpend (Built)
//!                                              │ primary key
//!                                              ▼
//!                                   PartiallySignedSpend (UserSigned)
//!                         token + CoSigner ─┤├─ secondary key (local)
//!                                              ▼
//!                                    BroadcastReceipt (Finalized)
//! ```
//!
//! Every failure past `Init` is wrapped in [`SpendError::Phase`] so callers can tell
//! which step failed. A failed broadcast never touches the ledger.

mod builder;
mod fees;
mod select;
mod signer;

pub use builder::{build, UnsignedSpend};
pub use fees::{estimate_vsize, fee_for, output_vbytes, GENERIC_OUTPUT_VBYTES, INPUT_VBYTES, OVERHEAD_VBYTES, P2SH_SCRIPT_LEN};
pub use select::{compute_prerequisites, custom_fee, parse_recipients, select_coins, send_max_fee, SelectionPolicy};
pub use signer::{
    finalize, sign_secondary, sign_user, BroadcastReceipt, ChildIndexEntry, InputRef, PartiallySignedSpend,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::chain::ChainError;
use crate::cosigner::CoSignerError;
use crate::keys::KeyError;
use crate::ledger::Utxo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTier { Low, Medium, High }

impl FeeTier {
    pub const ALL: [FeeTier; 3] = [FeeTier::Low, FeeTier::Medium, FeeTier::High];

    pub fn as_str(&self) -> &'static str {
        match self { FeeTier::Low => "low", FeeTier::Medium => "medium", FeeTier::High => "high" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRate {
    /// sat/vB
    pub fee_per_byte: u64,
    pub estimated_blocks: u32,
}

/// Fee-rate quote per tier, as supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTiers {
    pub low: FeeRate,
    pub medium: FeeRate,
    pub high: FeeRate,
}

impl FeeTiers {
    pub fn get(&self, tier: FeeTier) -> FeeRate {
        match tier { FeeTier::Low => self.low, FeeTier::Medium => self.medium, FeeTier::High => self.high }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedOutput {
    pub address: String,
    pub value: u64,
    /// Change back to the account's internal chain.
    #[serde(default)]
    pub change: bool,
}

/// Change destination: the next free internal address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTarget {
    pub address: String,
    pub index: u32,
}

/// Inputs and outputs chosen for one fee tier. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPrerequisite {
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<PlannedOutput>,
    pub fee: u64,
    pub fee_rate: u64,
    pub estimated_blocks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_index: Option<u32>,
}

impl TransactionPrerequisite {
    pub fn input_value(&self) -> u64 { self.inputs.iter().map(|u| u.value).sum() }
    pub fn change_value(&self) -> u64 { self.outputs.iter().filter(|o| o.change).map(|o| o.value).sum() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteSet {
    /// Fee of the cheapest funded tier.
    pub fee: u64,
    /// Spendable balance the selection ran against.
    pub balance: u64,
    pub tiers: BTreeMap<FeeTier, TransactionPrerequisite>,
    /// At least one tier was recomputed at the minimum relay rate.
    #[serde(default)]
    pub used_min_relay_fallback: bool,
    /// Tiers whose quoted rate could not be funded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub min_relay_tiers: Vec<FeeTier>,
}

/// Where the three-phase protocol currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendStage { Init, Built, UserSigned, Finalized, Failed }

/// Tag attached to a failure so the caller knows which step to restart from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendPhase { Init, Creation, Signing, Broadcast }

impl SpendPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpendPhase::Init => "tx-init",
            SpendPhase::Creation => "tx-creation",
            SpendPhase::Signing => "tx-signing",
            SpendPhase::Broadcast => "tx-broadcast",
        }
    }
}

impl std::fmt::Display for SpendPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, thiserror::Error)]
pub enum SpendError {
    #[error("No recipients")]
    NoRecipients,
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("Insufficient balance: fee {fee}, amount {net_amount}, balance {balance}")]
    InsufficientFunds { fee: u64, net_amount: u64, balance: u64 },
    #[error("Input {0} is not available for spending")]
    StaleInput(String),
    #[error("Two-factor authentication is not active")]
    TwoFactorInactive,
    #[error("Secondary mnemonic is required for this operation")]
    MissingSecondaryKey,
    #[error("Invalid transaction prerequisite: {0}")]
    InvalidPrerequisite(String),
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    CoSigner(#[from] CoSignerError),
    #[error("{phase}: {source}")]
    Phase { phase: SpendPhase, #[source] source: Box<SpendError> },
}

impl SpendError {
    /// Tag with `phase` unless already tagged.
    pub fn at(self, phase: SpendPhase) -> Self {
        match self {
            SpendError::Phase { .. } => self,
            other => SpendError::Phase { phase, source: Box::new(other) },
        }
    }

    pub fn phase(&self) -> Option<SpendPhase> {
        match self { SpendError::Phase { phase, .. } => Some(*phase), _ => None }
    }

    /// Innermost untagged error.
    pub fn root(&self) -> &SpendError {
        match self { SpendError::Phase { source, .. } => source.root(), other => other }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_tag_is_applied_once() {
        let err = SpendError::NoRecipients.at(SpendPhase::Creation).at(SpendPhase::Broadcast);
        assert_eq!(err.phase(), Some(SpendPhase::Creation));
        assert!(matches!(err.root(), SpendError::NoRecipients));
        assert_eq!(err.to_string(), "tx-creation: No recipients");
    }

    #[test]
    fn tiers_lookup() {
        let rate = |fee_per_byte| FeeRate { fee_per_byte, estimated_blocks: 1 };
        let tiers = FeeTiers { low: rate(1), medium: rate(5), high: rate(10) };
        assert_eq!(FeeTier::ALL.map(|t| tiers.get(t).fee_per_byte), [1, 5, 10]);
    }
}
