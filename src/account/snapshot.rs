//! Persistable account state. Mnemonics are never written; only their presence.

use bitcoin::bip32::Xpub;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::AccountError;
use crate::config::Network;
use crate::derivative::DerivativeAccounts;
use crate::ledger::Ledger;
use crate::twofa::TwoFactorState;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub version: u32,
    pub network: Network,
    pub gap_limit: u32,
    pub has_primary_mnemonic: bool,
    pub has_secondary_mnemonic: bool,
    pub primary_xpub: Xpub,
    pub secondary_xpub: Xpub,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_xpub: Option<Xpub>,
    /// External address at the frontier when the snapshot was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiving_address: Option<String>,
    pub ledger: Ledger,
    pub two_factor: TwoFactorState,
    #[serde(default)]
    pub derivative_accounts: DerivativeAccounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<i64>,
}

impl AccountSnapshot {
    pub fn to_json(&self) -> Result<String, AccountError> {
        serde_json::to_string_pretty(self).map_err(|e| AccountError::Snapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, AccountError> {
        let snapshot: Self = serde_json::from_str(json).map_err(|e| AccountError::Snapshot(e.to_string()))?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(AccountError::Snapshot(format!("unsupported version {}", snapshot.version)));
        }
        Ok(snapshot)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), AccountError> {
        std::fs::write(path, self.to_json()?).map_err(|e| AccountError::Snapshot(format!("{}: {}", path.display(), e)))
    }

    pub fn read_from(path: &Path) -> Result<Self, AccountError> {
        let json = std::fs::read_to_string(path).map_err(|e| AccountError::Snapshot(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}
