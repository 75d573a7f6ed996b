//! Derivative accounts - numbered sub-ledgers under the same 2-of-3 keys.
//!
//! Each account lives at `xpub/type_code/number/chain/index` and owns its own
//! [`Ledger`]. Visibility settings are presentation-only.

use bitcoin::bip32::Xpub;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::keys::{Chain, KeyError, MultisigBasis, SubAccountPath};
use crate::ledger::Ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DerivativeKind { SubAccount, Donation }

impl DerivativeKind {
    pub fn type_code(&self) -> u32 {
        match self { DerivativeKind::SubAccount => 3, DerivativeKind::Donation => 5 }
    }
    pub fn as_str(&self) -> &'static str {
        match self { DerivativeKind::SubAccount => "subAccount", DerivativeKind::Donation => "donation" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DerivativeError {
    #[error("No derivative account with id {0}")]
    NotFound(String),
    #[error("Account {0} is not a donation account")]
    NotDonation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityConfig {
    pub display_balance: bool,
    pub display_transactions: bool,
    pub display_tx_details: bool,
}

impl Default for VisibilityConfig {
    fn default() -> Self { Self { display_balance: true, display_transactions: true, display_tx_details: true } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationDetails {
    pub donee: String,
    pub subject: String,
    pub description: String,
}

/// Partial update; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub disabled: Option<bool>,
    pub configuration: Option<VisibilityConfig>,
    pub donation: Option<DonationDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivativeAccount {
    pub id: String,
    pub number: u32,
    pub kind: DerivativeKind,
    #[serde(flatten)]
    pub details: AccountDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donation: Option<DonationDetails>,
    #[serde(default)]
    pub configuration: VisibilityConfig,
    #[serde(default)]
    pub disabled: bool,
    pub ledger: Ledger,
}

impl DerivativeAccount {
    pub fn namespace(&self) -> SubAccountPath {
        SubAccountPath { type_code: self.kind.type_code(), number: self.number }
    }

    pub fn basis(&self, parent: &MultisigBasis) -> MultisigBasis { parent.sub_account(self.namespace()) }

    pub fn receiving_address(&self, parent: &MultisigBasis) -> Result<String, KeyError> {
        Ok(self.basis(parent).derive_address(Chain::External, self.ledger.next_free_index)?.address.to_string())
    }
}

/// Stable id: blake3 over kind, number and the primary xpub.
pub fn derivative_id(kind: DerivativeKind, number: u32, primary: &Xpub) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(&number.to_be_bytes());
    hasher.update(primary.to_string().as_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivativeAccounts {
    accounts: BTreeMap<String, DerivativeAccount>,
}

impl DerivativeAccounts {
    pub fn len(&self) -> usize { self.accounts.len() }
    pub fn is_empty(&self) -> bool { self.accounts.is_empty() }
    pub fn get(&self, id: &str) -> Option<&DerivativeAccount> { self.accounts.get(id) }
    pub fn iter(&self) -> impl Iterator<Item = &DerivativeAccount> { self.accounts.values() }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut DerivativeAccount, DerivativeError> {
        self.accounts.get_mut(id).ok_or_else(|| DerivativeError::NotFound(id.to_string()))
    }

    fn next_number(&self, kind: DerivativeKind) -> u32 {
        self.accounts.values().filter(|a| a.kind == kind).map(|a| a.number).max().unwrap_or(0) + 1
    }

    fn insert(&mut self, kind: DerivativeKind, primary: &Xpub, details: AccountDetails, donation: Option<DonationDetails>, configuration: VisibilityConfig, disabled: bool) -> (String, u32) {
        let number = self.next_number(kind);
        let id = derivative_id(kind, number, primary);
        self.accounts.insert(
            id.clone(),
            DerivativeAccount { id: id.clone(), number, kind, details, donation, configuration, disabled, ledger: Ledger::new(None) },
        );
        (id, number)
    }

    /// New account with the next ordinal number of its kind (starting at 1).
    pub fn setup(&mut self, kind: DerivativeKind, details: AccountDetails, primary: &Xpub) -> (String, u32) {
        self.insert(kind, primary, details, None, VisibilityConfig::default(), false)
    }

    pub fn setup_donation(&mut self, donation: DonationDetails, configuration: VisibilityConfig, disabled: bool, primary: &Xpub) -> (String, u32) {
        let details = AccountDetails { name: Some(donation.subject.clone()), description: Some(donation.description.clone()) };
        self.insert(DerivativeKind::Donation, primary, details, Some(donation), configuration, disabled)
    }

    /// Returns whether anything changed.
    pub fn update_details(&mut self, id: &str, details: AccountDetails) -> Result<bool, DerivativeError> {
        let account = self.get_mut(id)?;
        let mut next = account.details.clone();
        if details.name.is_some() {
            next.name = details.name;
        }
        if details.description.is_some() {
            next.description = details.description;
        }
        let changed = next != account.details;
        account.details = next;
        Ok(changed)
    }

    /// Returns whether anything changed.
    pub fn update_preferences(&mut self, id: &str, preferences: Preferences) -> Result<bool, DerivativeError> {
        let account = self.get_mut(id)?;
        if preferences.donation.is_some() && account.kind != DerivativeKind::Donation {
            return Err(DerivativeError::NotDonation(id.to_string()));
        }
        let before = account.clone();
        if let Some(disabled) = preferences.disabled {
            account.disabled = disabled;
        }
        if let Some(configuration) = preferences.configuration {
            account.configuration = configuration;
        }
        if let Some(donation) = preferences.donation {
            account.details.name = Some(donation.subject.clone());
            account.details.description = Some(donation.description.clone());
            account.donation = Some(donation);
        }
        Ok(*account != before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::keys::{account_xpub, MultisigXpubs};

    const PRIMARY: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const SECONDARY: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";
    const BACKEND: &str = "letter advice cage absurd amount doctor acoustic avoid letter advice cage above";

    fn basis() -> MultisigBasis {
        let xpubs = MultisigXpubs {
            primary: account_xpub(PRIMARY, Network::Testnet).unwrap(),
            secondary: account_xpub(SECONDARY, Network::Testnet).unwrap(),
            backend: account_xpub(BACKEND, Network::Testnet).unwrap(),
        };
        MultisigBasis::new(xpubs, Network::Testnet).unwrap()
    }

    fn donation() -> DonationDetails {
        DonationDetails { donee: "Shelter".into(), subject: "Winter".into(), description: "Blankets".into() }
    }

    #[test]
    fn numbers_are_ordinal_per_kind() {
        let primary = basis().xpubs().primary;
        let mut accounts = DerivativeAccounts::default();
        let (_, first) = accounts.setup(DerivativeKind::SubAccount, AccountDetails::default(), &primary);
        let (_, second) = accounts.setup(DerivativeKind::SubAccount, AccountDetails::default(), &primary);
        let (_, donation) = accounts.setup_donation(donation(), VisibilityConfig::default(), false, &primary);
        assert_eq!((first, second, donation), (1, 2, 1));
        assert_eq!(accounts.len(), 3);
    }

    #[test]
    fn ids_are_stable() {
        let primary = basis().xpubs().primary;
        let (a, _) = DerivativeAccounts::default().setup(DerivativeKind::Donation, AccountDetails::default(), &primary);
        let (b, _) = DerivativeAccounts::default().setup(DerivativeKind::Donation, AccountDetails::default(), &primary);
        assert_eq!(a, b);
        assert_ne!(a, derivative_id(DerivativeKind::SubAccount, 1, &primary));
    }

    #[test]
    fn updates_are_idempotent() {
        let primary = basis().xpubs().primary;
        let mut accounts = DerivativeAccounts::default();
        let (id, _) = accounts.setup_donation(donation(), VisibilityConfig::default(), false, &primary);

        let prefs = Preferences {
            disabled: Some(true),
            configuration: Some(VisibilityConfig { display_balance: false, ..Default::default() }),
            donation: None,
        };
        assert!(accounts.update_preferences(&id, prefs.clone()).unwrap());
        assert!(!accounts.update_preferences(&id, prefs).unwrap());
        assert!(accounts.get(&id).unwrap().disabled);

        let details = AccountDetails { name: Some("Renamed".into()), description: None };
        assert!(accounts.update_details(&id, details.clone()).unwrap());
        assert!(!accounts.update_details(&id, details).unwrap());
        assert_eq!(accounts.get(&id).unwrap().details.description.as_deref(), Some("Blankets"));
    }

    #[test]
    fn donation_details_only_on_donation_accounts() {
        let primary = basis().xpubs().primary;
        let mut accounts = DerivativeAccounts::default();
        let (id, _) = accounts.setup(DerivativeKind::SubAccount, AccountDetails::default(), &primary);
        let prefs = Preferences { donation: Some(donation()), ..Default::default() };
        assert_eq!(accounts.update_preferences(&id, prefs), Err(DerivativeError::NotDonation(id.clone())));
        assert!(matches!(accounts.update_details("missing", AccountDetails::default()), Err(DerivativeError::NotFound(_))));
    }

    #[test]
    fn receiving_address_uses_namespace() {
        let b = basis();
        let mut accounts = DerivativeAccounts::default();
        let (id, _) = accounts.setup(DerivativeKind::SubAccount, AccountDetails::default(), &b.xpubs().primary);
        let account = accounts.get(&id).unwrap();
        let sub = account.receiving_address(&b).unwrap();
        assert_ne!(sub, b.derive_address(Chain::External, 0).unwrap().address.to_string());
        assert_eq!(sub, b.sub_account(SubAccountPath { type_code: 3, number: 1 }).derive_address(Chain::External, 0).unwrap().address.to_string());
    }

    #[test]
    fn serde_round_trip() {
        let primary = basis().xpubs().primary;
        let mut accounts = DerivativeAccounts::default();
        accounts.setup_donation(donation(), VisibilityConfig::default(), true, &primary);
        let json = serde_json::to_string(&accounts).unwrap();
        let back: DerivativeAccounts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, accounts);
    }
}
