//! Seed - mnemonic to account-level keys. Mnemonics never leave this module as seeds.
//!
//! Account keys live at `m/{purpose}'/{coin}'/0'`. Multisig accounts use purpose 49
//! for all three cosigners; single-key fallback flows use the purpose of their standard.

use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use std::str::FromStr;
use zeroize::Zeroizing;

use super::{KeyError, Standard};
use crate::config::Network;

/// Purpose used for every cosigner of the 2-of-3 account.
pub const MULTISIG_PURPOSE: u32 = 49;

/// Parse and normalize a BIP39 mnemonic.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, KeyError> {
    Mnemonic::parse_normalized(phrase).map_err(|e| KeyError::InvalidMnemonic(e.to_string()))
}

/// Fresh 24-word mnemonic from 32 bytes of OS randomness.
pub fn generate_mnemonic() -> Result<Zeroizing<String>, KeyError> {
    let entropy = Zeroizing::new(rand::random::<[u8; 32]>());
    let mnemonic = Mnemonic::from_entropy(&entropy[..])
        .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

fn account_path(purpose: u32, network: Network) -> Result<DerivationPath, KeyError> {
    let path_str = format!("m/{}'/{}'/0'", purpose, network.coin_type());
    DerivationPath::from_str(&path_str).map_err(|e| KeyError::DerivationFailed(e.to_string()))
}

/// Account-level private key for `purpose` derived from a mnemonic.
pub fn account_xpriv(phrase: &str, purpose: u32, network: Network) -> Result<Xpriv, KeyError> {
    let mnemonic = parse_mnemonic(phrase)?;
    let seed = Zeroizing::new(mnemonic.to_seed(""));
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(network.to_bitcoin(), &seed[..])
        .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
    master
        .derive_priv(&secp, &account_path(purpose, network)?)
        .map_err(|e| KeyError::DerivationFailed(e.to_string()))
}

/// Account-level extended public key for the multisig purpose.
pub fn account_xpub(phrase: &str, network: Network) -> Result<Xpub, KeyError> {
    let secp = Secp256k1::new();
    Ok(Xpub::from_priv(&secp, &account_xpriv(phrase, MULTISIG_PURPOSE, network)?))
}

/// Holds an account-level private key for one cosigner and signs on its behalf.
/// The key is kept BIP32-serialized and wiped on drop; it is decoded per derivation.
pub struct SigningKey {
    encoded: Zeroizing<[u8; 78]>,
    xpub: Xpub,
}

impl SigningKey {
    fn from_xpriv(account: Xpriv) -> Self {
        let xpub = Xpub::from_priv(&Secp256k1::new(), &account);
        Self { encoded: Zeroizing::new(account.encode()), xpub }
    }

    pub fn from_mnemonic(phrase: &str, network: Network) -> Result<Self, KeyError> {
        Ok(Self::from_xpriv(account_xpriv(phrase, MULTISIG_PURPOSE, network)?))
    }

    pub fn for_standard(phrase: &str, standard: Standard, network: Network) -> Result<Self, KeyError> {
        Ok(Self::from_xpriv(account_xpriv(phrase, standard.purpose(), network)?))
    }

    pub fn xpub(&self) -> Xpub { self.xpub }

    /// Secret key at a relative, non-hardened path below the account key.
    pub fn child_secret(&self, path: &[ChildNumber]) -> Result<SecretKey, KeyError> {
        let secp = Secp256k1::new();
        let account = Xpriv::decode(&self.encoded[..]).map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
        let child = account
            .derive_priv(&secp, &path)
            .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
        Ok(child.private_key)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("fingerprint", &self.xpub().fingerprint()).finish()
    }
}
