//! Keys - deterministic 2-of-3 address derivation.
//!
//! Every multisig address is a pure function of the three account xpubs
//! (primary, secondary, backend), an optional sub-account namespace, the chain and
//! the index:
//!
//! ```text
//! xpub_{primary,secondary,backend} / [type_code / number] / chain / index
//!        │
//!        └── sorted pubkeys → 2-of-3 CHECKMULTISIG → P2WSH → P2SH wrapper
//! ```

mod seed;

pub use seed::{account_xpriv, account_xpub, generate_mnemonic, parse_mnemonic, SigningKey, MULTISIG_PURPOSE};

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_2, OP_PUSHNUM_3};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::{Address, CompressedPublicKey, NetworkKind, PublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::Network;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Invalid extended public key: {0}")]
    InvalidXpub(String),
    #[error("Derivation failed: {0}")]
    DerivationFailed(String),
    #[error("Index {0} is outside the non-hardened range")]
    IndexOutOfRange(u32),
    #[error("Extended key belongs to a different network")]
    NetworkMismatch,
    #[error("Address: {0}")]
    Address(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain { External, Internal }

impl Chain {
    pub fn code(&self) -> u32 {
        match self { Chain::External => 0, Chain::Internal => 1 }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Chain::External => "external", Chain::Internal => "internal" }
    }
}

/// Single-key address encodings for non-multisig flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Standard { Bip44, Bip49, Bip84 }

impl Standard {
    pub fn purpose(&self) -> u32 {
        match self { Standard::Bip44 => 44, Standard::Bip49 => 49, Standard::Bip84 => 84 }
    }
}

/// Sub-account namespace inserted before the chain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubAccountPath {
    pub type_code: u32,
    pub number: u32,
}

/// The three account xpubs forming the multisig basis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigXpubs {
    pub primary: Xpub,
    pub secondary: Xpub,
    pub backend: Xpub,
}

impl MultisigXpubs {
    pub fn check_network(&self, network: Network) -> Result<(), KeyError> {
        let kind = NetworkKind::from(network.to_bitcoin());
        if [&self.primary, &self.secondary, &self.backend].iter().all(|x| x.network == kind) {
            Ok(())
        } else {
            Err(KeyError::NetworkMismatch)
        }
    }

    /// Stable account identifier shared with the co-signing service.
    pub fn account_id(&self) -> String { account_id(&self.primary) }
}

/// Whether `phrase` is the mnemonic behind `secondary`.
pub fn is_secondary_mnemonic(phrase: &str, secondary: &Xpub, network: Network) -> bool {
    account_xpub(phrase, network).map_or(false, |xpub| xpub == *secondary)
}

/// blake3 of the primary account xpub; known before the backend xpub is.
pub fn account_id(primary: &Xpub) -> String {
    blake3::hash(primary.to_string().as_bytes()).to_hex().to_string()
}

pub fn parse_xpub(value: &str) -> Result<Xpub, KeyError> {
    Xpub::from_str(value.trim()).map_err(|e| KeyError::InvalidXpub(e.to_string()))
}

/// A derived 2-of-3 address with everything needed to spend from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub chain: Chain,
    pub index: u32,
    pub address: Address,
    /// 2-of-3 multisig script (P2WSH witness script).
    pub witness_script: ScriptBuf,
    /// P2WSH program pushed by the P2SH script_sig.
    pub redeem_script: ScriptBuf,
    /// Cosigner pubkeys in script order.
    pub pubkeys: [PublicKey; 3],
}

impl DerivedAddress {
    pub fn script_pubkey(&self) -> ScriptBuf { self.address.script_pubkey() }
}

/// Half-open index window `[start, end)` on one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub chain: Chain,
    pub start: u32,
    pub end: u32,
}

impl AddressRange {
    /// Window around the frontier: `gap` below and `gap` above the next free index.
    pub fn soft(chain: Chain, next_free: u32, gap_limit: u32) -> Self {
        Self { chain, start: next_free.saturating_sub(gap_limit), end: next_free.saturating_add(gap_limit) }
    }

    /// Every index from zero up to the lookahead.
    pub fn hard(chain: Chain, next_free: u32, gap_limit: u32) -> Self {
        Self { chain, start: 0, end: next_free.saturating_add(gap_limit) }
    }

    pub fn contains(&self, index: u32) -> bool { index >= self.start && index < self.end }
}

/// Xpubs + network + optional sub-account namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigBasis {
    xpubs: MultisigXpubs,
    network: Network,
    namespace: Option<SubAccountPath>,
}

impl MultisigBasis {
    pub fn new(xpubs: MultisigXpubs, network: Network) -> Result<Self, KeyError> {
        xpubs.check_network(network)?;
        Ok(Self { xpubs, network, namespace: None })
    }

    /// Same keys, shifted into a sub-account namespace.
    pub fn sub_account(&self, namespace: SubAccountPath) -> Self {
        Self { xpubs: self.xpubs.clone(), network: self.network, namespace: Some(namespace) }
    }

    pub fn xpubs(&self) -> &MultisigXpubs { &self.xpubs }
    pub fn network(&self) -> Network { self.network }
    pub fn namespace(&self) -> Option<SubAccountPath> { self.namespace }

    /// Relative path below each account xpub.
    pub fn child_path(&self, chain: Chain, index: u32) -> Result<Vec<ChildNumber>, KeyError> {
        let mut steps = Vec::with_capacity(4);
        if let Some(ns) = self.namespace {
            steps.push(normal(ns.type_code)?);
            steps.push(normal(ns.number)?);
        }
        steps.push(normal(chain.code())?);
        steps.push(normal(index)?);
        Ok(steps)
    }

    pub fn derive_address(&self, chain: Chain, index: u32) -> Result<DerivedAddress, KeyError> {
        self.derive_with(&Secp256k1::verification_only(), chain, index)
    }

    pub fn derive_range(&self, range: AddressRange) -> Result<Vec<DerivedAddress>, KeyError> {
        let secp = Secp256k1::verification_only();
        (range.start..range.end).map(|i| self.derive_with(&secp, range.chain, i)).collect()
    }

    fn derive_with<C: Verification>(&self, secp: &Secp256k1<C>, chain: Chain, index: u32) -> Result<DerivedAddress, KeyError> {
        let path = self.child_path(chain, index)?;
        let derive = |xpub: &Xpub| -> Result<PublicKey, KeyError> {
            let child = xpub.derive_pub(secp, &path).map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
            Ok(PublicKey::new(child.public_key))
        };
        let mut pubkeys = [derive(&self.xpubs.primary)?, derive(&self.xpubs.secondary)?, derive(&self.xpubs.backend)?];
        pubkeys.sort_by_key(|pk| pk.to_bytes());

        let witness_script = multisig_script(&pubkeys);
        let redeem_script = witness_script.to_p2wsh();
        let address = Address::p2shwsh(&witness_script, self.network.to_bitcoin());
        Ok(DerivedAddress { chain, index, address, witness_script, redeem_script, pubkeys })
    }
}

fn normal(index: u32) -> Result<ChildNumber, KeyError> {
    ChildNumber::from_normal_idx(index).map_err(|_| KeyError::IndexOutOfRange(index))
}

/// `OP_2 <pk1> <pk2> <pk3> OP_3 OP_CHECKMULTISIG`
pub fn multisig_script(pubkeys: &[PublicKey; 3]) -> ScriptBuf {
    pubkeys
        .iter()
        .fold(Builder::new().push_opcode(OP_PUSHNUM_2), |b, pk| b.push_key(pk))
        .push_opcode(OP_PUSHNUM_3)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Single-key address for one of the legacy/segwit standards.
pub fn single_key_address(pubkey: &PublicKey, standard: Standard, network: Network) -> Result<Address, KeyError> {
    let net = network.to_bitcoin();
    match standard {
        Standard::Bip44 => Ok(Address::p2pkh(pubkey.pubkey_hash(), net)),
        Standard::Bip49 | Standard::Bip84 => {
            let compressed = CompressedPublicKey::from_slice(&pubkey.to_bytes())
                .map_err(|e| KeyError::Address(e.to_string()))?;
            Ok(if standard == Standard::Bip49 {
                Address::p2shwpkh(&compressed, net)
            } else {
                Address::p2wpkh(&compressed, net)
            })
        }
    }
}

/// Single-key address at `m/purpose'/coin'/0'/chain/index` of a mnemonic.
pub fn single_key_address_at(phrase: &str, standard: Standard, network: Network, chain: Chain, index: u32) -> Result<Address, KeyError> {
    let key = SigningKey::for_standard(phrase, standard, network)?;
    let secp = Secp256k1::verification_only();
    let child = key
        .xpub()
        .derive_pub(&secp, &[normal(chain.code())?, normal(index)?])
        .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
    single_key_address(&PublicKey::new(child.public_key), standard, network)
}

/// Owned-address lookup: address string → (chain, index).
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    entries: HashMap<String, (Chain, u32)>,
    derived: HashMap<(Chain, u32), DerivedAddress>,
}

impl AddressBook {
    /// Every address from zero to the lookahead on both chains.
    pub fn build(basis: &MultisigBasis, next_free: u32, next_free_change: u32, gap_limit: u32) -> Result<Self, KeyError> {
        let mut book = Self::default();
        for range in [
            AddressRange::hard(Chain::External, next_free, gap_limit),
            AddressRange::hard(Chain::Internal, next_free_change, gap_limit),
        ] {
            for derived in basis.derive_range(range)? {
                book.entries.insert(derived.address.to_string(), (derived.chain, derived.index));
                book.derived.insert((derived.chain, derived.index), derived);
            }
        }
        Ok(book)
    }

    pub fn lookup(&self, address: &str) -> Option<(Chain, u32)> { self.entries.get(address).copied() }
    pub fn get(&self, chain: Chain, index: u32) -> Option<&DerivedAddress> { self.derived.get(&(chain, index)) }
    pub fn contains(&self, address: &str) -> bool { self.entries.contains_key(address) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Addresses of `chain` whose index lies in `range`, ascending.
    pub fn in_range(&self, range: AddressRange) -> Vec<String> {
        (range.start..range.end)
            .filter_map(|i| self.derived.get(&(range.chain, i)))
            .map(|d| d.address.to_string())
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &str> { self.entries.keys().map(String::as_str) }
}
