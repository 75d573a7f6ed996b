//! Two-factor enrollment and RFC 6238 one-time codes.
//!
//! ```text
//! Unset ──setup──► PendingValidation ──validate(code)──► Active
//!   ▲                    ▲                                 │
//!   └──── remove ────────┴──── reset(secondary mnemonic) ──┘
//! ```
//!
//! The reset secret is derived from the secondary mnemonic, so re-running a
//! reset with the same mnemonic yields the same enrollment.

use bitcoin::bip32::Xpub;
use bitcoin::hashes::{hmac as bhmac, sha1, Hash, HashEngine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use url::Url;
use zeroize::Zeroizing;

use crate::config::Network;
use crate::keys::{is_secondary_mnemonic, parse_mnemonic};

pub const TOTP_STEP_SECS: u64 = 30;
pub const TOTP_DIGITS: u32 = 6;
/// Steps of clock drift accepted either side of now.
pub const TOTP_WINDOW: u64 = 1;
pub const SECRET_LEN: usize = 20;

const RESET_DOMAIN: &[u8] = b"multisig-vault/two-factor-reset";
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TwoFactorError {
    #[error("Two-factor authentication is already active")]
    AlreadyActive,
    #[error("Two-factor authentication is not set up")]
    NotEnrolled,
    #[error("Invalid one-time code")]
    InvalidCode,
    #[error("Mnemonic does not match the secondary key")]
    WrongSecondaryMnemonic,
    #[error("Stored secret is corrupt")]
    CorruptSecret,
    #[error("Secret derivation failed: {0}")]
    Derivation(String),
    #[error("Enrollment URI: {0}")]
    EnrollmentUri(String),
}

/// Persisted 2FA state. Secrets are base32.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TwoFactorState {
    #[default]
    Unset,
    PendingValidation { secret: String },
    Active { secret: String },
}

impl std::fmt::Debug for TwoFactorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// What an authenticator app needs to enroll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorSetup {
    pub secret: String,
    pub otpauth_uri: String,
}

impl TwoFactorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TwoFactorState::Unset => "unset",
            TwoFactorState::PendingValidation { .. } => "pendingValidation",
            TwoFactorState::Active { .. } => "active",
        }
    }

    pub fn is_active(&self) -> bool { matches!(self, TwoFactorState::Active { .. }) }

    fn secret(&self) -> Option<&str> {
        match self {
            TwoFactorState::Unset => None,
            TwoFactorState::PendingValidation { secret } | TwoFactorState::Active { secret } => Some(secret),
        }
    }

    /// Fresh random secret. Refused while active; use `reset` instead.
    pub fn setup(&mut self, issuer: &str, label: &str) -> Result<TwoFactorSetup, TwoFactorError> {
        if self.is_active() {
            return Err(TwoFactorError::AlreadyActive);
        }
        let secret = Zeroizing::new(rand::random::<[u8; SECRET_LEN]>());
        self.enroll(&secret[..], issuer, label)
    }

    /// Check `code` at `unix_secs`. A pending enrollment becomes active on match.
    pub fn validate(&mut self, code: u32, unix_secs: u64) -> Result<(), TwoFactorError> {
        let encoded = self.secret().ok_or(TwoFactorError::NotEnrolled)?;
        let secret = Zeroizing::new(base32_decode(encoded).ok_or(TwoFactorError::CorruptSecret)?);
        if !verify(&secret, code, unix_secs) {
            return Err(TwoFactorError::InvalidCode);
        }
        if let TwoFactorState::PendingValidation { secret } = self {
            let secret = std::mem::take(secret);
            *self = TwoFactorState::Active { secret };
        }
        Ok(())
    }

    /// Re-enroll with a secret derived from the secondary mnemonic.
    pub fn reset(
        &mut self,
        secondary_phrase: &str,
        secondary: &Xpub,
        network: Network,
        issuer: &str,
        label: &str,
    ) -> Result<TwoFactorSetup, TwoFactorError> {
        if !is_secondary_mnemonic(secondary_phrase, secondary, network) {
            return Err(TwoFactorError::WrongSecondaryMnemonic);
        }
        let secret = reset_secret(secondary_phrase)?;
        self.enroll(&secret[..], issuer, label)
    }

    pub fn remove(&mut self) { *self = TwoFactorState::Unset; }

    fn enroll(&mut self, secret: &[u8], issuer: &str, label: &str) -> Result<TwoFactorSetup, TwoFactorError> {
        let encoded = base32_encode(secret);
        let setup = TwoFactorSetup { otpauth_uri: enrollment_uri(issuer, label, &encoded)?, secret: encoded.clone() };
        *self = TwoFactorState::PendingValidation { secret: encoded };
        Ok(setup)
    }
}

/// `otpauth://totp/Issuer:label?secret=...&issuer=...`
pub fn enrollment_uri(issuer: &str, label: &str, secret_b32: &str) -> Result<String, TwoFactorError> {
    let mut uri = Url::parse("otpauth://totp/").map_err(|e| TwoFactorError::EnrollmentUri(e.to_string()))?;
    uri.set_path(&format!("/{}:{}", issuer, label));
    uri.query_pairs_mut()
        .append_pair("secret", secret_b32)
        .append_pair("issuer", issuer)
        .append_pair("algorithm", "SHA1")
        .append_pair("digits", &TOTP_DIGITS.to_string())
        .append_pair("period", &TOTP_STEP_SECS.to_string());
    Ok(uri.into())
}

/// HOTP value for a counter (RFC 4226 dynamic truncation).
pub fn hotp(secret: &[u8], counter: u64) -> u32 {
    let mut engine = bhmac::HmacEngine::<sha1::Hash>::new(secret);
    engine.input(&counter.to_be_bytes());
    let mac = bhmac::Hmac::<sha1::Hash>::from_engine(engine).to_byte_array();
    let offset = (mac[mac.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([mac[offset], mac[offset + 1], mac[offset + 2], mac[offset + 3]]) & 0x7fff_ffff;
    binary % 10u32.pow(TOTP_DIGITS)
}

pub fn totp(secret: &[u8], unix_secs: u64) -> u32 { hotp(secret, unix_secs / TOTP_STEP_SECS) }

pub fn verify(secret: &[u8], code: u32, unix_secs: u64) -> bool {
    let step = unix_secs / TOTP_STEP_SECS;
    (step.saturating_sub(TOTP_WINDOW)..=step.saturating_add(TOTP_WINDOW)).any(|s| hotp(secret, s) == code)
}

/// HMAC-SHA512 over the BIP39 seed with a domain tag, truncated to the secret length.
fn reset_secret(phrase: &str) -> Result<Zeroizing<[u8; SECRET_LEN]>, TwoFactorError> {
    let mnemonic = parse_mnemonic(phrase).map_err(|e| TwoFactorError::Derivation(e.to_string()))?;
    let seed = Zeroizing::new(mnemonic.to_seed(""));
    let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(RESET_DOMAIN).map_err(|e| TwoFactorError::Derivation(e.to_string()))?;
    mac.update(&seed[..]);
    let digest = mac.finalize().into_bytes();
    let mut secret = Zeroizing::new([0u8; SECRET_LEN]);
    secret.copy_from_slice(&digest[..SECRET_LEN]);
    Ok(secret)
}

/// RFC 4648 base32, no padding.
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

pub fn base32_decode(encoded: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in encoded.trim_end_matches('=').bytes() {
        let value = BASE32_ALPHABET.iter().position(|&a| a == c.to_ascii_uppercase())? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Some(out)
}
