//! multisig-vault: two-factor, 2-of-3 multisig Bitcoin account engine.
//!
//! # Architecture
//!
//! ```text
//! SecureAccount (entry point, one async mutex per account)
//!   │
//!   ├── keys        (mnemonics → m/49'/coin'/0' xpubs → 2-of-3 P2SH-P2WSH addresses)
//!   │
//!   ├── ledger      (UTXOs, transactions, frontier; sync against one indexer call)
//!   │     └── chain::ChainClient (indexer + broadcast)
//!   │
//!   ├── spend       (coin selection → PSBT → user signature)
//!   │     ├── cosigner::CoSigner (backend signature, gated by a one-time token)
//!   │     └── local dual-sign with the secondary key → chain::ChainClient
//!   │
//!   ├── twofa       (TOTP enrollment, validation, reset)
//!   ├── derivative  (numbered sub-ledgers under the same keys)
//!   └── uri         (BIP21 payment URIs)
//! ```
//!
//! # Key tree
//!
//! | Path | Use |
//! |------|-----|
//! | `m/49'/coin'/0'` | account xpub, one per key (primary, secondary, backend) |
//! | `xpub/chain/index` | main account; chain 0 = receive, 1 = change |
//! | `xpub/type/number/chain/index` | derivative account (type 3 = sub-account, 5 = donation) |
//!
//! # Features
//!
//! - `http` (default) - reqwest-backed [`HttpChainClient`] and [`HttpCoSigner`]
//!
//! # Usage
//!
//! ```ignore
//! use multisig_vault::{AccountConfig, HttpChainClient, HttpCoSigner, SecureAccount, SyncMode};
//!
//! let account = SecureAccount::create(AccountConfig::testnet(), primary, None, chain, cosigner)?;
//! account.import_cosigner_key(token).await;
//! let outcome = account.sync_balances(SyncMode::Soft).await;
//! ```

pub mod account;
pub mod chain;
pub mod config;
pub mod cosigner;
pub mod derivative;
pub mod keys;
pub mod ledger;
pub mod logging;
pub mod spend;
pub mod twofa;
pub mod uri;

pub use account::{AccountError, AccountSnapshot, ErrorClass, Response, SecureAccount, Target};
pub use chain::{ChainClient, ChainError};
pub use config::{AccountConfig, ChainEndpoints, Network};
pub use cosigner::{CoSigner, CoSignerError};
pub use derivative::{AccountDetails, DerivativeKind, DonationDetails, Preferences, VisibilityConfig};
pub use keys::{Chain, KeyError, MultisigBasis, MultisigXpubs};
pub use ledger::{Balances, Ledger, SyncMode, SyncOutcome, TransactionRecord, TxKind, Utxo};
pub use spend::{FeeRate, FeeTier, FeeTiers, Recipient, SpendError, SpendPhase, TransactionPrerequisite};
pub use twofa::{TwoFactorSetup, TwoFactorState};
pub use uri::PaymentRequest;

#[cfg(feature = "http")]
pub use chain::HttpChainClient;
#[cfg(feature = "http")]
pub use cosigner::HttpCoSigner;
