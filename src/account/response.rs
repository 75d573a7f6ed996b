//! Uniform result envelope returned by every facade operation.

use serde::{Deserialize, Serialize};

use crate::chain::ChainError;
use crate::cosigner::CoSignerError;
use crate::derivative::DerivativeError;
use crate::keys::KeyError;
use crate::ledger::SyncError;
use crate::spend::SpendError;
use crate::twofa::TwoFactorError;
use crate::uri::UriError;

/// Error class by effect, reported as `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Ok,
    Setup,
    Network,
    InsufficientFunds,
    StaleState,
    Authorization,
    Internal,
}

impl ErrorClass {
    pub fn code(&self) -> u8 {
        match self {
            ErrorClass::Ok => 0,
            ErrorClass::Setup => 1,
            ErrorClass::Network => 2,
            ErrorClass::InsufficientFunds => 3,
            ErrorClass::StaleState => 4,
            ErrorClass::Authorization => 5,
            ErrorClass::Internal => 6,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorClass::Ok => "Success",
            ErrorClass::Setup => "Account setup or input is invalid",
            ErrorClass::Network => "Network request failed",
            ErrorClass::InsufficientFunds => "Insufficient balance",
            ErrorClass::StaleState => "Account state changed, rebuild the transaction",
            ErrorClass::Authorization => "Authorization failed",
            ErrorClass::Internal => "Internal error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Spend(#[from] SpendError),
    #[error(transparent)]
    CoSigner(#[from] CoSignerError),
    #[error(transparent)]
    TwoFactor(#[from] TwoFactorError),
    #[error(transparent)]
    Derivative(#[from] DerivativeError),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error("Backend xpub has not been imported")]
    MissingBackendKey,
    #[error("Neither a backend xpub nor a token was provided")]
    NoBackendSource,
    #[error("Snapshot: {0}")]
    Snapshot(String),
}

fn cosigner_class(err: &CoSignerError) -> ErrorClass {
    match err {
        CoSignerError::Rejected(_) => ErrorClass::Authorization,
        CoSignerError::Network(_) | CoSignerError::Malformed(_) => ErrorClass::Network,
    }
}

impl AccountError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AccountError::Key(_) | AccountError::Uri(_) | AccountError::Derivative(_) => ErrorClass::Setup,
            AccountError::MissingBackendKey | AccountError::NoBackendSource | AccountError::Snapshot(_) => ErrorClass::Setup,
            AccountError::Chain(_) | AccountError::Sync(SyncError::Chain(_)) => ErrorClass::Network,
            AccountError::Sync(SyncError::Key(_)) => ErrorClass::Setup,
            AccountError::CoSigner(err) => cosigner_class(err),
            AccountError::TwoFactor(TwoFactorError::CorruptSecret | TwoFactorError::Derivation(_) | TwoFactorError::EnrollmentUri(_)) => ErrorClass::Internal,
            AccountError::TwoFactor(_) => ErrorClass::Authorization,
            AccountError::Spend(err) => match err.root() {
                SpendError::InsufficientFunds { .. } => ErrorClass::InsufficientFunds,
                SpendError::StaleInput(_) => ErrorClass::StaleState,
                SpendError::TwoFactorInactive | SpendError::MissingSecondaryKey => ErrorClass::Authorization,
                SpendError::CoSigner(err) => cosigner_class(err),
                SpendError::Chain(_) => ErrorClass::Network,
                SpendError::Key(_) | SpendError::NoRecipients | SpendError::InvalidRecipient(_) | SpendError::InvalidPrerequisite(_) => {
                    ErrorClass::Setup
                }
                SpendError::Signing(_) | SpendError::Phase { .. } => ErrorClass::Internal,
            },
        }
    }
}

/// `{status, data}` on success, `{status, err, message}` on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response<T> {
    pub status: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failed spend tag, e.g. `tx-broadcast`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_amount: Option<u64>,
}

impl<T> Response<T> {
    pub fn ok(data: T) -> Self {
        Self { status: ErrorClass::Ok.code(), data: Some(data), err: None, message: None, phase: None, fee: None, net_amount: None }
    }

    pub fn fail(err: AccountError) -> Self {
        let class = err.class();
        let (phase, fee, net_amount) = match &err {
            AccountError::Spend(spend) => {
                let shortfall = match spend.root() {
                    SpendError::InsufficientFunds { fee, net_amount, .. } => (Some(*fee), Some(*net_amount)),
                    _ => (None, None),
                };
                (spend.phase().map(|p| p.as_str().to_string()), shortfall.0, shortfall.1)
            }
            _ => (None, None, None),
        };
        Self {
            status: class.code(),
            data: None,
            err: Some(err.to_string()),
            message: Some(class.message().to_string()),
            phase,
            fee,
            net_amount,
        }
    }

    pub fn from_result(result: Result<T, AccountError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::fail(err),
        }
    }

    pub fn is_ok(&self) -> bool { self.status == ErrorClass::Ok.code() }

    pub fn into_data(self) -> Option<T> { self.data }
}
