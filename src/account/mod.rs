//! SecureAccount - the facade a host application drives.
//!
//! ```text
//! host ──► SecureAccount (tokio Mutex<AccountState>)
//!             ├── sync_*          ──► ledger::sync ──► ChainClient
//!             ├── prerequisites   ──► spend::select
//!             ├── build_and_sign  ──► spend::build + sign_user
//!             ├── authorize_*     ──► CoSigner::submit ──► mark consumed, add change
//!             └── alternate_*     ──► local dual-sign ──► ChainClient::broadcast
//! ```
//!
//! Every operation holds the account lock for its whole duration, so a sync and a
//! spend never interleave. Operations return [`Response`] and never `Err`.

mod response;
mod snapshot;

pub use response::{AccountError, ErrorClass, Response};
pub use snapshot::{AccountSnapshot, SNAPSHOT_VERSION};

use bitcoin::bip32::Xpub;
use bitcoin::{NetworkKind, OutPoint};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument, Span};
use zeroize::Zeroizing;

use crate::chain::ChainClient;
use crate::config::AccountConfig;
use crate::cosigner::{ActivityRequest, BackendXpubRequest, CoSignRequest, CoSigner, HealthCheckRequest};
use crate::derivative::{AccountDetails, DerivativeAccount, DerivativeAccounts, DerivativeError, DerivativeKind, DonationDetails, Preferences, VisibilityConfig};
use crate::keys::{self, account_xpub, generate_mnemonic, parse_mnemonic, parse_xpub, Chain, KeyError, MultisigBasis, MultisigXpubs, SigningKey};
use crate::ledger::{self, Balances, Ledger, SyncMode, SyncOutcome, TransactionRecord, Utxo};
use crate::logging::{account_span, short_id};
use crate::spend::{
    self, BroadcastReceipt, ChangeTarget, FeeTiers, PartiallySignedSpend, PrerequisiteSet, Recipient, SelectionPolicy,
    SpendError, SpendPhase, TransactionPrerequisite,
};
use crate::twofa::{TwoFactorError, TwoFactorSetup, TwoFactorState};
use crate::uri::{self, PaymentRequest, ScannedKind, UriError};

/// Which ledger a spend or query runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Target<'a> {
    #[default]
    Main,
    Derivative(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMaxFee {
    pub fee: u64,
    /// Spendable balance minus the fee.
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativeCreated {
    pub id: String,
    pub number: u32,
}

struct AccountState {
    primary: Zeroizing<String>,
    /// Dropped (and zeroed) after a local dual-sign.
    secondary: Option<Zeroizing<String>>,
    primary_xpub: Xpub,
    secondary_xpub: Xpub,
    /// `None` until the backend xpub is imported.
    basis: Option<MultisigBasis>,
    ledger: Ledger,
    two_factor: TwoFactorState,
    derivatives: DerivativeAccounts,
    last_sync: Option<i64>,
}

impl AccountState {
    fn basis(&self) -> Result<&MultisigBasis, AccountError> { self.basis.as_ref().ok_or(AccountError::MissingBackendKey) }

    fn account_id(&self) -> String { keys::account_id(&self.primary_xpub) }

    fn two_factor_label(&self) -> String { format!("vault-{}", &self.account_id()[..8]) }

    fn derivative(&self, id: &str) -> Result<&DerivativeAccount, AccountError> {
        Ok(self.derivatives.get(id).ok_or_else(|| DerivativeError::NotFound(id.to_string()))?)
    }

    fn target_basis(&self, target: Target<'_>) -> Result<MultisigBasis, AccountError> {
        let basis = self.basis()?;
        match target {
            Target::Main => Ok(basis.clone()),
            Target::Derivative(id) => Ok(self.derivative(id)?.basis(basis)),
        }
    }

    fn ledger(&self, target: Target<'_>) -> Result<&Ledger, AccountError> {
        match target {
            Target::Main => Ok(&self.ledger),
            Target::Derivative(id) => Ok(&self.derivative(id)?.ledger),
        }
    }

    fn ledger_mut(&mut self, target: Target<'_>) -> Result<&mut Ledger, AccountError> {
        match target {
            Target::Main => Ok(&mut self.ledger),
            Target::Derivative(id) => Ok(&mut self.derivatives.get_mut(id)?.ledger),
        }
    }

    fn change_target(&self, target: Target<'_>) -> Result<ChangeTarget, AccountError> {
        let index = self.ledger(target)?.next_free_change_index;
        let address = self.target_basis(target)?.derive_address(Chain::Internal, index)?.address.to_string();
        Ok(ChangeTarget { address, index })
    }

    fn receiving_address(&self, target: Target<'_>) -> Result<String, AccountError> {
        match target {
            Target::Main => {
                let index = self.ledger.next_free_index;
                Ok(self.basis()?.derive_address(Chain::External, index)?.address.to_string())
            }
            Target::Derivative(id) => Ok(self.derivative(id)?.receiving_address(self.basis()?)?),
        }
    }

    fn install_backend(&mut self, backend: Xpub, config: &AccountConfig) -> Result<(), AccountError> {
        let xpubs = MultisigXpubs { primary: self.primary_xpub, secondary: self.secondary_xpub, backend };
        let basis = MultisigBasis::new(xpubs, config.network)?;
        self.ledger.faucet_address = if config.test_account {
            Some(basis.derive_address(Chain::External, 0)?.address.to_string())
        } else {
            None
        };
        self.basis = Some(basis);
        Ok(())
    }

    fn apply_receipt(&mut self, target: Target<'_>, receipt: &BroadcastReceipt) -> Result<(), AccountError> {
        let ledger = self.ledger_mut(target)?;
        ledger.mark_consumed(&receipt.consumed);
        if let Some(change) = receipt.change.clone() {
            ledger.add_pending_change(change);
        }
        Ok(())
    }
}

/// Inputs must still be spendable in the current ledger.
fn ensure_spendable(ledger: &Ledger, inputs: &[Utxo]) -> Result<(), SpendError> {
    let available: HashSet<OutPoint> = ledger.spendable_utxos().iter().map(Utxo::outpoint).collect();
    match inputs.iter().map(Utxo::outpoint).find(|o| !available.contains(o)) {
        Some(outpoint) => Err(SpendError::StaleInput(outpoint.to_string())),
        None => Ok(()),
    }
}

fn unix_now() -> i64 { chrono::Utc::now().timestamp() }

pub struct SecureAccount {
    config: AccountConfig,
    chain: Arc<dyn ChainClient>,
    cosigner: Arc<dyn CoSigner>,
    state: Mutex<AccountState>,
}

impl SecureAccount {
    /// New account. Without a secondary mnemonic one is generated; read it back
    /// once with [`SecureAccount::secondary_mnemonic`] for the user's backup.
    pub fn create(
        config: AccountConfig,
        primary_mnemonic: &str,
        secondary_mnemonic: Option<&str>,
        chain: Arc<dyn ChainClient>,
        cosigner: Arc<dyn CoSigner>,
    ) -> Result<Self, AccountError> {
        parse_mnemonic(primary_mnemonic)?;
        let secondary = match secondary_mnemonic {
            Some(phrase) => {
                parse_mnemonic(phrase)?;
                Zeroizing::new(phrase.trim().to_string())
            }
            None => generate_mnemonic()?,
        };
        let state = AccountState {
            primary_xpub: account_xpub(primary_mnemonic, config.network)?,
            secondary_xpub: account_xpub(&secondary, config.network)?,
            primary: Zeroizing::new(primary_mnemonic.trim().to_string()),
            secondary: Some(secondary),
            basis: None,
            ledger: Ledger::new(None),
            two_factor: TwoFactorState::default(),
            derivatives: DerivativeAccounts::default(),
            last_sync: None,
        };
        info!(network = config.network.as_str(), account = %short_id(&state.account_id()), "secure account created");
        Ok(Self { config, chain, cosigner, state: Mutex::new(state) })
    }

    /// Complete the 2-of-3 basis with a known backend xpub.
    pub fn with_backend_xpub(mut self, backend_xpub: &str) -> Result<Self, AccountError> {
        let backend = parse_xpub(backend_xpub)?;
        self.state.get_mut().install_backend(backend, &self.config)?;
        Ok(self)
    }

    /// Account whose secondary mnemonic stays off-device; only its xpub is given.
    /// The backend xpub is used as given, or fetched from the co-signer against `token`.
    pub async fn import(
        config: AccountConfig,
        primary_mnemonic: &str,
        secondary_xpub: &str,
        backend_xpub: Option<&str>,
        token: Option<u32>,
        chain: Arc<dyn ChainClient>,
        cosigner: Arc<dyn CoSigner>,
    ) -> Result<Self, AccountError> {
        parse_mnemonic(primary_mnemonic)?;
        let secondary_xpub = parse_xpub(secondary_xpub)?;
        if secondary_xpub.network != NetworkKind::from(config.network.to_bitcoin()) {
            return Err(KeyError::NetworkMismatch.into());
        }
        if backend_xpub.is_none() && token.is_none() {
            return Err(AccountError::NoBackendSource);
        }
        let mut state = AccountState {
            primary_xpub: account_xpub(primary_mnemonic, config.network)?,
            secondary_xpub,
            primary: Zeroizing::new(primary_mnemonic.trim().to_string()),
            secondary: None,
            basis: None,
            ledger: Ledger::new(None),
            two_factor: TwoFactorState::default(),
            derivatives: DerivativeAccounts::default(),
            last_sync: None,
        };
        if let Some(backend) = backend_xpub {
            state.install_backend(parse_xpub(backend)?, &config)?;
        }
        let account = Self { config, chain, cosigner, state: Mutex::new(state) };
        if let (None, Some(token)) = (backend_xpub, token) {
            let mut state = account.state.lock().await;
            let span = account.span(&state);
            account.import_cosigner_key_locked(&mut state, token).instrument(span).await?;
        }
        info!(account = %short_id(&account.account_id().await), "secure account imported");
        Ok(account)
    }

    /// Rebuild from a snapshot. The primary mnemonic (and the secondary, when
    /// given) must match the stored xpubs.
    pub fn restore(
        config: AccountConfig,
        primary_mnemonic: &str,
        secondary_mnemonic: Option<&str>,
        snapshot: AccountSnapshot,
        chain: Arc<dyn ChainClient>,
        cosigner: Arc<dyn CoSigner>,
    ) -> Result<Self, AccountError> {
        if snapshot.network != config.network {
            return Err(KeyError::NetworkMismatch.into());
        }
        if account_xpub(primary_mnemonic, config.network)? != snapshot.primary_xpub {
            return Err(AccountError::Snapshot("primary mnemonic does not match the stored xpub".into()));
        }
        let secondary = match secondary_mnemonic {
            Some(phrase) if account_xpub(phrase, config.network)? != snapshot.secondary_xpub => {
                return Err(TwoFactorError::WrongSecondaryMnemonic.into());
            }
            Some(phrase) => Some(Zeroizing::new(phrase.trim().to_string())),
            None => None,
        };
        let config = config.with_gap_limit(snapshot.gap_limit);

        let mut state = AccountState {
            primary: Zeroizing::new(primary_mnemonic.trim().to_string()),
            secondary,
            primary_xpub: snapshot.primary_xpub,
            secondary_xpub: snapshot.secondary_xpub,
            basis: None,
            ledger: snapshot.ledger,
            two_factor: snapshot.two_factor,
            derivatives: snapshot.derivative_accounts,
            last_sync: snapshot.last_sync,
        };
        if let Some(backend) = snapshot.backend_xpub {
            state.install_backend(backend, &config)?;
        }
        info!(account = %short_id(&state.account_id()), derivatives = state.derivatives.len(), "secure account restored");
        Ok(Self { config, chain, cosigner, state: Mutex::new(state) })
    }

    pub fn config(&self) -> &AccountConfig { &self.config }

    fn span(&self, state: &AccountState) -> Span { account_span(&state.account_id(), self.config.network) }

    pub async fn snapshot(&self) -> AccountSnapshot {
        let state = self.state.lock().await;
        AccountSnapshot {
            version: SNAPSHOT_VERSION,
            network: self.config.network,
            gap_limit: self.config.gap_limit,
            has_primary_mnemonic: true,
            has_secondary_mnemonic: state.secondary.is_some(),
            primary_xpub: state.primary_xpub,
            secondary_xpub: state.secondary_xpub,
            backend_xpub: state.basis.as_ref().map(|b| b.xpubs().backend),
            receiving_address: state.receiving_address(Target::Main).ok(),
            ledger: state.ledger.clone(),
            two_factor: state.two_factor.clone(),
            derivative_accounts: state.derivatives.clone(),
            last_sync: state.last_sync,
        }
    }

    pub async fn account_id(&self) -> String { self.state.lock().await.account_id() }

    /// Copy of the secondary mnemonic while it is still held.
    pub async fn secondary_mnemonic(&self) -> Option<Zeroizing<String>> { self.state.lock().await.secondary.clone() }

    pub async fn secondary_xpub(&self) -> Response<String> { Response::ok(self.state.lock().await.secondary_xpub.to_string()) }

    pub async fn is_secondary_mnemonic(&self, phrase: &str) -> Response<bool> {
        let state = self.state.lock().await;
        Response::ok(keys::is_secondary_mnemonic(phrase, &state.secondary_xpub, self.config.network))
    }

    /// Drop the held secondary mnemonic. Returns whether one was held.
    pub async fn remove_secondary_mnemonic(&self) -> Response<bool> {
        let removed = self.state.lock().await.secondary.take().is_some();
        if removed {
            info!("secondary mnemonic removed");
        }
        Response::ok(removed)
    }

    /// Hold the secondary mnemonic again; it must match the secondary xpub.
    pub async fn restore_secondary_mnemonic(&self, phrase: &str) -> Response<bool> {
        let mut state = self.state.lock().await;
        if !keys::is_secondary_mnemonic(phrase, &state.secondary_xpub, self.config.network) {
            return Response::fail(TwoFactorError::WrongSecondaryMnemonic.into());
        }
        state.secondary = Some(Zeroizing::new(phrase.trim().to_string()));
        info!("secondary mnemonic restored");
        Response::ok(true)
    }

    pub async fn two_factor_status(&self) -> &'static str { self.state.lock().await.two_factor.as_str() }

    // ---- 2FA ----

    pub async fn setup_two_factor(&self) -> Response<TwoFactorSetup> {
        let mut state = self.state.lock().await;
        let label = state.two_factor_label();
        Response::from_result(state.two_factor.setup(&self.config.two_factor_issuer, &label).map_err(Into::into))
    }

    /// Returns whether 2FA is active afterwards.
    pub async fn validate_two_factor(&self, code: u32) -> Response<bool> {
        let mut state = self.state.lock().await;
        let now = u64::try_from(unix_now()).unwrap_or_default();
        let result = state.two_factor.validate(code, now).map(|_| state.two_factor.is_active());
        if result.is_err() {
            warn!(state = state.two_factor.as_str(), "two-factor code rejected");
        }
        Response::from_result(result.map_err(Into::into))
    }

    pub async fn reset_two_factor(&self, secondary_mnemonic: &str) -> Response<TwoFactorSetup> {
        let mut state = self.state.lock().await;
        Response::from_result(self.reset_two_factor_locked(&mut state, secondary_mnemonic))
    }

    fn reset_two_factor_locked(&self, state: &mut AccountState, secondary_mnemonic: &str) -> Result<TwoFactorSetup, AccountError> {
        let secondary = state.secondary_xpub;
        let label = state.two_factor_label();
        let setup = state.two_factor.reset(secondary_mnemonic, &secondary, self.config.network, &self.config.two_factor_issuer, &label)?;
        info!("two-factor secret reset from secondary mnemonic");
        Ok(setup)
    }

    pub async fn remove_two_factor(&self) -> Response<bool> {
        let mut state = self.state.lock().await;
        state.two_factor.remove();
        info!("two-factor removed");
        Response::ok(true)
    }

    // ---- keys and addresses ----

    /// Fetch the backend xpub against a one-time token and complete the basis.
    pub async fn import_cosigner_key(&self, token: u32) -> Response<String> {
        let mut state = self.state.lock().await;
        let span = self.span(&state);
        Response::from_result(self.import_cosigner_key_locked(&mut state, token).instrument(span).await)
    }

    async fn import_cosigner_key_locked(&self, state: &mut AccountState, token: u32) -> Result<String, AccountError> {
        let request = BackendXpubRequest { account_id: state.account_id(), token };
        let raw = self.cosigner.fetch_backend_xpub(&request).await?;
        let backend = parse_xpub(&raw)?;
        state.install_backend(backend, &self.config)?;
        info!("backend xpub imported");
        Ok(backend.to_string())
    }

    /// Whether the co-signer has this account registered.
    pub async fn is_active(&self) -> Response<bool> {
        let request = ActivityRequest { account_id: self.account_id().await };
        Response::from_result(self.cosigner.is_active(&request).await.map_err(Into::into))
    }

    /// Ask the co-signer whether `chunk` is the slice of the secondary xpub at `pos`.
    pub async fn check_health(&self, chunk: &str, pos: usize) -> Response<bool> {
        let (account_id, span) = {
            let state = self.state.lock().await;
            (state.account_id(), self.span(&state))
        };
        let request = HealthCheckRequest { account_id, chunk: chunk.to_string(), pos };
        let result = self.cosigner.check_health(&request).instrument(span.clone()).await;
        if let Ok(false) = result {
            span.in_scope(|| warn!(pos, "secondary xpub health check failed"));
        }
        Response::from_result(result.map_err(Into::into))
    }

    pub async fn receiving_address(&self) -> Response<String> {
        Response::from_result(self.state.lock().await.receiving_address(Target::Main))
    }

    pub async fn payment_uri(&self, amount_sat: Option<u64>, label: Option<&str>, message: Option<&str>) -> Response<String> {
        let state = self.state.lock().await;
        Response::from_result(state.receiving_address(Target::Main).and_then(|address| {
            let mut request = PaymentRequest::new(address);
            request.amount_sat = amount_sat;
            request.label = label.map(str::to_string);
            request.message = message.map(str::to_string);
            Ok(uri::encode(&request)?)
        }))
    }

    /// Decode a BIP21 URI whose address must belong to the account network.
    pub fn decode_payment_uri(&self, value: &str) -> Response<PaymentRequest> {
        let result = uri::decode(value).and_then(|request| {
            if uri::is_valid_address(&request.address, self.config.network) {
                Ok(request)
            } else {
                Err(UriError::InvalidAddress(request.address))
            }
        });
        Response::from_result(result.map_err(Into::into))
    }

    /// Classify a scanned string as payment URI or bare address.
    pub fn scan(&self, value: &str) -> Response<ScannedKind> {
        Response::from_result(
            uri::address_diff(value, self.config.network).ok_or_else(|| UriError::InvalidAddress(value.trim().to_string()).into()),
        )
    }

    // ---- ledger ----

    pub async fn balances(&self, target: Target<'_>) -> Response<Balances> {
        Response::from_result(self.state.lock().await.ledger(target).map(|l| l.balances))
    }

    pub async fn transactions(&self, target: Target<'_>) -> Response<Vec<TransactionRecord>> {
        Response::from_result(self.state.lock().await.ledger(target).map(|l| l.transactions.clone()))
    }

    pub async fn sync_balances(&self, mode: SyncMode) -> Response<SyncOutcome> {
        let mut state = self.state.lock().await;
        let span = self.span(&state);
        let result = self.sync_locked(&mut state, Target::Main, mode).instrument(span).await;
        if result.is_ok() {
            state.last_sync = Some(unix_now());
        }
        Response::from_result(result)
    }

    pub async fn sync_derivative(&self, id: &str, mode: SyncMode) -> Response<SyncOutcome> {
        let mut state = self.state.lock().await;
        let span = self.span(&state);
        Response::from_result(self.sync_locked(&mut state, Target::Derivative(id), mode).instrument(span).await)
    }

    async fn sync_locked(&self, state: &mut AccountState, target: Target<'_>, mode: SyncMode) -> Result<SyncOutcome, AccountError> {
        let basis = state.target_basis(target)?;
        let (next, outcome) = ledger::sync(state.ledger(target)?, &basis, self.config.gap_limit, mode, self.chain.as_ref()).await?;
        *state.ledger_mut(target)? = next;
        Ok(outcome)
    }

    // ---- spend: selection ----

    pub async fn transaction_prerequisites(&self, target: Target<'_>, recipients: &[Recipient], tiers: &FeeTiers) -> Response<PrerequisiteSet> {
        let state = self.state.lock().await;
        let result = (|| -> Result<_, AccountError> {
            let change = state.change_target(target)?;
            let candidates = state.ledger(target)?.spendable_utxos();
            Ok(spend::compute_prerequisites(&candidates, recipients, tiers, &change, &SelectionPolicy::from(&self.config))?)
        })();
        Response::from_result(result)
    }

    pub async fn custom_fee(&self, target: Target<'_>, recipients: &[Recipient], fee_rate: u64) -> Response<TransactionPrerequisite> {
        let state = self.state.lock().await;
        let result = (|| -> Result<_, AccountError> {
            let change = state.change_target(target)?;
            let candidates = state.ledger(target)?.spendable_utxos();
            Ok(spend::custom_fee(&candidates, recipients, fee_rate, &change, &SelectionPolicy::from(&self.config))?)
        })();
        Response::from_result(result)
    }

    pub async fn send_max_fee(&self, target: Target<'_>, recipient_count: usize, fee_rate: u64) -> Response<SendMaxFee> {
        let state = self.state.lock().await;
        let result = state.ledger(target).map(|ledger| {
            let candidates = ledger.spendable_utxos();
            let balance: u64 = candidates.iter().map(|u| u.value).sum();
            let fee = spend::send_max_fee(&candidates, recipient_count, fee_rate.max(self.config.min_relay_fee_rate));
            SendMaxFee { fee, amount: balance.saturating_sub(fee) }
        });
        Response::from_result(result)
    }

    // ---- spend: build, sign, broadcast ----

    /// Build the PSBT and add the primary signature.
    pub async fn build_and_sign(&self, target: Target<'_>, prerequisite: &TransactionPrerequisite, sequence: Option<u32>) -> Response<PartiallySignedSpend> {
        let state = self.state.lock().await;
        Response::from_result(self.build_and_sign_locked(&state, target, prerequisite, sequence))
    }

    fn build_and_sign_locked(
        &self,
        state: &AccountState,
        target: Target<'_>,
        prerequisite: &TransactionPrerequisite,
        sequence: Option<u32>,
    ) -> Result<PartiallySignedSpend, AccountError> {
        let basis = state.target_basis(target)?;
        ensure_spendable(state.ledger(target)?, &prerequisite.inputs).map_err(|e| e.at(SpendPhase::Creation))?;
        let unsigned = spend::build(&basis, prerequisite, sequence).map_err(|e| e.at(SpendPhase::Creation))?;
        let primary = SigningKey::from_mnemonic(&state.primary, self.config.network).map_err(|e| SpendError::from(e).at(SpendPhase::Signing))?;
        Ok(spend::sign_user(unsigned, &basis, &primary).map_err(|e| e.at(SpendPhase::Signing))?)
    }

    /// Hand the user-signed spend and a one-time token to the co-signer. On success
    /// the inputs are marked consumed and change is tracked as pending.
    pub async fn authorize_and_broadcast(&self, target: Target<'_>, spend: &PartiallySignedSpend, token: u32) -> Response<BroadcastReceipt> {
        let mut state = self.state.lock().await;
        let span = self.span(&state);
        Response::from_result(self.authorize_locked(&mut state, target, spend, token).instrument(span).await)
    }

    async fn authorize_locked(
        &self,
        state: &mut AccountState,
        target: Target<'_>,
        spend: &PartiallySignedSpend,
        token: u32,
    ) -> Result<BroadcastReceipt, AccountError> {
        if !state.two_factor.is_active() {
            return Err(SpendError::TwoFactorInactive.at(SpendPhase::Broadcast).into());
        }
        let basis = state.target_basis(target)?;
        ensure_spendable(state.ledger(target)?, &spend.inputs).map_err(|e| e.at(SpendPhase::Broadcast))?;

        let request = CoSignRequest {
            account_id: state.account_id(),
            token,
            tx_hex: spend.psbt_hex(),
            child_index_array: spend.child_index_map.clone(),
        };
        let txid = match self.cosigner.submit(&request).await {
            Ok(txid) => txid,
            Err(err) => {
                warn!(error = %err, "co-signer refused the spend");
                return Err(SpendError::from(err).at(SpendPhase::Broadcast).into());
            }
        };
        let receipt = BroadcastReceipt::new(txid, spend, &basis).map_err(|e| e.at(SpendPhase::Broadcast))?;
        state.apply_receipt(target, &receipt)?;
        info!(txid = %receipt.txid, fee = receipt.fee, inputs = receipt.consumed.len(), "spend co-signed and broadcast");
        Ok(receipt)
    }

    /// Sign with both local keys and broadcast directly. The held secondary
    /// mnemonic is discarded afterwards whether or not the broadcast succeeds.
    pub async fn alternate_transfer(
        &self,
        target: Target<'_>,
        prerequisite: &TransactionPrerequisite,
        secondary_mnemonic: Option<&str>,
        sequence: Option<u32>,
    ) -> Response<BroadcastReceipt> {
        let mut state = self.state.lock().await;
        let span = self.span(&state);
        let result = self.alternate_transfer_locked(&mut state, target, prerequisite, secondary_mnemonic, sequence).instrument(span).await;
        if state.secondary.take().is_some() {
            debug!("secondary mnemonic discarded");
        }
        Response::from_result(result)
    }

    async fn alternate_transfer_locked(
        &self,
        state: &mut AccountState,
        target: Target<'_>,
        prerequisite: &TransactionPrerequisite,
        secondary_mnemonic: Option<&str>,
        sequence: Option<u32>,
    ) -> Result<BroadcastReceipt, AccountError> {
        let phrase = match secondary_mnemonic {
            Some(phrase) => {
                if account_xpub(phrase, self.config.network)? != state.secondary_xpub {
                    return Err(TwoFactorError::WrongSecondaryMnemonic.into());
                }
                Zeroizing::new(phrase.trim().to_string())
            }
            None => state.secondary.clone().ok_or_else(|| SpendError::MissingSecondaryKey.at(SpendPhase::Signing))?,
        };

        let basis = state.target_basis(target)?;
        let signed = self.build_and_sign_locked(state, target, prerequisite, sequence)?;
        let secondary = SigningKey::from_mnemonic(&phrase, self.config.network).map_err(|e| SpendError::from(e).at(SpendPhase::Signing))?;
        let signed = spend::sign_secondary(signed, &basis, &secondary).map_err(|e| e.at(SpendPhase::Signing))?;
        let (tx, tx_hex) = spend::finalize(&signed).map_err(|e| e.at(SpendPhase::Signing))?;

        let reported = self.chain.broadcast(&tx_hex).await.map_err(|e| SpendError::from(e).at(SpendPhase::Broadcast))?;
        let txid = tx.compute_txid();
        if reported != txid.to_string() {
            warn!(%txid, reported = %reported, "broadcaster reported a different txid");
        }
        let receipt = BroadcastReceipt::new(txid, &signed, &basis).map_err(|e| e.at(SpendPhase::Broadcast))?;
        state.apply_receipt(target, &receipt)?;
        info!(%txid, fee = receipt.fee, "spend dual-signed locally and broadcast");
        Ok(receipt)
    }

    // ---- derivative accounts ----

    pub async fn setup_derivative_account(&self, kind: DerivativeKind, details: AccountDetails) -> Response<DerivativeCreated> {
        let mut state = self.state.lock().await;
        let primary = state.primary_xpub;
        let (id, number) = state.derivatives.setup(kind, details, &primary);
        info!(kind = kind.as_str(), number, "derivative account created");
        Response::ok(DerivativeCreated { id, number })
    }

    pub async fn setup_donation_account(&self, donation: DonationDetails, configuration: VisibilityConfig, disabled: bool) -> Response<DerivativeCreated> {
        let mut state = self.state.lock().await;
        let primary = state.primary_xpub;
        let (id, number) = state.derivatives.setup_donation(donation, configuration, disabled, &primary);
        info!(number, "donation account created");
        Response::ok(DerivativeCreated { id, number })
    }

    /// Returns whether anything changed.
    pub async fn update_derivative_details(&self, id: &str, details: AccountDetails) -> Response<bool> {
        let mut state = self.state.lock().await;
        Response::from_result(state.derivatives.update_details(id, details).map_err(Into::into))
    }

    /// Returns whether anything changed.
    pub async fn update_derivative_preferences(&self, id: &str, preferences: Preferences) -> Response<bool> {
        let mut state = self.state.lock().await;
        Response::from_result(state.derivatives.update_preferences(id, preferences).map_err(Into::into))
    }

    pub async fn derivative_account(&self, id: &str) -> Response<DerivativeAccount> {
        Response::from_result(self.state.lock().await.derivative(id).cloned())
    }

    pub async fn derivative_receiving_address(&self, id: &str) -> Response<String> {
        Response::from_result(self.state.lock().await.receiving_address(Target::Derivative(id)))
    }
}
