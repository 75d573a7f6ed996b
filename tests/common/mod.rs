//! In-memory indexer and co-signer shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::psbt::Psbt;
use bitcoin::{Address, Transaction, Txid};
use multisig_vault::chain::{AccountResponse, AddressTransactions, MultiAddressRequest, WireStatus, WireTransaction, WireTxIo, WireUtxo};
use multisig_vault::cosigner::{ActivityRequest, BackendXpubRequest, CoSignRequest, HealthCheckRequest};
use multisig_vault::keys::{account_xpub, MultisigBasis, MultisigXpubs};
use multisig_vault::twofa::{base32_decode, totp};
use multisig_vault::{AccountConfig, Chain, ChainClient, ChainError, CoSigner, CoSignerError, Network, SecureAccount};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

// Well-known test mnemonics, never use with real funds
pub const PRIMARY: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const SECONDARY: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";
pub const BACKEND: &str = "letter advice cage absurd amount doctor acoustic avoid letter advice cage above";
pub const OTHER: &str = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong";

pub const VALID_TOKEN: u32 = 424_242;

pub static BACKEND_XPUB: Lazy<String> =
    Lazy::new(|| account_xpub(BACKEND, Network::Testnet).expect("backend xpub").to_string());

pub static SECONDARY_XPUB: Lazy<String> =
    Lazy::new(|| account_xpub(SECONDARY, Network::Testnet).expect("secondary xpub").to_string());

pub fn basis() -> MultisigBasis {
    let xpubs = MultisigXpubs {
        primary: account_xpub(PRIMARY, Network::Testnet).expect("primary"),
        secondary: account_xpub(SECONDARY, Network::Testnet).expect("secondary"),
        backend: account_xpub(BACKEND, Network::Testnet).expect("backend"),
    };
    MultisigBasis::new(xpubs, Network::Testnet).expect("basis")
}

pub fn address(chain: Chain, index: u32) -> String {
    basis().derive_address(chain, index).expect("derive").address.to_string()
}

/// A testnet address outside the account.
pub fn foreign_address(index: u32) -> String {
    let xpubs = MultisigXpubs {
        primary: account_xpub(OTHER, Network::Testnet).expect("other"),
        secondary: account_xpub(SECONDARY, Network::Testnet).expect("secondary"),
        backend: account_xpub(BACKEND, Network::Testnet).expect("backend"),
    };
    let other = MultisigBasis::new(xpubs, Network::Testnet).expect("other basis");
    other.derive_address(Chain::External, index).expect("derive").address.to_string()
}

pub fn fake_txid(n: u8) -> String { format!("{:064x}", n) }

#[derive(Default)]
struct ChainState {
    utxos: Vec<WireUtxo>,
    txs: HashMap<String, Vec<WireTransaction>>,
    broadcasts: Vec<String>,
    requests: Vec<MultiAddressRequest>,
    fail_query: bool,
    fail_broadcast: bool,
}

/// Indexer + broadcaster over an in-memory UTXO set.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Pay `value` to `address` from a foreign sender.
    pub fn fund(&self, address: &str, n: u8, value: u64, confirmations: u32) {
        let status = WireStatus { confirmed: confirmations > 0, block_time: (confirmations > 0).then_some(1_700_000_000) };
        let mut state = self.lock();
        state.utxos.push(WireUtxo { txid: fake_txid(n), vout: 0, value, address: address.to_string(), status });
        state.txs.entry(address.to_string()).or_default().push(WireTransaction {
            txid: fake_txid(n),
            transaction_type: None,
            amount: value,
            sent_amount: None,
            received_amount: None,
            fee: 200,
            confirmations,
            status,
            sender_addresses: Vec::new(),
            recipient_addresses: Vec::new(),
            inputs: Some(vec![WireTxIo { address: Some(foreign_address(99)), value: value + 200 }]),
            outputs: Some(vec![WireTxIo { address: Some(address.to_string()), value }]),
        });
    }

    /// Mempool view of a broadcast: inputs disappear, outputs appear unconfirmed.
    pub fn apply(&self, tx: &Transaction) {
        let txid = tx.compute_txid().to_string();
        let mut state = self.lock();
        for input in &tx.input {
            let spent = (input.previous_output.txid.to_string(), input.previous_output.vout);
            state.utxos.retain(|u| (u.txid.clone(), u.vout) != spent);
        }
        for (vout, output) in tx.output.iter().enumerate() {
            let Ok(address) = Address::from_script(&output.script_pubkey, bitcoin::Network::Testnet) else { continue };
            state.utxos.push(WireUtxo {
                txid: txid.clone(),
                vout: vout as u32,
                value: output.value.to_sat(),
                address: address.to_string(),
                status: WireStatus::default(),
            });
        }
    }

    pub fn set_fail_query(&self, fail: bool) { self.lock().fail_query = fail; }
    pub fn set_fail_broadcast(&self, fail: bool) { self.lock().fail_broadcast = fail; }
    pub fn broadcasts(&self) -> Vec<String> { self.lock().broadcasts.clone() }
    pub fn requests(&self) -> Vec<MultiAddressRequest> { self.lock().requests.clone() }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn query_addresses(&self, request: &MultiAddressRequest) -> Result<AccountResponse, ChainError> {
        let mut state = self.lock();
        state.requests.push(request.clone());
        if state.fail_query {
            return Err(ChainError::Network("indexer unreachable".into()));
        }
        let queried: Vec<&String> = request.sets.external.iter().chain(request.sets.internal.iter()).collect();
        let utxos = queried
            .iter()
            .map(|a| state.utxos.iter().filter(|u| &u.address == *a).cloned().collect())
            .collect();
        let txs = queried
            .iter()
            .filter_map(|a| {
                state.txs.get(*a).map(|txs| AddressTransactions {
                    address: (*a).clone(),
                    total_transactions: txs.len() as u32,
                    transactions: txs.clone(),
                })
            })
            .collect();
        Ok(AccountResponse { utxos, txs })
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, ChainError> {
        if self.lock().fail_broadcast {
            return Err(ChainError::BroadcastFailed { primary: "503".into(), fallback: "503".into() });
        }
        let tx: Transaction = deserialize_hex(tx_hex).map_err(|e| ChainError::Malformed(e.to_string()))?;
        self.apply(&tx);
        self.lock().broadcasts.push(tx_hex.to_string());
        Ok(tx.compute_txid().to_string())
    }
}

/// Co-signer that accepts exactly one token and forwards to the mock chain.
/// An account counts as active once its backend xpub was released.
pub struct MockCoSigner {
    chain: Arc<MockChain>,
    requests: Mutex<Vec<CoSignRequest>>,
    registered: Mutex<HashSet<String>>,
}

impl MockCoSigner {
    pub fn new(chain: Arc<MockChain>) -> Arc<Self> {
        Arc::new(Self { chain, requests: Mutex::new(Vec::new()), registered: Mutex::new(HashSet::new()) })
    }

    pub fn requests(&self) -> Vec<CoSignRequest> { self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone() }

    fn registered(&self) -> std::sync::MutexGuard<'_, HashSet<String>> { self.registered.lock().unwrap_or_else(|p| p.into_inner()) }
}

#[async_trait]
impl CoSigner for MockCoSigner {
    async fn fetch_backend_xpub(&self, request: &BackendXpubRequest) -> Result<String, CoSignerError> {
        if request.token != VALID_TOKEN {
            return Err(CoSignerError::Rejected("invalid token".into()));
        }
        self.registered().insert(request.account_id.clone());
        Ok(BACKEND_XPUB.clone())
    }

    async fn is_active(&self, request: &ActivityRequest) -> Result<bool, CoSignerError> {
        Ok(self.registered().contains(&request.account_id))
    }

    async fn check_health(&self, request: &HealthCheckRequest) -> Result<bool, CoSignerError> {
        if !self.registered().contains(&request.account_id) {
            return Err(CoSignerError::Rejected("unknown account".into()));
        }
        let end = request.pos + request.chunk.len();
        Ok(!request.chunk.is_empty() && SECONDARY_XPUB.get(request.pos..end) == Some(request.chunk.as_str()))
    }

    async fn submit(&self, request: &CoSignRequest) -> Result<Txid, CoSignerError> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).push(request.clone());
        if request.token != VALID_TOKEN {
            return Err(CoSignerError::Rejected("invalid token".into()));
        }
        let bytes = hex::decode(&request.tx_hex).map_err(|e| CoSignerError::Malformed(e.to_string()))?;
        let psbt = Psbt::deserialize(&bytes).map_err(|e| CoSignerError::Malformed(e.to_string()))?;
        if psbt.inputs.iter().any(|input| input.partial_sigs.len() != 1) {
            return Err(CoSignerError::Rejected("expected exactly one user signature per input".into()));
        }
        if request.child_index_array.len() != psbt.inputs.len() {
            return Err(CoSignerError::Rejected("child index map does not cover every input".into()));
        }
        let tx = psbt.unsigned_tx;
        self.chain.apply(&tx);
        Ok(tx.compute_txid())
    }
}

pub struct Harness {
    pub account: SecureAccount,
    pub chain: Arc<MockChain>,
    pub cosigner: Arc<MockCoSigner>,
}

pub fn harness_with(config: AccountConfig) -> Harness {
    let chain = MockChain::new();
    let cosigner = MockCoSigner::new(chain.clone());
    let account = SecureAccount::create(config, PRIMARY, Some(SECONDARY), chain.clone(), cosigner.clone())
        .expect("create")
        .with_backend_xpub(&BACKEND_XPUB)
        .expect("backend xpub");
    Harness { account, chain, cosigner }
}

pub fn harness() -> Harness { harness_with(AccountConfig::testnet()) }

pub fn current_code(secret_b32: &str) -> u32 {
    let secret = base32_decode(secret_b32).expect("base32 secret");
    totp(&secret, chrono::Utc::now().timestamp() as u64)
}

/// Enroll and validate 2FA.
pub async fn activate_two_factor(account: &SecureAccount) {
    let setup = account.setup_two_factor().await.into_data().expect("setup");
    let active = account.validate_two_factor(current_code(&setup.secret)).await;
    assert_eq!(active.data, Some(true));
}
