//! Ledger - UTXO, transaction and frontier bookkeeping for one address tree.
//!
//! The main account and every derivative account own exactly one `Ledger`.
//! Sync never edits a ledger in place: it returns a new snapshot that the owner
//! swaps in under its lock.

mod classify;
mod sync;

pub use classify::{classify, Classification};
pub use sync::{plan, reconcile, sync, SyncError, SyncMode, SyncOutcome, SyncPlan};

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::FINALITY_CONFIRMATIONS;
use crate::keys::Chain;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoStatus {
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub tx_id: Txid,
    pub vout: u32,
    pub value: u64,
    pub address: String,
    pub chain: Chain,
    pub index: u32,
    pub status: UtxoStatus,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint { OutPoint { txid: self.tx_id, vout: self.vout } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    Sent,
    Received,
    /// Every input and output belongs to the account; only the fee left.
    #[serde(rename = "Self")]
    SelfTransfer,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self { TxKind::Sent => "Sent", TxKind::Received => "Received", TxKind::SelfTransfer => "Self" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub txid: Txid,
    pub kind: TxKind,
    /// Value paid to recipients (Sent), received (Received) or sent to self (Self).
    pub amount: u64,
    pub fee: u64,
    pub confirmations: u32,
    pub confirmed: bool,
    /// Owned address the indexer reported this transaction under.
    pub address: String,
    #[serde(default)]
    pub sender_addresses: Vec<String>,
    #[serde(default)]
    pub recipient_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<i64>,
    pub seen_at: i64,
}

impl TransactionRecord {
    pub fn is_final(&self) -> bool { self.confirmations >= FINALITY_CONFIRMATIONS }

    /// Display view of a self transfer as an outgoing/incoming pair.
    /// The ledger keeps one record; the pair is never stored.
    pub fn as_sent_received_pair(&self) -> Option<(TransactionRecord, TransactionRecord)> {
        if self.kind != TxKind::SelfTransfer {
            return None;
        }
        let sent = TransactionRecord { kind: TxKind::Sent, amount: self.amount + self.fee, ..self.clone() };
        let received = TransactionRecord { kind: TxKind::Received, ..self.clone() };
        Some((sent, received))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balances {
    /// Spendable: confirmed, trusted change, and the test faucet exception.
    pub balance: u64,
    pub unconfirmed_balance: u64,
}

impl Balances {
    pub fn total(&self) -> u64 { self.balance + self.unconfirmed_balance }
}

/// Outpoint spent by one of our broadcasts, with the owned address it paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedOutpoint {
    pub outpoint: OutPoint,
    /// Empty when the spent output was not in the ledger; such markers are never cleared.
    #[serde(default)]
    pub address: String,
}

/// Outpoints hidden from selection until the indexer stops reporting them on a
/// queried address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumedOutpoints {
    entries: Vec<ConsumedOutpoint>,
}

impl ConsumedOutpoints {
    pub fn contains(&self, outpoint: &OutPoint) -> bool { self.entries.iter().any(|e| &e.outpoint == outpoint) }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &ConsumedOutpoint> { self.entries.iter() }

    pub fn insert(&mut self, outpoint: OutPoint, address: String) {
        if !self.contains(&outpoint) {
            self.entries.push(ConsumedOutpoint { outpoint, address });
        }
    }

    pub fn retain(&mut self, keep: impl FnMut(&ConsumedOutpoint) -> bool) { self.entries.retain(keep) }
}

/// Out-of-range addresses that still carry non-final transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressQueryList {
    pub external: BTreeSet<String>,
    pub internal: BTreeSet<String>,
}

impl AddressQueryList {
    pub fn insert(&mut self, chain: Chain, address: &str) -> bool {
        match chain {
            Chain::External => self.external.insert(address.to_string()),
            Chain::Internal => self.internal.insert(address.to_string()),
        }
    }

    pub fn remove(&mut self, address: &str) -> bool {
        self.external.remove(address) || self.internal.remove(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.external.contains(address) || self.internal.contains(address)
    }

    pub fn len(&self) -> usize { self.external.len() + self.internal.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub next_free_index: u32,
    pub next_free_change_index: u32,
    pub utxos: Vec<Utxo>,
    pub transactions: Vec<TransactionRecord>,
    pub address_query_list: AddressQueryList,
    pub balances: Balances,
    /// Outpoints spent by our own broadcasts; hidden until the indexer agrees.
    #[serde(default)]
    pub consumed: ConsumedOutpoints,
    /// Faucet-funded address counted as spendable while unconfirmed (test accounts only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faucet_address: Option<String>,
}

impl Ledger {
    pub fn new(faucet_address: Option<String>) -> Self {
        Self { faucet_address, ..Default::default() }
    }

    fn is_spendable(&self, utxo: &Utxo) -> bool {
        utxo.status.confirmed
            || utxo.chain == Chain::Internal
            || self.faucet_address.as_deref() == Some(utxo.address.as_str())
    }

    /// UTXOs coin selection may use.
    pub fn spendable_utxos(&self) -> Vec<Utxo> {
        self.utxos
            .iter()
            .filter(|u| !self.consumed.contains(&u.outpoint()) && self.is_spendable(u))
            .cloned()
            .collect()
    }

    pub fn recompute_balances(&mut self) {
        let mut balances = Balances::default();
        for utxo in self.utxos.iter().filter(|u| !self.consumed.contains(&u.outpoint())) {
            if self.is_spendable(utxo) {
                balances.balance += utxo.value;
            } else {
                balances.unconfirmed_balance += utxo.value;
            }
        }
        self.balances = balances;
    }

    /// Soft-remove inputs spent by a broadcast we made.
    pub fn mark_consumed(&mut self, outpoints: &[OutPoint]) {
        for outpoint in outpoints {
            let address = self.utxos.iter().find(|u| &u.outpoint() == outpoint).map(|u| u.address.clone()).unwrap_or_default();
            self.consumed.insert(*outpoint, address);
        }
        self.utxos.retain(|u| !outpoints.contains(&u.outpoint()));
        self.recompute_balances();
    }

    /// Record our own change output right after broadcast; later syncs dedupe it by outpoint.
    pub fn add_pending_change(&mut self, utxo: Utxo) {
        if utxo.chain == Chain::Internal {
            self.next_free_change_index = self.next_free_change_index.max(utxo.index + 1);
        }
        if !self.utxos.iter().any(|u| u.outpoint() == utxo.outpoint()) {
            self.utxos.push(utxo);
        }
        self.recompute_balances();
    }

    pub fn advance_frontier(&mut self, next_free_index: u32, next_free_change_index: u32) {
        self.next_free_index = self.next_free_index.max(next_free_index);
        self.next_free_change_index = self.next_free_change_index.max(next_free_change_index);
    }
}
