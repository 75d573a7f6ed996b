//! Sync - reconcile a ledger against one indexer response.
//!
//! 1. pending (non-final) txs whose address fell out of range → address query list
//! 2. one request: soft (or hard) range ∪ query list, per chain
//! 3. merge UTXOs by outpoint; unconfirmed → confirmed updates in place
//! 4. recompute balances
//! 5. classify new txs, dedupe by txid, refresh confirmations of known ones
//! 6. roll the frontier to one past the highest used index
//! 7. drop query-list addresses with no remaining non-final tx

use bitcoin::OutPoint;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::{classify, Ledger, TransactionRecord, Utxo, UtxoStatus};
use crate::chain::{parse_txid, AccountResponse, AddressSets, ChainClient, ChainError, MultiAddressRequest, WireUtxo};
use crate::keys::{AddressBook, AddressRange, Chain, KeyError, MultisigBasis};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Fetching balance and transactions failed: {0}")]
    Chain(#[from] ChainError),
    #[error("Address derivation failed: {0}")]
    Key(#[from] KeyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Window of `gap` around the frontier.
    #[default]
    Soft,
    /// Every index from zero; used after restore.
    Hard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub balances: super::Balances,
    pub new_transactions: Vec<TransactionRecord>,
    pub next_free_index: u32,
    pub next_free_change_index: u32,
}

/// Everything needed to interpret the response to `request`.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub request: MultiAddressRequest,
    pub ranges: [AddressRange; 2],
    pub book: AddressBook,
}

impl SyncPlan {
    fn in_range(&self, chain: Chain, index: u32) -> bool {
        self.ranges.iter().any(|r| r.chain == chain && r.contains(index))
    }
}

/// Steps 1-2: extend the query list and build the single request.
pub fn plan(ledger: &Ledger, basis: &MultisigBasis, gap_limit: u32, mode: SyncMode) -> Result<(Ledger, SyncPlan), SyncError> {
    let mut next = ledger.clone();
    let ranges = match mode {
        SyncMode::Soft => [
            AddressRange::soft(Chain::External, ledger.next_free_index, gap_limit),
            AddressRange::soft(Chain::Internal, ledger.next_free_change_index, gap_limit),
        ],
        SyncMode::Hard => [
            AddressRange::hard(Chain::External, ledger.next_free_index, gap_limit),
            AddressRange::hard(Chain::Internal, ledger.next_free_change_index, gap_limit),
        ],
    };
    let book = AddressBook::build(basis, ledger.next_free_index, ledger.next_free_change_index, gap_limit)?;

    for tx in ledger.transactions.iter().filter(|t| !t.is_final()) {
        let Some((chain, index)) = book.lookup(&tx.address) else { continue };
        if !ranges.iter().any(|r| r.chain == chain && r.contains(index)) && next.address_query_list.insert(chain, &tx.address) {
            debug!(address = %tx.address, chain = chain.as_str(), "tracking out-of-range address");
        }
    }

    let mut external = book.in_range(ranges[0]);
    external.extend(next.address_query_list.external.iter().cloned());
    let mut internal = book.in_range(ranges[1]);
    internal.extend(next.address_query_list.internal.iter().cloned());
    let mut owned: Vec<String> = book.all().map(str::to_string).collect();
    owned.sort();

    let request = MultiAddressRequest::new(AddressSets { external, internal, owned });
    Ok((next, SyncPlan { request, ranges, book }))
}

/// Steps 3-7: fold the response into a new ledger snapshot.
pub fn reconcile(mut ledger: Ledger, plan: &SyncPlan, response: AccountResponse, now: i64) -> Result<(Ledger, SyncOutcome), SyncError> {
    let queried: HashSet<&str> = plan.request.sets.external.iter().chain(plan.request.sets.internal.iter()).map(String::as_str).collect();

    // 3. UTXOs
    let mut reported: Vec<(OutPoint, WireUtxo)> = Vec::new();
    let mut seen: HashSet<OutPoint> = HashSet::new();
    let mut still_consumed: HashSet<OutPoint> = HashSet::new();
    for wire in response.utxos.into_iter().flatten() {
        let outpoint = wire.outpoint()?;
        if !plan.book.contains(&wire.address) {
            warn!(address = %wire.address, "indexer returned utxo for an address we do not own, skipping");
            continue;
        }
        if ledger.consumed.contains(&outpoint) {
            still_consumed.insert(outpoint);
            continue;
        }
        if seen.insert(outpoint) {
            reported.push((outpoint, wire));
        }
    }

    let mut fresh: HashMap<OutPoint, WireUtxo> = reported.iter().cloned().collect();
    let mut merged: Vec<Utxo> = Vec::with_capacity(ledger.utxos.len() + fresh.len());
    for mut cached in std::mem::take(&mut ledger.utxos) {
        match fresh.remove(&cached.outpoint()) {
            Some(wire) => {
                if wire.status.confirmed && !cached.status.confirmed {
                    cached.status = UtxoStatus { confirmed: true, block_time: wire.status.block_time };
                }
                merged.push(cached);
            }
            None if queried.contains(cached.address.as_str()) => {
                debug!(outpoint = %cached.outpoint(), "utxo no longer reported, treating as spent");
            }
            None => merged.push(cached),
        }
    }
    for (outpoint, _) in &reported {
        if let Some(wire) = fresh.remove(outpoint) {
            if let Some((chain, index)) = plan.book.lookup(&wire.address) {
                merged.push(Utxo {
                    tx_id: outpoint.txid,
                    vout: outpoint.vout,
                    value: wire.value,
                    address: wire.address,
                    chain,
                    index,
                    status: UtxoStatus { confirmed: wire.status.confirmed, block_time: wire.status.block_time },
                });
            }
        }
    }
    ledger.utxos = merged;
    // A marker clears only once its address was asked about and the outpoint is gone.
    ledger.consumed.retain(|c| still_consumed.contains(&c.outpoint) || !queried.contains(c.address.as_str()));

    // 4. balances
    ledger.recompute_balances();

    // 5-6. transactions + frontier
    let mut known: HashSet<bitcoin::Txid> = ledger.transactions.iter().map(|t| t.txid).collect();
    let mut new_transactions = Vec::new();
    let mut last_used = ledger.next_free_index.checked_sub(1);
    let mut last_used_change = ledger.next_free_change_index.checked_sub(1);

    for info in response.txs {
        let Some((chain, index)) = plan.book.lookup(&info.address) else {
            warn!(address = %info.address, "indexer returned transactions for an address we do not own, skipping");
            continue;
        };
        if info.total_transactions == 0 {
            continue;
        }
        for tx in &info.transactions {
            let txid = parse_txid(&tx.txid)?;
            if known.insert(txid) {
                let class = classify(tx, &plan.book)?;
                new_transactions.push(TransactionRecord {
                    txid,
                    kind: class.kind,
                    amount: class.amount,
                    fee: tx.fee,
                    confirmations: tx.confirmations,
                    confirmed: tx.status.confirmed,
                    address: info.address.clone(),
                    sender_addresses: class.sender_addresses,
                    recipient_addresses: class.recipient_addresses,
                    block_time: tx.status.block_time,
                    seen_at: tx.status.block_time.unwrap_or(now),
                });
            } else if let Some(record) = ledger
                .transactions
                .iter_mut()
                .chain(new_transactions.iter_mut())
                .find(|t| t.txid == txid)
            {
                record.confirmations = record.confirmations.max(tx.confirmations);
                record.confirmed |= tx.status.confirmed;
                if record.block_time.is_none() {
                    record.block_time = tx.status.block_time;
                }
            }
        }
        let slot = match chain { Chain::External => &mut last_used, Chain::Internal => &mut last_used_change };
        *slot = Some(slot.map_or(index, |current| current.max(index)));
    }

    let mut transactions = new_transactions.clone();
    transactions.append(&mut ledger.transactions);
    ledger.transactions = transactions;
    ledger.advance_frontier(last_used.map_or(0, |i| i + 1), last_used_change.map_or(0, |i| i + 1));

    // 7. prune query list
    let pending: HashSet<&str> = ledger.transactions.iter().filter(|t| !t.is_final()).map(|t| t.address.as_str()).collect();
    let stale: Vec<String> = ledger
        .address_query_list
        .external
        .iter()
        .chain(ledger.address_query_list.internal.iter())
        .filter(|a| {
            !pending.contains(a.as_str())
                || plan.book.lookup(a).map_or(false, |(chain, index)| plan.in_range(chain, index))
        })
        .cloned()
        .collect();
    for address in &stale {
        ledger.address_query_list.remove(address);
    }

    let outcome = SyncOutcome {
        balances: ledger.balances,
        new_transactions,
        next_free_index: ledger.next_free_index,
        next_free_change_index: ledger.next_free_change_index,
    };
    Ok((ledger, outcome))
}

/// Plan, query once, reconcile. Returns the replacement snapshot.
pub async fn sync(
    ledger: &Ledger,
    basis: &MultisigBasis,
    gap_limit: u32,
    mode: SyncMode,
    client: &dyn ChainClient,
) -> Result<(Ledger, SyncOutcome), SyncError> {
    let (planned, plan) = plan(ledger, basis, gap_limit, mode)?;
    let response = client.query_addresses(&plan.request).await?;
    let (next, outcome) = reconcile(planned, &plan, response, chrono::Utc::now().timestamp())?;
    info!(
        balance = outcome.balances.balance,
        unconfirmed = outcome.balances.unconfirmed_balance,
        new_txs = outcome.new_transactions.len(),
        next_free = outcome.next_free_index,
        next_free_change = outcome.next_free_change_index,
        "sync complete"
    );
    Ok((next, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{AddressTransactions, WireStatus, WireTransaction, WireTxIo};
    use crate::config::Network;
    use crate::keys::{account_xpub, MultisigXpubs};
    use crate::ledger::TxKind;

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

    fn addr(chain: Chain, index: u32) -> String {
        basis().derive_address(chain, index).unwrap().address.to_string()
    }

    fn txid_hex(n: u8) -> String { format!("{:064x}", n) }

    fn wire_utxo(n: u8, value: u64, address: &str, confirmed: bool) -> WireUtxo {
        WireUtxo { txid: txid_hex(n), vout: 0, value, address: address.into(), status: WireStatus { confirmed, block_time: None } }
    }

    fn raw_tx(n: u8, fee: u64, confirmations: u32, inputs: Vec<(&str, u64)>, outputs: Vec<(&str, u64)>) -> WireTransaction {
        let io = |v: Vec<(&str, u64)>| v.into_iter().map(|(a, value)| WireTxIo { address: Some(a.into()), value }).collect();
        WireTransaction {
            txid: txid_hex(n),
            transaction_type: None,
            amount: 0,
            sent_amount: None,
            received_amount: None,
            fee,
            confirmations,
            status: WireStatus { confirmed: confirmations > 0, block_time: None },
            sender_addresses: vec![],
            recipient_addresses: vec![],
            inputs: Some(io(inputs)),
            outputs: Some(io(outputs)),
        }
    }

    fn run(ledger: &Ledger, response: AccountResponse) -> (Ledger, SyncOutcome) {
        let (planned, plan) = plan(ledger, &basis(), 3, SyncMode::Soft).unwrap();
        reconcile(planned, &plan, response, 1_700_000_000).unwrap()
    }

    #[test]
    fn plan_queries_soft_range_per_chain() {
        let (_, plan) = plan(&Ledger::new(None), &basis(), 3, SyncMode::Soft).unwrap();
        assert_eq!(plan.request.sets.external, (0..3).map(|i| addr(Chain::External, i)).collect::<Vec<_>>());
        assert_eq!(plan.request.sets.internal.len(), 3);
        assert_eq!(plan.request.sets.owned.len(), 6);
    }

    #[test]
    fn receive_advances_frontier_and_balance() {
        let a0 = addr(Chain::External, 0);
        let response = AccountResponse {
            utxos: vec![vec![wire_utxo(1, 100_000, &a0, true)]],
            txs: vec![AddressTransactions {
                address: a0.clone(),
                total_transactions: 1,
                transactions: vec![raw_tx(1, 200, 1, vec![("foreign", 100_200)], vec![(&a0, 100_000)])],
            }],
        };
        let (ledger, outcome) = run(&Ledger::new(None), response);
        assert_eq!(outcome.balances.balance, 100_000);
        assert_eq!(outcome.next_free_index, 1);
        assert_eq!(ledger.transactions[0].kind, TxKind::Received);
        assert_eq!(ledger.transactions[0].amount, 100_000);
    }

    #[test]
    fn sync_is_idempotent() {
        let a0 = addr(Chain::External, 0);
        let response = AccountResponse {
            utxos: vec![vec![wire_utxo(1, 5_000, &a0, false)]],
            txs: vec![AddressTransactions {
                address: a0.clone(),
                total_transactions: 1,
                transactions: vec![raw_tx(1, 100, 0, vec![("foreign", 5_100)], vec![(&a0, 5_000)])],
            }],
        };
        let (first, _) = run(&Ledger::new(None), response.clone());
        let (second, outcome) = run(&first, response);
        assert_eq!(first.utxos, second.utxos);
        assert_eq!(first.transactions, second.transactions);
        assert_eq!(first.balances, second.balances);
        assert!(outcome.new_transactions.is_empty());
    }

    #[test]
    fn unconfirmed_utxo_confirms_in_place() {
        let a0 = addr(Chain::External, 0);
        let pending = AccountResponse { utxos: vec![vec![wire_utxo(1, 5_000, &a0, false)]], txs: vec![] };
        let (first, _) = run(&Ledger::new(None), pending);
        assert_eq!(first.balances.unconfirmed_balance, 5_000);
        let confirmed = AccountResponse { utxos: vec![vec![wire_utxo(1, 5_000, &a0, true)]], txs: vec![] };
        let (second, _) = run(&first, confirmed);
        assert_eq!(second.utxos.len(), 1);
        assert!(second.utxos[0].status.confirmed);
        assert_eq!(second.balances.balance, 5_000);
    }

    #[test]
    fn unreported_utxo_in_queried_range_is_dropped() {
        let a0 = addr(Chain::External, 0);
        let (first, _) = run(&Ledger::new(None), AccountResponse { utxos: vec![vec![wire_utxo(1, 5_000, &a0, true)]], txs: vec![] });
        let (second, _) = run(&first, AccountResponse::default());
        assert!(second.utxos.is_empty());
        assert_eq!(second.balances.balance, 0);
    }

    #[test]
    fn foreign_utxo_is_rejected() {
        let response = AccountResponse { utxos: vec![vec![wire_utxo(1, 5_000, "2NotOurs", true)]], txs: vec![] };
        let (ledger, _) = run(&Ledger::new(None), response);
        assert!(ledger.utxos.is_empty());
    }

    #[test]
    fn consumed_outpoint_is_not_remerged() {
        let a0 = addr(Chain::External, 0);
        let response = AccountResponse { utxos: vec![vec![wire_utxo(1, 5_000, &a0, true)]], txs: vec![] };
        let (mut ledger, _) = run(&Ledger::new(None), response.clone());
        let op = ledger.utxos[0].outpoint();
        ledger.mark_consumed(&[op]);
        let (ledger, _) = run(&ledger, response);
        assert!(ledger.utxos.is_empty());
        assert!(ledger.consumed.contains(&op));
        let (ledger, _) = run(&ledger, AccountResponse::default());
        assert!(ledger.consumed.is_empty());
    }

    #[test]
    fn consumed_marker_survives_unqueried_address() {
        let a2 = addr(Chain::External, 2);
        let reported = AccountResponse { utxos: vec![vec![wire_utxo(9, 50_000, &a2, true)]], txs: vec![] };
        let mut ledger = Ledger::new(None);
        ledger.next_free_index = 10;

        let (planned, hard) = plan(&ledger, &basis(), 3, SyncMode::Hard).unwrap();
        let (mut ledger, _) = reconcile(planned, &hard, reported.clone(), 0).unwrap();
        let op = ledger.utxos[0].outpoint();
        ledger.mark_consumed(&[op]);

        // Soft range is [7, 13): external/2 is not asked about.
        let (planned, soft) = plan(&ledger, &basis(), 3, SyncMode::Soft).unwrap();
        assert!(!soft.request.sets.external.contains(&a2));
        let (ledger, _) = reconcile(planned, &soft, AccountResponse::default(), 0).unwrap();
        assert!(ledger.consumed.contains(&op));

        // A lagging indexer still reports the spent output on a hard sync.
        let (planned, hard) = plan(&ledger, &basis(), 3, SyncMode::Hard).unwrap();
        let (ledger, _) = reconcile(planned, &hard, reported, 0).unwrap();
        assert!(ledger.spendable_utxos().is_empty());
        assert_eq!(ledger.balances.balance, 0);
        assert!(ledger.consumed.contains(&op));

        // Queried and no longer reported: the marker clears.
        let (planned, hard) = plan(&ledger, &basis(), 3, SyncMode::Hard).unwrap();
        let (ledger, _) = reconcile(planned, &hard, AccountResponse::default(), 0).unwrap();
        assert!(ledger.consumed.is_empty());
    }

    #[test]
    fn self_transfer_recorded_once() {
        let a0 = addr(Chain::External, 0);
        let a1 = addr(Chain::External, 1);
        let c0 = addr(Chain::Internal, 0);
        let tx = raw_tx(2, 300, 1, vec![(&a0, 100_000)], vec![(&a1, 60_000), (&c0, 39_700)]);
        let response = AccountResponse {
            utxos: vec![],
            txs: vec![
                AddressTransactions { address: a0.clone(), total_transactions: 1, transactions: vec![tx.clone()] },
                AddressTransactions { address: a1.clone(), total_transactions: 1, transactions: vec![tx.clone()] },
                AddressTransactions { address: c0.clone(), total_transactions: 1, transactions: vec![tx] },
            ],
        };
        let (ledger, outcome) = run(&Ledger::new(None), response);
        assert_eq!(ledger.transactions.len(), 1);
        assert_eq!(ledger.transactions[0].kind, TxKind::SelfTransfer);
        assert_eq!(ledger.transactions[0].amount, 60_000);
        assert_eq!((outcome.next_free_index, outcome.next_free_change_index), (2, 1));
    }

    #[test]
    fn fee_tolerance_separates_self_from_sent() {
        let a0 = addr(Chain::External, 0);
        let c0 = addr(Chain::Internal, 0);
        // Fee 300 but the indexer's fee field says 299: loss exceeds tolerance → Sent.
        let mut tx = raw_tx(3, 299, 1, vec![(&a0, 100_000)], vec![(&c0, 99_700)]);
        let response = |tx: WireTransaction| AccountResponse {
            utxos: vec![],
            txs: vec![AddressTransactions { address: a0.clone(), total_transactions: 1, transactions: vec![tx] }],
        };
        let (ledger, _) = run(&Ledger::new(None), response(tx.clone()));
        assert_eq!(ledger.transactions[0].kind, TxKind::Sent);

        tx.txid = txid_hex(4);
        tx.fee = 300;
        let (ledger, _) = run(&Ledger::new(None), response(tx));
        assert_eq!(ledger.transactions[0].kind, TxKind::SelfTransfer);
    }

    #[test]
    fn sent_transaction_amount_excludes_fee() {
        let a0 = addr(Chain::External, 0);
        let c0 = addr(Chain::Internal, 0);
        let tx = raw_tx(5, 500, 1, vec![(&a0, 100_000)], vec![("2Foreign", 40_000), (&c0, 59_500)]);
        let response = AccountResponse {
            utxos: vec![],
            txs: vec![AddressTransactions { address: a0.clone(), total_transactions: 1, transactions: vec![tx] }],
        };
        let (ledger, _) = run(&Ledger::new(None), response);
        let record = &ledger.transactions[0];
        assert_eq!((record.kind, record.amount, record.fee), (TxKind::Sent, 40_000, 500));
        assert_eq!(record.recipient_addresses, vec!["2Foreign".to_string()]);
    }

    #[test]
    fn declared_type_used_without_raw_io() {
        let a0 = addr(Chain::External, 0);
        let mut tx = raw_tx(6, 100, 2, vec![], vec![]);
        tx.inputs = None;
        tx.outputs = None;
        tx.transaction_type = Some("Received".into());
        tx.amount = 7_000;
        let response = AccountResponse {
            utxos: vec![],
            txs: vec![AddressTransactions { address: a0, total_transactions: 1, transactions: vec![tx.clone()] }],
        };
        let (ledger, _) = run(&Ledger::new(None), response);
        assert_eq!((ledger.transactions[0].kind, ledger.transactions[0].amount), (TxKind::Received, 7_000));

        tx.transaction_type = Some("Gift".into());
        tx.txid = txid_hex(7);
        let response = AccountResponse {
            utxos: vec![],
            txs: vec![AddressTransactions { address: addr(Chain::External, 0), total_transactions: 1, transactions: vec![tx] }],
        };
        let (planned, plan) = plan(&Ledger::new(None), &basis(), 3, SyncMode::Soft).unwrap();
        assert!(matches!(reconcile(planned, &plan, response, 0), Err(SyncError::Chain(ChainError::Malformed(_)))));
    }

    #[test]
    fn query_list_tracks_and_prunes_out_of_range_address() {
        let a0 = addr(Chain::External, 0);
        let mut ledger = Ledger::new(None);
        ledger.next_free_index = 10;
        ledger.transactions.push(TransactionRecord {
            txid: parse_txid(&txid_hex(8)).unwrap(),
            kind: TxKind::Received,
            amount: 1,
            fee: 0,
            confirmations: 2,
            confirmed: true,
            address: a0.clone(),
            sender_addresses: vec![],
            recipient_addresses: vec![],
            block_time: None,
            seen_at: 0,
        });

        // Still pending: address stays tracked and is queried.
        let (planned, plan_) = plan(&ledger, &basis(), 3, SyncMode::Soft).unwrap();
        assert!(planned.address_query_list.external.contains(&a0));
        assert!(plan_.request.sets.external.contains(&a0));
        let mut tx = raw_tx(8, 0, 3, vec![("foreign", 1)], vec![(&a0, 1)]);
        let response = |tx: WireTransaction| AccountResponse {
            utxos: vec![],
            txs: vec![AddressTransactions { address: a0.clone(), total_transactions: 1, transactions: vec![tx] }],
        };
        let (after, _) = reconcile(planned, &plan_, response(tx.clone()), 0).unwrap();
        assert!(after.address_query_list.external.contains(&a0));

        // Seven confirmations: pruned.
        tx.confirmations = 7;
        let (planned, plan_) = plan(&after, &basis(), 3, SyncMode::Soft).unwrap();
        let (after, _) = reconcile(planned, &plan_, response(tx), 0).unwrap();
        assert!(after.address_query_list.is_empty());
        assert_eq!(after.transactions[0].confirmations, 7);
    }
}
