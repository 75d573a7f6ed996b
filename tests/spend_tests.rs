//! Integration Tests: the two-factor spend protocol end to end
//!
//! These tests verify:
//! 1. Prerequisites → user signature → co-signer → ledger update
//! 2. Each UTXO is spent at most once
//! 3. Failed authorization or broadcast never touches the ledger
//! 4. The local dual-sign path wipes the secondary mnemonic

mod common;

use common::*;
use multisig_vault::spend::P2SH_SCRIPT_LEN;
use multisig_vault::{Chain, FeeRate, FeeTier, FeeTiers, Recipient, SyncMode, Target};

fn tiers() -> FeeTiers {
    FeeTiers {
        low: FeeRate { fee_per_byte: 1, estimated_blocks: 6 },
        medium: FeeRate { fee_per_byte: 2, estimated_blocks: 3 },
        high: FeeRate { fee_per_byte: 3, estimated_blocks: 1 },
    }
}

fn pay(amount: u64) -> Vec<Recipient> { vec![Recipient { address: foreign_address(0), amount }] }

async fn funded(value: u64) -> Harness {
    let h = harness();
    h.chain.fund(&address(Chain::External, 0), 1, value, 6);
    assert!(h.account.sync_balances(SyncMode::Soft).await.is_ok());
    h
}

/// Test: 100k confirmed, send 50k at 1 sat/vB → change output, pending change tracked
#[tokio::test]
async fn cosigned_spend_with_change() {
    let h = funded(100_000).await;
    activate_two_factor(&h.account).await;

    let set = h.account.transaction_prerequisites(Target::Main, &pay(50_000), &tiers()).await.into_data().expect("prerequisites");
    assert_eq!(set.balance, 100_000);
    let low = set.tiers[&FeeTier::Low].clone();
    // 11 overhead + 140 input + two P2SH outputs of 9 + 23
    let expected_fee = 11 + 140 + 2 * (9 + P2SH_SCRIPT_LEN as u64);
    assert_eq!(low.fee, expected_fee);
    assert_eq!(low.change_value(), 100_000 - 50_000 - expected_fee);
    assert_eq!(set.tiers[&FeeTier::High].fee, 3 * expected_fee);

    let signed = h.account.build_and_sign(Target::Main, &low, None).await.into_data().expect("signed");
    assert_eq!(signed.child_index_map.len(), 1);
    assert_eq!(signed.child_index_map[0].derivation, "m/49'/1'/0'/0/0");

    let receipt = h.account.authorize_and_broadcast(Target::Main, &signed, VALID_TOKEN).await;
    assert!(receipt.is_ok(), "{:?}", receipt.err);
    let receipt = receipt.into_data().expect("receipt");
    let change = receipt.change.clone().expect("change utxo");
    assert_eq!(change.address, address(Chain::Internal, 0));
    assert_eq!(change.value, 100_000 - 50_000 - expected_fee);

    // Trusted change is immediately spendable
    let balances = h.account.balances(Target::Main).await.into_data().expect("balances");
    assert_eq!(balances.balance, change.value);

    // The co-signer saw the account id and the user-signed PSBT
    let requests = h.cosigner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].account_id, h.account.account_id().await);

    // The next sync agrees with the mempool view and does not double count
    let outcome = h.account.sync_balances(SyncMode::Soft).await.into_data().expect("outcome");
    assert_eq!(outcome.balances.balance, change.value);
    assert_eq!(outcome.next_free_change_index, 1);
}

/// Test: The same signed spend cannot be broadcast twice
#[tokio::test]
async fn spend_is_exactly_once() {
    let h = funded(100_000).await;
    activate_two_factor(&h.account).await;

    let low = h.account.custom_fee(Target::Main, &pay(40_000), 2).await.into_data().expect("custom");
    let signed = h.account.build_and_sign(Target::Main, &low, None).await.into_data().expect("signed");
    assert!(h.account.authorize_and_broadcast(Target::Main, &signed, VALID_TOKEN).await.is_ok());

    let replay = h.account.authorize_and_broadcast(Target::Main, &signed, VALID_TOKEN).await;
    assert_eq!(replay.status, 4);
    assert_eq!(replay.phase.as_deref(), Some("tx-broadcast"));
    assert_eq!(h.cosigner.requests().len(), 1);

    // Building from the stale prerequisite fails at creation
    let rebuilt = h.account.build_and_sign(Target::Main, &low, None).await;
    assert_eq!(rebuilt.status, 4);
    assert_eq!(rebuilt.phase.as_deref(), Some("tx-creation"));
}

/// Test: Remote spend is refused until 2FA is active
#[tokio::test]
async fn authorization_requires_active_two_factor() {
    let h = funded(100_000).await;
    let low = h.account.custom_fee(Target::Main, &pay(10_000), 1).await.into_data().expect("custom");
    let signed = h.account.build_and_sign(Target::Main, &low, None).await.into_data().expect("signed");

    let refused = h.account.authorize_and_broadcast(Target::Main, &signed, VALID_TOKEN).await;
    assert_eq!(refused.status, 5);
    assert_eq!(refused.phase.as_deref(), Some("tx-broadcast"));
    assert!(h.cosigner.requests().is_empty());
}

/// Test: Rejected token leaves balances untouched
#[tokio::test]
async fn rejected_token_keeps_ledger() {
    let h = funded(100_000).await;
    activate_two_factor(&h.account).await;
    let low = h.account.custom_fee(Target::Main, &pay(10_000), 1).await.into_data().expect("custom");
    let signed = h.account.build_and_sign(Target::Main, &low, None).await.into_data().expect("signed");

    let rejected = h.account.authorize_and_broadcast(Target::Main, &signed, 1).await;
    assert_eq!(rejected.status, 5);
    let balances = h.account.balances(Target::Main).await.into_data().expect("balances");
    assert_eq!(balances.balance, 100_000);

    // Same spend still goes through with the right token
    assert!(h.account.authorize_and_broadcast(Target::Main, &signed, VALID_TOKEN).await.is_ok());
}

/// Test: Overdraw reports fee and net amount with status 3
#[tokio::test]
async fn insufficient_funds_response() {
    let h = funded(20_000).await;
    let response = h.account.transaction_prerequisites(Target::Main, &pay(30_000), &tiers()).await;
    assert_eq!(response.status, 3);
    assert_eq!(response.net_amount, Some(30_000));
    assert!(response.fee.expect("fee") > 0);
}

/// Test: Send-max fee leaves the remaining balance as the amount
#[tokio::test]
async fn send_max_fee_sweeps_balance() {
    let h = funded(100_000).await;
    let max = h.account.send_max_fee(Target::Main, 1, 2).await.into_data().expect("send max");
    assert_eq!(max.fee, 2 * (11 + 140 + 34));
    assert_eq!(max.amount, 100_000 - max.fee);
}

/// Test: Local dual-sign broadcasts directly and wipes the secondary mnemonic
#[tokio::test]
async fn alternate_transfer_wipes_secondary() {
    let h = funded(100_000).await;
    assert!(h.account.secondary_mnemonic().await.is_some());

    let low = h.account.custom_fee(Target::Main, &pay(25_000), 1).await.into_data().expect("custom");
    let receipt = h.account.alternate_transfer(Target::Main, &low, None, Some(0xffff_fffd)).await;
    assert!(receipt.is_ok(), "{:?}", receipt.err);
    let receipt = receipt.into_data().expect("receipt");

    let broadcasts = h.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert!(h.cosigner.requests().is_empty());
    assert!(h.account.secondary_mnemonic().await.is_none());
    assert!(!h.account.snapshot().await.has_secondary_mnemonic);
    assert_eq!(receipt.consumed.len(), 1);

    // Without the secondary mnemonic the local path is refused
    let low = h.account.custom_fee(Target::Main, &pay(10_000), 1).await.into_data().expect("custom");
    let refused = h.account.alternate_transfer(Target::Main, &low, None, None).await;
    assert_eq!(refused.status, 5);
    assert_eq!(refused.phase.as_deref(), Some("tx-signing"));

    // Supplying the right mnemonic works again; a wrong one does not
    let wrong = h.account.alternate_transfer(Target::Main, &low, Some(OTHER), None).await;
    assert_eq!(wrong.status, 5);
    assert!(h.account.alternate_transfer(Target::Main, &low, Some(SECONDARY), None).await.is_ok());
}

/// Test: Failed broadcast keeps the ledger but still wipes the secondary
#[tokio::test]
async fn failed_broadcast_keeps_ledger() {
    let h = funded(100_000).await;
    h.chain.set_fail_broadcast(true);

    let low = h.account.custom_fee(Target::Main, &pay(25_000), 1).await.into_data().expect("custom");
    let failed = h.account.alternate_transfer(Target::Main, &low, None, None).await;
    assert_eq!(failed.status, 2);
    assert_eq!(failed.phase.as_deref(), Some("tx-broadcast"));

    let balances = h.account.balances(Target::Main).await.into_data().expect("balances");
    assert_eq!(balances.balance, 100_000);
    assert!(h.account.secondary_mnemonic().await.is_none());
}

/// Test: Derivative accounts spend through the same pipeline on their own ledger
#[tokio::test]
async fn derivative_account_spend() {
    let h = harness();
    activate_two_factor(&h.account).await;
    let created = h
        .account
        .setup_derivative_account(multisig_vault::DerivativeKind::SubAccount, Default::default())
        .await
        .into_data()
        .expect("derivative");
    let target = Target::Derivative(&created.id);

    let sub_address = h.account.derivative_receiving_address(&created.id).await.into_data().expect("address");
    h.chain.fund(&sub_address, 7, 60_000, 6);
    assert!(h.account.sync_derivative(&created.id, SyncMode::Soft).await.is_ok());

    let low = h.account.custom_fee(target, &pay(20_000), 1).await.into_data().expect("custom");
    let signed = h.account.build_and_sign(target, &low, None).await.into_data().expect("signed");
    assert_eq!(signed.child_index_map[0].derivation, "m/49'/1'/0'/3/1/0/0");

    let receipt = h.account.authorize_and_broadcast(target, &signed, VALID_TOKEN).await.into_data().expect("receipt");
    let sub_balance = h.account.balances(target).await.into_data().expect("balances");
    assert_eq!(sub_balance.balance, receipt.change.expect("change").value);
    assert_eq!(h.account.balances(Target::Main).await.into_data().expect("main").total(), 0);
}
