//! Accumulative largest-first coin selection with a minimum-relay fallback.

use bitcoin::Address;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};

use super::fees::{estimate_vsize, fee_for, GENERIC_OUTPUT_VBYTES, INPUT_VBYTES, OVERHEAD_VBYTES, P2SH_SCRIPT_LEN};
use super::{ChangeTarget, FeeRate, FeeTier, FeeTiers, PlannedOutput, PrerequisiteSet, Recipient, SpendError, TransactionPrerequisite};
use crate::config::{AccountConfig, Network};
use crate::ledger::Utxo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionPolicy {
    pub network: Network,
    pub min_relay_fee_rate: u64,
    pub dust_limit: u64,
}

impl From<&AccountConfig> for SelectionPolicy {
    fn from(config: &AccountConfig) -> Self {
        Self { network: config.network, min_relay_fee_rate: config.min_relay_fee_rate, dust_limit: config.dust_limit }
    }
}

/// Validate recipients for the account network. Returns the outputs and their script lengths.
pub fn parse_recipients(recipients: &[Recipient], policy: &SelectionPolicy) -> Result<(Vec<PlannedOutput>, Vec<usize>), SpendError> {
    if recipients.is_empty() {
        return Err(SpendError::NoRecipients);
    }
    let mut outputs = Vec::with_capacity(recipients.len());
    let mut script_lens = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let address = Address::from_str(recipient.address.trim())
            .map_err(|e| SpendError::InvalidRecipient(format!("{}: {}", recipient.address, e)))?
            .require_network(policy.network.to_bitcoin())
            .map_err(|_| SpendError::InvalidRecipient(format!("{} is not a {} address", recipient.address, policy.network.as_str())))?;
        if recipient.amount <= policy.dust_limit {
            return Err(SpendError::InvalidRecipient(format!(
                "amount {} to {} is at or below the dust limit {}",
                recipient.amount, recipient.address, policy.dust_limit
            )));
        }
        script_lens.push(address.script_pubkey().len());
        outputs.push(PlannedOutput { address: address.to_string(), value: recipient.amount, change: false });
    }
    Ok((outputs, script_lens))
}

/// Largest value first; confirmed before unconfirmed; then outpoint.
fn compare_largest_first(a: &Utxo, b: &Utxo) -> Ordering {
    b.value
        .cmp(&a.value)
        .then_with(|| b.status.confirmed.cmp(&a.status.confirmed))
        .then_with(|| a.outpoint().cmp(&b.outpoint()))
}

/// Pick inputs until recipients + fee are covered. A change output is added when
/// the remainder clears the dust limit, otherwise the remainder goes to the fee.
pub fn select_coins(
    candidates: &[Utxo],
    outputs: &[PlannedOutput],
    script_lens: &[usize],
    rate: FeeRate,
    change: Option<&ChangeTarget>,
    dust_limit: u64,
) -> Result<TransactionPrerequisite, SpendError> {
    let net_amount: u64 = outputs.iter().map(|o| o.value).sum();
    let mut with_change = script_lens.to_vec();
    with_change.push(P2SH_SCRIPT_LEN);

    let mut sorted = candidates.to_vec();
    sorted.sort_by(compare_largest_first);

    let mut total = 0u64;
    let mut selected = Vec::new();
    let mut fee = fee_for(estimate_vsize(1, script_lens), rate.fee_per_byte);
    for utxo in sorted {
        total = total.saturating_add(utxo.value);
        selected.push(utxo);
        fee = fee_for(estimate_vsize(selected.len(), script_lens), rate.fee_per_byte);
        if total < net_amount.saturating_add(fee) {
            continue;
        }

        let prerequisite = |outputs: Vec<PlannedOutput>, fee: u64, change_index: Option<u32>, inputs: Vec<Utxo>| TransactionPrerequisite {
            inputs,
            outputs,
            fee,
            fee_rate: rate.fee_per_byte,
            estimated_blocks: rate.estimated_blocks,
            change_index,
        };
        if let Some(target) = change {
            let fee_with_change = fee_for(estimate_vsize(selected.len(), &with_change), rate.fee_per_byte);
            let remainder = total.saturating_sub(net_amount).saturating_sub(fee_with_change);
            if total >= net_amount.saturating_add(fee_with_change) && remainder >= dust_limit {
                let mut planned = outputs.to_vec();
                planned.push(PlannedOutput { address: target.address.clone(), value: remainder, change: true });
                return Ok(prerequisite(planned, fee_with_change, Some(target.index), selected));
            }
        }
        return Ok(prerequisite(outputs.to_vec(), total - net_amount, None, selected));
    }
    Err(SpendError::InsufficientFunds { fee, net_amount, balance: total })
}

/// Per-tier prerequisites. Any tier that cannot be funded at its quoted rate is
/// recomputed once at the minimum relay rate; if even that falls short the whole
/// request is `InsufficientFunds`, so every tier is present on success.
pub fn compute_prerequisites(
    candidates: &[Utxo],
    recipients: &[Recipient],
    tiers: &FeeTiers,
    change: &ChangeTarget,
    policy: &SelectionPolicy,
) -> Result<PrerequisiteSet, SpendError> {
    let (outputs, script_lens) = parse_recipients(recipients, policy)?;
    let balance: u64 = candidates.iter().map(|u| u.value).sum();

    let mut selected = BTreeMap::new();
    let mut min_relay_tiers = Vec::new();
    for tier in FeeTier::ALL {
        let quoted = tiers.get(tier);
        let err = match select_coins(candidates, &outputs, &script_lens, quoted, Some(change), policy.dust_limit) {
            Ok(prerequisite) => {
                selected.insert(tier, prerequisite);
                continue;
            }
            Err(err) => err,
        };
        let min_rate = FeeRate { fee_per_byte: policy.min_relay_fee_rate, estimated_blocks: quoted.estimated_blocks };
        match select_coins(candidates, &outputs, &script_lens, min_rate, Some(change), policy.dust_limit) {
            Ok(prerequisite) => {
                info!(tier = tier.as_str(), rate = min_rate.fee_per_byte, fee = prerequisite.fee, "tier funded at minimum relay rate");
                selected.insert(tier, prerequisite);
                min_relay_tiers.push(tier);
            }
            Err(_) => {
                debug!(tier = tier.as_str(), error = %err, "tier not fundable at minimum relay rate");
                return Err(match err {
                    SpendError::InsufficientFunds { fee, net_amount, .. } => SpendError::InsufficientFunds { fee, net_amount, balance },
                    other => other,
                });
            }
        }
    }

    let fee = selected.get(&FeeTier::Low).map(|p| p.fee).unwrap_or_default();
    Ok(PrerequisiteSet { fee, balance, tiers: selected, used_min_relay_fallback: !min_relay_tiers.is_empty(), min_relay_tiers })
}

/// Fee for sweeping every candidate to `recipient_count` outputs with no change.
pub fn send_max_fee(candidates: &[Utxo], recipient_count: usize, fee_rate: u64) -> u64 {
    let vsize = OVERHEAD_VBYTES + candidates.len() as u64 * INPUT_VBYTES + recipient_count.max(1) as u64 * GENERIC_OUTPUT_VBYTES;
    fee_for(vsize, fee_rate)
}

/// Prerequisite at a caller-chosen rate.
pub fn custom_fee(
    candidates: &[Utxo],
    recipients: &[Recipient],
    fee_rate: u64,
    change: &ChangeTarget,
    policy: &SelectionPolicy,
) -> Result<TransactionPrerequisite, SpendError> {
    let (outputs, script_lens) = parse_recipients(recipients, policy)?;
    let rate = FeeRate { fee_per_byte: fee_rate.max(policy.min_relay_fee_rate), estimated_blocks: 0 };
    select_coins(candidates, &outputs, &script_lens, rate, Some(change), policy.dust_limit)
}
