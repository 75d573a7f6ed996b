//! Transaction classification relative to the account's owned addresses.

use crate::chain::{ChainError, WireTransaction};
use crate::keys::{AddressBook, Chain};

use super::TxKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: TxKind,
    pub amount: u64,
    pub sender_addresses: Vec<String>,
    pub recipient_addresses: Vec<String>,
}

/// Classify from raw inputs/outputs when the indexer provides them, otherwise
/// validate and adopt the indexer's declared type.
///
/// Net value `v` = owned outputs - owned inputs:
/// `v > 0` → Received; `v <= 0 && |v| <= fee` → Self; else Sent.
pub fn classify(tx: &WireTransaction, book: &AddressBook) -> Result<Classification, ChainError> {
    match (&tx.inputs, &tx.outputs) {
        (Some(_), Some(_)) => Ok(classify_raw(tx, book)),
        _ => classify_declared(tx),
    }
}

fn classify_raw(tx: &WireTransaction, book: &AddressBook) -> Classification {
    let inputs = tx.inputs.as_deref().unwrap_or_default();
    let outputs = tx.outputs.as_deref().unwrap_or_default();

    let mut value: i128 = 0;
    let mut to_self_external: u64 = 0;
    let mut to_self_any: u64 = 0;
    let (mut foreign_senders, mut own_senders) = (Vec::new(), Vec::new());
    let (mut foreign_recipients, mut own_recipients) = (Vec::new(), Vec::new());

    for input in inputs {
        let Some(address) = input.address.as_deref() else { continue };
        if book.contains(address) {
            value -= input.value as i128;
            own_senders.push(address.to_string());
        } else {
            foreign_senders.push(address.to_string());
        }
    }

    for output in outputs {
        let Some(address) = output.address.as_deref() else { continue };
        match book.lookup(address) {
            Some((chain, _)) => {
                value += output.value as i128;
                to_self_any += output.value;
                if chain == Chain::External {
                    to_self_external += output.value;
                    own_recipients.push(address.to_string());
                }
            }
            None => foreign_recipients.push(address.to_string()),
        }
    }

    if value > 0 {
        return Classification {
            kind: TxKind::Received,
            amount: value as u64,
            sender_addresses: foreign_senders,
            recipient_addresses: Vec::new(),
        };
    }

    let loss = value.unsigned_abs() as u64;
    if loss <= tx.fee {
        let amount = if to_self_external > 0 { to_self_external } else { to_self_any };
        Classification {
            kind: TxKind::SelfTransfer,
            amount,
            sender_addresses: own_senders,
            recipient_addresses: own_recipients,
        }
    } else {
        Classification {
            kind: TxKind::Sent,
            amount: loss.saturating_sub(tx.fee),
            sender_addresses: own_senders,
            recipient_addresses: foreign_recipients,
        }
    }
}

fn classify_declared(tx: &WireTransaction) -> Result<Classification, ChainError> {
    let declared = tx
        .transaction_type
        .as_deref()
        .ok_or_else(|| ChainError::Malformed(format!("tx {} has neither a type nor inputs/outputs", tx.txid)))?;
    let (kind, amount) = match declared.to_ascii_lowercase().as_str() {
        "received" => (TxKind::Received, tx.amount),
        "sent" => (TxKind::Sent, tx.amount),
        "self" => {
            let amount = tx
                .received_amount
                .or_else(|| tx.sent_amount.map(|s| s.saturating_sub(tx.fee)))
                .unwrap_or(tx.amount);
            (TxKind::SelfTransfer, amount)
        }
        other => return Err(ChainError::Malformed(format!("tx {} has unknown type '{}'", tx.txid, other))),
    };
    Ok(Classification {
        kind,
        amount,
        sender_addresses: tx.sender_addresses.clone(),
        recipient_addresses: tx.recipient_addresses.clone(),
    })
}
