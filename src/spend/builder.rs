//! Unsigned PSBT skeleton from a prerequisite.

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use std::str::FromStr;
use tracing::debug;

use super::{SpendError, SpendStage, TransactionPrerequisite};
use crate::keys::MultisigBasis;
use crate::ledger::Utxo;

/// A built spend waiting for the user signature.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedSpend {
    pub psbt: Psbt,
    /// Spent UTXOs, in transaction input order.
    pub inputs: Vec<Utxo>,
    pub fee: u64,
    /// `(vout, value, internal index)` of the change output.
    pub change: Option<(u32, u64, u32)>,
}

impl UnsignedSpend {
    pub fn outpoints(&self) -> Vec<OutPoint> { self.inputs.iter().map(Utxo::outpoint).collect() }
    pub fn stage(&self) -> SpendStage { SpendStage::Built }
}

/// Inputs are sorted by outpoint; recipients keep their order with change last.
/// `sequence` overrides the default final sequence (e.g. to signal RBF).
pub fn build(basis: &MultisigBasis, prerequisite: &TransactionPrerequisite, sequence: Option<u32>) -> Result<UnsignedSpend, SpendError> {
    let network = basis.network().to_bitcoin();
    let sequence = sequence.map(Sequence).unwrap_or(Sequence::MAX);

    let mut inputs = prerequisite.inputs.clone();
    inputs.sort_by_key(Utxo::outpoint);

    let mut outputs = prerequisite.outputs.clone();
    outputs.sort_by_key(|o| o.change);

    let mut tx_outputs = Vec::with_capacity(outputs.len());
    let mut change = None;
    for (vout, output) in outputs.iter().enumerate() {
        let address = Address::from_str(&output.address)
            .map_err(|e| SpendError::InvalidRecipient(format!("{}: {}", output.address, e)))?
            .require_network(network)
            .map_err(|e| SpendError::InvalidRecipient(format!("{}: {}", output.address, e)))?;
        tx_outputs.push(TxOut { value: Amount::from_sat(output.value), script_pubkey: address.script_pubkey() });
        if output.change {
            let index = prerequisite
                .change_index
                .ok_or_else(|| SpendError::InvalidPrerequisite("change output without an internal index".into()))?;
            change = Some((vout as u32, output.value, index));
        }
    }

    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|u| TxIn { previous_output: u.outpoint(), script_sig: ScriptBuf::new(), sequence, witness: Witness::new() })
            .collect(),
        output: tx_outputs,
    };
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx).map_err(|e| SpendError::InvalidPrerequisite(e.to_string()))?;

    for (psbt_input, utxo) in psbt.inputs.iter_mut().zip(&inputs) {
        let derived = basis.derive_address(utxo.chain, utxo.index)?;
        if derived.address.to_string() != utxo.address {
            return Err(SpendError::StaleInput(format!("{} does not belong to {}/{}", utxo.outpoint(), utxo.chain.as_str(), utxo.index)));
        }
        psbt_input.witness_utxo = Some(TxOut { value: Amount::from_sat(utxo.value), script_pubkey: derived.script_pubkey() });
        psbt_input.redeem_script = Some(derived.redeem_script);
        psbt_input.witness_script = Some(derived.witness_script);
    }

    debug!(inputs = inputs.len(), outputs = outputs.len(), fee = prerequisite.fee, "built unsigned spend");
    Ok(UnsignedSpend { psbt, inputs, fee: prerequisite.fee, change })
}
