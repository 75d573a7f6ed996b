//! User partial signature, local dual-sign and witness finalization.

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::ecdsa::Signature as EcdsaSignature;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, OutPoint, PublicKey, Transaction, Txid, Witness};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SpendError, SpendStage, UnsignedSpend};
use crate::keys::{Chain, MultisigBasis, SigningKey, MULTISIG_PURPOSE};
use crate::ledger::{Utxo, UtxoStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub txid: String,
    pub vout: u32,
}

/// Which derived key signs which input; sent to the co-signer with the PSBT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildIndexEntry {
    pub child_index: u32,
    pub chain: Chain,
    /// Full path from the master key, e.g. `m/49'/1'/0'/0/3`.
    pub derivation: String,
    pub input: InputRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartiallySignedSpend {
    pub psbt: Psbt,
    pub inputs: Vec<Utxo>,
    pub fee: u64,
    pub change: Option<(u32, u64, u32)>,
    pub child_index_map: Vec<ChildIndexEntry>,
}

impl PartiallySignedSpend {
    pub fn psbt_hex(&self) -> String { self.psbt.serialize_hex() }
    pub fn outpoints(&self) -> Vec<OutPoint> { self.inputs.iter().map(Utxo::outpoint).collect() }
    pub fn stage(&self) -> SpendStage { SpendStage::UserSigned }
}

/// Outcome of a successful broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReceipt {
    pub txid: Txid,
    pub fee: u64,
    pub consumed: Vec<OutPoint>,
    /// Our change output, to be tracked as a pending UTXO right away.
    pub change: Option<Utxo>,
}

impl BroadcastReceipt {
    pub fn stage(&self) -> SpendStage { SpendStage::Finalized }

    pub fn new(txid: Txid, spend: &PartiallySignedSpend, basis: &MultisigBasis) -> Result<Self, SpendError> {
        let change = match spend.change {
            Some((vout, value, index)) => {
                let derived = basis.derive_address(Chain::Internal, index)?;
                Some(Utxo {
                    tx_id: txid,
                    vout,
                    value,
                    address: derived.address.to_string(),
                    chain: Chain::Internal,
                    index,
                    status: UtxoStatus::default(),
                })
            }
            None => None,
        };
        Ok(Self { txid, fee: spend.fee, consumed: spend.outpoints(), change })
    }
}

fn sign_inputs(psbt: &mut Psbt, inputs: &[Utxo], basis: &MultisigBasis, key: &SigningKey) -> Result<(), SpendError> {
    let secp = Secp256k1::new();
    let tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);

    for (i, utxo) in inputs.iter().enumerate() {
        let derived = basis.derive_address(utxo.chain, utxo.index)?;
        let secret = key.child_secret(&basis.child_path(utxo.chain, utxo.index)?)?;
        let pubkey = PublicKey::new(secret.public_key(&secp));
        if !derived.pubkeys.contains(&pubkey) {
            return Err(SpendError::Signing(format!("key is not a cosigner of input {}", i)));
        }

        let input = psbt.inputs.get_mut(i).ok_or_else(|| SpendError::Signing(format!("missing psbt input {}", i)))?;
        let witness_script = input
            .witness_script
            .as_ref()
            .ok_or_else(|| SpendError::Signing(format!("input {} has no witness script", i)))?;
        let sighash = cache
            .p2wsh_signature_hash(i, witness_script, Amount::from_sat(utxo.value), EcdsaSighashType::All)
            .map_err(|e| SpendError::Signing(e.to_string()))?;
        let signature = secp.sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &secret);
        input.partial_sigs.insert(pubkey, EcdsaSignature { signature, sighash_type: EcdsaSighashType::All });
    }
    Ok(())
}

fn child_index_map(inputs: &[Utxo], basis: &MultisigBasis) -> Result<Vec<ChildIndexEntry>, SpendError> {
    let prefix = format!("m/{}'/{}'/0'", MULTISIG_PURPOSE, basis.network().coin_type());
    inputs
        .iter()
        .map(|utxo| {
            let path = basis.child_path(utxo.chain, utxo.index)?;
            let derivation = path.iter().fold(prefix.clone(), |acc, step| format!("{}/{}", acc, step));
            Ok(ChildIndexEntry {
                child_index: utxo.index,
                chain: utxo.chain,
                derivation,
                input: InputRef { txid: utxo.tx_id.to_string(), vout: utxo.vout },
            })
        })
        .collect()
}

/// Primary-key signature over every input.
pub fn sign_user(unsigned: UnsignedSpend, basis: &MultisigBasis, primary: &SigningKey) -> Result<PartiallySignedSpend, SpendError> {
    let UnsignedSpend { mut psbt, inputs, fee, change } = unsigned;
    sign_inputs(&mut psbt, &inputs, basis, primary)?;
    let child_index_map = child_index_map(&inputs, basis)?;
    debug!(inputs = inputs.len(), "user signature applied");
    Ok(PartiallySignedSpend { psbt, inputs, fee, change, child_index_map })
}

/// Second signature with the locally held secondary key.
pub fn sign_secondary(mut spend: PartiallySignedSpend, basis: &MultisigBasis, secondary: &SigningKey) -> Result<PartiallySignedSpend, SpendError> {
    sign_inputs(&mut spend.psbt, &spend.inputs, basis, secondary)?;
    Ok(spend)
}

/// Assemble `[<> <sig_a> <sig_b> <witness_script>]` per input and extract the
/// network transaction. Signatures follow the script's key order.
pub fn finalize(spend: &PartiallySignedSpend) -> Result<(Transaction, String), SpendError> {
    let mut psbt = spend.psbt.clone();
    for (i, input) in psbt.inputs.iter_mut().enumerate() {
        let witness_script = input
            .witness_script
            .take()
            .ok_or_else(|| SpendError::Signing(format!("input {} has no witness script", i)))?;
        let redeem_script = input
            .redeem_script
            .take()
            .ok_or_else(|| SpendError::Signing(format!("input {} has no redeem script", i)))?;

        let mut sigs: Vec<(PublicKey, EcdsaSignature)> = std::mem::take(&mut input.partial_sigs).into_iter().collect();
        if sigs.len() < 2 {
            return Err(SpendError::Signing(format!("input {} has {} of 2 signatures", i, sigs.len())));
        }
        sigs.sort_by_key(|(pk, _)| pk.to_bytes());

        let mut witness = Witness::new();
        witness.push(Vec::<u8>::new());
        for (_, sig) in sigs.iter().take(2) {
            witness.push(sig.to_vec());
        }
        witness.push(witness_script.as_bytes());

        let push = PushBytesBuf::try_from(redeem_script.to_bytes()).map_err(|e| SpendError::Signing(e.to_string()))?;
        input.final_script_sig = Some(Builder::new().push_slice(push).into_script());
        input.final_script_witness = Some(witness);
        input.bip32_derivation.clear();
    }
    let tx = psbt.extract_tx().map_err(|e| SpendError::Signing(e.to_string()))?;
    let hex = serialize_hex(&tx);
    Ok((tx, hex))
}
