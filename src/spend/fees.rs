//! Virtual-size and fee estimation for 2-of-3 P2SH-P2WSH spends.

/// version + locktime + counts + segwit marker/flag
pub const OVERHEAD_VBYTES: u64 = 11;
/// outpoint + sequence + 35-byte script_sig + (empty, 2 sigs, 105-byte script) witness
pub const INPUT_VBYTES: u64 = 140;
/// `OP_HASH160 <20> OP_EQUAL`
pub const P2SH_SCRIPT_LEN: usize = 23;
/// Output size used when only a recipient count is known.
pub const GENERIC_OUTPUT_VBYTES: u64 = 34;

/// value (8) + script length (1) + script
pub fn output_vbytes(script_len: usize) -> u64 { 9 + script_len as u64 }

pub fn estimate_vsize(inputs: usize, output_script_lens: &[usize]) -> u64 {
    OVERHEAD_VBYTES
        + inputs as u64 * INPUT_VBYTES
        + output_script_lens.iter().map(|len| output_vbytes(*len)).sum::<u64>()
}

pub fn fee_for(vsize: u64, fee_rate: u64) -> u64 { vsize.saturating_mul(fee_rate) }
