//! Legacy transaction signature hash.

use coind_consensus::Hash256;
use coind_primitives::encoding::{Encodable, Encoder};
use coind_primitives::hash::sha256d;
use coind_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    pub fn is_defined(self) -> bool {
        matches!(self.base_type(), SIGHASH_ALL | SIGHASH_NONE | SIGHASH_SINGLE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashError {
    InputIndexOutOfRange,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
        }
    }
}

impl std::error::Error for SighashError {}

/// Per-transaction hashes shared by every input's signature check. Computed
/// once when a transaction enters validation and passed alongside each check.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrecomputedTransactionData {
    pub hash_prevouts: Hash256,
    pub hash_sequence: Hash256,
    pub hash_outputs: Hash256,
}

impl PrecomputedTransactionData {
    pub fn new(tx: &Transaction) -> Self {
        let mut prevouts = Encoder::new();
        let mut sequences = Encoder::new();
        for input in &tx.vin {
            input.prevout.consensus_encode(&mut prevouts);
            sequences.write_u32_le(input.sequence);
        }
        let mut outputs = Encoder::new();
        for output in &tx.vout {
            output_encode(output, &mut outputs);
        }
        Self {
            hash_prevouts: sha256d(&prevouts.into_inner()),
            hash_sequence: sha256d(&sequences.into_inner()),
            hash_outputs: sha256d(&outputs.into_inner()),
        }
    }
}

fn output_encode(output: &coind_primitives::transaction::TxOut, encoder: &mut Encoder) {
    encoder.write_i64_le(output.value);
    encoder.write_var_bytes(&output.script_pubkey);
}

/// The legacy signature hash: the transaction re-serialized with scripts and
/// outputs masked per the hash type, followed by the 4-byte type, double
/// SHA-256d.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    let hash_single = sighash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = sighash_type.base_type() == SIGHASH_NONE;
    let anyone_can_pay = sighash_type.has_anyone_can_pay();

    // The historical out-of-range SIGHASH_SINGLE result: the "hash" 1. Signers
    // relying on it are broken, but consensus preserves it.
    if hash_single && input_index >= tx.vout.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return Ok(one);
    }

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    let input_count = if anyone_can_pay { 1 } else { tx.vin.len() };
    encoder.write_compact_size(input_count as u64);
    for idx in 0..input_count {
        let actual_index = if anyone_can_pay { input_index } else { idx };
        let input = &tx.vin[actual_index];
        input.prevout.consensus_encode(&mut encoder);
        let is_signing = actual_index == input_index;
        if is_signing {
            encoder.write_var_bytes(script_code);
        } else {
            encoder.write_compact_size(0);
        }
        if !is_signing && (hash_single || hash_none) {
            encoder.write_u32_le(0);
        } else {
            encoder.write_u32_le(input.sequence);
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.vout.len()
    };
    encoder.write_compact_size(output_count as u64);
    for idx in 0..output_count {
        if hash_single && idx != input_index {
            // Blanked output: value -1, empty script.
            encoder.write_i64_le(-1);
            encoder.write_compact_size(0);
        } else {
            output_encode(&tx.vout[idx], &mut encoder);
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);

    Ok(sha256d(&encoder.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::outpoint::OutPoint;
    use coind_primitives::transaction::{TxIn, TxOut};

    fn two_in_two_out() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![
                TxIn {
                    prevout: OutPoint::new([1u8; 32], 0),
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                },
                TxIn {
                    prevout: OutPoint::new([2u8; 32], 1),
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                },
            ],
            vout: vec![
                TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 20,
                    script_pubkey: vec![0x51],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn all_differs_per_input() {
        let tx = two_in_two_out();
        let code = vec![0x51];
        let h0 = signature_hash(&tx, 0, &code, SighashType(SIGHASH_ALL)).expect("hash");
        let h1 = signature_hash(&tx, 1, &code, SighashType(SIGHASH_ALL)).expect("hash");
        assert_ne!(h0, h1);
    }

    #[test]
    fn none_ignores_other_outputs() {
        let mut tx = two_in_two_out();
        let code = vec![0x51];
        let before = signature_hash(&tx, 0, &code, SighashType(SIGHASH_NONE)).expect("hash");
        tx.vout[1].value = 999;
        let after = signature_hash(&tx, 0, &code, SighashType(SIGHASH_NONE)).expect("hash");
        assert_eq!(before, after);
    }

    #[test]
    fn single_out_of_range_is_one() {
        let mut tx = two_in_two_out();
        tx.vout.truncate(1);
        let hash =
            signature_hash(&tx, 1, &[0x51], SighashType(SIGHASH_SINGLE)).expect("hash");
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(hash, one);
    }

    #[test]
    fn bad_index_rejected() {
        let tx = two_in_two_out();
        assert_eq!(
            signature_hash(&tx, 5, &[0x51], SighashType(SIGHASH_ALL)),
            Err(SighashError::InputIndexOutOfRange)
        );
    }

    #[test]
    fn anyone_can_pay_isolates_input() {
        let mut tx = two_in_two_out();
        let code = vec![0x51];
        let sighash_type = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
        let before = signature_hash(&tx, 0, &code, sighash_type).expect("hash");
        tx.vin[1].sequence = 7;
        let after = signature_hash(&tx, 0, &code, sighash_type).expect("hash");
        assert_eq!(before, after);
    }
}
