//! Transaction types.

use coind_consensus::money::{Amount, MAX_MONEY};
use coind_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const TX_CURRENT_VERSION: i32 = 1;

/// Sequence value that disables lock-time for an input.
pub const SEQUENCE_FINAL: u32 = u32::MAX;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&crate::encoding::encode(self))
    }

    pub fn serialized_size(&self) -> usize {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        encoder.len()
    }

    /// Sum of output values. `None` on overflow or out-of-range totals; the
    /// caller decides whether that is a consensus failure.
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            if output.value < 0 || output.value > MAX_MONEY {
                return None;
            }
            total = total.checked_add(output.value)?;
            if total > MAX_MONEY {
                return None;
            }
        }
        Some(total)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_compact_size(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.consensus_encode(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_compact_size(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin_count = decoder.read_compact_size()? as usize;
        let mut vin = Vec::with_capacity(vin_count.min(1024));
        for _ in 0..vin_count {
            let prevout = OutPoint::consensus_decode(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            vin.push(TxIn {
                prevout,
                script_sig,
                sequence,
            });
        }
        let vout_count = decoder.read_compact_size()? as usize;
        let mut vout = Vec::with_capacity(vout_count.min(1024));
        for _ in 0..vout_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            vout.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};

    fn sample_tx() -> Transaction {
        Transaction {
            version: TX_CURRENT_VERSION,
            vin: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 1),
                script_sig: vec![0x51],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 50 * 100_000_000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn round_trip() {
        let tx = sample_tx();
        let bytes = encode(&tx);
        let decoded: Transaction = decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
        tx.vin.push(TxIn::new(OutPoint::null(), Vec::new()));
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn value_out_overflow_is_rejected() {
        let mut tx = sample_tx();
        tx.vout = vec![
            TxOut {
                value: MAX_MONEY,
                script_pubkey: Vec::new(),
            },
            TxOut {
                value: 1,
                script_pubkey: Vec::new(),
            },
        ];
        assert_eq!(tx.value_out(), None);
    }

    #[test]
    fn serialized_size_matches_encoding() {
        let tx = sample_tx();
        assert_eq!(tx.serialized_size(), encode(&tx).len());
    }
}
