//! Per-block undo data: the coins consumed by a block, in input order.

use coind_primitives::encoding::{DecodeError, Decoder, Encoder};
use coind_primitives::transaction::TxOut;

use crate::coins::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;

/// One spent coin. `height == 0` with `is_coinbase == false` marks a record
/// written before metadata was tracked; disconnect then reconstructs what it
/// can from surviving sibling coins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpentCoin {
    pub coin: Coin,
}

impl SpentCoin {
    pub fn has_metadata(&self) -> bool {
        self.coin.height != 0
    }
}

/// Everything needed to revert one block: the coin consumed by each
/// non-coinbase input, in transaction-then-input order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub spent: Vec<SpentCoin>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_compact_size(self.spent.len() as u64);
        for spent in &self.spent {
            let coin = &spent.coin;
            let code = ((coin.height as u64) << 1) | u64::from(coin.is_coinbase);
            encoder.write_compact_size(code);
            encoder.write_i64_le(coin.output.value);
            encoder.write_var_bytes(&coin.output.script_pubkey);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let count = decoder.read_compact_size()? as usize;
        let mut spent = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let code = decoder.read_compact_size()?;
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            spent.push(SpentCoin {
                coin: Coin {
                    output: TxOut {
                        value,
                        script_pubkey,
                    },
                    height: (code >> 1) as i32,
                    is_coinbase: (code & 1) != 0,
                },
            });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spent(value: i64, height: i32, is_coinbase: bool) -> SpentCoin {
        SpentCoin {
            coin: Coin {
                output: TxOut {
                    value,
                    script_pubkey: vec![0x51, 0x52],
                },
                height,
                is_coinbase,
            },
        }
    }

    #[test]
    fn round_trip() {
        let undo = BlockUndo {
            spent: vec![spent(50, 1, true), spent(25, 7, false), spent(1, 0, false)],
        };
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode");
        assert_eq!(decoded, undo);
        assert!(!decoded.spent[2].has_metadata());
    }

    #[test]
    fn empty_block_undo() {
        let undo = BlockUndo::default();
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode");
        assert!(decoded.spent.is_empty());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = BlockUndo::default().encode();
        bytes[0] = 9;
        assert!(BlockUndo::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = BlockUndo::default().encode();
        bytes.push(0);
        assert_eq!(
            BlockUndo::decode(&bytes),
            Err(DecodeError::TrailingBytes)
        );
    }
}
