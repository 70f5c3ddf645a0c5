//! Chain parameter definitions per network.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// A historical block whose coinbase txid collides with an earlier, still
/// unspent coinbase. Overwriting these two is the only tolerated violation of
/// the duplicate-txid rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DuplicateCoinbase {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub subsidy_halving_interval: i32,
    /// Height at which the coinbase must commit to the block height.
    pub bip34_height: i32,
    /// Hash of the block activating the coinbase-height rule; once the active
    /// chain contains it, the duplicate-txid scan can be skipped.
    pub bip34_hash: Hash256,
    /// Height from which version-2 blocks are mandatory.
    pub version2_enforce_height: i32,
    /// Height from which version-3 blocks are mandatory.
    pub version3_enforce_height: i32,
    /// Height from which version-4 blocks are mandatory.
    pub version4_enforce_height: i32,
    /// Height from which relative lock-times (sequence locks) are enforced.
    pub csv_height: i32,
    /// The two grandfathered duplicate-coinbase blocks.
    pub duplicate_coinbases: Vec<DuplicateCoinbase>,
    /// Proof-of-work limit as a little-endian 256-bit target.
    pub pow_limit: Hash256,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub pow_allow_min_difficulty: bool,
    pub pow_no_retargeting: bool,
    /// Chains with less cumulative work than this are not worth validating.
    pub minimum_chain_work: Hash256,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().max_by_key(|cp| cp.height)
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.height == height)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Message-start bytes framing each block record on disk.
    pub magic: [u8; 4],
    pub consensus: ConsensusParams,
    /// Default assumed-valid block hash; ancestors may skip signature checks.
    pub assume_valid: Option<Hash256>,
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let high = hex_digit(chunk[0]).ok_or(HexError::InvalidHex)?;
        let low = hex_digit(chunk[1]).ok_or(HexError::InvalidHex)?;
        // Display order is reversed relative to the internal little-endian order.
        out[31 - i] = (high << 4) | low;
    }
    Ok(out)
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn hash_or_zero(hex: &str) -> Hash256 {
    hash256_from_hex(hex).unwrap_or([0u8; 32])
}

const MAINNET_POW_LIMIT: &str = "00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
const REGTEST_POW_LIMIT: &str = "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            consensus: ConsensusParams {
                network,
                hash_genesis_block: hash_or_zero(
                    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
                ),
                subsidy_halving_interval: 210_000,
                bip34_height: 227_931,
                bip34_hash: hash_or_zero(
                    "000000000000024b89b42a942fe0d9fea3bb44ab7bd1b19115dd6a759c0808b8",
                ),
                version2_enforce_height: 227_931,
                version3_enforce_height: 363_725,
                version4_enforce_height: 388_381,
                csv_height: 419_328,
                duplicate_coinbases: vec![
                    DuplicateCoinbase {
                        height: 91_842,
                        hash: hash_or_zero(
                            "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
                        ),
                    },
                    DuplicateCoinbase {
                        height: 91_880,
                        hash: hash_or_zero(
                            "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
                        ),
                    },
                ],
                pow_limit: hash_or_zero(MAINNET_POW_LIMIT),
                pow_target_spacing: 10 * 60,
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_allow_min_difficulty: false,
                pow_no_retargeting: false,
                minimum_chain_work: hash_or_zero(
                    "0000000000000000000000000000000000000000007e5dbf54c7f6b58a6853cd",
                ),
                checkpoints: vec![
                    Checkpoint {
                        height: 11_111,
                        hash: hash_or_zero(
                            "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
                        ),
                    },
                    Checkpoint {
                        height: 105_000,
                        hash: hash_or_zero(
                            "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
                        ),
                    },
                    Checkpoint {
                        height: 295_000,
                        hash: hash_or_zero(
                            "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983",
                        ),
                    },
                ],
            },
            assume_valid: Some(hash_or_zero(
                "0000000000000000003b9ce759c2a087d52abc4266f8f4ebd6d768b89defa50a",
            )),
        },
        Network::Testnet => ChainParams {
            network,
            magic: [0x0b, 0x11, 0x09, 0x07],
            consensus: ConsensusParams {
                network,
                hash_genesis_block: hash_or_zero(
                    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
                ),
                subsidy_halving_interval: 210_000,
                bip34_height: 21_111,
                bip34_hash: hash_or_zero(
                    "0000000023b3a96d3484e5abb3755c413e7d41500f8e2a5c3f0dd01299cd8ef8",
                ),
                version2_enforce_height: 21_111,
                version3_enforce_height: 330_776,
                version4_enforce_height: 581_885,
                csv_height: 770_112,
                duplicate_coinbases: Vec::new(),
                pow_limit: hash_or_zero(MAINNET_POW_LIMIT),
                pow_target_spacing: 10 * 60,
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_allow_min_difficulty: true,
                pow_no_retargeting: false,
                minimum_chain_work: hash_or_zero(
                    "0000000000000000000000000000000000000000000000198b4def2baa9338d6",
                ),
                checkpoints: vec![Checkpoint {
                    height: 546,
                    hash: hash_or_zero(
                        "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
                    ),
                }],
            },
            assume_valid: None,
        },
        Network::Regtest => ChainParams {
            network,
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            consensus: ConsensusParams {
                network,
                hash_genesis_block: hash_or_zero(
                    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
                ),
                subsidy_halving_interval: 150,
                bip34_height: 100_000_000,
                bip34_hash: [0u8; 32],
                version2_enforce_height: 100_000_000,
                version3_enforce_height: 100_000_000,
                version4_enforce_height: 100_000_000,
                csv_height: 0,
                duplicate_coinbases: Vec::new(),
                pow_limit: hash_or_zero(REGTEST_POW_LIMIT),
                pow_target_spacing: 10 * 60,
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_allow_min_difficulty: true,
                pow_no_retargeting: true,
                minimum_chain_work: [0u8; 32],
                checkpoints: Vec::new(),
            },
            assume_valid: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hash = hash256_from_hex(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        )
        .expect("hash");
        // Internal order is little-endian: display tail lands at byte 0.
        assert_eq!(hash[0], 0x6f);
        assert_eq!(hash[31], 0x00);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(hash256_from_hex("abc").is_err());
        assert!(hash256_from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn mainnet_has_duplicate_coinbase_carveouts() {
        let params = chain_params(Network::Mainnet).consensus;
        let heights: Vec<i32> = params
            .duplicate_coinbases
            .iter()
            .map(|dup| dup.height)
            .collect();
        assert_eq!(heights, vec![91_842, 91_880]);
    }

    #[test]
    fn regtest_disables_retargeting() {
        let params = chain_params(Network::Regtest).consensus;
        assert!(params.pow_no_retargeting);
        assert!(params.checkpoints.is_empty());
        assert_eq!(params.difficulty_adjustment_interval(), 2_016);
    }
}
