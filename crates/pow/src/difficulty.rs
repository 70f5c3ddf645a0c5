//! Difficulty and compact target utilities.

use coind_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    let mut out = [0u8; 32];
    value.to_little_endian(&mut out);
    Ok(out)
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Work contributed by a block with the given compact target: the expected
/// number of hashes to find it, `~target / (target + 1) + 1`.
pub fn block_proof(bits: u32) -> U256 {
    let Ok(target) = compact_to_u256(bits) else {
        return U256::zero();
    };
    if target.is_zero() {
        return U256::zero();
    }
    let one = U256::from(1u64);
    (!target / (target + one)) + one
}

/// Required compact target for the block following `last_*`.
///
/// `period_first_time` is the timestamp of the first block in the retarget
/// window ending at the last block; it is only consulted when the next height
/// lands on an adjustment boundary.
pub fn next_work_required(
    last_height: i64,
    last_time: i64,
    last_bits: u32,
    period_first_time: i64,
    next_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let interval = params.difficulty_adjustment_interval();

    if (last_height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty
            && next_block_time > last_time + params.pow_target_spacing * 2
        {
            // Min-difficulty networks let a stalled chain accept a limit-work
            // block once one spacing has been missed twice over.
            return Ok(pow_limit_bits);
        }
        return Ok(last_bits);
    }

    if params.pow_no_retargeting {
        return Ok(last_bits);
    }

    let mut actual_timespan = last_time - period_first_time;
    if actual_timespan < params.pow_target_timespan / 4 {
        actual_timespan = params.pow_target_timespan / 4;
    }
    if actual_timespan > params.pow_target_timespan * 4 {
        actual_timespan = params.pow_target_timespan * 4;
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let mut new_target = compact_to_u256(last_bits)?;
    new_target = new_target * U256::from(actual_timespan as u64)
        / U256::from(params.pow_target_timespan as u64);
    if new_target > pow_limit {
        new_target = pow_limit;
    }

    Ok(u256_to_compact(new_target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_consensus::{chain_params, Network};

    #[test]
    fn compact_round_trip() {
        let bits = 0x1d00_ffff;
        let target = compact_to_target(bits).expect("target");
        assert_eq!(target_to_compact(&target), bits);
    }

    #[test]
    fn compact_target_layout() {
        let target = compact_to_target(0x207f_ffff).expect("target");
        assert!(target[..29].iter().all(|b| *b == 0));
        assert_eq!(target[29], 0xff);
        assert_eq!(target[30], 0xff);
        assert_eq!(target[31], 0x7f);
    }

    #[test]
    fn compact_rejects_negative() {
        assert_eq!(compact_to_u256(0x0180_0001), Err(CompactError::Negative));
    }

    #[test]
    fn hash_meets_target_cmp() {
        let target = compact_to_target(0x207f_ffff).expect("target");
        assert!(hash_meets_target(&[0u8; 32], &target));
        assert!(!hash_meets_target(&[0xffu8; 32], &target));
    }

    #[test]
    fn proof_grows_as_target_shrinks() {
        let easy = block_proof(0x207f_ffff);
        let hard = block_proof(0x1d00_ffff);
        assert!(hard > easy);
        assert!(easy > U256::zero());
    }

    #[test]
    fn retarget_only_on_boundary() {
        let params = chain_params(Network::Mainnet).consensus;
        let bits = 0x1d00_ffff;
        let required =
            next_work_required(100, 1_300_000_000, bits, 0, 1_300_000_600, &params).expect("bits");
        assert_eq!(required, bits);
    }

    #[test]
    fn retarget_clamps_timespan() {
        let params = chain_params(Network::Mainnet).consensus;
        let bits = 0x1c05_a3f4;
        // A period mined instantly must not raise difficulty more than 4x.
        let fast = next_work_required(2_015, 1_000_000, bits, 1_000_000, 1_000_600, &params)
            .expect("bits");
        let quarter = compact_to_u256(bits).expect("target") / U256::from(4u64);
        assert_eq!(compact_to_u256(fast).expect("target"), quarter);
    }

    #[test]
    fn regtest_never_retargets() {
        let params = chain_params(Network::Regtest).consensus;
        let bits = target_to_compact(&params.pow_limit);
        let required =
            next_work_required(2_015, 1_000_000, bits, 999_000, 1_000_600, &params).expect("bits");
        assert_eq!(required, bits);
    }
}
