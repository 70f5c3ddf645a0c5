use coind_consensus::ConsensusParams;
use coind_primitives::block::BlockHeader;
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug)]
pub enum PowError {
    InvalidBits(&'static str),
    HashAboveTarget,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashAboveTarget => write!(f, "block hash does not meet claimed target"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that the header hash satisfies its own claimed `bits` target and
/// that the target is within the network's proof-of-work limit. Whether the
/// claimed target matches the retarget schedule is a contextual check made
/// against the block index.
pub fn check_proof_of_work(header: &BlockHeader, params: &ConsensusParams) -> Result<(), PowError> {
    let target = compact_to_u256(header.bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("target above proof-of-work limit"));
    }

    let hash = header.hash();
    if U256::from_little_endian(&hash) > target {
        return Err(PowError::HashAboveTarget);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_consensus::{chain_params, Network};

    fn header_with_bits(bits: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1_300_000_000,
            bits,
            nonce,
        }
    }

    fn mine(mut header: BlockHeader, params: &ConsensusParams) -> BlockHeader {
        while check_proof_of_work(&header, params).is_err() {
            header.nonce = header.nonce.wrapping_add(1);
        }
        header
    }

    #[test]
    fn regtest_header_mines_quickly() {
        let params = chain_params(Network::Regtest).consensus;
        let bits = crate::difficulty::target_to_compact(&params.pow_limit);
        let header = mine(header_with_bits(bits, 0), &params);
        assert!(check_proof_of_work(&header, &params).is_ok());
    }

    #[test]
    fn target_above_limit_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        // Regtest-strength bits exceed the mainnet limit.
        let header = header_with_bits(0x207f_ffff, 0);
        assert!(matches!(
            check_proof_of_work(&header, &params),
            Err(PowError::InvalidBits(_))
        ));
    }

    #[test]
    fn zero_target_rejected() {
        let params = chain_params(Network::Regtest).consensus;
        let header = header_with_bits(0, 0);
        assert!(check_proof_of_work(&header, &params).is_err());
    }
}
