//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// Mining subsidy for a block at the given height. Halves every
/// `subsidy_halving_interval` blocks and reaches zero after 64 halvings,
/// where the shift would wrap.
pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}
