//! Relay policy knobs and the adaptive fee floor.

use coind_consensus::money::Amount;

/// Fee floor increments when the pool evicts; decays with this half-life.
const ROLLING_FEE_HALFLIFE_SECS: u64 = 60 * 60 * 12;

/// Free-relay allowance decays with a ten-minute half-life.
const FREE_RELAY_HALFLIFE_SECS: f64 = 600.0;

#[derive(Clone, Debug)]
pub struct MempoolPolicy {
    pub require_standard: bool,
    /// Base units per kilobyte.
    pub min_relay_fee_per_kb: Amount,
    /// Kilobytes per minute of below-fee transactions tolerated.
    pub limit_free_relay_kb_per_min: u64,
    pub max_ancestors: u64,
    pub max_ancestor_size: u64,
    pub max_descendants: u64,
    pub max_descendant_size: u64,
    /// Pool byte budget.
    pub max_bytes: usize,
    /// Entries older than this are expired on each admission attempt.
    pub expiry_secs: u64,
    /// Refuse fees beyond `absurd_fee_multiplier` times the relay minimum,
    /// protecting a confused sender. Off for relayed transactions.
    pub reject_absurd_fee: bool,
    pub absurd_fee_multiplier: i64,
    pub max_script_sig_size: usize,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        Self {
            require_standard: true,
            min_relay_fee_per_kb: 1_000,
            limit_free_relay_kb_per_min: 0,
            max_ancestors: 25,
            max_ancestor_size: 101_000,
            max_descendants: 25,
            max_descendant_size: 101_000,
            max_bytes: 300 * 1024 * 1024,
            expiry_secs: 336 * 60 * 60,
            reject_absurd_fee: false,
            absurd_fee_multiplier: 10_000,
            max_script_sig_size: 1_650,
        }
    }
}

impl MempoolPolicy {
    pub fn min_relay_fee_for_size(&self, size: usize) -> Amount {
        fee_for_size(self.min_relay_fee_per_kb, size)
    }

    pub fn absurd_fee_for_size(&self, size: usize) -> Amount {
        self.min_relay_fee_for_size(size)
            .saturating_mul(self.absurd_fee_multiplier)
            .max(self.absurd_fee_multiplier)
    }
}

pub fn fee_for_size(fee_per_kb: Amount, size: usize) -> Amount {
    let fee = fee_per_kb.saturating_mul(size as Amount) / 1_000;
    if fee == 0 && fee_per_kb > 0 {
        fee_per_kb
    } else {
        fee
    }
}

/// The pool-wide dynamic fee floor: jumps when eviction happens, halves
/// every twelve hours otherwise, and collapses to zero once negligible.
#[derive(Clone, Debug)]
pub struct RollingFeeRate {
    rate_per_kb: Amount,
    last_update: u64,
}

impl RollingFeeRate {
    pub fn new() -> Self {
        Self {
            rate_per_kb: 0,
            last_update: 0,
        }
    }

    pub fn current(&mut self, now: u64, min_relay_fee_per_kb: Amount) -> Amount {
        if self.rate_per_kb == 0 {
            return 0;
        }
        let elapsed = now.saturating_sub(self.last_update);
        if elapsed > 0 {
            let halvings = (elapsed / ROLLING_FEE_HALFLIFE_SECS).min(62);
            self.rate_per_kb >>= halvings;
            let remainder = elapsed % ROLLING_FEE_HALFLIFE_SECS;
            if remainder > 0 {
                // Linear interpolation inside the half-life window.
                let keep = ROLLING_FEE_HALFLIFE_SECS - remainder / 2;
                self.rate_per_kb =
                    self.rate_per_kb.saturating_mul(keep as Amount) / ROLLING_FEE_HALFLIFE_SECS as Amount;
            }
            self.last_update = now;
            if self.rate_per_kb < min_relay_fee_per_kb / 2 {
                self.rate_per_kb = 0;
            }
        }
        self.rate_per_kb
    }

    /// Called when eviction fires: the floor doubles, and never falls below
    /// the rate of what was just evicted.
    pub fn bump(&mut self, now: u64, evicted_rate_per_kb: Amount, min_relay_fee_per_kb: Amount) {
        let doubled = self
            .rate_per_kb
            .max(min_relay_fee_per_kb)
            .saturating_mul(2);
        self.rate_per_kb = doubled.max(evicted_rate_per_kb);
        self.last_update = now;
    }
}

/// Decaying budget of bytes admitted below the fee floor.
#[derive(Clone, Debug)]
pub struct FreeRelayLimiter {
    accumulated: f64,
    last_time: u64,
}

impl FreeRelayLimiter {
    pub fn new() -> Self {
        Self {
            accumulated: 0.0,
            last_time: 0,
        }
    }

    /// Whether `size` more free bytes fit under `limit_kb_per_min`, charging
    /// them if so.
    pub fn allow(&mut self, now: u64, size: usize, limit_kb_per_min: u64) -> bool {
        let elapsed = now.saturating_sub(self.last_time) as f64;
        self.accumulated *= 0.5f64.powf(elapsed / FREE_RELAY_HALFLIFE_SECS);
        self.last_time = now;
        // The window tolerates ten minutes of the per-minute budget.
        let ceiling = (limit_kb_per_min * 10 * 1_000) as f64;
        if self.accumulated + size as f64 >= ceiling {
            return false;
        }
        self.accumulated += size as f64;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_for_size_rounds_up_to_floor() {
        assert_eq!(fee_for_size(1_000, 250), 250);
        // Sub-unit results charge the per-kb rate instead of zero.
        assert_eq!(fee_for_size(1_000, 0), 0);
        assert_eq!(fee_for_size(3, 100), 3);
    }

    #[test]
    fn rolling_fee_doubles_and_decays() {
        let mut rate = RollingFeeRate::new();
        assert_eq!(rate.current(0, 1_000), 0);
        rate.bump(0, 5_000, 1_000);
        assert_eq!(rate.current(0, 1_000), 5_000);
        rate.bump(0, 0, 1_000);
        assert_eq!(rate.current(0, 1_000), 10_000);

        // One half-life later the floor has halved.
        let later = ROLLING_FEE_HALFLIFE_SECS;
        assert_eq!(rate.current(later, 1_000), 5_000);

        // Far in the future it collapses to zero.
        assert_eq!(rate.current(later * 20, 1_000), 0);
    }

    #[test]
    fn free_relay_budget_depletes_and_recovers() {
        let mut limiter = FreeRelayLimiter::new();
        let limit_kb = 15u64;
        assert!(limiter.allow(0, 100_000, limit_kb));
        // The ten-minute window is 150 kB; the rest is nearly spent.
        assert!(!limiter.allow(0, 60_000, limit_kb));
        // After an hour the counter has decayed away.
        assert!(limiter.allow(3_600, 60_000, limit_kb));
    }

    #[test]
    fn free_relay_disabled_with_zero_limit() {
        let mut limiter = FreeRelayLimiter::new();
        assert!(!limiter.allow(0, 1, 0));
    }
}
