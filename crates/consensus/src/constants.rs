//! Consensus-wide constants shared across validation.

/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u64 = 2_000_000;
/// The maximum allowed number of signature check operations per megabyte of block.
pub const MAX_BLOCK_SIGOPS_PER_MB: u64 = 20_000;
/// The maximum allowed size for a serialized transaction (network rule).
pub const MAX_TX_SIZE: u64 = 1_000_000;
/// The maximum allowed number of signature check operations in one transaction.
pub const MAX_TX_SIGOPS: u64 = 20_000;

/// Lock times below this value are interpreted as block heights.
pub const LOCKTIME_THRESHOLD: i64 = 500_000_000;

/// Interpret an input's sequence number as a relative lock-time (BIP68).
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Use the previous block's median-time-past instead of the block time for
/// lock-time comparisons.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Lock-time flags applied to transactions entering the memory pool.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 =
    LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

/// Setting this bit in a sequence number disables relative lock-time.
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
/// If set, the relative lock-time is time-based in 512-second granules.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
/// Mask extracting the lock-time value from a sequence number.
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
/// Shift converting masked sequence time units into seconds.
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Number of block timestamps the median-time-past window spans.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Headers with a timestamp further in the future than this are rejected.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Blocks this deep below the tip are never pruned and reorgs past them are
/// not supported.
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;

/// A tip older than this is treated as initial block download.
pub const DEFAULT_MAX_TIP_AGE: i64 = 24 * 60 * 60;
