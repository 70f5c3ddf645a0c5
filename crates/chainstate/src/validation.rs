//! Context-free block and transaction checks, the validation error taxonomy,
//! and lock-time arithmetic.

use std::collections::HashSet;

use coind_consensus::constants::{
    LOCKTIME_THRESHOLD, LOCKTIME_VERIFY_SEQUENCE, MAX_BLOCK_SIGOPS_PER_MB, MAX_BLOCK_SIZE,
    MAX_TX_SIZE, SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_GRANULARITY,
    SEQUENCE_LOCKTIME_MASK, SEQUENCE_LOCKTIME_TYPE_FLAG,
};
use coind_consensus::money::MAX_MONEY;
use coind_consensus::params::ConsensusParams;
use coind_consensus::Hash256;
use coind_primitives::block::Block;
use coind_primitives::hash::sha256d;
use coind_primitives::transaction::Transaction;
use coind_script::{
    ScriptFlags, MANDATORY_SCRIPT_VERIFY_FLAGS, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY,
    SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, SCRIPT_VERIFY_LOW_S, SCRIPT_VERIFY_STRICTENC,
};

pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_OBSOLETE: u8 = 0x11;
pub const REJECT_DUPLICATE: u8 = 0x12;
pub const REJECT_NONSTANDARD: u8 = 0x40;
pub const REJECT_INSUFFICIENT_FEE: u8 = 0x42;
pub const REJECT_CHECKPOINT: u8 = 0x43;

/// What a rejection means for the object and for the peer that sent it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectKind {
    /// Consensus-invalid; fatal to the block or transaction.
    Invalid,
    /// Violates local policy only; never a block-level failure.
    NonStandard,
    InsufficientFee,
    /// Conflicts with an in-pool spend of the same outpoint.
    Conflict,
    AlreadyKnown,
    /// Inputs not found; the transaction may become valid later.
    MissingInputs,
    /// Fee absurdly high; refused to protect the sender.
    HighFee,
    /// Would fork below the last checkpoint.
    Checkpoint,
    /// Failed in a way local corruption could explain; the object stays
    /// re-requestable and the index is not marked failed.
    CorruptionPossible,
    /// Internal error; the node aborts rather than guess.
    Internal,
}

#[derive(Clone, Debug)]
pub struct ValidationFailure {
    pub kind: RejectKind,
    pub reject_code: u8,
    pub reason: String,
    /// Suggested misbehavior score for the sending peer: 0 policy, 10 mildly
    /// malformed, 100 consensus-invalid.
    pub ban_score: u32,
}

impl ValidationFailure {
    pub fn invalid(reject_code: u8, ban_score: u32, reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Invalid,
            reject_code,
            reason: reason.into(),
            ban_score,
        }
    }

    pub fn corruption(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::CorruptionPossible,
            reject_code: REJECT_INVALID,
            reason: reason.into(),
            ban_score: 0,
        }
    }

    pub fn policy(reject_code: u8, reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::NonStandard,
            reject_code,
            reason: reason.into(),
            ban_score: 0,
        }
    }

    pub fn with_kind(kind: RejectKind, reject_code: u8, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reject_code,
            reason: reason.into(),
            ban_score: 0,
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Internal,
            reject_code: 0,
            reason: reason.into(),
            ban_score: 0,
        }
    }

    /// Whether the failure may permanently mark a block index failed.
    pub fn marks_failed(&self) -> bool {
        self.kind == RejectKind::Invalid
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for ValidationFailure {}

/// Sigop allowance scales with the serialized block size, per started
/// megabyte.
pub fn max_block_sigops(block_size: u64) -> u64 {
    let mb = (block_size.saturating_sub(1)) / 1_000_000 + 1;
    mb * MAX_BLOCK_SIGOPS_PER_MB
}

/// Script flags every transaction in a block at `height` must satisfy.
pub fn block_script_flags(height: i32, params: &ConsensusParams) -> ScriptFlags {
    let mut flags = MANDATORY_SCRIPT_VERIFY_FLAGS;
    if height >= params.version3_enforce_height {
        flags |= SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_LOW_S;
    }
    if height >= params.version4_enforce_height {
        flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if height >= params.csv_height {
        flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
    }
    flags
}

/// Lock-time flags for validating a block at `height`.
pub fn block_locktime_flags(height: i32, params: &ConsensusParams) -> u32 {
    if height >= params.csv_height {
        LOCKTIME_VERIFY_SEQUENCE
    } else {
        0
    }
}

/// Context-free transaction checks: structure, money range, duplicate
/// inputs, coinbase shape.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationFailure> {
    if tx.vin.is_empty() {
        return Err(ValidationFailure::invalid(
            REJECT_INVALID,
            10,
            "bad-txns-vin-empty",
        ));
    }
    if tx.vout.is_empty() {
        return Err(ValidationFailure::invalid(
            REJECT_INVALID,
            10,
            "bad-txns-vout-empty",
        ));
    }
    if tx.serialized_size() as u64 > MAX_TX_SIZE {
        return Err(ValidationFailure::invalid(
            REJECT_INVALID,
            100,
            "bad-txns-oversize",
        ));
    }

    let mut value_out: i64 = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ValidationFailure::invalid(
                REJECT_INVALID,
                100,
                "bad-txns-vout-negative",
            ));
        }
        if output.value > MAX_MONEY {
            return Err(ValidationFailure::invalid(
                REJECT_INVALID,
                100,
                "bad-txns-vout-toolarge",
            ));
        }
        value_out += output.value;
        if value_out > MAX_MONEY {
            return Err(ValidationFailure::invalid(
                REJECT_INVALID,
                100,
                "bad-txns-txouttotal-toolarge",
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ValidationFailure::invalid(
                REJECT_INVALID,
                100,
                "bad-txns-inputs-duplicate",
            ));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(ValidationFailure::invalid(
                REJECT_INVALID,
                100,
                "bad-cb-length",
            ));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(ValidationFailure::invalid(
            REJECT_INVALID,
            10,
            "bad-txns-prevout-null",
        ));
    }

    Ok(())
}

/// Context-free block checks: merkle commitment, size, sigop ceiling, and
/// coinbase placement. PoW is checked by the header path.
pub fn check_block(block: &Block, txids: &[Hash256]) -> Result<(), ValidationFailure> {
    if block.transactions.is_empty() {
        return Err(ValidationFailure::invalid(
            REJECT_INVALID,
            100,
            "bad-blk-length",
        ));
    }

    let (root, mutated) = merkle_root(txids);
    if mutated {
        // A mutated tree means the tx list was tampered in transit, not that
        // the block is permanently bad.
        return Err(ValidationFailure::corruption("bad-txns-duplicate"));
    }
    if root != block.header.merkle_root {
        return Err(ValidationFailure::corruption("bad-txnmrklroot"));
    }

    let block_size = block.serialized_size() as u64;
    if block_size > MAX_BLOCK_SIZE {
        return Err(ValidationFailure::invalid(
            REJECT_INVALID,
            100,
            "bad-blk-length",
        ));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationFailure::invalid(
            REJECT_INVALID,
            100,
            "bad-cb-missing",
        ));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ValidationFailure::invalid(
                REJECT_INVALID,
                100,
                "bad-cb-multiple",
            ));
        }
    }

    let mut sigops = 0u64;
    for tx in &block.transactions {
        check_transaction(tx)?;
        for input in &tx.vin {
            sigops += coind_script::legacy_sigops(&input.script_sig, false);
        }
        for output in &tx.vout {
            sigops += coind_script::legacy_sigops(&output.script_pubkey, false);
        }
    }
    if sigops > max_block_sigops(block_size) {
        return Err(ValidationFailure::invalid(
            REJECT_INVALID,
            100,
            "bad-blk-sigops",
        ));
    }

    Ok(())
}

/// Merkle root over txids, flagging the duplicated-final-pair mutation that
/// makes two different transaction lists hash alike.
pub fn merkle_root(txids: &[Hash256]) -> (Hash256, bool) {
    if txids.is_empty() {
        return ([0u8; 32], false);
    }
    let mut layer = txids.to_vec();
    let mut mutated = false;
    while layer.len() > 1 {
        let size = layer.len();
        let mut next = Vec::with_capacity(size.div_ceil(2));
        let mut i = 0usize;
        while i < size {
            let i2 = if i + 1 < size { i + 1 } else { i };
            if i2 == i + 1 && i2 + 1 == size && layer[i] == layer[i2] {
                mutated = true;
            }
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&layer[i]);
            data.extend_from_slice(&layer[i2]);
            next.push(sha256d(&data));
            i += 2;
        }
        layer = next;
    }
    (layer[0], mutated)
}

/// Whether a transaction is final for a block at `height` whose lock-time
/// reference clock reads `block_time`.
pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = tx.lock_time as i64;
    let threshold = if lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        block_time
    };
    if lock_time < threshold {
        return true;
    }
    tx.vin.iter().all(|input| input.sequence == u32::MAX)
}

/// The point at which a transaction's relative locks are satisfied.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LockPoints {
    /// Minimum block height the spending block must have.
    pub height: i32,
    /// Minimum median-time-past the spending block's parent must have.
    pub time: i64,
    /// Highest input prevout height; used to re-check validity after reorgs.
    pub max_input_height: i32,
}

/// Computes a transaction's sequence locks. `prevs` pairs each input with
/// the height of the block that created its prevout and the median-time-past
/// of that block's parent.
pub fn calculate_sequence_locks(
    tx: &Transaction,
    locktime_flags: u32,
    prevs: &[(i32, i64)],
) -> LockPoints {
    let mut lock = LockPoints {
        height: -1,
        time: -1,
        max_input_height: 0,
    };
    // Relative locks exist from transaction version 2 and only while the
    // rule deployment is active.
    let enforce = tx.version >= 2 && (locktime_flags & LOCKTIME_VERIFY_SEQUENCE) != 0;
    if !enforce || tx.is_coinbase() {
        return lock;
    }

    for (input, (prev_height, prev_parent_mtp)) in tx.vin.iter().zip(prevs) {
        if (input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG) != 0 {
            continue;
        }
        lock.max_input_height = lock.max_input_height.max(*prev_height);
        let masked = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if (input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG) != 0 {
            // Time-based: granularity is 512-second units measured from the
            // median-time-past preceding the prevout's block.
            let lock_time = prev_parent_mtp + (masked << SEQUENCE_LOCKTIME_GRANULARITY);
            lock.time = lock.time.max(lock_time);
        } else {
            lock.height = lock.height.max(prev_height + masked as i32);
        }
    }
    lock
}

/// Whether a block at `height` with parent median-time-past `mtp` satisfies
/// the lock points.
pub fn evaluate_sequence_locks(height: i32, mtp: i64, lock: &LockPoints) -> bool {
    lock.height < height && lock.time < mtp
}
