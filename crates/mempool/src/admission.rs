//! The admission pipeline: every gate an unconfirmed transaction passes on
//! its way into the pool, in order, each with its typed rejection.

use std::collections::HashSet;
use std::sync::Mutex;

use coind_chainstate::coins::Coin;
use coind_chainstate::state::ChainState;
use coind_chainstate::validation::{
    calculate_sequence_locks, check_transaction, evaluate_sequence_locks, is_final_tx, RejectKind,
    ValidationFailure, REJECT_DUPLICATE, REJECT_INSUFFICIENT_FEE, REJECT_INVALID,
    REJECT_NONSTANDARD,
};
use coind_consensus::constants::{
    COINBASE_MATURITY, MAX_TX_SIGOPS, STANDARD_LOCKTIME_VERIFY_FLAGS,
};
use coind_consensus::money::{Amount, MAX_MONEY};
use coind_consensus::Hash256;
use coind_primitives::hash256_to_hex;
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::Transaction;
use coind_script::standard::{classify_script_pubkey, is_dust, is_push_only, ScriptType};
use coind_script::{
    legacy_sigops, p2sh_sigops, verify_script, PrecomputedTransactionData,
    TransactionSignatureChecker, STANDARD_SCRIPT_VERIFY_FLAGS,
};

use crate::policy::{fee_for_size, MempoolPolicy};
use crate::{Mempool, MempoolEntry, MEMPOOL_HEIGHT};

/// Sigops allowed in the redeem script of a standard P2SH input.
const MAX_P2SH_SIGOPS: u64 = 15;

#[derive(Debug)]
pub struct MempoolRejection {
    pub failure: ValidationFailure,
    /// Parents the caller may fetch before retrying; set only for
    /// missing-input rejections.
    pub missing_parents: Vec<Hash256>,
}

impl From<ValidationFailure> for MempoolRejection {
    fn from(failure: ValidationFailure) -> Self {
        Self {
            failure,
            missing_parents: Vec::new(),
        }
    }
}

impl std::fmt::Display for MempoolRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.failure)
    }
}

impl std::error::Error for MempoolRejection {}

fn reject(kind: RejectKind, code: u8, reason: impl Into<String>) -> MempoolRejection {
    ValidationFailure::with_kind(kind, code, reason).into()
}

/// Runs the full admission pipeline against the current tip and, on success,
/// inserts the transaction and trims the pool. The pool mutex is taken after
/// the validation lock; every caller holding both must use that order.
pub fn accept_to_mempool(
    chain: &ChainState,
    pool: &Mutex<Mempool>,
    policy: &MempoolPolicy,
    tx: Transaction,
    now: u64,
) -> Result<Hash256, MempoolRejection> {
    let txid = tx.txid();

    // Stage 1: context-free shape.
    check_transaction(&tx).map_err(MempoolRejection::from)?;
    if tx.is_coinbase() {
        return Err(ValidationFailure::invalid(REJECT_INVALID, 100, "coinbase").into());
    }
    let size = tx.serialized_size();
    let mut sigops: u64 = 0;
    for input in &tx.vin {
        sigops += legacy_sigops(&input.script_sig, false);
    }
    for output in &tx.vout {
        sigops += legacy_sigops(&output.script_pubkey, false);
    }
    if sigops > MAX_TX_SIGOPS {
        return Err(
            ValidationFailure::invalid(REJECT_INVALID, 10, "bad-txns-too-many-sigops").into(),
        );
    }

    // Stage 2: standardness.
    if policy.require_standard {
        if let Err(reason) = check_standard(&tx, policy) {
            return Err(reject(RejectKind::NonStandard, REJECT_NONSTANDARD, reason));
        }
    }

    // Everything from here needs chain state; the pool mutex follows the
    // validation lock.
    let mut view = chain.lock();
    let mut pool = pool.lock().expect("mempool lock");
    let pool = &mut *pool;
    let tip = view
        .tip()
        .ok_or_else(|| MempoolRejection::from(ValidationFailure::internal("no active tip")))?;
    let next_height = tip.height + 1;

    // Stage 3: finality against the next block.
    if !is_final_tx(&tx, next_height, tip.median_time_past) {
        return Err(reject(RejectKind::NonStandard, REJECT_NONSTANDARD, "non-final"));
    }

    // Stage 4: already known.
    if pool.contains(&txid) {
        return Err(reject(
            RejectKind::AlreadyKnown,
            REJECT_DUPLICATE,
            "txn-already-in-mempool",
        ));
    }
    for vout in 0..tx.vout.len() as u32 {
        if view
            .have_coin(&OutPoint::new(txid, vout))
            .map_err(|err| ValidationFailure::internal(err.to_string()))?
        {
            return Err(reject(
                RejectKind::AlreadyKnown,
                REJECT_DUPLICATE,
                "txn-already-known",
            ));
        }
    }

    // Stage 5: in-pool conflicts.
    for input in &tx.vin {
        if let Some(conflict) = pool.spender_of(&input.prevout) {
            return Err(reject(
                RejectKind::Conflict,
                REJECT_DUPLICATE,
                format!("txn-mempool-conflict with {}", hash256_to_hex(&conflict)),
            ));
        }
    }

    // Stage 6: inputs resolvable in (UTXO ∪ mempool).
    let mut spent_coins: Vec<Coin> = Vec::with_capacity(tx.vin.len());
    let mut missing_parents: Vec<Hash256> = Vec::new();
    for input in &tx.vin {
        if let Some(coin) = view
            .coin(&input.prevout)
            .map_err(|err| ValidationFailure::internal(err.to_string()))?
        {
            spent_coins.push(coin);
        } else if let Some(output) = pool.output(&input.prevout) {
            spent_coins.push(Coin::new(output.clone(), MEMPOOL_HEIGHT, false));
        } else if !missing_parents.contains(&input.prevout.txid) {
            missing_parents.push(input.prevout.txid);
        }
    }
    if !missing_parents.is_empty() {
        return Err(MempoolRejection {
            failure: ValidationFailure::with_kind(
                RejectKind::MissingInputs,
                REJECT_INVALID,
                "bad-txns-inputs-missing",
            ),
            missing_parents,
        });
    }

    for coin in &spent_coins {
        if coin.is_coinbase && next_height - coin.height < COINBASE_MATURITY {
            return Err(ValidationFailure::invalid(
                REJECT_INVALID,
                10,
                "bad-txns-premature-spend-of-coinbase",
            )
            .into());
        }
    }

    // Stage 7: relative lock-times, evaluated as if mined in the next block.
    let prevs: Vec<(i32, i64)> = spent_coins
        .iter()
        .map(|coin| {
            if coin.height == MEMPOOL_HEIGHT {
                (next_height, tip.median_time_past)
            } else {
                (coin.height, view.mtp_before_height(coin.height))
            }
        })
        .collect();
    let lock_points = calculate_sequence_locks(&tx, STANDARD_LOCKTIME_VERIFY_FLAGS, &prevs);
    if !evaluate_sequence_locks(next_height, tip.median_time_past, &lock_points) {
        return Err(reject(
            RejectKind::NonStandard,
            REJECT_NONSTANDARD,
            "non-BIP68-final",
        ));
    }

    // Standard inputs: P2SH redeem scripts stay within the sigop allowance.
    if policy.require_standard {
        for (input, coin) in tx.vin.iter().zip(&spent_coins) {
            if p2sh_sigops(&coin.output.script_pubkey, &input.script_sig) > MAX_P2SH_SIGOPS {
                return Err(reject(
                    RejectKind::NonStandard,
                    REJECT_NONSTANDARD,
                    "bad-txns-nonstandard-inputs",
                ));
            }
        }
    }

    // Stage 8: fees.
    let mut value_in: Amount = 0;
    for coin in &spent_coins {
        value_in = value_in
            .checked_add(coin.value())
            .filter(|total| *total <= MAX_MONEY)
            .ok_or_else(|| {
                ValidationFailure::invalid(REJECT_INVALID, 100, "bad-txns-inputvalues-outofrange")
            })?;
    }
    let value_out = tx
        .value_out()
        .ok_or_else(|| ValidationFailure::invalid(REJECT_INVALID, 100, "bad-txns-txouttotal-toolarge"))?;
    if value_in < value_out {
        return Err(ValidationFailure::invalid(REJECT_INVALID, 100, "bad-txns-in-belowout").into());
    }
    let fee = value_in - value_out;
    let modified_fee = fee.saturating_add(pool.fee_delta_for(&txid));

    let pool_floor_per_kb = pool.min_fee_per_kb(now, policy);
    if modified_fee < fee_for_size(pool_floor_per_kb, size) {
        return Err(reject(
            RejectKind::InsufficientFee,
            REJECT_INSUFFICIENT_FEE,
            "mempool min fee not met",
        ));
    }
    if modified_fee < policy.min_relay_fee_for_size(size) {
        let allowed = policy.limit_free_relay_kb_per_min > 0
            && pool.free_relay_allow(now, size, policy.limit_free_relay_kb_per_min);
        if !allowed {
            return Err(reject(
                RejectKind::InsufficientFee,
                REJECT_INSUFFICIENT_FEE,
                "min relay fee not met",
            ));
        }
        coind_log::log_debug!("accepting free transaction {}", hash256_to_hex(&txid));
    }
    if policy.reject_absurd_fee && fee > policy.absurd_fee_for_size(size) {
        return Err(reject(
            RejectKind::HighFee,
            REJECT_INSUFFICIENT_FEE,
            "absurdly-high-fee",
        ));
    }

    // Stage 9: package limits.
    let parents: HashSet<Hash256> = tx
        .vin
        .iter()
        .map(|input| input.prevout.txid)
        .filter(|parent| pool.contains(parent))
        .collect();
    let ancestors = pool
        .calculate_ancestors(&parents, size, policy)
        .map_err(|reason| {
            reject(
                RejectKind::NonStandard,
                REJECT_NONSTANDARD,
                format!("too-long-mempool-chain: {reason}"),
            )
        })?;

    // Stage 10: scripts, first under policy flags, then under the consensus
    // flags of the current tip. A policy failure must never be treated as
    // consensus invalidity.
    let precomputed = PrecomputedTransactionData::new(&tx);
    for (input_index, coin) in spent_coins.iter().enumerate() {
        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index,
            amount: coin.value(),
            precomputed: Some(&precomputed),
        };
        if let Err(err) = verify_script(
            &tx.vin[input_index].script_sig,
            &coin.output.script_pubkey,
            STANDARD_SCRIPT_VERIFY_FLAGS,
            &checker,
        ) {
            return Err(reject(
                RejectKind::NonStandard,
                REJECT_NONSTANDARD,
                format!("non-mandatory-script-verify-flag ({err})"),
            ));
        }
    }
    let consensus_flags = view.consensus_script_flags_for_tip();
    for (input_index, coin) in spent_coins.iter().enumerate() {
        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index,
            amount: coin.value(),
            precomputed: Some(&precomputed),
        };
        if let Err(err) = verify_script(
            &tx.vin[input_index].script_sig,
            &coin.output.script_pubkey,
            consensus_flags,
            &checker,
        ) {
            return Err(ValidationFailure::invalid(
                REJECT_INVALID,
                100,
                format!("mandatory-script-verify-flag-failed ({err})"),
            )
            .into());
        }
    }

    // Stage 11: insert, expire, trim.
    pool.expire(now, policy);
    let entry = MempoolEntry {
        txid,
        tx,
        size,
        fee,
        fee_delta: 0,
        time: now,
        height: tip.height,
        sigops,
        lock_points,
        parents,
        children: HashSet::new(),
        ancestor_count: 0,
        ancestor_size: 0,
        ancestor_fees: 0,
        descendant_count: 0,
        descendant_size: 0,
        descendant_fees: 0,
    };
    pool.insert(entry, &ancestors);
    pool.trim_to_size(now, policy);
    if !pool.contains(&txid) {
        return Err(reject(
            RejectKind::InsufficientFee,
            REJECT_INSUFFICIENT_FEE,
            "mempool full",
        ));
    }
    Ok(txid)
}

fn check_standard(tx: &Transaction, policy: &MempoolPolicy) -> Result<(), String> {
    if !(1..=2).contains(&tx.version) {
        return Err("version".to_string());
    }
    for input in &tx.vin {
        if input.script_sig.len() > policy.max_script_sig_size {
            return Err("scriptsig-size".to_string());
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly".to_string());
        }
    }
    let mut data_outputs = 0usize;
    for output in &tx.vout {
        match classify_script_pubkey(&output.script_pubkey) {
            ScriptType::NonStandard => return Err("scriptpubkey".to_string()),
            ScriptType::NullData => data_outputs += 1,
            _ => {
                if is_dust(output, policy.min_relay_fee_per_kb) {
                    return Err("dust".to_string());
                }
            }
        }
    }
    if data_outputs > 1 {
        return Err("multi-op-return".to_string());
    }
    Ok(())
}
