//! The memory pool: unconfirmed transactions forming a DAG rooted at
//! confirmed outputs, with ancestor/descendant accounting, size-based
//! eviction, expiry, and reorg maintenance.

pub mod admission;
pub mod orphans;
pub mod policy;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use coind_chainstate::validation::LockPoints;
use coind_consensus::money::Amount;
use coind_consensus::Hash256;
use coind_primitives::hash256_to_hex;
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::Transaction;

use crate::policy::{FreeRelayLimiter, MempoolPolicy, RollingFeeRate};

pub use crate::admission::{accept_to_mempool, MempoolRejection};
pub use coind_chainstate::events::RemovalReason;

/// Marker height for coins created by in-pool transactions.
pub const MEMPOOL_HEIGHT: i32 = 0x7fff_ffff;

/// Observers of pool membership changes.
pub trait MempoolWatcher: Send + Sync {
    fn transaction_added(&self, _tx: &Transaction) {}
    fn transaction_removed(&self, _tx: &Transaction, _reason: RemovalReason) {}
}

#[derive(Clone, Debug)]
pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub size: usize,
    pub fee: Amount,
    pub fee_delta: Amount,
    /// Arrival time, unix seconds.
    pub time: u64,
    /// Active-chain height at admission.
    pub height: i32,
    pub sigops: u64,
    pub lock_points: LockPoints,
    /// Direct in-pool parents and children.
    pub parents: HashSet<Hash256>,
    pub children: HashSet<Hash256>,
    /// Totals over this entry plus every in-pool ancestor.
    pub ancestor_count: u64,
    pub ancestor_size: u64,
    pub ancestor_fees: Amount,
    /// Totals over this entry plus every in-pool descendant.
    pub descendant_count: u64,
    pub descendant_size: u64,
    pub descendant_fees: Amount,
}

impl MempoolEntry {
    pub fn modified_fee(&self) -> Amount {
        self.fee.saturating_add(self.fee_delta)
    }

    pub fn fee_rate_per_kb(&self) -> Amount {
        self.modified_fee().saturating_mul(1_000) / self.size.max(1) as Amount
    }

    fn descendant_rate_per_kb(&self) -> Amount {
        self.descendant_fees.saturating_mul(1_000) / self.descendant_size.max(1) as Amount
    }

    /// Eviction score: the better of the entry's own rate and its package
    /// rate, so a cheap parent is carried by paying children.
    fn eviction_rate_per_kb(&self) -> Amount {
        self.fee_rate_per_kb().max(self.descendant_rate_per_kb())
    }
}

/// Fires `transaction_removed(Conflict)` for everything it collected when it
/// goes out of scope; the activator holds one across a reorg so conflict
/// notifications trail the tip switch.
pub struct ConflictTracker {
    watchers: Vec<Arc<dyn MempoolWatcher>>,
    conflicted: Vec<Transaction>,
}

impl ConflictTracker {
    fn new(watchers: Vec<Arc<dyn MempoolWatcher>>) -> Self {
        Self {
            watchers,
            conflicted: Vec::new(),
        }
    }

    fn record(&mut self, tx: Transaction) {
        self.conflicted.push(tx);
    }
}

impl Drop for ConflictTracker {
    fn drop(&mut self) {
        for tx in &self.conflicted {
            for watcher in &self.watchers {
                watcher.transaction_removed(tx, RemovalReason::Conflict);
            }
        }
    }
}

pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    /// Outpoint → spending txid; enforces the no-double-spend invariant.
    spent: HashMap<OutPoint, Hash256>,
    fee_deltas: HashMap<Hash256, Amount>,
    watchers: Vec<Arc<dyn MempoolWatcher>>,
    rolling_fee: RollingFeeRate,
    free_relay: FreeRelayLimiter,
    total_bytes: usize,
}

impl Mempool {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            fee_deltas: HashMap::new(),
            watchers: Vec::new(),
            rolling_fee: RollingFeeRate::new(),
            free_relay: FreeRelayLimiter::new(),
            total_bytes: 0,
        }
    }

    pub fn subscribe(&mut self, watcher: Arc<dyn MempoolWatcher>) {
        self.watchers.push(watcher);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    /// The output of an in-pool transaction, if any.
    pub fn output(&self, outpoint: &OutPoint) -> Option<&coind_primitives::transaction::TxOut> {
        let entry = self.entries.get(&outpoint.txid)?;
        entry.tx.vout.get(outpoint.index as usize)
    }

    /// Current dynamic admission floor per kilobyte.
    pub fn min_fee_per_kb(&mut self, now: u64, policy: &MempoolPolicy) -> Amount {
        self.rolling_fee.current(now, policy.min_relay_fee_per_kb)
    }

    /// Charges `size` bytes against the free-relay allowance.
    pub fn free_relay_allow(&mut self, now: u64, size: usize, limit_kb_per_min: u64) -> bool {
        self.free_relay.allow(now, size, limit_kb_per_min)
    }

    /// Registers a fee bias applied during admission and eviction ordering.
    pub fn prioritise(&mut self, txid: Hash256, fee_delta: Amount) {
        let total = {
            let slot = self.fee_deltas.entry(txid).or_insert(0);
            *slot = slot.saturating_add(fee_delta);
            *slot
        };
        if self.entries.contains_key(&txid) {
            let ancestors = self.transitive(&txid, Direction::Ancestors);
            let descendants = self.transitive(&txid, Direction::Descendants);
            let entry = self.entries.get_mut(&txid).expect("checked membership");
            let applied = total - entry.fee_delta;
            entry.fee_delta = total;
            entry.ancestor_fees = entry.ancestor_fees.saturating_add(applied);
            entry.descendant_fees = entry.descendant_fees.saturating_add(applied);
            for ancestor in ancestors {
                let entry = self.entries.get_mut(&ancestor).expect("linked ancestor");
                entry.descendant_fees = entry.descendant_fees.saturating_add(applied);
            }
            for descendant in descendants {
                let entry = self.entries.get_mut(&descendant).expect("linked descendant");
                entry.ancestor_fees = entry.ancestor_fees.saturating_add(applied);
            }
        }
        coind_log::log_info!(
            "prioritised {} by {fee_delta} (total {total})",
            hash256_to_hex(&txid)
        );
    }

    pub fn fee_delta_for(&self, txid: &Hash256) -> Amount {
        self.fee_deltas.get(txid).copied().unwrap_or(0)
    }

    /// The in-pool ancestor set a new transaction with `parents` would have,
    /// or the limit it violates.
    pub fn calculate_ancestors(
        &self,
        parents: &HashSet<Hash256>,
        entry_size: usize,
        policy: &MempoolPolicy,
    ) -> Result<HashSet<Hash256>, String> {
        let mut ancestors: HashSet<Hash256> = HashSet::new();
        let mut queue: VecDeque<Hash256> = parents.iter().copied().collect();
        let mut total_size = entry_size as u64;
        while let Some(txid) = queue.pop_front() {
            if !ancestors.insert(txid) {
                continue;
            }
            let entry = self
                .entries
                .get(&txid)
                .ok_or_else(|| "ancestor disappeared".to_string())?;

            // Adding the child must not push any existing ancestor over its
            // descendant allowance.
            if entry.descendant_count + 1 > policy.max_descendants {
                return Err(format!(
                    "exceeds descendant count limit for {}",
                    hash256_to_hex(&txid)
                ));
            }
            if entry.descendant_size + entry_size as u64 > policy.max_descendant_size {
                return Err(format!(
                    "exceeds descendant size limit for {}",
                    hash256_to_hex(&txid)
                ));
            }

            total_size += entry.size as u64;
            if ancestors.len() as u64 + 1 > policy.max_ancestors {
                return Err("too many unconfirmed ancestors".to_string());
            }
            if total_size > policy.max_ancestor_size {
                return Err("exceeds ancestor size limit".to_string());
            }
            queue.extend(entry.parents.iter().copied());
        }
        Ok(ancestors)
    }

    /// Inserts a fully-validated entry, wiring the DAG and package totals.
    pub fn insert(&mut self, mut entry: MempoolEntry, ancestors: &HashSet<Hash256>) {
        entry.fee_delta = self.fee_delta_for(&entry.txid);
        entry.ancestor_count = 1;
        entry.ancestor_size = entry.size as u64;
        entry.ancestor_fees = entry.modified_fee();
        entry.descendant_count = 1;
        entry.descendant_size = entry.size as u64;
        entry.descendant_fees = entry.modified_fee();

        for ancestor in ancestors {
            let ancestor_entry = self.entries.get(ancestor).expect("validated ancestor");
            entry.ancestor_count += 1;
            entry.ancestor_size += ancestor_entry.size as u64;
            entry.ancestor_fees = entry
                .ancestor_fees
                .saturating_add(ancestor_entry.modified_fee());
        }

        let txid = entry.txid;
        let size = entry.size as u64;
        let fee = entry.modified_fee();
        for ancestor in ancestors {
            let ancestor_entry = self.entries.get_mut(ancestor).expect("validated ancestor");
            ancestor_entry.descendant_count += 1;
            ancestor_entry.descendant_size += size;
            ancestor_entry.descendant_fees = ancestor_entry.descendant_fees.saturating_add(fee);
        }
        for parent in entry.parents.clone() {
            if let Some(parent_entry) = self.entries.get_mut(&parent) {
                parent_entry.children.insert(txid);
            }
        }
        for input in &entry.tx.vin {
            self.spent.insert(input.prevout, txid);
        }
        self.total_bytes += entry.size;
        let tx = entry.tx.clone();
        self.entries.insert(txid, entry);
        for watcher in &self.watchers {
            watcher.transaction_added(&tx);
        }
    }

    fn transitive(&self, txid: &Hash256, direction: Direction) -> HashSet<Hash256> {
        let mut out = HashSet::new();
        let mut queue = VecDeque::new();
        if let Some(entry) = self.entries.get(txid) {
            let seed = match direction {
                Direction::Ancestors => &entry.parents,
                Direction::Descendants => &entry.children,
            };
            queue.extend(seed.iter().copied());
        }
        while let Some(current) = queue.pop_front() {
            if !out.insert(current) {
                continue;
            }
            if let Some(entry) = self.entries.get(&current) {
                let next = match direction {
                    Direction::Ancestors => &entry.parents,
                    Direction::Descendants => &entry.children,
                };
                queue.extend(next.iter().copied());
            }
        }
        out
    }

    /// Removes one entry. Ancestors always lose its contribution to their
    /// descendant totals; with `update_descendants`, remaining descendants
    /// also drop it from their ancestor totals (the confirmed-in-block case,
    /// where the children live on).
    fn remove_single(
        &mut self,
        txid: &Hash256,
        reason: RemovalReason,
        update_descendants: bool,
    ) -> Option<MempoolEntry> {
        let ancestors = self.transitive(txid, Direction::Ancestors);
        let descendants = if update_descendants {
            self.transitive(txid, Direction::Descendants)
        } else {
            HashSet::new()
        };
        let entry = self.entries.remove(txid)?;

        for ancestor in ancestors {
            if let Some(ancestor_entry) = self.entries.get_mut(&ancestor) {
                ancestor_entry.descendant_count -= 1;
                ancestor_entry.descendant_size -= entry.size as u64;
                ancestor_entry.descendant_fees -= entry.modified_fee();
            }
        }
        for descendant in descendants {
            if let Some(descendant_entry) = self.entries.get_mut(&descendant) {
                descendant_entry.ancestor_count -= 1;
                descendant_entry.ancestor_size -= entry.size as u64;
                descendant_entry.ancestor_fees -= entry.modified_fee();
            }
        }
        for parent in &entry.parents {
            if let Some(parent_entry) = self.entries.get_mut(parent) {
                parent_entry.children.remove(txid);
            }
        }
        for child in &entry.children {
            if let Some(child_entry) = self.entries.get_mut(child) {
                child_entry.parents.remove(txid);
            }
        }
        for input in &entry.tx.vin {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        self.total_bytes -= entry.size;
        for watcher in &self.watchers {
            watcher.transaction_removed(&entry.tx, reason);
        }
        Some(entry)
    }

    /// Removes an entry and everything that descends from it.
    pub fn remove_recursive(&mut self, txid: &Hash256, reason: RemovalReason) -> Vec<MempoolEntry> {
        let mut order: Vec<Hash256> = self
            .transitive(txid, Direction::Descendants)
            .into_iter()
            .collect();
        order.push(*txid);
        // Children first, so parent unlinking never dangles.
        order.sort_by_key(|member| {
            std::cmp::Reverse(
                self.entries
                    .get(member)
                    .map(|entry| entry.ancestor_count)
                    .unwrap_or(0),
            )
        });
        let mut removed = Vec::new();
        for member in order {
            if let Some(entry) = self.remove_single(&member, reason, false) {
                removed.push(entry);
            }
        }
        removed
    }

    /// Evicts everything a newly connected block made redundant: its own
    /// transactions, then anything conflicting with its spends.
    pub fn remove_for_block(&mut self, block_txs: &[Transaction]) {
        let mut tracker = ConflictTracker::new(self.watchers.clone());
        for tx in block_txs {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                self.remove_single(&txid, RemovalReason::InBlock, true);
                continue;
            }
            for input in &tx.vin {
                if let Some(conflict) = self.spent.get(&input.prevout).copied() {
                    for removed in self.remove_recursive(&conflict, RemovalReason::Conflict) {
                        tracker.record(removed.tx);
                    }
                }
            }
        }
    }

    /// Drops entries a reorg invalidated: `still_valid` judges each entry
    /// against the new tip (maturity, lock points, missing inputs).
    pub fn remove_for_reorg(&mut self, mut still_valid: impl FnMut(&MempoolEntry) -> bool) {
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| !still_valid(entry))
            .map(|entry| entry.txid)
            .collect();
        for txid in stale {
            self.remove_recursive(&txid, RemovalReason::Reorg);
        }
    }

    /// Expires entries older than the policy's horizon.
    pub fn expire(&mut self, now: u64, policy: &MempoolPolicy) -> usize {
        let cutoff = now.saturating_sub(policy.expiry_secs);
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.time < cutoff)
            .map(|entry| entry.txid)
            .collect();
        let mut removed = 0;
        for txid in &stale {
            removed += self
                .remove_recursive(txid, RemovalReason::Expired)
                .len();
        }
        removed
    }

    /// Evicts lowest-value packages until the pool fits its budget, raising
    /// the dynamic fee floor. Returns the txids evicted.
    pub fn trim_to_size(&mut self, now: u64, policy: &MempoolPolicy) -> Vec<Hash256> {
        let mut evicted = Vec::new();
        while self.total_bytes > policy.max_bytes {
            let Some(worst) = self
                .entries
                .values()
                .min_by_key(|entry| (entry.eviction_rate_per_kb(), std::cmp::Reverse(entry.time)))
            else {
                break;
            };
            let rate = worst.eviction_rate_per_kb();
            let txid = worst.txid;
            self.rolling_fee.bump(now, rate, policy.min_relay_fee_per_kb);
            for entry in self.remove_recursive(&txid, RemovalReason::SizeLimit) {
                evicted.push(entry.txid);
            }
        }
        if !evicted.is_empty() {
            coind_log::log_info!(
                "mempool trimmed {} transaction(s), new floor {} per kB",
                evicted.len(),
                self.rolling_fee.current(now, policy.min_relay_fee_per_kb)
            );
        }
        evicted
    }

    /// Walks the spend graph and cross-checks every cached total; test and
    /// debug aid for the DAG invariants.
    pub fn check_consistency(&self) -> Result<(), String> {
        for entry in self.entries.values() {
            let ancestors = self.transitive(&entry.txid, Direction::Ancestors);
            let descendants = self.transitive(&entry.txid, Direction::Descendants);
            if ancestors.contains(&entry.txid) {
                return Err(format!("cycle through {}", hash256_to_hex(&entry.txid)));
            }
            let ancestor_size: u64 = entry.size as u64
                + ancestors
                    .iter()
                    .map(|a| self.entries[a].size as u64)
                    .sum::<u64>();
            let descendant_size: u64 = entry.size as u64
                + descendants
                    .iter()
                    .map(|d| self.entries[d].size as u64)
                    .sum::<u64>();
            if entry.ancestor_count != ancestors.len() as u64 + 1
                || entry.ancestor_size != ancestor_size
                || entry.descendant_count != descendants.len() as u64 + 1
                || entry.descendant_size != descendant_size
            {
                return Err(format!(
                    "stale package totals for {}",
                    hash256_to_hex(&entry.txid)
                ));
            }
        }
        for (outpoint, spender) in &self.spent {
            let entry = self
                .entries
                .get(spender)
                .ok_or_else(|| "spent map references missing entry".to_string())?;
            if !entry.tx.vin.iter().any(|input| input.prevout == *outpoint) {
                return Err("spent map entry does not match its transaction".to_string());
            }
        }
        Ok(())
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Ancestors,
    Descendants,
}
