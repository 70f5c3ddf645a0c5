//! Parking for transactions whose parents have not arrived yet.

use std::collections::HashMap;

use coind_consensus::Hash256;
use coind_primitives::transaction::Transaction;

const MAX_ORPHANS: usize = 100;
const MAX_ORPHAN_TX_SIZE: usize = 100_000;
const ORPHAN_TTL_SECS: u64 = 20 * 60;

#[derive(Clone, Debug)]
struct OrphanTx {
    tx: Transaction,
    received: u64,
    missing_parents: Vec<Hash256>,
}

/// A bounded side-pool of transactions rejected with missing inputs. When a
/// parent shows up the children are handed back for a fresh admission
/// attempt.
#[derive(Default)]
pub struct OrphanPool {
    orphans: HashMap<Hash256, OrphanTx>,
    by_parent: HashMap<Hash256, Vec<Hash256>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.orphans.contains_key(txid)
    }

    pub fn add(&mut self, tx: Transaction, missing_parents: Vec<Hash256>, now: u64) {
        if missing_parents.is_empty() {
            return;
        }
        if tx.serialized_size() > MAX_ORPHAN_TX_SIZE {
            return;
        }
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return;
        }
        self.prune(now);
        while self.orphans.len() >= MAX_ORPHANS {
            if !self.evict_oldest() {
                break;
            }
        }
        for parent in &missing_parents {
            let children = self.by_parent.entry(*parent).or_default();
            if !children.contains(&txid) {
                children.push(txid);
            }
        }
        self.orphans.insert(
            txid,
            OrphanTx {
                tx,
                received: now,
                missing_parents,
            },
        );
    }

    /// Orphans waiting on `parent`, removed from the pool for retry.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<Transaction> {
        let Some(txids) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for txid in txids {
            if let Some(orphan) = self.remove(&txid) {
                out.push(orphan.tx);
            }
        }
        out
    }

    pub fn prune(&mut self, now: u64) {
        let cutoff = now.saturating_sub(ORPHAN_TTL_SECS);
        let stale: Vec<Hash256> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.received <= cutoff)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in stale {
            self.remove(&txid);
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some(oldest) = self
            .orphans
            .values()
            .min_by_key(|orphan| orphan.received)
            .map(|orphan| orphan.tx.txid())
        else {
            return false;
        };
        self.remove(&oldest).is_some()
    }

    fn remove(&mut self, txid: &Hash256) -> Option<OrphanTx> {
        let orphan = self.orphans.remove(txid)?;
        let mut empty_parents = Vec::new();
        for parent in &orphan.missing_parents {
            if let Some(children) = self.by_parent.get_mut(parent) {
                children.retain(|child| child != txid);
                if children.is_empty() {
                    empty_parents.push(*parent);
                }
            }
        }
        for parent in empty_parents {
            self.by_parent.remove(&parent);
        }
        Some(orphan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coind_primitives::outpoint::OutPoint;
    use coind_primitives::transaction::{TxIn, TxOut};

    fn orphan_tx(parent: Hash256, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new(parent, 0),
                script_sig: vec![0x01, tag],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn children_return_when_parent_arrives() {
        let mut pool = OrphanPool::new();
        let parent = [1u8; 32];
        let tx = orphan_tx(parent, 7);
        pool.add(tx.clone(), vec![parent], 100);
        assert_eq!(pool.len(), 1);

        let children = pool.take_children(&parent);
        assert_eq!(children, vec![tx]);
        assert!(pool.is_empty());
    }

    #[test]
    fn stale_orphans_pruned() {
        let mut pool = OrphanPool::new();
        pool.add(orphan_tx([2u8; 32], 1), vec![[2u8; 32]], 0);
        pool.prune(ORPHAN_TTL_SECS + 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut pool = OrphanPool::new();
        for i in 0..=MAX_ORPHANS as u8 {
            let parent = [i; 32];
            pool.add(orphan_tx(parent, i), vec![parent], 1_000 + i as u64);
        }
        assert_eq!(pool.len(), MAX_ORPHANS);
        assert!(!pool.contains(&orphan_tx([0u8; 32], 0).txid()));
    }
}
