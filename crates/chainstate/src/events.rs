//! Interfaces the validation core consumes from and exposes to the rest of
//! the node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use coind_consensus::Hash256;
use coind_primitives::block::Block;
use coind_primitives::transaction::Transaction;

/// Downstream observers of chain-state transitions. All callbacks fire with
/// the validation lock released.
pub trait ChainNotifier: Send + Sync {
    fn block_connected(&self, _block: &Block, _hash: &Hash256, _height: i32) {}
    fn block_disconnected(&self, _block: &Block, _hash: &Hash256) {}
    fn header_tip(&self, _height: i32, _hash: &Hash256, _initial_download: bool) {}
    /// A block body extending the current tip was stored, ahead of
    /// activation; peers may be told early.
    fn block_stored(&self, _hash: &Hash256, _height: i32) {}
    fn transaction_removed(&self, _tx: &Transaction, _reason: RemovalReason) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemovalReason {
    Expired,
    SizeLimit,
    Reorg,
    /// Confirmed in a connected block.
    InBlock,
    /// Conflicts with a transaction in a connected block.
    Conflict,
}

/// Network-adjusted wall clock; the implementation caps peer skew.
pub trait NetworkClock: Send + Sync {
    fn adjusted_time(&self) -> i64;
}

pub struct SystemClock;

impl NetworkClock for SystemClock {
    fn adjusted_time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// Cooperative shutdown flag checked between connect/disconnect steps.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
