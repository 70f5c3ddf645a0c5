use std::sync::{Arc, Mutex};

use coind_chainstate::events::{NetworkClock, ShutdownFlag};
use coind_chainstate::genesis::genesis_block;
use coind_chainstate::state::{ChainState, ChainStateConfig};
use coind_chainstate::validation::{merkle_root, RejectKind};
use coind_consensus::money::COIN;
use coind_consensus::subsidy::block_subsidy;
use coind_consensus::{chain_params, Hash256, Network};
use coind_mempool::policy::MempoolPolicy;
use coind_mempool::{accept_to_mempool, Mempool};
use coind_pow::check_proof_of_work;
use coind_primitives::block::{Block, BlockHeader};
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::{Transaction, TxIn, TxOut};
use coind_storage::memory::MemoryStore;
use coind_storage::KeyValueStore;

struct FixedClock(i64);

impl NetworkClock for FixedClock {
    fn adjusted_time(&self) -> i64 {
        self.0
    }
}

const BASE_TIME: u32 = 1_296_688_602;
const NOW: u64 = 1_400_000_000;

fn coinbase(height: i32) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: block_subsidy(height, &chain_params(Network::Regtest).consensus),
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn build_block(prev: Hash256, height: i32, mut txs: Vec<Transaction>) -> Block {
    let mut transactions = vec![coinbase(height)];
    transactions.append(&mut txs);
    let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
    let (root, _) = merkle_root(&txids);
    let params = chain_params(Network::Regtest).consensus;
    let mut header = BlockHeader {
        version: 1,
        prev_block: prev,
        merkle_root: root,
        time: BASE_TIME + height as u32 * 600,
        bits: 0x207f_ffff,
        nonce: 0,
    };
    while check_proof_of_work(&header, &params).is_err() {
        header.nonce += 1;
    }
    Block {
        header,
        transactions,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    chain: Arc<ChainState>,
    tip: Hash256,
    height: i32,
    /// Coinbase txids by block height.
    coinbases: Vec<Hash256>,
}

impl Harness {
    /// A regtest chain of `height` blocks whose coinbases pay to OP_TRUE.
    fn with_height(height: i32) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let chain = ChainState::new(
            store as Arc<dyn KeyValueStore>,
            dir.path().join("blocks"),
            chain_params(Network::Regtest),
            ChainStateConfig {
                coins_cache_bytes: 8 * 1024 * 1024,
                ..ChainStateConfig::default()
            },
            Arc::new(FixedClock(BASE_TIME as i64 + 100_000_000)),
            ShutdownFlag::new(),
        )
        .expect("chain");
        chain.load().expect("load");

        let mut harness = Self {
            _dir: dir,
            chain: Arc::new(chain),
            tip: genesis_block(Network::Regtest).hash(),
            height: 0,
            coinbases: vec![genesis_block(Network::Regtest).transactions[0].txid()],
        };
        harness.mine(height, Vec::new());
        harness
    }

    fn mine(&mut self, count: i32, mut txs: Vec<Transaction>) {
        for _ in 0..count {
            let height = self.height + 1;
            let block = build_block(self.tip, height, std::mem::take(&mut txs));
            self.tip = block.hash();
            self.height = height;
            self.coinbases.push(block.transactions[0].txid());
            self.chain.process_new_block(&block, true).expect("connect");
        }
    }

    /// A spend of an OP_TRUE output. `tag` goes into the lock-time to make
    /// otherwise-identical transactions distinct while staying final.
    fn spend(&self, prevout: OutPoint, value: i64, sequence: u32, tag: u8) -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout,
                script_sig: Vec::new(),
                sequence,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: tag as u32,
        }
    }
}

fn lenient_policy() -> MempoolPolicy {
    MempoolPolicy {
        require_standard: false,
        ..MempoolPolicy::default()
    }
}

#[test]
fn double_spend_is_conflict() {
    let harness = Harness::with_height(101);
    let pool = Mutex::new(Mempool::new());
    let policy = lenient_policy();
    let prevout = OutPoint::new(harness.coinbases[1], 0);

    let t1 = harness.spend(prevout, 49 * COIN, u32::MAX, 1);
    let admitted =
        accept_to_mempool(&harness.chain, &pool, &policy, t1.clone(), NOW).expect("t1");
    assert_eq!(admitted, t1.txid());

    let t2 = harness.spend(prevout, 49 * COIN, u32::MAX, 2);
    let rejection =
        accept_to_mempool(&harness.chain, &pool, &policy, t2, NOW).expect_err("t2");
    assert_eq!(rejection.failure.kind, RejectKind::Conflict);
    assert_eq!(pool.lock().unwrap().len(), 1);
    pool.lock().unwrap().check_consistency().expect("dag");
}

#[test]
fn immature_coinbase_spend_rejected() {
    let mut harness = Harness::with_height(10);
    let pool = Mutex::new(Mempool::new());
    let policy = lenient_policy();
    // The coinbase of block 3 stays locked until the chain is deep enough
    // that the next block satisfies the 100-block rule.
    let prevout = OutPoint::new(harness.coinbases[3], 0);

    let premature = harness.spend(prevout, 49 * COIN, u32::MAX, 1);
    let rejection =
        accept_to_mempool(&harness.chain, &pool, &policy, premature, NOW).expect_err("young");
    assert_eq!(rejection.failure.kind, RejectKind::Invalid);
    assert_eq!(rejection.failure.reason, "bad-txns-premature-spend-of-coinbase");

    // Tip 101: depth of the height-3 coinbase in the next block is 99.
    harness.mine(91, Vec::new());
    let still_young = harness.spend(prevout, 49 * COIN, u32::MAX, 1);
    accept_to_mempool(&harness.chain, &pool, &policy, still_young, NOW)
        .expect_err("one short");

    harness.mine(1, Vec::new());
    let mature = harness.spend(prevout, 49 * COIN, u32::MAX, 1);
    accept_to_mempool(&harness.chain, &pool, &policy, mature, NOW).expect("mature");
}

#[test]
fn bip68_relative_height_lock() {
    let mut harness = Harness::with_height(101);
    let pool = Mutex::new(Mempool::new());
    let policy = lenient_policy();

    // Confirm a plain spend at height 102; its output is the lock target.
    let funding = harness.spend(
        OutPoint::new(harness.coinbases[1], 0),
        49 * COIN,
        u32::MAX,
        1,
    );
    let funding_height = harness.height + 1;
    harness.mine(1, vec![funding.clone()]);
    assert_eq!(harness.height, funding_height);

    let locked = harness.spend(OutPoint::new(funding.txid(), 0), 48 * COIN, 5, 2);

    // Rejected while tip <= funding_height + 4.
    for _ in 0..4 {
        let rejection =
            accept_to_mempool(&harness.chain, &pool, &policy, locked.clone(), NOW)
                .expect_err("locked");
        assert_eq!(rejection.failure.kind, RejectKind::NonStandard);
        assert_eq!(rejection.failure.reason, "non-BIP68-final");
        harness.mine(1, Vec::new());
    }
    assert_eq!(harness.height, funding_height + 4);
    accept_to_mempool(&harness.chain, &pool, &policy, locked.clone(), NOW)
        .expect_err("still locked");

    // Admitted once the tip reaches funding_height + 5.
    harness.mine(1, Vec::new());
    accept_to_mempool(&harness.chain, &pool, &policy, locked, NOW).expect("unlocked");
}

#[test]
fn missing_inputs_signal_orphan_path() {
    let harness = Harness::with_height(101);
    let pool = Mutex::new(Mempool::new());
    let policy = lenient_policy();

    let phantom = OutPoint::new([0x55u8; 32], 0);
    let orphan = harness.spend(phantom, COIN, u32::MAX, 1);
    let rejection =
        accept_to_mempool(&harness.chain, &pool, &policy, orphan, NOW).expect_err("orphan");
    assert_eq!(rejection.failure.kind, RejectKind::MissingInputs);
    assert_eq!(rejection.missing_parents, vec![[0x55u8; 32]]);
}

#[test]
fn fee_floor_and_free_relay() {
    let harness = Harness::with_height(102);
    let pool = Mutex::new(Mempool::new());
    let mut policy = lenient_policy();

    // Paying the full input value leaves no fee.
    let zero_fee = harness.spend(
        OutPoint::new(harness.coinbases[1], 0),
        50 * COIN,
        u32::MAX,
        1,
    );
    let rejection =
        accept_to_mempool(&harness.chain, &pool, &policy, zero_fee.clone(), NOW)
            .expect_err("free");
    assert_eq!(rejection.failure.kind, RejectKind::InsufficientFee);

    // The free-relay allowance admits it.
    policy.limit_free_relay_kb_per_min = 15;
    accept_to_mempool(&harness.chain, &pool, &policy, zero_fee, NOW).expect("free allowance");

    // Absurd fees are refused only when the caller opts in.
    policy.reject_absurd_fee = true;
    let burn = harness.spend(OutPoint::new(harness.coinbases[2], 0), COIN, u32::MAX, 2);
    let rejection =
        accept_to_mempool(&harness.chain, &pool, &policy, burn.clone(), NOW)
            .expect_err("absurd");
    assert_eq!(rejection.failure.kind, RejectKind::HighFee);
    policy.reject_absurd_fee = false;
    accept_to_mempool(&harness.chain, &pool, &policy, burn, NOW).expect("high fee ok");
}

#[test]
fn ancestor_chain_limit_applies() {
    let harness = Harness::with_height(101);
    let pool = Mutex::new(Mempool::new());
    let mut policy = lenient_policy();
    policy.max_ancestors = 3;

    let mut prevout = OutPoint::new(harness.coinbases[1], 0);
    let mut value = 50 * COIN;
    for tag in 0..3 {
        value -= COIN / 10;
        let tx = harness.spend(prevout, value, u32::MAX, tag);
        prevout = OutPoint::new(tx.txid(), 0);
        accept_to_mempool(&harness.chain, &pool, &policy, tx, NOW).expect("chain member");
    }

    value -= COIN / 10;
    let overflow = harness.spend(prevout, value, u32::MAX, 9);
    let rejection =
        accept_to_mempool(&harness.chain, &pool, &policy, overflow, NOW).expect_err("deep");
    assert_eq!(rejection.failure.kind, RejectKind::NonStandard);
    assert!(rejection.failure.reason.starts_with("too-long-mempool-chain"));
    pool.lock().unwrap().check_consistency().expect("dag");
}

#[test]
fn duplicate_and_already_known_rejections() {
    let harness = Harness::with_height(101);
    let pool = Mutex::new(Mempool::new());
    let policy = lenient_policy();

    let tx = harness.spend(OutPoint::new(harness.coinbases[1], 0), 49 * COIN, u32::MAX, 1);
    accept_to_mempool(&harness.chain, &pool, &policy, tx.clone(), NOW).expect("first");
    let rejection =
        accept_to_mempool(&harness.chain, &pool, &policy, tx, NOW).expect_err("again");
    assert_eq!(rejection.failure.kind, RejectKind::AlreadyKnown);
}

#[test]
fn confirmed_transactions_leave_the_pool() {
    let mut harness = Harness::with_height(101);
    let pool = Mutex::new(Mempool::new());
    let policy = lenient_policy();

    let tx = harness.spend(OutPoint::new(harness.coinbases[1], 0), 49 * COIN, u32::MAX, 1);
    accept_to_mempool(&harness.chain, &pool, &policy, tx.clone(), NOW).expect("admitted");
    assert_eq!(pool.lock().unwrap().len(), 1);

    // Mining it into the chain evicts it; a conflicting pool spend of the
    // same outpoint would leave with it.
    harness.mine(1, vec![tx.clone()]);
    pool.lock().unwrap().remove_for_block(std::slice::from_ref(&tx));
    assert!(pool.lock().unwrap().is_empty());
}

#[test]
fn nonstandard_rejected_only_under_standard_policy() {
    let harness = Harness::with_height(101);
    let pool = Mutex::new(Mempool::new());

    // OP_TRUE outputs are not a standard template.
    let tx = harness.spend(OutPoint::new(harness.coinbases[1], 0), 49 * COIN, u32::MAX, 1);

    let strict = MempoolPolicy::default();
    let rejection =
        accept_to_mempool(&harness.chain, &pool, &strict, tx.clone(), NOW)
            .expect_err("nonstandard");
    assert_eq!(rejection.failure.kind, RejectKind::NonStandard);

    let lenient = lenient_policy();
    accept_to_mempool(&harness.chain, &pool, &lenient, tx, NOW).expect("lenient");
}
