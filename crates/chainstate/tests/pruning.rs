use std::sync::Arc;

use coind_chainstate::blockindex::{STATUS_HAVE_DATA, STATUS_HAVE_UNDO};
use coind_chainstate::events::{NetworkClock, ShutdownFlag};
use coind_chainstate::genesis::genesis_block;
use coind_chainstate::state::{ChainState, ChainStateConfig};
use coind_chainstate::validation::merkle_root;
use coind_consensus::constants::MIN_BLOCKS_TO_KEEP;
use coind_consensus::subsidy::block_subsidy;
use coind_consensus::{chain_params, Hash256, Network};
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

/// Coinbase padded with a data output so blocks are big enough to roll the
/// 64 KiB fast-prune files on a short chain.
fn padded_coinbase(height: i32) -> Transaction {
    let mut data_script = vec![0x6a, 0x4d];
    let payload = vec![0xaa; 2_000];
    data_script.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    data_script.extend_from_slice(&payload);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![
            TxOut {
                value: block_subsidy(height, &chain_params(Network::Regtest).consensus),
                script_pubkey: vec![0x51],
            },
            TxOut {
                value: 0,
                script_pubkey: data_script,
            },
        ],
        lock_time: 0,
    }
}

fn build_block(prev: Hash256, height: i32) -> Block {
    let transactions = vec![padded_coinbase(height)];
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

#[test]
fn manual_prune_respects_keep_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let chain = ChainState::new(
        store as Arc<dyn KeyValueStore>,
        dir.path().join("blocks"),
        chain_params(Network::Regtest),
        ChainStateConfig {
            coins_cache_bytes: 16 * 1024 * 1024,
            fast_prune: true,
            ..ChainStateConfig::default()
        },
        Arc::new(FixedClock(BASE_TIME as i64 + 400_000_000)),
        ShutdownFlag::new(),
    )
    .expect("chain");
    chain.load().expect("load");

    let chain_length = MIN_BLOCKS_TO_KEEP + 40;
    let mut prev = genesis_block(Network::Regtest).hash();
    let mut hashes = Vec::new();
    for height in 1..=chain_length {
        let block = build_block(prev, height);
        prev = block.hash();
        hashes.push(prev);
        chain.process_new_block(&block, true).expect("connect");
    }
    let tip_before = chain.lock().tip().expect("tip");
    assert_eq!(tip_before.height, chain_length);

    // Ask far beyond the keep window: the effective limit is tip - 288.
    let target = chain_length - 10;
    chain.prune_blocks_to_height(target).expect("prune");
    let effective_limit = chain_length - MIN_BLOCKS_TO_KEEP;

    let view = chain.lock();
    assert_eq!(view.tip().expect("tip").hash, tip_before.hash);

    let mut cleared = 0;
    for (offset, hash) in hashes.iter().enumerate() {
        let height = offset as i32 + 1;
        let (_, _, status) = view.header_of(hash).expect("indexed");
        let has_data = status & STATUS_HAVE_DATA != 0;
        let has_undo = status & STATUS_HAVE_UNDO != 0;
        if height > effective_limit {
            // The keep window around the tip must be untouched.
            assert!(has_data, "height {height} lost data inside keep window");
        } else if !has_data {
            assert!(!has_undo, "height {height} kept undo without data");
            cleared += 1;
        }
    }
    assert!(cleared > 0, "no file was prunable below height {effective_limit}");
    drop(view);

    // The surviving tail still replays cleanly.
    assert_eq!(chain.verify_db(5, 3), 0);
}

#[test]
fn pruned_files_are_deleted_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let chain = ChainState::new(
        store as Arc<dyn KeyValueStore>,
        dir.path().join("blocks"),
        chain_params(Network::Regtest),
        ChainStateConfig {
            coins_cache_bytes: 16 * 1024 * 1024,
            fast_prune: true,
            ..ChainStateConfig::default()
        },
        Arc::new(FixedClock(BASE_TIME as i64 + 400_000_000)),
        ShutdownFlag::new(),
    )
    .expect("chain");
    chain.load().expect("load");

    let chain_length = MIN_BLOCKS_TO_KEEP + 60;
    let mut prev = genesis_block(Network::Regtest).hash();
    for height in 1..=chain_length {
        let block = build_block(prev, height);
        prev = block.hash();
        chain.process_new_block(&block, true).expect("connect");
    }

    let first_file = dir.path().join("blocks").join("blk00000.dat");
    assert!(first_file.exists());

    chain
        .prune_blocks_to_height(chain_length)
        .expect("prune");
    assert!(!first_file.exists(), "lowest block file should be deleted");
    assert!(!dir.path().join("blocks").join("rev00000.dat").exists());

    // The chain itself is unaffected.
    assert_eq!(chain.lock().tip().expect("tip").height, chain_length);
}
