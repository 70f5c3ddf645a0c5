use std::sync::Arc;

use coind_chainstate::blockindex::STATUS_FAILED_VALID;
use coind_chainstate::events::{NetworkClock, ShutdownFlag};
use coind_chainstate::genesis::genesis_block;
use coind_chainstate::state::{ChainState, ChainStateConfig};
use coind_chainstate::validation::merkle_root;
use coind_consensus::money::COIN;
use coind_consensus::subsidy::block_subsidy;
use coind_consensus::{chain_params, Hash256, Network};
use coind_pow::check_proof_of_work;
use coind_primitives::block::{Block, BlockHeader};
use coind_primitives::hash::hash160;
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::{Transaction, TxIn, TxOut};
use coind_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use coind_storage::memory::MemoryStore;
use coind_storage::{Column, KeyValueStore};

/// Fixed "now" so header timestamps are never in the future.
struct FixedClock(i64);

impl NetworkClock for FixedClock {
    fn adjusted_time(&self) -> i64 {
        self.0
    }
}

const BASE_TIME: u32 = 1_296_688_602;

fn setup() -> (tempfile::TempDir, Arc<MemoryStore>, Arc<ChainState>) {
    setup_with(ChainStateConfig {
        coins_cache_bytes: 8 * 1024 * 1024,
        ..ChainStateConfig::default()
    })
}

fn setup_with(config: ChainStateConfig) -> (tempfile::TempDir, Arc<MemoryStore>, Arc<ChainState>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let chain = ChainState::new(
        Arc::clone(&store) as Arc<dyn KeyValueStore>,
        dir.path().join("blocks"),
        chain_params(Network::Regtest),
        config,
        Arc::new(FixedClock(BASE_TIME as i64 + 100_000_000)),
        ShutdownFlag::new(),
    )
    .expect("chain state");
    let chain = Arc::new(chain);
    chain.load().expect("load");
    (dir, store, chain)
}

fn coinbase(height: i32, extra_tag: u8) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(extra_tag);
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: block_subsidy(height, &chain_params(Network::Regtest).consensus),
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn build_block(prev: Hash256, height: i32, extra_tag: u8, mut txs: Vec<Transaction>) -> Block {
    let mut transactions = vec![coinbase(height, extra_tag)];
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

/// Extends the chain with `count` empty blocks, returning each block.
fn mine(chain: &ChainState, from: Hash256, start_height: i32, count: i32, tag: u8) -> Vec<Block> {
    let mut out = Vec::new();
    let mut prev = from;
    for offset in 0..count {
        let block = build_block(prev, start_height + offset, tag, Vec::new());
        prev = block.hash();
        chain.process_new_block(&block, true).expect("connect");
        out.push(block);
    }
    out
}

fn utxo_entries(store: &MemoryStore) -> usize {
    store.entry_count(Column::Utxo)
}

#[test]
fn linear_apply_three_blocks() {
    let (_dir, store, chain) = setup();
    let genesis = genesis_block(Network::Regtest);
    let blocks = mine(&chain, genesis.hash(), 1, 3, 0);

    let mut view = chain.lock();
    let tip = view.tip().expect("tip");
    assert_eq!(tip.height, 3);
    assert_eq!(tip.hash, blocks[2].hash());

    for (i, block) in blocks.iter().enumerate() {
        let outpoint = OutPoint::new(block.transactions[0].txid(), 0);
        let coin = view.coin(&outpoint).expect("view").expect("coinbase coin");
        assert!(coin.is_coinbase);
        assert_eq!(coin.height, i as i32 + 1);
        assert_eq!(coin.value(), 50 * COIN);
    }
    drop(view);

    // Exactly the three coinbases; the genesis coinbase never enters the set.
    chain.flush().expect("flush");
    assert_eq!(utxo_entries(&store), 3);
}

#[test]
fn reorg_to_heavier_fork() {
    let (_dir, _store, chain) = setup();
    let genesis = genesis_block(Network::Regtest);
    let main = mine(&chain, genesis.hash(), 1, 3, 0);
    let work_before = chain.lock().tip().expect("tip").chain_work;

    // A competing fork from b1 with one more block of work.
    let fork = mine(&chain, main[0].hash(), 2, 3, 0xaa);

    let mut view = chain.lock();
    let tip = view.tip().expect("tip");
    assert_eq!(tip.height, 4);
    assert_eq!(tip.hash, fork[2].hash());
    assert!(tip.chain_work > work_before);

    // Old branch coinbases are gone; fork coinbases are spendable.
    for block in &main[1..] {
        let outpoint = OutPoint::new(block.transactions[0].txid(), 0);
        assert!(!view.have_coin(&outpoint).expect("view"));
    }
    for block in &fork {
        let outpoint = OutPoint::new(block.transactions[0].txid(), 0);
        assert!(view.have_coin(&outpoint).expect("view"));
    }
    // The shared ancestor b1 still has its coinbase.
    let shared = OutPoint::new(main[0].transactions[0].txid(), 0);
    assert!(view.have_coin(&shared).expect("view"));
}

#[test]
fn equal_work_tip_stays_until_precious() {
    let (_dir, _store, chain) = setup();
    let genesis = genesis_block(Network::Regtest);
    let first = mine(&chain, genesis.hash(), 1, 2, 0);

    // Same height, same work, seen later: must lose the tie-break.
    let rival = build_block(first[0].hash(), 2, 0xbb, Vec::new());
    chain.process_new_block(&rival, true).expect("accept rival");
    assert_eq!(chain.lock().tip().expect("tip").hash, first[1].hash());

    // Operator preference overrides the arrival order.
    chain.precious_block(&rival.hash()).expect("precious");
    assert_eq!(chain.lock().tip().expect("tip").hash, rival.hash());
}

#[test]
fn utxo_round_trip_through_disconnect() {
    let (_dir, store, chain) = setup();
    let genesis = genesis_block(Network::Regtest);
    let blocks = mine(&chain, genesis.hash(), 1, 3, 0);
    chain.flush().expect("flush");
    let before: Vec<(Vec<u8>, Vec<u8>)> =
        store.scan_prefix(Column::Utxo, &[]).expect("scan");

    // Force the whole branch off, then re-admit it.
    chain.invalidate_block(&blocks[0].hash()).expect("invalidate");
    assert_eq!(chain.lock().tip().expect("tip").height, 0);
    chain.flush().expect("flush");
    assert_eq!(utxo_entries(&store), 0);

    chain.reconsider_block(&blocks[0].hash()).expect("reconsider");
    assert_eq!(chain.lock().tip().expect("tip").hash, blocks[2].hash());
    chain.flush().expect("flush");
    let after: Vec<(Vec<u8>, Vec<u8>)> =
        store.scan_prefix(Column::Utxo, &[]).expect("scan");
    assert_eq!(before, after);
}

#[test]
fn candidate_set_matches_work_rule() {
    let (_dir, _store, chain) = setup();
    let genesis = genesis_block(Network::Regtest);
    let main = mine(&chain, genesis.hash(), 1, 3, 0);
    // A stale one-block fork off genesis: strictly less work than the tip,
    // so it must not be a candidate.
    let stale = build_block(genesis.hash(), 1, 0xcc, Vec::new());
    chain.process_new_block(&stale, true).expect("accept stale");

    let view = chain.lock();
    let candidates = view.candidate_tips();
    assert_eq!(candidates.first(), Some(&main[2].hash()));
    assert!(!candidates.contains(&stale.hash()));
}

#[test]
fn out_of_order_bodies_connect_through_unlinked_map() {
    let (_dir, _store, chain) = setup();
    let genesis = genesis_block(Network::Regtest);
    let b1 = build_block(genesis.hash(), 1, 0, Vec::new());
    let b2 = build_block(b1.hash(), 2, 0, Vec::new());

    // The child body arrives first; only the parent header is known.
    chain.accept_header(&b1.header).expect("header b1");
    chain.process_new_block(&b2, true).expect("accept b2");
    assert_eq!(chain.lock().tip().expect("tip").height, 0);

    // The parent body arrives and both connect.
    chain.process_new_block(&b1, true).expect("accept b1");
    let tip = chain.lock().tip().expect("tip");
    assert_eq!(tip.height, 2);
    assert_eq!(tip.hash, b2.hash());
}

#[test]
fn state_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let params = chain_params(Network::Regtest);
    let clock = Arc::new(FixedClock(BASE_TIME as i64 + 100_000_000));
    let config = ChainStateConfig {
        coins_cache_bytes: 8 * 1024 * 1024,
        ..ChainStateConfig::default()
    };

    let tip_hash;
    let coin_outpoint;
    {
        let chain = ChainState::new(
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            dir.path().join("blocks"),
            params.clone(),
            config.clone(),
            clock.clone(),
            ShutdownFlag::new(),
        )
        .expect("chain");
        chain.load().expect("load");
        let genesis = genesis_block(Network::Regtest);
        let blocks = mine(&chain, genesis.hash(), 1, 5, 0);
        tip_hash = blocks[4].hash();
        coin_outpoint = OutPoint::new(blocks[1].transactions[0].txid(), 0);
        chain.flush().expect("flush");
    }

    let chain = ChainState::new(
        store as Arc<dyn KeyValueStore>,
        dir.path().join("blocks"),
        params,
        config,
        clock,
        ShutdownFlag::new(),
    )
    .expect("chain");
    chain.load().expect("load");
    let mut view = chain.lock();
    assert_eq!(view.tip().expect("tip").hash, tip_hash);
    assert_eq!(view.tip().expect("tip").height, 5);
    assert!(view.have_coin(&coin_outpoint).expect("view"));
}

#[test]
fn verify_db_levels_and_corruption() {
    let (dir, _store, chain) = setup();
    let genesis = genesis_block(Network::Regtest);
    mine(&chain, genesis.hash(), 1, 8, 0);

    assert_eq!(chain.verify_db(8, 4), 0);
    assert_eq!(chain.verify_db(8, 1), 0);

    // Flip one byte of undo payload: checksum fails, I/O-level error.
    let undo_path = dir.path().join("blocks").join("rev00000.dat");
    let mut raw = std::fs::read(&undo_path).expect("undo file");
    raw[9] ^= 0xff;
    std::fs::write(&undo_path, raw).expect("rewrite");
    assert_eq!(chain.verify_db(8, 2), 2);
    assert_eq!(chain.verify_db(8, 1), 0);
}

fn p2pkh_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&hash160(pubkey));
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

#[test]
fn signature_checks_run_through_worker_pool() {
    let (_dir, _store, chain) = setup_with(ChainStateConfig {
        coins_cache_bytes: 8 * 1024 * 1024,
        script_threads: 2,
        ..ChainStateConfig::default()
    });
    let secp = secp256k1::Secp256k1::new();
    let secret = secp256k1::SecretKey::from_slice(&[0x11u8; 32]).expect("key");
    let pubkey = secp256k1::PublicKey::from_secret_key(&secp, &secret);
    let pubkey_bytes = pubkey.serialize().to_vec();

    // Block 1 pays the key; then 100 more so the coinbase matures.
    let genesis = genesis_block(Network::Regtest);
    let mut funding_cb = coinbase(1, 0);
    funding_cb.vout[0].script_pubkey = p2pkh_script(&pubkey_bytes);
    let funding = {
        let txids = vec![funding_cb.txid()];
        let (root, _) = merkle_root(&txids);
        let params = chain_params(Network::Regtest).consensus;
        let mut header = BlockHeader {
            version: 1,
            prev_block: genesis.hash(),
            merkle_root: root,
            time: BASE_TIME + 600,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        while check_proof_of_work(&header, &params).is_err() {
            header.nonce += 1;
        }
        Block {
            header,
            transactions: vec![funding_cb.clone()],
        }
    };
    chain.process_new_block(&funding, true).expect("funding");
    let matured = mine(&chain, funding.hash(), 2, 100, 0);

    // A valid signed spend connects.
    let prevout = OutPoint::new(funding_cb.txid(), 0);
    let mut spend = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 49 * COIN,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let script_code = p2pkh_script(&pubkey_bytes);
    let hash = signature_hash(&spend, 0, &script_code, SighashType(SIGHASH_ALL)).expect("hash");
    let message = secp256k1::Message::from_digest(hash);
    let mut der = secp.sign_ecdsa(&message, &secret).serialize_der().to_vec();
    der.push(SIGHASH_ALL as u8);
    let mut script_sig = vec![der.len() as u8];
    script_sig.extend_from_slice(&der);
    script_sig.push(pubkey_bytes.len() as u8);
    script_sig.extend_from_slice(&pubkey_bytes);
    spend.vin[0].script_sig = script_sig;

    let good = build_block(matured[99].hash(), 102, 0, vec![spend.clone()]);
    chain.process_new_block(&good, true).expect("signed spend");
    assert_eq!(chain.lock().tip().expect("tip").height, 102);

    // A spend of the same output with a stale signature fails the batch;
    // the block is marked failed and the tip does not move. A second block
    // cannot double-spend the output the good block consumed, so fork off
    // the previous tip.
    let mut bad_spend = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: spend.vin[0].script_sig.clone(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 48 * COIN,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    bad_spend.vin[0].script_sig[2] ^= 0x01;
    let bad = build_block(matured[99].hash(), 102, 7, vec![bad_spend]);
    chain.process_new_block(&bad, true).expect("accepted body");
    // Equal work, later arrival: force it to be the preferred tip so the
    // connect actually runs and fails.
    chain.precious_block(&bad.hash()).expect("precious");

    let view = chain.lock();
    assert_eq!(view.tip().expect("tip").hash, good.hash());
    let (_, _, status) = view.header_of(&bad.hash()).expect("indexed");
    assert_ne!(status & STATUS_FAILED_VALID, 0);
}

#[test]
fn immature_coinbase_spend_rejected_in_block() {
    let (_dir, _store, chain) = setup();
    let genesis = genesis_block(Network::Regtest);
    let blocks = mine(&chain, genesis.hash(), 1, 3, 0);

    let premature = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new(blocks[2].transactions[0].txid(), 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let bad = build_block(blocks[2].hash(), 4, 0, vec![premature]);
    chain.process_new_block(&bad, true).expect("accepted body");

    let view = chain.lock();
    assert_eq!(view.tip().expect("tip").height, 3);
    let (_, _, status) = view.header_of(&bad.hash()).expect("indexed");
    assert_ne!(status & STATUS_FAILED_VALID, 0);
}
