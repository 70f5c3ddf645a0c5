//! Node bootstrap: configuration, storage, chain-state reconstruction, and
//! the startup verification pass.

mod config;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use coind_chainstate::events::{ChainNotifier, ShutdownFlag, SystemClock};
use coind_chainstate::state::{ChainState, ChainStateConfig};
use coind_chainstate::validation::{evaluate_sequence_locks, is_final_tx};
use coind_consensus::{chain_params, Hash256, Network};
use coind_log::{log_error, log_info, log_warn};
use coind_mempool::policy::MempoolPolicy;
use coind_mempool::{accept_to_mempool, Mempool};
use coind_primitives::block::Block;
use coind_primitives::hash256_to_hex;
use coind_storage::KeyValueStore;

use crate::config::Config;

fn main() {
    let config = match config::parse_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };
    std::process::exit(run(config));
}

fn run(config: Config) -> i32 {
    coind_log::init(coind_log::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: true,
    });

    let params = chain_params(config.network);
    let data_dir = config
        .data_dir
        .clone()
        .unwrap_or_else(|| default_data_dir(config.network));
    let blocks_dir = data_dir.join("blocks");
    let db_dir = data_dir.join("chainstate");

    if config.reindex {
        // A reindex rebuilds the database from the block files, so the old
        // database must go first.
        if db_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&db_dir) {
                log_error!("failed to clear database for reindex: {err}");
                return 1;
            }
        }
        log_info!("reindexing from block files in {}", blocks_dir.display());
    }

    let store: Arc<dyn KeyValueStore> = match open_store(&db_dir, &config) {
        Ok(store) => store,
        Err(message) => {
            log_error!("cannot open database: {message}");
            return 1;
        }
    };

    let assume_valid = match config.assume_valid {
        Some(hash) if hash == [0u8; 32] => None,
        Some(hash) => Some(hash),
        None => params.assume_valid,
    };
    let chain_config = ChainStateConfig {
        coins_cache_bytes: (config.dbcache_mb as usize) * 1024 * 1024,
        script_threads: config.par,
        prune_target_bytes: config.prune_mb * 1024 * 1024,
        assume_valid,
        checkpoints_enabled: config.checkpoints,
        tx_index: config.tx_index,
        fast_prune: false,
    };

    let shutdown = ShutdownFlag::new();
    let chain = match ChainState::new(
        store,
        &blocks_dir,
        params,
        chain_config,
        Arc::new(SystemClock),
        shutdown.clone(),
    ) {
        Ok(chain) => Arc::new(chain),
        Err(err) => {
            log_error!("cannot initialize chain state: {err}");
            return 1;
        }
    };

    let pool = Arc::new(Mutex::new(Mempool::new()));
    let policy = MempoolPolicy {
        min_relay_fee_per_kb: config.min_relay_tx_fee,
        limit_free_relay_kb_per_min: config.limit_free_relay_kb,
        max_ancestors: config.limit_ancestor_count,
        max_ancestor_size: config.limit_ancestor_size_kb * 1_000,
        max_descendants: config.limit_descendant_count,
        max_descendant_size: config.limit_descendant_size_kb * 1_000,
        max_bytes: (config.maxmempool_mb as usize) * 1024 * 1024,
        expiry_secs: config.mempool_expiry_hours * 60 * 60,
        ..MempoolPolicy::default()
    };
    let sync = Arc::new(MempoolSync {
        pool: Arc::clone(&pool),
        chain: Mutex::new(Weak::new()),
        policy: policy.clone(),
    });
    chain.register_notifier(Arc::clone(&sync) as Arc<dyn ChainNotifier>);
    *sync.chain.lock().expect("sync lock") = Arc::downgrade(&chain);

    log_info!(
        "starting validation core on {:?}, data dir {}",
        config.network,
        data_dir.display()
    );
    log_info!(
        "mempool limits: {} MiB, {}h expiry, {}/{} kB ancestor packages",
        config.maxmempool_mb,
        config.mempool_expiry_hours,
        policy.max_ancestors,
        policy.max_ancestor_size / 1_000
    );
    if let Err(err) = chain.load() {
        log_error!("failed to load chain state: {err}");
        return 1;
    }

    {
        let view = chain.lock();
        match view.tip() {
            Some(tip) => log_info!(
                "active chain height {} tip {}",
                tip.height,
                hash256_to_hex(&tip.hash)
            ),
            None => log_warn!("no active chain after load"),
        }
    }

    let verify_result = chain.verify_db(config.check_blocks, config.check_level);
    match verify_result {
        0 => log_info!(
            "verified {} recent block(s) at level {}",
            config.check_blocks,
            config.check_level
        ),
        1 => log_error!("block verification found an inconsistency"),
        _ => log_error!("block verification hit an I/O error"),
    }
    if verify_result != 0 {
        return verify_result;
    }

    if let Err(err) = chain.flush() {
        log_error!("final flush failed: {err}");
        return 1;
    }
    0
}

/// Keeps the mempool coherent with tip changes: confirmed and conflicting
/// transactions leave on connect; a disconnect feeds the block's
/// transactions back through admission and drops entries the new tip no
/// longer allows.
struct MempoolSync {
    pool: Arc<Mutex<Mempool>>,
    chain: Mutex<Weak<ChainState>>,
    policy: MempoolPolicy,
}

impl ChainNotifier for MempoolSync {
    fn block_connected(&self, block: &Block, _hash: &Hash256, _height: i32) {
        let mut pool = self.pool.lock().expect("mempool lock");
        pool.remove_for_block(&block.transactions);
    }

    fn block_disconnected(&self, block: &Block, _hash: &Hash256) {
        let Some(chain) = self.chain.lock().expect("sync lock").upgrade() else {
            return;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);

        for tx in block.transactions.iter().skip(1) {
            // Entries the new tip rejects are simply dropped.
            let _ = accept_to_mempool(&chain, &self.pool, &self.policy, tx.clone(), now);
        }

        // A reorg can strand entries whose inputs or lock points came from
        // the abandoned branch.
        let view = chain.lock();
        let mut pool = self.pool.lock().expect("mempool lock");
        if let Some(tip) = view.tip() {
            let next_height = tip.height + 1;
            let mtp = tip.median_time_past;
            pool.remove_for_reorg(|entry| {
                is_final_tx(&entry.tx, next_height, mtp)
                    && evaluate_sequence_locks(next_height, mtp, &entry.lock_points)
                    && entry.lock_points.max_input_height <= tip.height
            });
        }
    }
}

fn open_store(db_dir: &PathBuf, config: &Config) -> Result<Arc<dyn KeyValueStore>, String> {
    #[cfg(feature = "fjall")]
    {
        let options = coind_storage::fjall::FjallOptions {
            cache_bytes: Some(config.dbcache_mb * 1024 * 1024 / 4),
            ..Default::default()
        };
        let store = coind_storage::fjall::FjallStore::open_with_options(db_dir, options)
            .map_err(|err| err.to_string())?;
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "fjall"))]
    {
        let _ = (db_dir, config);
        Ok(Arc::new(coind_storage::memory::MemoryStore::new()))
    }
}

fn default_data_dir(network: Network) -> PathBuf {
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".coind");
    match network {
        Network::Mainnet => base,
        Network::Testnet => base.join("testnet"),
        Network::Regtest => base.join("regtest"),
    }
}
