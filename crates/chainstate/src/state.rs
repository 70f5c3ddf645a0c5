//! The chain state proper: header/block acceptance, block connection and
//! disconnection against the UTXO view, best-chain activation, flushing,
//! pruning, and startup reconstruction.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use coind_consensus::block_subsidy;
use coind_consensus::constants::{
    COINBASE_MATURITY, DEFAULT_MAX_TIP_AGE, MAX_FUTURE_BLOCK_TIME, MIN_BLOCKS_TO_KEEP,
};
use coind_consensus::params::ChainParams;
use coind_consensus::Hash256;
use coind_pow::difficulty::{block_proof, next_work_required};
use coind_pow::{check_proof_of_work, PowError};
use coind_primitives::block::{Block, BlockHeader};
use coind_primitives::encoding::{decode, encode, Encodable, Encoder};
use coind_primitives::hash256_to_hex;
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::Transaction;
use coind_script::{
    verify_script, PrecomputedTransactionData, ScriptError, ScriptFlags,
    TransactionSignatureChecker,
};
use coind_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::blockindex::{
    BlockIndex, BlockIndexArena, CandidateKey, Chain, DiskBlockIndex, Validity, STATUS_FAILED_CHILD,
    STATUS_FAILED_VALID, STATUS_HAVE_DATA, STATUS_HAVE_UNDO,
};
use crate::checkqueue::{CheckQueue, QueueCheck};
use crate::coins::{Coin, CoinsCache, CoinsError, CoinsStore, CoinsView, CoinsViewBacked};
use crate::events::{ChainNotifier, NetworkClock, ShutdownFlag};
use crate::filemeta::{file_info_key, parse_file_info_key, BlockFileInfo, META_LAST_BLOCK_FILE_KEY};
use crate::flatfiles::{BlockFileError, BlockFileManager, FileLocation};
use crate::genesis::genesis_block;
use crate::undo::{BlockUndo, SpentCoin};
use crate::validation::{
    block_locktime_flags, block_script_flags, calculate_sequence_locks, check_block,
    evaluate_sequence_locks, is_final_tx, max_block_sigops, RejectKind, ValidationFailure,
    REJECT_CHECKPOINT, REJECT_DUPLICATE, REJECT_INVALID, REJECT_OBSOLETE,
};

/// Blocks connected per activation step before the lock is released.
const MAX_CONNECT_BATCH: usize = 32;

/// Full flush interval for the periodic timer.
const PERIODIC_FLUSH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Cache occupancy fraction (percent) that forces a flush.
const CACHE_FLUSH_WATERMARK_PCT: usize = 90;

/// Window, in block-proof-equivalent seconds, within which the assumed-valid
/// optimization may skip signature checks. Policy, not consensus.
const ASSUME_VALID_WINDOW_SECS: i64 = 14 * 24 * 60 * 60;

/// How many sibling outpoints to probe when reconstructing metadata for a
/// legacy undo record.
const METADATA_PROBE_LIMIT: u32 = 1_000;

const META_TXINDEX_FLAG_KEY: &[u8] = b"flags:txindex";
const META_PRUNE_FLAG_KEY: &[u8] = b"flags:prune";

#[derive(Debug)]
pub enum ChainstateError {
    Store(StoreError),
    Coins(CoinsError),
    Files(BlockFileError),
    Corrupt(&'static str),
}

impl std::fmt::Display for ChainstateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainstateError::Store(err) => write!(f, "{err}"),
            ChainstateError::Coins(err) => write!(f, "{err}"),
            ChainstateError::Files(err) => write!(f, "{err}"),
            ChainstateError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainstateError {}

impl From<StoreError> for ChainstateError {
    fn from(err: StoreError) -> Self {
        ChainstateError::Store(err)
    }
}

impl From<CoinsError> for ChainstateError {
    fn from(err: CoinsError) -> Self {
        ChainstateError::Coins(err)
    }
}

impl From<BlockFileError> for ChainstateError {
    fn from(err: BlockFileError) -> Self {
        ChainstateError::Files(err)
    }
}

/// Failure of a block/header/chain operation: either a validation verdict on
/// the object, or a local fault that must abort the node before the state
/// diverges.
#[derive(Debug)]
pub enum ProcessError {
    Invalid(ValidationFailure),
    Fatal(ChainstateError),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Invalid(failure) => write!(f, "{failure}"),
            ProcessError::Fatal(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<ValidationFailure> for ProcessError {
    fn from(failure: ValidationFailure) -> Self {
        ProcessError::Invalid(failure)
    }
}

impl From<ChainstateError> for ProcessError {
    fn from(err: ChainstateError) -> Self {
        ProcessError::Fatal(err)
    }
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        ProcessError::Fatal(err.into())
    }
}

impl From<CoinsError> for ProcessError {
    fn from(err: CoinsError) -> Self {
        ProcessError::Fatal(err.into())
    }
}

impl From<BlockFileError> for ProcessError {
    fn from(err: BlockFileError) -> Self {
        ProcessError::Fatal(err.into())
    }
}

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    /// UTXO cache soft budget in bytes.
    pub coins_cache_bytes: usize,
    /// Script verification worker threads; zero runs checks inline.
    pub script_threads: usize,
    /// Target size of block files on disk; zero disables pruning.
    pub prune_target_bytes: u64,
    /// Ancestors of this block may skip signature verification.
    pub assume_valid: Option<Hash256>,
    pub checkpoints_enabled: bool,
    /// Maintain the txid → disk location index.
    pub tx_index: bool,
    /// Debug knob: roll block files at 64 KiB so pruning is exercisable on
    /// short chains.
    pub fast_prune: bool,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            coins_cache_bytes: 450 * 1024 * 1024,
            script_threads: 0,
            prune_target_bytes: 0,
            assume_valid: None,
            checkpoints_enabled: true,
            tx_index: false,
            fast_prune: false,
        }
    }
}

/// A queued per-input script check; runs on the worker pool.
struct ScriptCheck {
    script_pubkey: Vec<u8>,
    amount: i64,
    tx: Arc<Transaction>,
    input_index: usize,
    flags: ScriptFlags,
    precomputed: Arc<PrecomputedTransactionData>,
}

#[derive(Debug)]
struct ScriptCheckFailure {
    txid: Hash256,
    input_index: usize,
    error: ScriptError,
}

impl QueueCheck for ScriptCheck {
    type Error = ScriptCheckFailure;

    fn execute(self) -> Result<(), Self::Error> {
        let checker = TransactionSignatureChecker {
            tx: &self.tx,
            input_index: self.input_index,
            amount: self.amount,
            precomputed: Some(&self.precomputed),
        };
        let script_sig = &self.tx.vin[self.input_index].script_sig;
        verify_script(script_sig, &self.script_pubkey, self.flags, &checker).map_err(|error| {
            ScriptCheckFailure {
                txid: self.tx.txid(),
                input_index: self.input_index,
                error,
            }
        })
    }
}

/// Outcome of reverting one block from the view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectResult {
    Clean,
    /// Recovered, but the view had drifted (overwritten or legacy records);
    /// a second disconnect would not reproduce it.
    Unclean,
    Failed,
}

#[derive(Clone, Copy, Debug)]
pub enum FlushMode {
    /// Flush only if the cache is over budget.
    IfNeeded,
    /// Flush if the periodic interval elapsed.
    Periodic,
    Always,
}

#[derive(Clone, Debug)]
pub struct TipStatus {
    pub index: usize,
    pub hash: Hash256,
    pub height: i32,
    pub time: u32,
    pub median_time_past: i64,
    pub chain_work: U256,
}

enum ChainEvent {
    Connected(Arc<Block>, Hash256, i32),
    Disconnected(Arc<Block>, Hash256),
    HeaderTip(i32, Hash256, bool),
    BlockStored(Hash256, i32),
}

struct ChainData {
    arena: BlockIndexArena,
    chain: Chain,
    coins: CoinsCache<CoinsStore<dyn KeyValueStore>>,
    /// Every validated, fully-linked tip at least as good as the active one.
    candidates: BTreeSet<CandidateKey>,
    /// Blocks whose bodies arrived before their parent chain completed,
    /// keyed by parent arena index.
    unlinked: HashMap<usize, Vec<usize>>,
    best_header: Option<usize>,
    best_invalid: Option<usize>,
    next_sequence_id: i32,
    reverse_sequence_id: i32,
    last_precious_work: U256,
    dirty_indexes: HashSet<usize>,
    last_flush: Instant,
}

pub struct ChainState {
    store: Arc<dyn KeyValueStore>,
    files: BlockFileManager,
    params: ChainParams,
    config: ChainStateConfig,
    queue: CheckQueue<ScriptCheck>,
    clock: Arc<dyn NetworkClock>,
    shutdown: ShutdownFlag,
    notifiers: Mutex<Vec<Arc<dyn ChainNotifier>>>,
    data: Mutex<ChainData>,
}

impl ChainState {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        blocks_dir: impl AsRef<Path>,
        params: ChainParams,
        config: ChainStateConfig,
        clock: Arc<dyn NetworkClock>,
        shutdown: ShutdownFlag,
    ) -> Result<Self, ChainstateError> {
        let max_file_size = if config.fast_prune {
            64 * 1024
        } else {
            crate::flatfiles::MAX_BLOCKFILE_SIZE
        };
        let files =
            BlockFileManager::with_max_file_size(blocks_dir.as_ref(), params.magic, max_file_size)?;
        let coins = CoinsCache::new(CoinsStore::new(Arc::clone(&store))?);
        let queue = CheckQueue::new(config.script_threads);
        Ok(Self {
            store,
            files,
            params,
            config,
            queue,
            clock,
            shutdown,
            notifiers: Mutex::new(Vec::new()),
            data: Mutex::new(ChainData {
                arena: BlockIndexArena::new(),
                chain: Chain::new(),
                coins,
                candidates: BTreeSet::new(),
                unlinked: HashMap::new(),
                best_header: None,
                best_invalid: None,
                next_sequence_id: 1,
                reverse_sequence_id: -1,
                last_precious_work: U256::zero(),
                dirty_indexes: HashSet::new(),
                last_flush: Instant::now(),
            }),
        })
    }

    pub fn register_notifier(&self, notifier: Arc<dyn ChainNotifier>) {
        self.notifiers.lock().expect("notifier lock").push(notifier);
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Acquires the validation lock for a batch of reads.
    pub fn lock(&self) -> ChainLock<'_> {
        ChainLock {
            state: self,
            data: self.data.lock().expect("validation lock"),
        }
    }

    fn emit(&self, events: Vec<ChainEvent>) {
        if events.is_empty() {
            return;
        }
        let notifiers = self.notifiers.lock().expect("notifier lock").clone();
        for event in events {
            for notifier in &notifiers {
                match &event {
                    ChainEvent::Connected(block, hash, height) => {
                        notifier.block_connected(block, hash, *height)
                    }
                    ChainEvent::Disconnected(block, hash) => {
                        notifier.block_disconnected(block, hash)
                    }
                    ChainEvent::HeaderTip(height, hash, ibd) => {
                        notifier.header_tip(*height, hash, *ibd)
                    }
                    ChainEvent::BlockStored(hash, height) => {
                        notifier.block_stored(hash, *height)
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------- load

    /// Reconstructs in-memory state from the persistent store, creating and
    /// activating the genesis block on first run, then rewinds any tip whose
    /// validation level falls short of the current requirement.
    pub fn load(&self) -> Result<(), ProcessError> {
        {
            let mut data = self.data.lock().expect("validation lock");
            self.load_block_index(&mut data)?;
            self.load_file_info()?;
            self.resolve_active_chain(&mut data)?;
        }

        let first_run = {
            let data = self.data.lock().expect("validation lock");
            data.arena.is_empty()
        };
        if first_run {
            let genesis = genesis_block(self.params.network);
            self.process_new_block(&genesis, true)?;
        }

        self.persist_flags()?;
        self.rewind()?;
        // Heal a crash between body persistence and activation.
        self.activate_best_chain()?;
        Ok(())
    }

    fn load_block_index(&self, data: &mut ChainData) -> Result<(), ProcessError> {
        let entries = self.store.scan_prefix(Column::BlockIndex, &[])?;
        for (key, value) in entries {
            let hash: Hash256 = key
                .as_slice()
                .try_into()
                .map_err(|_| ChainstateError::Corrupt("bad block index key"))?;
            let disk = DiskBlockIndex::decode(&value)
                .map_err(|_| ChainstateError::Corrupt("bad block index entry"))?;
            if disk.header.hash() != hash {
                return Err(ChainstateError::Corrupt("block index hash mismatch").into());
            }
            data.arena.insert_loaded(BlockIndex {
                hash,
                header: disk.header,
                prev: None,
                skip: None,
                height: disk.height,
                chain_work: U256::zero(),
                status: disk.status,
                tx_count: disk.tx_count,
                chain_tx_count: 0,
                file: disk.file,
                undo: disk.undo,
                sequence_id: 0,
                time_max: 0,
            });
        }
        data.arena.link_loaded();

        // Derive work, max time and chain-tx totals parent-first.
        let mut order: Vec<usize> = (0..data.arena.len()).collect();
        order.sort_by_key(|&idx| data.arena.get(idx).height);
        for idx in order {
            let (prev_work, prev_time_max, prev_chain_tx) = match data.arena.get(idx).prev {
                Some(prev) => {
                    let parent = data.arena.get(prev);
                    (parent.chain_work, parent.time_max, parent.chain_tx_count)
                }
                None => (U256::zero(), 0, 0),
            };
            let entry = data.arena.get_mut(idx);
            entry.chain_work = prev_work + block_proof(entry.header.bits);
            entry.time_max = prev_time_max.max(entry.header.time);
            let parent_linked = entry.prev.is_none() || prev_chain_tx != 0;
            if entry.tx_count > 0 && parent_linked {
                entry.chain_tx_count = prev_chain_tx + entry.tx_count as u64;
            } else {
                entry.chain_tx_count = 0;
                if entry.tx_count > 0 {
                    if let Some(prev) = entry.prev {
                        data.unlinked.entry(prev).or_default().push(idx);
                    }
                }
            }
            let entry = data.arena.get(idx);
            if data
                .best_header
                .map(|best| entry.chain_work > data.arena.get(best).chain_work)
                .unwrap_or(true)
                && !entry.is_failed()
            {
                data.best_header = Some(idx);
            }
            if entry.is_failed()
                && data
                    .best_invalid
                    .map(|best| entry.chain_work > data.arena.get(best).chain_work)
                    .unwrap_or(true)
            {
                data.best_invalid = Some(idx);
            }
        }
        Ok(())
    }

    fn load_file_info(&self) -> Result<(), ProcessError> {
        let entries = self.store.scan_prefix(Column::FileInfo, &[])?;
        let mut infos: Vec<(u32, BlockFileInfo)> = Vec::new();
        for (key, value) in entries {
            let Some(file_id) = parse_file_info_key(&key) else {
                continue;
            };
            let info = BlockFileInfo::decode(&value)
                .map_err(|_| ChainstateError::Corrupt("bad file info entry"))?;
            infos.push((file_id, info));
        }
        if infos.is_empty() {
            return Ok(());
        }
        let max_id = infos.iter().map(|(id, _)| *id).max().unwrap_or(0);
        let mut dense = vec![BlockFileInfo::default(); (max_id + 1) as usize];
        for (id, info) in infos {
            dense[id as usize] = info;
        }
        let last_file = match self.store.get(Column::Meta, META_LAST_BLOCK_FILE_KEY)? {
            Some(bytes) if bytes.len() == 4 => {
                u32::from_le_bytes(bytes.try_into().expect("4-byte last file"))
            }
            _ => max_id,
        };
        self.files.load(dense, last_file);
        Ok(())
    }

    fn resolve_active_chain(&self, data: &mut ChainData) -> Result<(), ProcessError> {
        let Some(best_hash) = data.coins.best_block()? else {
            return Ok(());
        };
        let tip = data
            .arena
            .lookup(&best_hash)
            .ok_or(ChainstateError::Corrupt("utxo best block not in index"))?;
        data.chain.set_tip(&data.arena, Some(tip));
        self.rebuild_candidates(data);
        Ok(())
    }

    fn rebuild_candidates(&self, data: &mut ChainData) {
        data.candidates.clear();
        let tip_work = data
            .chain
            .tip()
            .map(|tip| data.arena.get(tip).chain_work)
            .unwrap_or_default();
        for (idx, entry) in data.arena.iter() {
            if entry.is_valid_at_least(Validity::Transactions)
                && entry.chain_tx_count != 0
                && entry.chain_work >= tip_work
            {
                data.candidates.insert(CandidateKey::for_block(entry, idx));
            }
        }
    }

    fn persist_flags(&self) -> Result<(), ProcessError> {
        let mut batch = WriteBatch::new();
        batch.put(
            Column::Meta,
            META_TXINDEX_FLAG_KEY,
            [u8::from(self.config.tx_index)],
        );
        batch.put(
            Column::Meta,
            META_PRUNE_FLAG_KEY,
            [u8::from(self.config.prune_target_bytes > 0)],
        );
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Disconnects tips whose validity level predates the current rules.
    fn rewind(&self) -> Result<(), ProcessError> {
        let mut events = Vec::new();
        loop {
            if self.shutdown.requested() {
                break;
            }
            let mut data = self.data.lock().expect("validation lock");
            let Some(tip) = data.chain.tip() else { break };
            let entry = data.arena.get(tip);
            if entry.height == 0 || entry.is_valid_at_least(Validity::Scripts) {
                break;
            }
            coind_log::log_info!(
                "rewinding under-validated tip {} at height {}",
                hash256_to_hex(&entry.hash),
                entry.height
            );
            self.disconnect_tip(&mut data, &mut events)?;
            self.persist_index(&mut data)?;
        }
        self.emit(events);
        Ok(())
    }

    // ------------------------------------------------------------- headers

    pub fn accept_header(&self, header: &BlockHeader) -> Result<usize, ProcessError> {
        let mut data = self.data.lock().expect("validation lock");
        let mut events = Vec::new();
        let result = self.accept_header_locked(&mut data, header, &mut events);
        drop(data);
        self.emit(events);
        result
    }

    fn accept_header_locked(
        &self,
        data: &mut ChainData,
        header: &BlockHeader,
        events: &mut Vec<ChainEvent>,
    ) -> Result<usize, ProcessError> {
        let hash = header.hash();
        if let Some(idx) = data.arena.lookup(&hash) {
            if data.arena.get(idx).is_failed() {
                return Err(ValidationFailure::invalid(
                    REJECT_DUPLICATE,
                    0,
                    "duplicate-invalid",
                )
                .into());
            }
            return Ok(idx);
        }

        if let Err(err) = check_proof_of_work(header, &self.params.consensus) {
            let reason = match err {
                PowError::HashAboveTarget => "high-hash",
                _ => "bad-diffbits",
            };
            return Err(ValidationFailure::invalid(REJECT_INVALID, 50, reason).into());
        }

        let is_genesis = hash == self.params.consensus.hash_genesis_block;
        let prev = if is_genesis {
            None
        } else {
            let prev = data.arena.lookup(&header.prev_block).ok_or_else(|| {
                ValidationFailure::invalid(REJECT_INVALID, 10, "prev-blk-not-found")
            })?;
            if data.arena.get(prev).is_failed() {
                return Err(ValidationFailure::invalid(REJECT_INVALID, 100, "bad-prevblk").into());
            }
            self.contextual_check_header(data, header, prev)?;
            Some(prev)
        };

        let idx = data.arena.insert(*header);
        debug_assert_eq!(data.arena.get(idx).prev, prev);
        data.dirty_indexes.insert(idx);

        let is_new_best = data
            .best_header
            .map(|best| data.arena.get(idx).chain_work > data.arena.get(best).chain_work)
            .unwrap_or(true);
        if is_new_best {
            data.best_header = Some(idx);
            let entry = data.arena.get(idx);
            events.push(ChainEvent::HeaderTip(
                entry.height,
                entry.hash,
                self.is_initial_download(data),
            ));
        }
        Ok(idx)
    }

    fn contextual_check_header(
        &self,
        data: &ChainData,
        header: &BlockHeader,
        prev: usize,
    ) -> Result<(), ProcessError> {
        let params = &self.params.consensus;
        let parent = data.arena.get(prev);
        let height = parent.height + 1;

        // The claimed difficulty must match the retarget schedule. The window
        // ends at the parent and spans one adjustment interval.
        let interval = params.difficulty_adjustment_interval() as i32;
        let first_height = (parent.height - (interval - 1)).max(0);
        let period_first_time = data
            .arena
            .ancestor(prev, first_height)
            .map(|idx| data.arena.get(idx).header.time as i64)
            .unwrap_or(parent.header.time as i64);
        let expected_bits = next_work_required(
            parent.height as i64,
            parent.header.time as i64,
            parent.header.bits,
            period_first_time,
            header.time as i64,
            params,
        )
        .map_err(|_| ValidationFailure::invalid(REJECT_INVALID, 100, "bad-diffbits"))?;
        if header.bits != expected_bits {
            return Err(ValidationFailure::invalid(REJECT_INVALID, 100, "bad-diffbits").into());
        }

        let mtp = data.arena.median_time_past(prev);
        if (header.time as i64) <= mtp {
            return Err(ValidationFailure::invalid(REJECT_INVALID, 0, "time-too-old").into());
        }
        if (header.time as i64) > self.clock.adjusted_time() + MAX_FUTURE_BLOCK_TIME {
            return Err(ValidationFailure::invalid(REJECT_INVALID, 0, "time-too-new").into());
        }

        if self.config.checkpoints_enabled {
            if let Some(checkpoint) = params.checkpoint_at(height) {
                if checkpoint.hash != header.hash() {
                    return Err(ValidationFailure::with_kind(
                        RejectKind::Checkpoint,
                        REJECT_CHECKPOINT,
                        "checkpoint-mismatch",
                    )
                    .into());
                }
            }
            // No fork may begin strictly below the last checkpoint.
            if let Some(last) = params.last_checkpoint() {
                if height < last.height {
                    return Err(ValidationFailure {
                        kind: RejectKind::Checkpoint,
                        reject_code: REJECT_CHECKPOINT,
                        reason: "bad-fork-prior-to-checkpoint".to_string(),
                        ban_score: 100,
                    }
                    .into());
                }
            }
        }

        let obsolete = (header.version < 2 && height >= params.version2_enforce_height)
            || (header.version < 3 && height >= params.version3_enforce_height)
            || (header.version < 4 && height >= params.version4_enforce_height);
        if obsolete {
            return Err(ValidationFailure::invalid(REJECT_OBSOLETE, 0, "bad-version").into());
        }
        Ok(())
    }

    // -------------------------------------------------------------- blocks

    /// Accepts a block body: header checks, the decision whether to persist,
    /// full context-free and contextual validation, then disk storage.
    /// Activation is separate; callers normally use [`Self::process_new_block`].
    pub fn accept_block(&self, block: &Block, force_processing: bool) -> Result<usize, ProcessError> {
        let mut data = self.data.lock().expect("validation lock");
        let mut events = Vec::new();
        let result = self.accept_block_locked(&mut data, block, force_processing, &mut events);
        if result.is_ok() {
            self.persist_index(&mut data)?;
        }
        drop(data);
        self.emit(events);
        result
    }

    fn accept_block_locked(
        &self,
        data: &mut ChainData,
        block: &Block,
        force_processing: bool,
        events: &mut Vec<ChainEvent>,
    ) -> Result<usize, ProcessError> {
        let idx = self.accept_header_locked(data, &block.header, events)?;
        if data.arena.get(idx).has_data() {
            return Ok(idx);
        }

        let (height, tip_work, tip_height) = {
            let entry = data.arena.get(idx);
            let tip = data.chain.tip();
            (
                entry.height,
                tip.map(|t| data.arena.get(t).chain_work).unwrap_or_default(),
                tip.map(|t| data.arena.get(t).height).unwrap_or(-1),
            )
        };
        let has_more_work = data.arena.get(idx).chain_work > tip_work;
        let too_far_ahead = height > tip_height + MIN_BLOCKS_TO_KEEP;
        if !force_processing && (!has_more_work || too_far_ahead) {
            // Not requested and not a plausible next tip; drop the body.
            return Ok(idx);
        }

        let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
        if let Err(failure) = self.check_block_with_context(data, block, &txids, idx) {
            if failure.marks_failed() {
                self.mark_block_failed(data, idx);
            }
            return Err(failure.into());
        }

        let bytes = encode(block);
        let location =
            self.files
                .find_block_pos(bytes.len() as u32, height, block.header.time)?;
        self.files.write_block(location, &bytes)?;

        {
            let entry = data.arena.get_mut(idx);
            entry.file = Some(location);
            entry.status |= STATUS_HAVE_DATA;
            entry.tx_count = block.transactions.len() as u32;
            entry.raise_validity(Validity::Transactions);
        }
        data.dirty_indexes.insert(idx);
        self.receive_block_transactions(data, idx);

        let extends_tip = data.chain.tip().map(|tip| data.arena.get(idx).prev == Some(tip))
            == Some(true)
            || (data.chain.tip().is_none() && height == 0);
        if extends_tip {
            events.push(ChainEvent::BlockStored(data.arena.get(idx).hash, height));
        }
        Ok(idx)
    }

    /// Block-body rules that need the index: everything in
    /// [`check_block`] plus finality and the coinbase height commitment.
    fn check_block_with_context(
        &self,
        data: &ChainData,
        block: &Block,
        txids: &[Hash256],
        idx: usize,
    ) -> Result<(), ValidationFailure> {
        check_block(block, txids)?;

        let entry = data.arena.get(idx);
        let height = entry.height;
        let params = &self.params.consensus;

        let locktime_cutoff = match entry.prev {
            Some(prev) if block_locktime_flags(height, params) != 0 => {
                data.arena.median_time_past(prev)
            }
            Some(_) => block.header.time as i64,
            None => block.header.time as i64,
        };
        for tx in &block.transactions {
            if !is_final_tx(tx, height, locktime_cutoff) {
                return Err(ValidationFailure::invalid(
                    REJECT_INVALID,
                    10,
                    "bad-txns-nonfinal",
                ));
            }
        }

        if height >= params.bip34_height {
            let expected = script_push_int(height as i64);
            if !block.transactions[0].vin[0].script_sig.starts_with(&expected) {
                return Err(ValidationFailure::invalid(
                    REJECT_INVALID,
                    100,
                    "bad-cb-height",
                ));
            }
        }
        Ok(())
    }

    /// Marks the body linked, assigns the arrival sequence id, enters the
    /// candidate set when eligible, and walks the unlinked map forward.
    fn receive_block_transactions(&self, data: &mut ChainData, idx: usize) {
        let mut queue = vec![idx];
        while let Some(current) = queue.pop() {
            let parent_chain_tx = match data.arena.get(current).prev {
                Some(prev) => data.arena.get(prev).chain_tx_count,
                None => 0,
            };
            let is_root = data.arena.get(current).prev.is_none();
            if !is_root && parent_chain_tx == 0 {
                // Parent chain incomplete; park under the parent.
                let prev = data.arena.get(current).prev.expect("checked non-root");
                let children = data.unlinked.entry(prev).or_default();
                if !children.contains(&current) {
                    children.push(current);
                }
                continue;
            }

            let sequence = data.next_sequence_id;
            data.next_sequence_id += 1;
            {
                let entry = data.arena.get_mut(current);
                entry.chain_tx_count = parent_chain_tx + entry.tx_count as u64;
                if entry.sequence_id == 0 {
                    entry.sequence_id = sequence;
                }
            }
            self.try_add_candidate(data, current);

            if let Some(children) = data.unlinked.remove(&current) {
                for child in children {
                    if data.arena.get(child).has_data() {
                        queue.push(child);
                    }
                }
            }
        }
    }

    fn try_add_candidate(&self, data: &mut ChainData, idx: usize) {
        let tip_work = data
            .chain
            .tip()
            .map(|tip| data.arena.get(tip).chain_work)
            .unwrap_or_default();
        let entry = data.arena.get(idx);
        if entry.is_valid_at_least(Validity::Transactions)
            && entry.chain_tx_count != 0
            && entry.chain_work >= tip_work
        {
            data.candidates.insert(CandidateKey::for_block(entry, idx));
        }
    }

    fn mark_block_failed(&self, data: &mut ChainData, idx: usize) {
        {
            let entry = data.arena.get_mut(idx);
            entry.status |= STATUS_FAILED_VALID;
        }
        data.dirty_indexes.insert(idx);
        let entry = data.arena.get(idx);
        data.candidates.remove(&CandidateKey::for_block(entry, idx));
        if data
            .best_invalid
            .map(|best| entry.chain_work > data.arena.get(best).chain_work)
            .unwrap_or(true)
        {
            data.best_invalid = Some(idx);
            coind_log::log_warn!(
                "invalid block {} at height {} has work {}",
                hash256_to_hex(&entry.hash),
                entry.height,
                entry.chain_work
            );
        }
    }

    /// Accept + activate: the entry point for a freshly received block.
    pub fn process_new_block(&self, block: &Block, force_processing: bool) -> Result<usize, ProcessError> {
        let idx = self.accept_block(block, force_processing)?;
        self.activate_best_chain()?;
        Ok(idx)
    }

    // --------------------------------------------------------- connections

    fn read_block_body(&self, entry: &BlockIndex) -> Result<Block, ProcessError> {
        let location = entry
            .file
            .ok_or(ChainstateError::Corrupt("block data location missing"))?;
        let bytes = self.files.read_block(location)?;
        decode::<Block>(&bytes)
            .map_err(|_| ChainstateError::Corrupt("undecodable block on disk").into())
    }

    /// Whether signature checks may be skipped for `idx` under the
    /// assumed-valid optimization.
    fn script_checks_required(&self, data: &ChainData, idx: usize) -> bool {
        let Some(assume_valid) = self.config.assume_valid else {
            return true;
        };
        let Some(av_idx) = data.arena.lookup(&assume_valid) else {
            return true;
        };
        let Some(best_header) = data.best_header else {
            return true;
        };
        let entry = data.arena.get(idx);
        let in_assumed_chain = data.arena.ancestor(av_idx, entry.height) == Some(idx)
            && data.arena.ancestor(best_header, entry.height) == Some(idx);
        if !in_assumed_chain {
            return true;
        }
        let best = data.arena.get(best_header);
        let min_work = U256::from_little_endian(&self.params.consensus.minimum_chain_work);
        if best.chain_work < min_work {
            return true;
        }
        // Proof-equivalent time between the block and the best header.
        let proof_per_sec = block_proof(best.header.bits)
            / U256::from(self.params.consensus.pow_target_spacing.max(1) as u64);
        if proof_per_sec.is_zero() {
            return true;
        }
        let gap = (best.chain_work - entry.chain_work) / proof_per_sec;
        gap > U256::from(ASSUME_VALID_WINDOW_SECS as u64)
    }

    /// Applies one block to the active tip. The block's effects build up in
    /// a scratch view and reach the tip cache only if every check passes; on
    /// validation failure the index is marked failed and the view is intact.
    fn connect_tip(
        &self,
        data: &mut ChainData,
        idx: usize,
        events: &mut Vec<ChainEvent>,
    ) -> Result<(), ProcessError> {
        let block = Arc::new(self.read_block_body(data.arena.get(idx))?);
        let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();

        let script_checks = self.script_checks_required(data, idx);
        let block_file = data.arena.get(idx).file;
        let connect_result = {
            let arena = &data.arena;
            let mut scratch = CoinsCache::new(&mut data.coins);
            match self.connect_block(
                arena,
                &mut scratch,
                &block,
                &txids,
                idx,
                script_checks,
                block_file,
            ) {
                Ok(undo_location) => {
                    scratch.flush()?;
                    Ok(undo_location)
                }
                Err(err) => Err(err),
            }
        };

        let undo_location = match connect_result {
            Ok(undo_location) => undo_location,
            Err(ProcessError::Invalid(failure)) => {
                if failure.marks_failed() {
                    self.mark_block_failed(data, idx);
                }
                return Err(failure.into());
            }
            Err(fatal) => return Err(fatal),
        };

        {
            let entry = data.arena.get_mut(idx);
            if let Some(location) = undo_location {
                entry.undo = Some(location);
                entry.status |= STATUS_HAVE_UNDO;
            }
            entry.raise_validity(Validity::Scripts);
        }
        data.dirty_indexes.insert(idx);
        data.chain.set_tip(&data.arena, Some(idx));
        let entry = data.arena.get(idx);
        coind_log::log_debug!(
            "new tip {} height {} work {}",
            hash256_to_hex(&entry.hash),
            entry.height,
            entry.chain_work
        );
        events.push(ChainEvent::Connected(block, entry.hash, entry.height));
        Ok(())
    }

    /// §4.F block connection, applied to a scratch view. Returns the undo
    /// record's location (none for genesis).
    #[allow(clippy::too_many_arguments)]
    fn connect_block<V: CoinsViewBacked>(
        &self,
        arena: &BlockIndexArena,
        coins: &mut CoinsCache<V>,
        block: &Block,
        txids: &[Hash256],
        idx: usize,
        script_checks: bool,
        block_file: Option<FileLocation>,
    ) -> Result<Option<FileLocation>, ProcessError> {
        let entry = arena.get(idx);
        let height = entry.height;
        let hash = entry.hash;
        let prev_hash = entry.header.prev_block;

        let view_best = coins.best_block()?;
        let expected_parent = if height == 0 { None } else { Some(prev_hash) };
        if view_best != expected_parent {
            return Err(ChainstateError::Corrupt("view out of sync with connect").into());
        }

        // Full re-check; acceptance may have happened in an earlier run.
        check_block(block, txids).map_err(ProcessError::Invalid)?;

        // The genesis coinbase is spendable by no one and never enters the
        // coin set; connecting it only moves the view marker.
        if height == 0 {
            coins.set_best_block(hash);
            return Ok(None);
        }

        let flags = block_script_flags(height, &self.params.consensus);
        let locktime_flags = block_locktime_flags(height, &self.params.consensus);

        // Duplicate-txid protection: unless this block is one of the two
        // grandfathered pairs, or the coinbase-height rule already guarantees
        // uniqueness on this chain, no txid may shadow unspent outputs.
        let dup_exception = self
            .params
            .consensus
            .duplicate_coinbases
            .iter()
            .any(|dup| dup.height == height && dup.hash == hash);
        let bip34_active = arena
            .ancestor(idx, self.params.consensus.bip34_height)
            .map(|anc| arena.get(anc).hash == self.params.consensus.bip34_hash)
            .unwrap_or(false);
        let enforce_dup_check = !dup_exception && !bip34_active;
        if enforce_dup_check {
            for (tx, txid) in block.transactions.iter().zip(txids) {
                for vout in 0..tx.vout.len() as u32 {
                    if coins.have(&OutPoint::new(*txid, vout))? {
                        return Err(ValidationFailure::invalid(
                            REJECT_INVALID,
                            100,
                            "bad-txns-BIP30",
                        )
                        .into());
                    }
                }
            }
        }

        let mut batch = self.queue.start_batch();
        let mut undo = BlockUndo::default();
        let mut fees: i64 = 0;
        let mut sigops: u64 = 0;
        let block_size = block.serialized_size() as u64;
        let sigop_limit = max_block_sigops(block_size);

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = txids[tx_index];
            let is_coinbase = tx_index == 0;

            for input in &tx.vin {
                sigops += coind_script::legacy_sigops(&input.script_sig, false);
            }
            for output in &tx.vout {
                sigops += coind_script::legacy_sigops(&output.script_pubkey, false);
            }

            if !is_coinbase {
                let mut spent_coins: Vec<(OutPoint, Coin)> = Vec::with_capacity(tx.vin.len());
                for input in &tx.vin {
                    let coin = coins.access(&input.prevout)?.ok_or_else(|| {
                        ValidationFailure::invalid(
                            REJECT_INVALID,
                            100,
                            format!(
                                "bad-txns-inputs-missingorspent in {}",
                                hash256_to_hex(&txid)
                            ),
                        )
                    })?;
                    spent_coins.push((input.prevout, coin));
                }

                // Relative lock-times measure from the prevout block's parent.
                let prevs: Vec<(i32, i64)> = spent_coins
                    .iter()
                    .map(|(_, coin)| {
                        let mtp = arena
                            .ancestor(idx, (coin.height - 1).max(0))
                            .map(|anc| arena.median_time_past(anc))
                            .unwrap_or(0);
                        (coin.height, mtp)
                    })
                    .collect();
                let lock = calculate_sequence_locks(tx, locktime_flags, &prevs);
                let parent_mtp = arena
                    .get(idx)
                    .prev
                    .map(|prev| arena.median_time_past(prev))
                    .unwrap_or(0);
                if !evaluate_sequence_locks(height, parent_mtp, &lock) {
                    return Err(ValidationFailure::invalid(
                        REJECT_INVALID,
                        10,
                        "bad-txns-nonfinal-bip68",
                    )
                    .into());
                }

                let mut value_in: i64 = 0;
                for (input, (_, coin)) in tx.vin.iter().zip(&spent_coins) {
                    if coin.is_coinbase {
                        let depth = height - coin.height;
                        if depth < COINBASE_MATURITY {
                            return Err(ValidationFailure::invalid(
                                REJECT_INVALID,
                                100,
                                "bad-txns-premature-spend-of-coinbase",
                            )
                            .into());
                        }
                    }
                    value_in = value_in.checked_add(coin.value()).ok_or_else(|| {
                        ValidationFailure::invalid(REJECT_INVALID, 100, "bad-txns-inputvalues-outofrange")
                    })?;

                    if (flags & coind_script::SCRIPT_VERIFY_P2SH) != 0 {
                        sigops +=
                            coind_script::p2sh_sigops(&coin.output.script_pubkey, &input.script_sig);
                    }
                }
                if sigops > sigop_limit {
                    return Err(
                        ValidationFailure::invalid(REJECT_INVALID, 100, "bad-blk-sigops").into()
                    );
                }

                let value_out = tx.value_out().ok_or_else(|| {
                    ValidationFailure::invalid(REJECT_INVALID, 100, "bad-txns-txouttotal-toolarge")
                })?;
                if value_in < value_out {
                    return Err(ValidationFailure::invalid(
                        REJECT_INVALID,
                        100,
                        "bad-txns-in-belowout",
                    )
                    .into());
                }
                fees = fees.checked_add(value_in - value_out).ok_or_else(|| {
                    ValidationFailure::invalid(REJECT_INVALID, 100, "bad-txns-fee-outofrange")
                })?;

                if script_checks {
                    let shared_tx = Arc::new(tx.clone());
                    let precomputed = Arc::new(PrecomputedTransactionData::new(tx));
                    let checks: Vec<ScriptCheck> = spent_coins
                        .iter()
                        .enumerate()
                        .map(|(input_index, (_, coin))| ScriptCheck {
                            script_pubkey: coin.output.script_pubkey.clone(),
                            amount: coin.value(),
                            tx: Arc::clone(&shared_tx),
                            input_index,
                            flags,
                            precomputed: Arc::clone(&precomputed),
                        })
                        .collect();
                    batch.add(checks);
                }

                for (outpoint, _) in &spent_coins {
                    let coin = coins.spend(outpoint)?;
                    undo.spent.push(SpentCoin { coin });
                }
            } else if sigops > sigop_limit {
                return Err(ValidationFailure::invalid(REJECT_INVALID, 100, "bad-blk-sigops").into());
            }

            // Only coinbases may overwrite; that is the carve-out for the two
            // grandfathered duplicate pairs.
            for (vout, output) in tx.vout.iter().enumerate() {
                coins.add(
                    OutPoint::new(txid, vout as u32),
                    Coin::new(output.clone(), height, is_coinbase),
                    is_coinbase,
                )?;
            }
        }

        let subsidy = block_subsidy(height, &self.params.consensus);
        let coinbase_out = block.transactions[0].value_out().ok_or_else(|| {
            ValidationFailure::invalid(REJECT_INVALID, 100, "bad-txns-txouttotal-toolarge")
        })?;
        if coinbase_out > subsidy + fees {
            return Err(ValidationFailure::invalid(REJECT_INVALID, 100, "bad-cb-amount").into());
        }

        if let Err(failure) = batch.complete() {
            coind_log::log_debug!(
                "script check failed for input {} of {}: {}",
                failure.input_index,
                hash256_to_hex(&failure.txid),
                failure.error
            );
            return Err(
                ValidationFailure::invalid(REJECT_INVALID, 100, "blk-bad-inputs").into(),
            );
        }

        // Durable effects, in crash-safe order: undo record first, then the
        // index status and the view's best-block marker via the caller.
        let undo_bytes = undo.encode();
        let block_file =
            block_file.ok_or(ChainstateError::Corrupt("connect without block data"))?;
        let undo_location = self
            .files
            .find_undo_pos(block_file.file_id, undo_bytes.len() as u32)?;
        self.files
            .write_undo(undo_location, &undo_bytes, &prev_hash)?;

        if self.config.tx_index {
            self.write_tx_index(block, txids, block_file)?;
        }

        coins.set_best_block(hash);
        Ok(Some(undo_location))
    }

    fn write_tx_index(
        &self,
        block: &Block,
        txids: &[Hash256],
        block_file: FileLocation,
    ) -> Result<(), ProcessError> {
        let mut batch = WriteBatch::new();
        batch.reserve(block.transactions.len());
        let mut offset_encoder = Encoder::new();
        block.header.consensus_encode(&mut offset_encoder);
        offset_encoder.write_compact_size(block.transactions.len() as u64);
        let mut tx_offset = offset_encoder.len() as u32;
        for (tx, txid) in block.transactions.iter().zip(txids) {
            let mut value = Vec::with_capacity(20);
            value.extend_from_slice(&block_file.encode());
            value.extend_from_slice(&tx_offset.to_le_bytes());
            batch.put(Column::TxIndex, *txid, value);
            tx_offset += tx.serialized_size() as u32;
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Reverts the active tip. The undo record restores every spent coin;
    /// the created outputs are spent away.
    fn disconnect_tip(
        &self,
        data: &mut ChainData,
        events: &mut Vec<ChainEvent>,
    ) -> Result<DisconnectResult, ProcessError> {
        let tip = data
            .chain
            .tip()
            .ok_or(ChainstateError::Corrupt("disconnect with empty chain"))?;
        let block = Arc::new(self.read_block_body(data.arena.get(tip))?);
        let entry = data.arena.get(tip);
        let hash = entry.hash;
        let prev_hash = entry.header.prev_block;
        let undo_location = entry
            .undo
            .ok_or(ChainstateError::Corrupt("disconnect without undo data"))?;
        let undo_bytes = self.files.read_undo(undo_location, &prev_hash)?;
        let undo = BlockUndo::decode(&undo_bytes)
            .map_err(|_| ChainstateError::Corrupt("undecodable undo record"))?;

        // Revert on a scratch layer; an irrecoverable undo leaves the live
        // view untouched.
        let height = data.arena.get(tip).height;
        let result = {
            let mut scratch = CoinsCache::new(&mut data.coins);
            let result = revert_block(&block, &undo, height, &mut scratch)?;
            if result != DisconnectResult::Failed {
                scratch.set_best_block(prev_hash);
                scratch.flush()?;
            }
            result
        };
        if result == DisconnectResult::Failed {
            return Err(ChainstateError::Corrupt("block disconnect failed").into());
        }

        if self.config.tx_index {
            let mut batch = WriteBatch::new();
            for tx in &block.transactions {
                batch.delete(Column::TxIndex, tx.txid());
            }
            self.store.write_batch(&batch)?;
        }

        let prev = data.arena.get(tip).prev;
        data.chain.set_tip(&data.arena, prev);
        events.push(ChainEvent::Disconnected(block, hash));
        Ok(result)
    }

    // ---------------------------------------------------------- activation

    /// Brings the active chain to the best candidate tip, in bounded steps
    /// with the lock released in between.
    pub fn activate_best_chain(&self) -> Result<(), ProcessError> {
        loop {
            if self.shutdown.requested() {
                return Ok(());
            }
            let mut events = Vec::new();
            let mut data = self.data.lock().expect("validation lock");

            let best = self.find_most_work_chain(&mut data);
            let tip = data.chain.tip();
            let done = match best {
                Some(best) => Some(best) == tip,
                None => true,
            };
            if done {
                self.flush_state(&mut data, FlushMode::Periodic)?;
                drop(data);
                self.emit(events);
                return Ok(());
            }
            let best = best.expect("checked above");

            match self.activate_step(&mut data, best, &mut events) {
                Ok(()) => {}
                Err(ProcessError::Invalid(_)) => {
                    // The offending subtree is marked; re-select from the
                    // remaining candidates.
                }
                Err(fatal) => return Err(fatal),
            }
            self.prune_candidates(&mut data);
            self.persist_index(&mut data)?;
            self.flush_state(&mut data, FlushMode::IfNeeded)?;
            drop(data);
            self.emit(events);
        }
    }

    /// Best fully-connectable candidate, pruning candidates whose path to
    /// the active chain is failed or missing data.
    fn find_most_work_chain(&self, data: &mut ChainData) -> Option<usize> {
        'selection: loop {
            let key = *data.candidates.iter().next_back()?;
            let candidate = key.index.0;

            let mut test = candidate;
            while !data.chain.contains(&data.arena, test) {
                let entry = data.arena.get(test);
                if entry.is_failed() {
                    self.remove_failed_branch(data, test, candidate);
                    continue 'selection;
                }
                if !entry.has_data() || entry.chain_tx_count == 0 {
                    self.park_unlinked_branch(data, test, candidate);
                    continue 'selection;
                }
                match entry.prev {
                    Some(prev) => test = prev,
                    None => break,
                }
            }
            return Some(candidate);
        }
    }

    /// An ancestor is failed: everything from it up to the candidate leaves
    /// the set and inherits FAILED_CHILD.
    fn remove_failed_branch(&self, data: &mut ChainData, failed: usize, candidate: usize) {
        let mut walk = candidate;
        loop {
            let entry = data.arena.get(walk);
            data.candidates.remove(&CandidateKey::for_block(entry, walk));
            if walk == failed {
                break;
            }
            let prev = entry.prev;
            {
                let entry = data.arena.get_mut(walk);
                entry.status |= STATUS_FAILED_CHILD;
            }
            data.dirty_indexes.insert(walk);
            match prev {
                Some(prev) => walk = prev,
                None => break,
            }
        }
    }

    /// An ancestor lacks data: the blocks above it cannot connect yet and go
    /// back to the unlinked map.
    fn park_unlinked_branch(&self, data: &mut ChainData, missing: usize, candidate: usize) {
        let mut walk = candidate;
        while walk != missing {
            let entry = data.arena.get(walk);
            data.candidates.remove(&CandidateKey::for_block(entry, walk));
            let Some(prev) = entry.prev else { break };
            if data.arena.get(walk).has_data() {
                let children = data.unlinked.entry(prev).or_default();
                if !children.contains(&walk) {
                    children.push(walk);
                }
            }
            walk = prev;
        }
        let entry = data.arena.get(missing);
        data.candidates
            .remove(&CandidateKey::for_block(entry, missing));
    }

    /// One step toward `target`: disconnect to the fork point, then connect
    /// up to [`MAX_CONNECT_BATCH`] blocks.
    fn activate_step(
        &self,
        data: &mut ChainData,
        target: usize,
        events: &mut Vec<ChainEvent>,
    ) -> Result<(), ProcessError> {
        let fork = data
            .chain
            .tip()
            .map(|tip| data.arena.last_common_ancestor(tip, target));

        while let Some(tip) = data.chain.tip() {
            if self.shutdown.requested() {
                return Ok(());
            }
            if Some(tip) == fork || fork.is_none() {
                break;
            }
            self.disconnect_tip(data, events)?;
        }

        // Collect the next blocks to connect, lowest height first.
        let mut pending: Vec<usize> = Vec::new();
        let mut walk = target;
        loop {
            if Some(walk) == fork {
                break;
            }
            pending.push(walk);
            match data.arena.get(walk).prev {
                Some(prev) => walk = prev,
                None => break,
            }
        }
        pending.reverse();
        pending.truncate(MAX_CONNECT_BATCH);

        for idx in pending {
            if self.shutdown.requested() {
                return Ok(());
            }
            self.connect_tip(data, idx, events)?;
        }
        Ok(())
    }

    /// Drops candidates that can no longer beat the tip. The tip itself
    /// always stays.
    fn prune_candidates(&self, data: &mut ChainData) {
        let Some(tip) = data.chain.tip() else { return };
        let tip_entry = data.arena.get(tip);
        let tip_key = CandidateKey::for_block(tip_entry, tip);
        let stale: Vec<CandidateKey> = data
            .candidates
            .iter()
            .filter(|key| **key < tip_key)
            .copied()
            .collect();
        for key in stale {
            data.candidates.remove(&key);
        }
        data.candidates.insert(tip_key);
    }

    // ----------------------------------------------- precious / invalidate

    /// Biases the tie-break toward `hash` as if its body had arrived first.
    pub fn precious_block(&self, hash: &Hash256) -> Result<(), ProcessError> {
        {
            let mut guard = self.data.lock().expect("validation lock");
            let data = &mut *guard;
            let Some(idx) = data.arena.lookup(hash) else {
                return Ok(());
            };
            let tip_work = data
                .chain
                .tip()
                .map(|tip| data.arena.get(tip).chain_work)
                .unwrap_or_default();
            if data.arena.get(idx).chain_work < tip_work {
                return Ok(());
            }
            if tip_work > data.last_precious_work {
                // Chain advanced since the last call; the counter may reset
                // instead of marching toward its floor.
                data.reverse_sequence_id = -1;
            }
            data.last_precious_work = tip_work;

            let entry = data.arena.get(idx);
            data.candidates.remove(&CandidateKey::for_block(entry, idx));
            let sequence = data.reverse_sequence_id;
            data.arena.get_mut(idx).sequence_id = sequence;
            if data.reverse_sequence_id > i32::MIN {
                data.reverse_sequence_id -= 1;
            }
            self.try_add_candidate(data, idx);
        }
        self.activate_best_chain()
    }

    /// Marks a block invalid and forces the chain off it.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ProcessError> {
        let mut events = Vec::new();
        {
            let mut guard = self.data.lock().expect("validation lock");
            let data = &mut *guard;
            let Some(idx) = data.arena.lookup(hash) else {
                return Ok(());
            };
            self.mark_block_failed(data, idx);

            while let Some(tip) = data.chain.tip() {
                if !data.arena.is_ancestor(idx, tip) {
                    break;
                }
                {
                    let entry = data.arena.get_mut(tip);
                    if tip != idx {
                        entry.status |= STATUS_FAILED_CHILD;
                    }
                }
                data.dirty_indexes.insert(tip);
                let entry = data.arena.get(tip);
                data.candidates.remove(&CandidateKey::for_block(entry, tip));
                self.disconnect_tip(data, &mut events)?;
            }
            self.rebuild_candidates(data);
            self.persist_index(data)?;
        }
        self.emit(events);
        self.activate_best_chain()
    }

    /// Clears failure marks from a subtree, re-admitting it to candidacy.
    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), ProcessError> {
        {
            let mut data = self.data.lock().expect("validation lock");
            let Some(idx) = data.arena.lookup(hash) else {
                return Ok(());
            };
            let height = data.arena.get(idx).height;

            let all: Vec<usize> = (0..data.arena.len()).collect();
            for walk in all {
                let is_descendant = data.arena.ancestor(walk, height) == Some(idx);
                if is_descendant && data.arena.get(walk).is_failed() {
                    {
                        let entry = data.arena.get_mut(walk);
                        entry.status &= !(STATUS_FAILED_VALID | STATUS_FAILED_CHILD);
                    }
                    data.dirty_indexes.insert(walk);
                    self.try_add_candidate(&mut data, walk);
                }
            }
            // Ancestors marked failed would still poison this subtree.
            let mut walk = Some(idx);
            while let Some(current) = walk {
                if data.arena.get(current).is_failed() {
                    {
                        let entry = data.arena.get_mut(current);
                        entry.status &= !(STATUS_FAILED_VALID | STATUS_FAILED_CHILD);
                    }
                    data.dirty_indexes.insert(current);
                }
                walk = data.arena.get(current).prev;
            }
            data.best_invalid = None;
            self.persist_index(&mut data)?;
        }
        self.activate_best_chain()
    }

    // ----------------------------------------------------- flush & pruning

    fn persist_index(&self, data: &mut ChainData) -> Result<(), ProcessError> {
        let dirty_files = self.files.take_dirty_infos();
        if data.dirty_indexes.is_empty() && dirty_files.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        batch.reserve(data.dirty_indexes.len() + dirty_files.len() + 1);
        for idx in data.dirty_indexes.drain() {
            let entry = data.arena.get(idx);
            batch.put(
                Column::BlockIndex,
                entry.hash,
                DiskBlockIndex::from_entry(entry).encode(),
            );
        }
        for (file_id, info) in dirty_files {
            batch.put(Column::FileInfo, file_info_key(file_id), info.encode());
        }
        batch.put(
            Column::Meta,
            META_LAST_BLOCK_FILE_KEY,
            self.files.last_file().to_le_bytes(),
        );
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Writes the durable state in crash-safe order: block files first, then
    /// the index batch, then the coin view.
    fn flush_state(&self, data: &mut ChainData, mode: FlushMode) -> Result<(), ProcessError> {
        let cache_bytes = data.coins.cache_size_bytes();
        let over_budget =
            cache_bytes * 100 > self.config.coins_cache_bytes * CACHE_FLUSH_WATERMARK_PCT;
        let periodic_due = data.last_flush.elapsed() >= PERIODIC_FLUSH_INTERVAL;
        let should_flush = match mode {
            FlushMode::IfNeeded => over_budget,
            FlushMode::Periodic => over_budget || periodic_due,
            FlushMode::Always => true,
        };
        if !should_flush {
            return Ok(());
        }

        if let Some(tip) = data.chain.tip() {
            if let Some(location) = data.arena.get(tip).file {
                self.files.flush_file(location.file_id, false)?;
            }
        }
        self.persist_index(data)?;
        if data.coins.flush()? {
            self.store.sync()?;
        }
        data.last_flush = Instant::now();
        coind_log::log_debug!("flushed chain state ({cache_bytes} cached bytes)");

        if self.config.prune_target_bytes > 0 {
            self.prune_to_target(data)?;
        }
        Ok(())
    }

    /// Forces everything to disk; used at shutdown.
    pub fn flush(&self) -> Result<(), ProcessError> {
        let mut data = self.data.lock().expect("validation lock");
        self.flush_state(&mut data, FlushMode::Always)
    }

    fn prune_to_target(&self, data: &mut ChainData) -> Result<(), ProcessError> {
        let Some(tip) = data.chain.tip() else {
            return Ok(());
        };
        let tip_height = data.arena.get(tip).height;
        let mut usage: u64 = 0;
        let mut file_id = 0u32;
        while let Some(info) = self.files.file_info(file_id) {
            usage += info.size + info.undo_size;
            file_id += 1;
        }
        if usage <= self.config.prune_target_bytes {
            return Ok(());
        }
        self.prune_files_below(data, tip_height - MIN_BLOCKS_TO_KEEP)
    }

    /// Deletes block/undo files wholly at or below `height`, clearing every
    /// index entry that points into them. The keep window around the tip is
    /// always preserved.
    pub fn prune_blocks_to_height(&self, height: i32) -> Result<(), ProcessError> {
        let mut data = self.data.lock().expect("validation lock");
        let Some(tip) = data.chain.tip() else {
            return Ok(());
        };
        let tip_height = data.arena.get(tip).height;
        let limit = height.min(tip_height - MIN_BLOCKS_TO_KEEP);
        // Coins referencing pruned blocks must be durable before deletion.
        self.flush_state(&mut data, FlushMode::Always)?;
        self.prune_files_below(&mut data, limit)
    }

    fn prune_files_below(&self, data: &mut ChainData, height: i32) -> Result<(), ProcessError> {
        if height < 0 {
            return Ok(());
        }
        let victims = self.files.files_below_height(height);
        if victims.is_empty() {
            return Ok(());
        }
        let victim_set: HashSet<u32> = victims.iter().copied().collect();
        let all: Vec<usize> = (0..data.arena.len()).collect();
        for idx in all {
            let entry = data.arena.get(idx);
            let in_victim = entry
                .file
                .map(|loc| victim_set.contains(&loc.file_id))
                .unwrap_or(false);
            if in_victim {
                let entry = data.arena.get_mut(idx);
                entry.status &= !(STATUS_HAVE_DATA | STATUS_HAVE_UNDO);
                entry.file = None;
                entry.undo = None;
                data.dirty_indexes.insert(idx);
            }
        }
        self.persist_index(data)?;
        self.files.delete_files(&victims)?;
        coind_log::log_info!(
            "pruned {} block file pair(s) at or below height {height}",
            victims.len()
        );
        Ok(())
    }

    // ------------------------------------------------------------ verify

    /// Replays recent blocks with increasing depth of cross-checking.
    /// Returns 0 on success, 1 on an inconsistency, 2 on an I/O error.
    pub fn verify_db(&self, depth: i32, level: u32) -> i32 {
        let mut data = self.data.lock().expect("validation lock");
        match self.verify_db_inner(&mut data, depth, level) {
            Ok(true) => 0,
            Ok(false) => 1,
            Err(_) => 2,
        }
    }

    fn verify_db_inner(
        &self,
        data: &mut ChainData,
        depth: i32,
        level: u32,
    ) -> Result<bool, ProcessError> {
        let Some(tip) = data.chain.tip() else {
            return Ok(true);
        };
        let tip_height = data.arena.get(tip).height;
        let stop_height = (tip_height - depth).max(0);

        let mut overlay: HashMap<OutPoint, Option<Coin>> = HashMap::new();
        let mut replay: Vec<usize> = Vec::new();
        let mut height = tip_height;
        while height > stop_height {
            let idx = data.chain.at(height).expect("height on chain");
            let entry = data.arena.get(idx);
            if !entry.has_data() {
                // Pruned away; nothing deeper can be verified.
                break;
            }
            let block = self.read_block_body(entry)?;
            let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
            if check_block(&block, &txids).is_err() {
                return Ok(false);
            }

            if level >= 2 {
                let Some(undo_location) = data.arena.get(idx).undo else {
                    return Ok(false);
                };
                let undo_bytes = self
                    .files
                    .read_undo(undo_location, &block.header.prev_block)?;
                let Ok(undo) = BlockUndo::decode(&undo_bytes) else {
                    return Ok(false);
                };

                if level >= 3 {
                    if !revert_block_overlay(&block, &undo, height, &mut data.coins, &mut overlay)?
                    {
                        return Ok(false);
                    }
                    replay.push(idx);
                }
            }
            height -= 1;
        }

        if level >= 4 {
            for idx in replay.into_iter().rev() {
                let block = self.read_block_body(data.arena.get(idx))?;
                let block_height = data.arena.get(idx).height;
                if !reconnect_block_overlay(
                    &block,
                    block_height,
                    &mut data.coins,
                    &mut overlay,
                )? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------- queries

    fn is_initial_download(&self, data: &ChainData) -> bool {
        let Some(tip) = data.chain.tip() else {
            return true;
        };
        let entry = data.arena.get(tip);
        let min_work = U256::from_little_endian(&self.params.consensus.minimum_chain_work);
        if entry.chain_work < min_work {
            return true;
        }
        (entry.time_max as i64) < self.clock.adjusted_time() - DEFAULT_MAX_TIP_AGE
    }
}

/// A held validation lock plus the read API callers use under it.
pub struct ChainLock<'a> {
    state: &'a ChainState,
    data: MutexGuard<'a, ChainData>,
}

impl ChainLock<'_> {
    pub fn tip(&self) -> Option<TipStatus> {
        let tip = self.data.chain.tip()?;
        let entry = self.data.arena.get(tip);
        Some(TipStatus {
            index: tip,
            hash: entry.hash,
            height: entry.height,
            time: entry.header.time,
            median_time_past: self.data.arena.median_time_past(tip),
            chain_work: entry.chain_work,
        })
    }

    pub fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        self.data.coins.access(outpoint)
    }

    pub fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        self.data.coins.have(outpoint)
    }

    pub fn block_hash_at(&self, height: i32) -> Option<Hash256> {
        let idx = self.data.chain.at(height)?;
        Some(self.data.arena.get(idx).hash)
    }

    pub fn header_of(&self, hash: &Hash256) -> Option<(BlockHeader, i32, u32)> {
        let idx = self.data.arena.lookup(hash)?;
        let entry = self.data.arena.get(idx);
        Some((entry.header, entry.height, entry.status))
    }

    pub fn locator(&self) -> Vec<Hash256> {
        self.data.chain.locator(&self.data.arena)
    }

    pub fn candidate_tips(&self) -> Vec<Hash256> {
        self.data
            .candidates
            .iter()
            .rev()
            .map(|key| self.data.arena.get(key.index.0).hash)
            .collect()
    }

    /// Median-time-past of the block *before* the one at `height` on the
    /// active chain; the reference clock for time-based relative locks.
    pub fn mtp_before_height(&self, height: i32) -> i64 {
        self.data
            .chain
            .at((height - 1).max(0))
            .map(|idx| self.data.arena.median_time_past(idx))
            .unwrap_or(0)
    }

    pub fn consensus_script_flags_for_tip(&self) -> ScriptFlags {
        let height = self.tip().map(|tip| tip.height).unwrap_or(0);
        block_script_flags(height, &self.state.params.consensus)
    }

    pub fn is_initial_download(&self) -> bool {
        self.state.is_initial_download(&self.data)
    }
}

/// Applies the undo data for `block` directly to the cache. Used by the real
/// disconnect path.
fn revert_block<V: CoinsViewBacked>(
    block: &Block,
    undo: &BlockUndo,
    height: i32,
    coins: &mut CoinsCache<V>,
) -> Result<DisconnectResult, ProcessError> {
    let expected_inputs: usize = block
        .transactions
        .iter()
        .skip(1)
        .map(|tx| tx.vin.len())
        .sum();
    if undo.spent.len() != expected_inputs {
        return Ok(DisconnectResult::Failed);
    }

    let mut clean = true;
    let mut undo_cursor = undo.spent.len();

    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for vout in (0..tx.vout.len() as u32).rev() {
            let outpoint = OutPoint::new(txid, vout);
            match coins.spend(&outpoint) {
                Ok(_) => {}
                Err(CoinsError::MissingCoin(_)) => {
                    // Output already gone: overwritten by a later duplicate
                    // txid. Legal, but the view has drifted.
                    coind_log::log_warn!(
                        "missing output {}:{} during disconnect at height {height}",
                        hash256_to_hex(&txid),
                        vout
                    );
                    clean = false;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if tx_index == 0 {
            continue;
        }
        for input in tx.vin.iter().rev() {
            undo_cursor -= 1;
            let mut coin = undo.spent[undo_cursor].coin.clone();
            if !undo.spent[undo_cursor].has_metadata() {
                // Legacy record: borrow metadata from any surviving sibling.
                match probe_sibling_metadata(coins, &input.prevout.txid)? {
                    Some((sibling_height, sibling_coinbase)) => {
                        coin.height = sibling_height;
                        coin.is_coinbase = sibling_coinbase;
                    }
                    None => clean = false,
                }
            }
            let was_present = coins.have(&input.prevout)?;
            if was_present {
                clean = false;
            }
            coins.add(input.prevout, coin, was_present)?;
        }
    }

    Ok(if clean {
        DisconnectResult::Clean
    } else {
        DisconnectResult::Unclean
    })
}

fn probe_sibling_metadata<V: CoinsViewBacked>(
    coins: &mut CoinsCache<V>,
    txid: &Hash256,
) -> Result<Option<(i32, bool)>, CoinsError> {
    for index in 0..METADATA_PROBE_LIMIT {
        if let Some(coin) = coins.access(&OutPoint::new(*txid, index))? {
            if coin.height != 0 {
                return Ok(Some((coin.height, coin.is_coinbase)));
            }
        }
    }
    Ok(None)
}

// The verify-db replay must not mutate the live view, so block effects are
// tracked in a shadow overlay consulted before the cache.

fn overlay_get<V: CoinsViewBacked>(
    coins: &mut CoinsCache<V>,
    overlay: &HashMap<OutPoint, Option<Coin>>,
    outpoint: &OutPoint,
) -> Result<Option<Coin>, CoinsError> {
    match overlay.get(outpoint) {
        Some(entry) => Ok(entry.clone()),
        None => coins.access(outpoint),
    }
}

fn revert_block_overlay<V: CoinsViewBacked>(
    block: &Block,
    undo: &BlockUndo,
    _height: i32,
    coins: &mut CoinsCache<V>,
    overlay: &mut HashMap<OutPoint, Option<Coin>>,
) -> Result<bool, ProcessError> {
    let expected_inputs: usize = block
        .transactions
        .iter()
        .skip(1)
        .map(|tx| tx.vin.len())
        .sum();
    if undo.spent.len() != expected_inputs {
        return Ok(false);
    }

    let mut undo_cursor = undo.spent.len();
    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for vout in (0..tx.vout.len() as u32).rev() {
            let outpoint = OutPoint::new(txid, vout);
            if overlay_get(coins, overlay, &outpoint)?.is_none() {
                return Ok(false);
            }
            overlay.insert(outpoint, None);
        }
        if tx_index == 0 {
            continue;
        }
        for input in tx.vin.iter().rev() {
            undo_cursor -= 1;
            overlay.insert(
                input.prevout,
                Some(undo.spent[undo_cursor].coin.clone()),
            );
        }
    }
    Ok(true)
}

fn reconnect_block_overlay<V: CoinsViewBacked>(
    block: &Block,
    height: i32,
    coins: &mut CoinsCache<V>,
    overlay: &mut HashMap<OutPoint, Option<Coin>>,
) -> Result<bool, ProcessError> {
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let txid = tx.txid();
        if tx_index > 0 {
            for input in &tx.vin {
                if overlay_get(coins, overlay, &input.prevout)?.is_none() {
                    return Ok(false);
                }
                overlay.insert(input.prevout, None);
            }
        }
        for (vout, output) in tx.vout.iter().enumerate() {
            overlay.insert(
                OutPoint::new(txid, vout as u32),
                Some(Coin::new(output.clone(), height, tx_index == 0)),
            );
        }
    }
    Ok(true)
}

fn script_push_int(value: i64) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1NEGATE: u8 = 0x4f;
    const OP_1: u8 = 0x51;
    if value == 0 {
        return vec![OP_0];
    }
    if value == -1 {
        return vec![OP_1NEGATE];
    }
    if (1..=16).contains(&value) {
        return vec![OP_1 + (value as u8 - 1)];
    }
    let mut abs = value.unsigned_abs();
    let mut data = Vec::new();
    while abs > 0 {
        data.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = data.last_mut() {
        if (*last & 0x80) != 0 {
            data.push(if value < 0 { 0x80 } else { 0 });
        } else if value < 0 {
            *last |= 0x80;
        }
    }
    let mut script = Vec::with_capacity(1 + data.len());
    script.push(data.len() as u8);
    script.extend_from_slice(&data);
    script
}
