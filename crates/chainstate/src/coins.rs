//! The unspent-output set: a dirty-tracking cache stacked on a persistent
//! store.

use std::collections::{hash_map::Entry, HashMap};
use std::sync::Arc;

use coind_consensus::money::Amount;
use coind_consensus::Hash256;
use coind_primitives::encoding::{DecodeError, Decoder, Encoder};
use coind_primitives::outpoint::OutPoint;
use coind_primitives::transaction::TxOut;
use coind_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use rand::RngCore;

pub const OUTPOINT_KEY_LEN: usize = 36;

const META_BEST_BLOCK_KEY: &[u8] = b"coins:best_block";
const META_OBFUSCATE_KEY: &[u8] = b"coins:obfuscate_key";

/// A single unspent output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub output: TxOut,
    pub height: i32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(output: TxOut, height: i32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }

    pub fn value(&self) -> Amount {
        self.output.value
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        let code = ((self.height as u32) << 1) | u32::from(self.is_coinbase);
        encoder.write_u32_le(code);
        encoder.write_i64_le(self.output.value);
        encoder.write_var_bytes(&self.output.script_pubkey);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let code = decoder.read_u32_le()?;
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            output: TxOut {
                value,
                script_pubkey,
            },
            height: (code >> 1) as i32,
            is_coinbase: (code & 1) != 0,
        })
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + self.output.script_pubkey.capacity()
    }
}

pub fn outpoint_key(outpoint: &OutPoint) -> [u8; OUTPOINT_KEY_LEN] {
    let mut bytes = [0u8; OUTPOINT_KEY_LEN];
    bytes[..32].copy_from_slice(&outpoint.txid);
    bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
    bytes
}

#[derive(Debug)]
pub enum CoinsError {
    Store(StoreError),
    Corrupt(&'static str),
    /// `add` of an outpoint that is already unspent without permission to
    /// overwrite.
    Overwrite(OutPoint),
    /// `spend` of an outpoint that is not in the view.
    MissingCoin(OutPoint),
}

impl std::fmt::Display for CoinsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinsError::Store(err) => write!(f, "{err}"),
            CoinsError::Corrupt(message) => write!(f, "{message}"),
            CoinsError::Overwrite(outpoint) => {
                write!(f, "coin overwrite at index {}", outpoint.index)
            }
            CoinsError::MissingCoin(outpoint) => {
                write!(f, "missing coin at index {}", outpoint.index)
            }
        }
    }
}

impl std::error::Error for CoinsError {}

impl From<StoreError> for CoinsError {
    fn from(err: StoreError) -> Self {
        CoinsError::Store(err)
    }
}

const FLAG_DIRTY: u8 = 1 << 0;
/// The parent view is known not to have this coin; a spend can simply drop
/// the entry instead of recording a deletion.
const FLAG_FRESH: u8 = 1 << 1;

#[derive(Clone, Debug)]
pub struct CachedCoin {
    pub coin: Option<Coin>,
    flags: u8,
}

impl CachedCoin {
    pub fn is_dirty(&self) -> bool {
        (self.flags & FLAG_DIRTY) != 0
    }

    pub fn is_fresh(&self) -> bool {
        (self.flags & FLAG_FRESH) != 0
    }
}

/// Read access shared by every layer of the view stack.
pub trait CoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError>;
    fn best_block(&self) -> Result<Option<Hash256>, CoinsError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }
}

/// A layer that can absorb a flush from the cache above it.
pub trait CoinsViewBacked: CoinsView {
    fn batch_write(
        &mut self,
        changes: Vec<(OutPoint, CachedCoin)>,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError>;
}

/// The bottom layer: per-output records in the key-value store. Values are
/// XOR-obfuscated with a per-database random key so that on-disk patterns do
/// not mirror script bytes.
pub struct CoinsStore<S: ?Sized> {
    store: Arc<S>,
    obfuscate_key: [u8; 8],
}

impl<S: KeyValueStore + ?Sized> CoinsStore<S> {
    pub fn new(store: Arc<S>) -> Result<Self, CoinsError> {
        let obfuscate_key = match store.get(Column::Meta, META_OBFUSCATE_KEY)? {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map_err(|_| CoinsError::Corrupt("invalid obfuscation key"))?,
            None => {
                let mut key = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut key);
                store.put(Column::Meta, META_OBFUSCATE_KEY, &key)?;
                key
            }
        };
        Ok(Self {
            store,
            obfuscate_key,
        })
    }

    fn obfuscate(&self, bytes: &mut [u8]) {
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte ^= self.obfuscate_key[i % self.obfuscate_key.len()];
        }
    }
}

impl<S: KeyValueStore + ?Sized> CoinsView for CoinsStore<S> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        let key = outpoint_key(outpoint);
        match self.store.get(Column::Utxo, &key)? {
            Some(mut bytes) => {
                self.obfuscate(&mut bytes);
                Ok(Some(Coin::decode(&bytes).map_err(|_| {
                    CoinsError::Corrupt("undecodable coin record")
                })?))
            }
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CoinsError::Corrupt("invalid best block hash"))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }
}

impl<S: KeyValueStore + ?Sized> CoinsViewBacked for CoinsStore<S> {
    fn batch_write(
        &mut self,
        changes: Vec<(OutPoint, CachedCoin)>,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        let mut batch = WriteBatch::new();
        batch.reserve(changes.len() + 1);
        for (outpoint, cached) in changes {
            if !cached.is_dirty() {
                continue;
            }
            let key = outpoint_key(&outpoint);
            match cached.coin {
                Some(coin) => {
                    let mut bytes = coin.encode();
                    self.obfuscate(&mut bytes);
                    batch.put(Column::Utxo, key, bytes);
                }
                None => batch.delete(Column::Utxo, key),
            }
        }
        if let Some(hash) = best_block {
            batch.put(Column::Meta, META_BEST_BLOCK_KEY, hash);
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

/// The in-memory write layer. Reads fall through to the base and are cached;
/// writes stay here, flagged dirty, until [`CoinsCache::flush`].
pub struct CoinsCache<V: CoinsViewBacked> {
    base: V,
    map: HashMap<OutPoint, CachedCoin>,
    best_block: Option<Hash256>,
    cached_coin_bytes: usize,
}

impl<V: CoinsViewBacked> CoinsCache<V> {
    pub fn new(base: V) -> Self {
        Self {
            base,
            map: HashMap::new(),
            best_block: None,
            cached_coin_bytes: 0,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    /// Approximate heap footprint of the cache layer.
    pub fn cache_size_bytes(&self) -> usize {
        self.cached_coin_bytes
            + self.map.len() * (OUTPOINT_KEY_LEN + std::mem::size_of::<CachedCoin>())
    }

    pub fn cached_entries(&self) -> usize {
        self.map.len()
    }

    fn fetch(&mut self, outpoint: &OutPoint) -> Result<Option<&CachedCoin>, CoinsError> {
        if !self.map.contains_key(outpoint) {
            match self.base.get_coin(outpoint)? {
                Some(coin) => {
                    self.cached_coin_bytes += coin.memory_usage();
                    self.map.insert(
                        *outpoint,
                        CachedCoin {
                            coin: Some(coin),
                            flags: 0,
                        },
                    );
                }
                None => return Ok(None),
            }
        }
        Ok(self.map.get(outpoint))
    }

    pub fn access(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        Ok(self
            .fetch(outpoint)?
            .and_then(|cached| cached.coin.clone()))
    }

    pub fn have(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(self
            .fetch(outpoint)?
            .map(|cached| cached.coin.is_some())
            .unwrap_or(false))
    }

    /// Adds an unspent coin. Refuses to overwrite an existing unspent entry
    /// unless `overwrite_allowed`; the caller grants that only for the two
    /// historical duplicate coinbases.
    pub fn add(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        overwrite_allowed: bool,
    ) -> Result<(), CoinsError> {
        let mut fresh = false;
        match self.map.entry(outpoint) {
            Entry::Occupied(entry) => {
                let cached = entry.get();
                if cached.coin.is_some() && !overwrite_allowed {
                    return Err(CoinsError::Overwrite(outpoint));
                }
                // A re-created coin over a spent entry keeps FRESH only if the
                // spent entry was itself invisible to the base.
                fresh = cached.is_fresh();
                if let Some(old) = &cached.coin {
                    self.cached_coin_bytes = self.cached_coin_bytes.saturating_sub(old.memory_usage());
                }
            }
            Entry::Vacant(_) => {
                if !overwrite_allowed {
                    fresh = true;
                }
            }
        }
        self.cached_coin_bytes += coin.memory_usage();
        self.map.insert(
            outpoint,
            CachedCoin {
                coin: Some(coin),
                flags: FLAG_DIRTY | if fresh { FLAG_FRESH } else { 0 },
            },
        );
        Ok(())
    }

    /// Removes a coin from the view, returning it. Fresh entries vanish
    /// outright; others leave a dirty deletion for the next flush.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Coin, CoinsError> {
        self.fetch(outpoint)?;
        let Some(cached) = self.map.get_mut(outpoint) else {
            return Err(CoinsError::MissingCoin(*outpoint));
        };
        let Some(coin) = cached.coin.take() else {
            return Err(CoinsError::MissingCoin(*outpoint));
        };
        self.cached_coin_bytes = self.cached_coin_bytes.saturating_sub(coin.memory_usage());
        if cached.is_fresh() {
            self.map.remove(outpoint);
        } else {
            cached.flags |= FLAG_DIRTY;
        }
        Ok(coin)
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    /// Pushes all dirty entries into the base layer and empties this one.
    /// Returns whether anything was written.
    pub fn flush(&mut self) -> Result<bool, CoinsError> {
        let changes: Vec<(OutPoint, CachedCoin)> = self
            .map
            .drain()
            .filter(|(_, cached)| cached.is_dirty())
            .collect();
        let wrote = !changes.is_empty() || self.best_block.is_some();
        self.base.batch_write(changes, self.best_block)?;
        self.cached_coin_bytes = 0;
        Ok(wrote)
    }
}

impl<V: CoinsViewBacked> CoinsView for CoinsCache<V> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        match self.map.get(outpoint) {
            Some(cached) => Ok(cached.coin.clone()),
            None => self.base.get_coin(outpoint),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }
}

impl<V: CoinsViewBacked> CoinsViewBacked for CoinsCache<V> {
    fn batch_write(
        &mut self,
        changes: Vec<(OutPoint, CachedCoin)>,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        for (outpoint, incoming) in changes {
            if !incoming.is_dirty() {
                continue;
            }
            match self.map.entry(outpoint) {
                Entry::Occupied(mut entry) => {
                    let cached = entry.get_mut();
                    if let Some(old) = &cached.coin {
                        self.cached_coin_bytes =
                            self.cached_coin_bytes.saturating_sub(old.memory_usage());
                    }
                    if incoming.coin.is_none() && cached.is_fresh() {
                        entry.remove();
                        continue;
                    }
                    let cached = entry.into_mut();
                    if let Some(coin) = &incoming.coin {
                        self.cached_coin_bytes += coin.memory_usage();
                    }
                    cached.coin = incoming.coin;
                    cached.flags |= FLAG_DIRTY;
                }
                Entry::Vacant(entry) => {
                    if let Some(coin) = &incoming.coin {
                        self.cached_coin_bytes += coin.memory_usage();
                    }
                    entry.insert(incoming);
                }
            }
        }
        if best_block.is_some() {
            self.best_block = best_block;
        }
        Ok(())
    }
}

// A scratch layer can borrow the layer below it, so block connection runs
// against a throwaway view and flushes into the tip cache only on success.
impl<V: CoinsViewBacked> CoinsView for &mut CoinsCache<V> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        CoinsView::get_coin(&**self, outpoint)
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        CoinsView::best_block(&**self)
    }
}

impl<V: CoinsViewBacked> CoinsViewBacked for &mut CoinsCache<V> {
    fn batch_write(
        &mut self,
        changes: Vec<(OutPoint, CachedCoin)>,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        CoinsViewBacked::batch_write(&mut **self, changes, best_block)
    }
}
