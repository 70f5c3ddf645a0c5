//! The block tree: every known header, the active chain, and the orderings
//! the best-chain activator relies on.

use std::cmp::Reverse;
use std::collections::HashMap;

use coind_consensus::constants::MEDIAN_TIME_SPAN;
use coind_consensus::Hash256;
use coind_pow::block_proof;
use coind_primitives::block::BlockHeader;
use coind_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use primitive_types::U256;

use crate::flatfiles::FileLocation;

pub const STATUS_HAVE_DATA: u32 = 1 << 0;
pub const STATUS_HAVE_UNDO: u32 = 1 << 1;
pub const STATUS_VALID_TREE: u32 = 1 << 2;
pub const STATUS_VALID_TRANSACTIONS: u32 = 1 << 3;
pub const STATUS_VALID_CHAIN: u32 = 1 << 4;
pub const STATUS_VALID_SCRIPTS: u32 = 1 << 5;
pub const STATUS_FAILED_VALID: u32 = 1 << 6;
pub const STATUS_FAILED_CHILD: u32 = 1 << 7;

pub const STATUS_FAILED_MASK: u32 = STATUS_FAILED_VALID | STATUS_FAILED_CHILD;
const STATUS_VALIDITY_MASK: u32 =
    STATUS_VALID_TREE | STATUS_VALID_TRANSACTIONS | STATUS_VALID_CHAIN | STATUS_VALID_SCRIPTS;

/// Validity milestones in increasing order. Reaching one implies all below.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Validity {
    Tree,
    Transactions,
    Chain,
    Scripts,
}

impl Validity {
    fn bits(self) -> u32 {
        match self {
            Validity::Tree => STATUS_VALID_TREE,
            Validity::Transactions => STATUS_VALID_TREE | STATUS_VALID_TRANSACTIONS,
            Validity::Chain => {
                STATUS_VALID_TREE | STATUS_VALID_TRANSACTIONS | STATUS_VALID_CHAIN
            }
            Validity::Scripts => STATUS_VALIDITY_MASK,
        }
    }
}

/// A node in the block tree. Entries live in the [`BlockIndexArena`] for the
/// life of the process; `prev` and `skip` are arena indices.
#[derive(Clone, Debug)]
pub struct BlockIndex {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub prev: Option<usize>,
    pub skip: Option<usize>,
    pub height: i32,
    pub chain_work: U256,
    pub status: u32,
    /// Transactions in this block; zero until the body arrives.
    pub tx_count: u32,
    /// Transactions on the chain up to and including this block; zero while
    /// any ancestor body is missing.
    pub chain_tx_count: u64,
    pub file: Option<FileLocation>,
    pub undo: Option<FileLocation>,
    /// Order of body arrival; tie-breaker between equal-work tips.
    pub sequence_id: i32,
    /// Maximum timestamp on the path from genesis to this block.
    pub time_max: u32,
}

impl BlockIndex {
    pub fn has_data(&self) -> bool {
        (self.status & STATUS_HAVE_DATA) != 0
    }

    pub fn has_undo(&self) -> bool {
        (self.status & STATUS_HAVE_UNDO) != 0
    }

    pub fn is_failed(&self) -> bool {
        (self.status & STATUS_FAILED_MASK) != 0
    }

    pub fn is_valid_at_least(&self, level: Validity) -> bool {
        if self.is_failed() {
            return false;
        }
        let bits = level.bits();
        (self.status & bits) == bits
    }

    pub fn raise_validity(&mut self, level: Validity) -> bool {
        if self.is_failed() {
            return false;
        }
        let bits = level.bits();
        if (self.status & bits) == bits {
            return false;
        }
        self.status |= bits;
        true
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

/// Ancestor height targeted by the skip pointer of a block at `height`.
fn skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Owns every [`BlockIndex`]. Entries are never removed; all other structures
/// refer to them by index.
#[derive(Default)]
pub struct BlockIndexArena {
    entries: Vec<BlockIndex>,
    by_hash: HashMap<Hash256, usize>,
}

impl BlockIndexArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> &BlockIndex {
        &self.entries[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut BlockIndex {
        &mut self.entries[idx]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BlockIndex)> {
        self.entries.iter().enumerate()
    }

    /// Inserts a header whose parent (if any) is already present, deriving
    /// height, cumulative work, skip pointer and max time.
    pub fn insert(&mut self, header: BlockHeader) -> usize {
        let hash = header.hash();
        if let Some(existing) = self.lookup(&hash) {
            return existing;
        }
        let prev = self.by_hash.get(&header.prev_block).copied();
        let (height, parent_work, parent_time_max) = match prev {
            Some(parent) => {
                let parent = &self.entries[parent];
                (parent.height + 1, parent.chain_work, parent.time_max)
            }
            None => (0, U256::zero(), 0),
        };
        let idx = self.entries.len();
        let skip = prev.map(|_| self.ancestor_of(prev, skip_height(height)).unwrap_or(0));
        self.entries.push(BlockIndex {
            hash,
            prev,
            skip,
            height,
            chain_work: parent_work + block_proof(header.bits),
            status: STATUS_VALID_TREE,
            tx_count: 0,
            chain_tx_count: 0,
            file: None,
            undo: None,
            sequence_id: 0,
            time_max: parent_time_max.max(header.time),
            header,
        });
        self.by_hash.insert(hash, idx);
        idx
    }

    /// Re-inserts an entry loaded from disk. The caller links parents and
    /// recomputes derived fields once every entry is present.
    pub fn insert_loaded(&mut self, entry: BlockIndex) -> usize {
        let idx = self.entries.len();
        self.by_hash.insert(entry.hash, idx);
        self.entries.push(entry);
        idx
    }

    pub fn link_loaded(&mut self) {
        let prev_of: Vec<Option<usize>> = self
            .entries
            .iter()
            .map(|entry| self.by_hash.get(&entry.header.prev_block).copied())
            .collect();
        for (idx, prev) in prev_of.into_iter().enumerate() {
            // Genesis points at the all-zero hash which is never indexed.
            self.entries[idx].prev = prev.filter(|&p| p != idx);
        }
    }

    fn ancestor_of(&self, start: Option<usize>, height: i32) -> Option<usize> {
        let mut idx = start?;
        if height > self.entries[idx].height || height < 0 {
            return None;
        }
        while self.entries[idx].height != height {
            let entry = &self.entries[idx];
            // Follow the skip pointer while it lands at or beyond the target,
            // otherwise fall back to the parent link.
            match entry.skip {
                Some(skip) if self.entries[skip].height >= height => idx = skip,
                _ => idx = entry.prev?,
            }
        }
        Some(idx)
    }

    /// Ancestor of `idx` at `height`, walking skip pointers.
    pub fn ancestor(&self, idx: usize, height: i32) -> Option<usize> {
        self.ancestor_of(Some(idx), height)
    }

    pub fn last_common_ancestor(&self, a: usize, b: usize) -> usize {
        let (mut a, mut b) = (a, b);
        let shared_height = self.entries[a].height.min(self.entries[b].height);
        a = self.ancestor(a, shared_height).unwrap_or(a);
        b = self.ancestor(b, shared_height).unwrap_or(b);
        while a != b {
            match (self.entries[a].prev, self.entries[b].prev) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        a
    }

    /// Median of the last eleven block timestamps ending at `idx`.
    pub fn median_time_past(&self, idx: usize) -> i64 {
        let mut times: Vec<i64> = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(idx);
        while let Some(current) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = &self.entries[current];
            times.push(entry.header.time as i64);
            cursor = entry.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Whether `ancestor` lies on the path from genesis to `descendant`.
    pub fn is_ancestor(&self, ancestor: usize, descendant: usize) -> bool {
        self.ancestor(descendant, self.entries[ancestor].height) == Some(ancestor)
    }
}

/// The active chain: a height-indexed vector of arena indices.
#[derive(Default)]
pub struct Chain {
    items: Vec<usize>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn height(&self) -> i32 {
        self.items.len() as i32 - 1
    }

    pub fn tip(&self) -> Option<usize> {
        self.items.last().copied()
    }

    pub fn at(&self, height: i32) -> Option<usize> {
        if height < 0 {
            return None;
        }
        self.items.get(height as usize).copied()
    }

    pub fn contains(&self, arena: &BlockIndexArena, idx: usize) -> bool {
        self.at(arena.get(idx).height) == Some(idx)
    }

    pub fn next(&self, arena: &BlockIndexArena, idx: usize) -> Option<usize> {
        if self.contains(arena, idx) {
            self.at(arena.get(idx).height + 1)
        } else {
            None
        }
    }

    /// Rebuilds the vector so that it ends at `tip`, reusing the shared
    /// prefix.
    pub fn set_tip(&mut self, arena: &BlockIndexArena, tip: Option<usize>) {
        let Some(tip) = tip else {
            self.items.clear();
            return;
        };
        let height = arena.get(tip).height;
        self.items.resize((height + 1) as usize, usize::MAX);
        let mut cursor = Some(tip);
        while let Some(idx) = cursor {
            let entry_height = arena.get(idx).height as usize;
            if self.items[entry_height] == idx {
                break;
            }
            self.items[entry_height] = idx;
            cursor = arena.get(idx).prev;
        }
    }

    /// Sparse locator: recent blocks densely, then exponentially thinning
    /// steps back to genesis. Used to find a fork point with a peer.
    pub fn locator(&self, arena: &BlockIndexArena) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let Some(tip) = self.tip() else {
            return hashes;
        };
        let mut height = arena.get(tip).height;
        let mut step = 1i32;
        loop {
            let Some(idx) = self.at(height) else { break };
            hashes.push(arena.get(idx).hash);
            if height == 0 {
                break;
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height = (height - step).max(0);
        }
        hashes
    }

    /// Last block shared with the (possibly off-chain) `idx`.
    pub fn find_fork(&self, arena: &BlockIndexArena, idx: usize) -> Option<usize> {
        let mut cursor = idx;
        if arena.get(cursor).height > self.height() {
            cursor = arena.ancestor(cursor, self.height())?;
        }
        while !self.contains(arena, cursor) {
            cursor = arena.get(cursor).prev?;
        }
        Some(cursor)
    }
}

/// Ordering key for the candidate-tip set. `BTreeSet::last` yields the best
/// tip: most work, then earliest-seen body, then earliest allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct CandidateKey {
    pub work: U256,
    pub sequence: Reverse<i32>,
    pub index: Reverse<usize>,
}

impl CandidateKey {
    pub fn for_block(entry: &BlockIndex, idx: usize) -> Self {
        Self {
            work: entry.chain_work,
            sequence: Reverse(entry.sequence_id),
            index: Reverse(idx),
        }
    }
}

/// On-disk form of a block-index entry. Work, skip pointers and chain-tx
/// totals are recomputed at load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskBlockIndex {
    pub header: BlockHeader,
    pub height: i32,
    pub status: u32,
    pub tx_count: u32,
    pub file: Option<FileLocation>,
    pub undo: Option<FileLocation>,
}

impl DiskBlockIndex {
    pub fn from_entry(entry: &BlockIndex) -> Self {
        Self {
            header: entry.header,
            height: entry.height,
            status: entry.status,
            tx_count: entry.tx_count,
            file: entry.file,
            undo: entry.undo,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.consensus_encode(&mut encoder);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.status);
        encoder.write_u32_le(self.tx_count);
        match self.file {
            Some(location) => {
                encoder.write_u8(1);
                encoder.write_bytes(&location.encode());
            }
            None => encoder.write_u8(0),
        }
        match self.undo {
            Some(location) => {
                encoder.write_u8(1);
                encoder.write_bytes(&location.encode());
            }
            None => encoder.write_u8(0),
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        let height = decoder.read_i32_le()?;
        let status = decoder.read_u32_le()?;
        let tx_count = decoder.read_u32_le()?;
        let file = if decoder.read_u8()? != 0 {
            Some(
                FileLocation::decode(&decoder.read_fixed::<16>()?)
                    .ok_or(DecodeError::InvalidData("invalid file location"))?,
            )
        } else {
            None
        };
        let undo = if decoder.read_u8()? != 0 {
            Some(
                FileLocation::decode(&decoder.read_fixed::<16>()?)
                    .ok_or(DecodeError::InvalidData("invalid undo location"))?,
            )
        } else {
            None
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            height,
            status,
            tx_count,
            file,
            undo,
        })
    }
}
