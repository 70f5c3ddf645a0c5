//! Numbered, append-only block and undo files.
//!
//! Block records are framed `magic | length | block_bytes`; undo records add
//! a trailing `sha256d(prev_block_hash || undo_bytes)` checksum. A truncated
//! tail is legal (crash mid-write) and is healed by startup.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use coind_consensus::Hash256;
use coind_primitives::hash::sha256d;

use crate::filemeta::BlockFileInfo;

/// A block file rolls over once it would exceed this size.
pub const MAX_BLOCKFILE_SIZE: u64 = 128 * 1024 * 1024;
/// Block files grow in pre-allocated chunks of this size.
pub const BLOCKFILE_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
/// Undo files grow in pre-allocated chunks of this size.
pub const UNDOFILE_CHUNK_SIZE: u64 = 1024 * 1024;

/// Bytes of framing before block data: 4 magic + 4 length.
const RECORD_HEADER_SIZE: u64 = 8;
/// Undo records carry a 32-byte checksum after the data.
const UNDO_CHECKSUM_SIZE: u64 = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    /// Offset of the record header within the file.
    pub offset: u64,
    /// Length of the payload, excluding framing and checksum.
    pub len: u32,
}

impl FileLocation {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let file_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let offset = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[12..16].try_into().ok()?);
        Some(Self {
            file_id,
            offset,
            len,
        })
    }
}

#[derive(Debug)]
pub enum BlockFileError {
    Io(std::io::Error),
    /// Preallocation failed; the volume is out of space.
    DiskFull,
    BadMagic,
    LengthMismatch,
    ChecksumMismatch,
    InvalidLocation,
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io(err) => write!(f, "{err}"),
            BlockFileError::DiskFull => write!(f, "out of disk space"),
            BlockFileError::BadMagic => write!(f, "bad record magic"),
            BlockFileError::LengthMismatch => write!(f, "record length mismatch"),
            BlockFileError::ChecksumMismatch => write!(f, "undo checksum mismatch"),
            BlockFileError::InvalidLocation => write!(f, "invalid file location"),
        }
    }
}

impl std::error::Error for BlockFileError {}

impl From<std::io::Error> for BlockFileError {
    fn from(err: std::io::Error) -> Self {
        BlockFileError::Io(err)
    }
}

struct FilesState {
    infos: Vec<BlockFileInfo>,
    last_file: u32,
    dirty: HashSet<u32>,
}

/// Owns the `blk*.dat`/`rev*.dat` pair series and their logical-size
/// bookkeeping.
pub struct BlockFileManager {
    dir: PathBuf,
    magic: [u8; 4],
    max_file_size: u64,
    state: Mutex<FilesState>,
}

impl BlockFileManager {
    pub fn new(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Result<Self, BlockFileError> {
        Self::with_max_file_size(dir, magic, MAX_BLOCKFILE_SIZE)
    }

    /// Test and debug entry point: tiny files make pruning reachable on
    /// short chains.
    pub fn with_max_file_size(
        dir: impl Into<PathBuf>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, BlockFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            magic,
            max_file_size,
            state: Mutex::new(FilesState {
                infos: vec![BlockFileInfo::default()],
                last_file: 0,
                dirty: HashSet::new(),
            }),
        })
    }

    /// Restores bookkeeping persisted in the index store.
    pub fn load(&self, infos: Vec<BlockFileInfo>, last_file: u32) {
        let mut state = self.state.lock().expect("block file lock");
        state.infos = infos;
        if state.infos.is_empty() {
            state.infos.push(BlockFileInfo::default());
        }
        state.last_file = last_file.min(state.infos.len() as u32 - 1);
        state.dirty.clear();
    }

    pub fn block_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("blk{file_id:05}.dat"))
    }

    pub fn undo_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("rev{file_id:05}.dat"))
    }

    pub fn last_file(&self) -> u32 {
        self.state.lock().expect("block file lock").last_file
    }

    pub fn file_info(&self, file_id: u32) -> Option<BlockFileInfo> {
        let state = self.state.lock().expect("block file lock");
        state.infos.get(file_id as usize).copied()
    }

    /// File-info entries mutated since the last call, for persisting.
    pub fn take_dirty_infos(&self) -> Vec<(u32, BlockFileInfo)> {
        let mut state = self.state.lock().expect("block file lock");
        let mut out: Vec<(u32, BlockFileInfo)> = state
            .dirty
            .iter()
            .filter_map(|&id| state.infos.get(id as usize).map(|info| (id, *info)))
            .collect();
        state.dirty.clear();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Files whose highest contained block is at or below `height`; the set a
    /// prune pass may delete.
    pub fn files_below_height(&self, height: i32) -> Vec<u32> {
        let state = self.state.lock().expect("block file lock");
        state
            .infos
            .iter()
            .enumerate()
            .filter(|(id, info)| {
                *id != state.last_file as usize && info.blocks > 0 && info.height_last <= height
            })
            .map(|(id, _)| id as u32)
            .collect()
    }

    /// Chooses where the next block of `size` payload bytes lands, rolling to
    /// a new file when the current one is full and pre-allocating chunks
    /// ahead of the write.
    pub fn find_block_pos(
        &self,
        size: u32,
        height: i32,
        time: u32,
    ) -> Result<FileLocation, BlockFileError> {
        let record = RECORD_HEADER_SIZE + size as u64;
        let mut state = self.state.lock().expect("block file lock");
        let mut file_id = state.last_file;
        loop {
            let info = &state.infos[file_id as usize];
            if info.size + record < self.max_file_size {
                break;
            }
            // Finalize the filled file: drop preallocated slack and sync.
            let (size, undo_size) = (info.size, info.undo_size);
            self.flush_file_at(file_id, size, undo_size, true)?;
            file_id += 1;
            if state.infos.len() <= file_id as usize {
                state.infos.push(BlockFileInfo::default());
            }
        }
        state.last_file = file_id;

        let offset = state.infos[file_id as usize].size;
        self.preallocate(
            &self.block_path(file_id),
            offset,
            record,
            BLOCKFILE_CHUNK_SIZE.min(self.max_file_size),
        )?;

        let info = &mut state.infos[file_id as usize];
        info.size += record;
        info.add_block(height, time);
        state.dirty.insert(file_id);
        Ok(FileLocation {
            file_id,
            offset,
            len: size,
        })
    }

    /// Chooses where a block's undo record lands; undo always goes in the
    /// file pairing the block's data file.
    pub fn find_undo_pos(&self, file_id: u32, size: u32) -> Result<FileLocation, BlockFileError> {
        let record = RECORD_HEADER_SIZE + size as u64 + UNDO_CHECKSUM_SIZE;
        let mut state = self.state.lock().expect("block file lock");
        let info = state
            .infos
            .get_mut(file_id as usize)
            .ok_or(BlockFileError::InvalidLocation)?;
        let offset = info.undo_size;
        info.undo_size += record;
        state.dirty.insert(file_id);
        drop(state);
        self.preallocate(
            &self.undo_path(file_id),
            offset,
            record,
            UNDOFILE_CHUNK_SIZE,
        )?;
        Ok(FileLocation {
            file_id,
            offset,
            len: size,
        })
    }

    pub fn write_block(&self, location: FileLocation, bytes: &[u8]) -> Result<(), BlockFileError> {
        if bytes.len() != location.len as usize {
            return Err(BlockFileError::LengthMismatch);
        }
        let mut file = open_rw(&self.block_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        file.write_all(&self.magic)?;
        file.write_all(&location.len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    pub fn read_block(&self, location: FileLocation) -> Result<Vec<u8>, BlockFileError> {
        if location.len == 0 {
            return Err(BlockFileError::InvalidLocation);
        }
        let mut file = File::open(self.block_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(BlockFileError::BadMagic);
        }
        let stored_len = u32::from_le_bytes(header[4..8].try_into().expect("framing length"));
        if stored_len != location.len {
            return Err(BlockFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn write_undo(
        &self,
        location: FileLocation,
        bytes: &[u8],
        prev_block_hash: &Hash256,
    ) -> Result<(), BlockFileError> {
        if bytes.len() != location.len as usize {
            return Err(BlockFileError::LengthMismatch);
        }
        let mut file = open_rw(&self.undo_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        file.write_all(&self.magic)?;
        file.write_all(&location.len.to_le_bytes())?;
        file.write_all(bytes)?;
        file.write_all(&undo_checksum(prev_block_hash, bytes))?;
        file.flush()?;
        Ok(())
    }

    pub fn read_undo(
        &self,
        location: FileLocation,
        prev_block_hash: &Hash256,
    ) -> Result<Vec<u8>, BlockFileError> {
        let mut file = File::open(self.undo_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header)?;
        if header[0..4] != self.magic {
            return Err(BlockFileError::BadMagic);
        }
        let stored_len = u32::from_le_bytes(header[4..8].try_into().expect("framing length"));
        if stored_len != location.len {
            return Err(BlockFileError::LengthMismatch);
        }
        let mut buffer = vec![0u8; stored_len as usize];
        file.read_exact(&mut buffer)?;
        let mut checksum = [0u8; 32];
        file.read_exact(&mut checksum)?;
        if checksum != undo_checksum(prev_block_hash, &buffer) {
            return Err(BlockFileError::ChecksumMismatch);
        }
        Ok(buffer)
    }

    /// Syncs the active file pair; when finalizing, first truncates away the
    /// preallocated slack beyond the logical sizes.
    pub fn flush_file(&self, file_id: u32, finalize: bool) -> Result<(), BlockFileError> {
        let (size, undo_size) = {
            let state = self.state.lock().expect("block file lock");
            let info = state
                .infos
                .get(file_id as usize)
                .ok_or(BlockFileError::InvalidLocation)?;
            (info.size, info.undo_size)
        };
        self.flush_file_at(file_id, size, undo_size, finalize)
    }

    fn flush_file_at(
        &self,
        file_id: u32,
        size: u64,
        undo_size: u64,
        finalize: bool,
    ) -> Result<(), BlockFileError> {
        for (path, logical) in [
            (self.block_path(file_id), size),
            (self.undo_path(file_id), undo_size),
        ] {
            if !path.exists() {
                continue;
            }
            let file = open_rw(&path)?;
            if finalize {
                file.set_len(logical)?;
            }
            file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a file pair and clears its bookkeeping. The caller is
    /// responsible for having cleared every index entry pointing into it.
    pub fn delete_files(&self, file_ids: &[u32]) -> Result<(), BlockFileError> {
        let mut state = self.state.lock().expect("block file lock");
        for &file_id in file_ids {
            for path in [self.block_path(file_id), self.undo_path(file_id)] {
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            if let Some(info) = state.infos.get_mut(file_id as usize) {
                *info = BlockFileInfo::default();
                state.dirty.insert(file_id);
            }
        }
        Ok(())
    }

    /// Grows the file to the chunk boundary covering `offset + record`.
    /// Failure to grow is treated as the volume running out of space.
    fn preallocate(
        &self,
        path: &Path,
        offset: u64,
        record: u64,
        chunk: u64,
    ) -> Result<(), BlockFileError> {
        let file = open_rw(path)?;
        let needed_end = offset + record;
        let target = needed_end.div_ceil(chunk) * chunk;
        let current = file.metadata()?.len();
        if current < target {
            file.set_len(target).map_err(|_| BlockFileError::DiskFull)?;
        }
        Ok(())
    }
}

fn open_rw(path: &Path) -> Result<File, std::io::Error> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
}

fn undo_checksum(prev_block_hash: &Hash256, bytes: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(32 + bytes.len());
    data.extend_from_slice(prev_block_hash);
    data.extend_from_slice(bytes);
    sha256d(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    fn manager() -> (tempfile::TempDir, BlockFileManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = BlockFileManager::new(dir.path(), MAGIC).expect("manager");
        (dir, files)
    }

    #[test]
    fn block_write_read_round_trip() {
        let (_dir, files) = manager();
        let payload = vec![7u8; 200];
        let loc = files
            .find_block_pos(payload.len() as u32, 1, 1_000)
            .expect("pos");
        files.write_block(loc, &payload).expect("write");
        assert_eq!(files.read_block(loc).expect("read"), payload);
    }

    #[test]
    fn records_are_framed_with_magic_and_length() {
        let (dir, files) = manager();
        let payload = vec![9u8; 16];
        let loc = files.find_block_pos(16, 0, 1).expect("pos");
        files.write_block(loc, &payload).expect("write");

        let raw = std::fs::read(dir.path().join("blk00000.dat")).expect("raw");
        assert_eq!(&raw[0..4], &MAGIC);
        assert_eq!(u32::from_le_bytes(raw[4..8].try_into().unwrap()), 16);
        assert_eq!(&raw[8..24], payload.as_slice());
    }

    #[test]
    fn undo_checksum_detects_corruption() {
        let (dir, files) = manager();
        let payload = vec![3u8; 64];
        let prev = [0xaau8; 32];
        let loc = files.find_undo_pos(0, payload.len() as u32).expect("pos");
        files.write_undo(loc, &payload, &prev).expect("write");
        assert_eq!(files.read_undo(loc, &prev).expect("read"), payload);

        // Wrong parent hash fails the checksum.
        assert!(matches!(
            files.read_undo(loc, &[0xbbu8; 32]),
            Err(BlockFileError::ChecksumMismatch)
        ));

        // Flip a payload byte on disk.
        let path = dir.path().join("rev00000.dat");
        let mut raw = std::fs::read(&path).expect("raw");
        raw[9] ^= 0xff;
        std::fs::write(&path, raw).expect("rewrite");
        assert!(matches!(
            files.read_undo(loc, &prev),
            Err(BlockFileError::ChecksumMismatch)
        ));
    }

    #[test]
    fn preallocation_rounds_to_chunks() {
        let (dir, files) = manager();
        let loc = files.find_block_pos(100, 0, 1).expect("pos");
        files.write_block(loc, &vec![1u8; 100]).expect("write");
        let len = std::fs::metadata(dir.path().join("blk00000.dat"))
            .expect("meta")
            .len();
        assert_eq!(len, BLOCKFILE_CHUNK_SIZE);
    }

    #[test]
    fn finalize_truncates_to_logical_size() {
        let (dir, files) = manager();
        let loc = files.find_block_pos(100, 0, 1).expect("pos");
        files.write_block(loc, &vec![1u8; 100]).expect("write");
        files.flush_file(0, true).expect("flush");
        let len = std::fs::metadata(dir.path().join("blk00000.dat"))
            .expect("meta")
            .len();
        assert_eq!(len, 108);
    }

    #[test]
    fn file_rolls_when_full() {
        let (_dir, files) = manager();
        {
            let mut state = files.state.lock().expect("lock");
            state.infos[0].size = MAX_BLOCKFILE_SIZE - 50;
            state.infos[0].blocks = 1;
            state.infos[0].height_last = 9;
        }
        let loc = files.find_block_pos(100, 10, 1_000).expect("pos");
        assert_eq!(loc.file_id, 1);
        assert_eq!(loc.offset, 0);
        assert_eq!(files.last_file(), 1);
    }

    #[test]
    fn prune_candidates_and_deletion() {
        let (dir, files) = manager();
        let loc = files.find_block_pos(50, 5, 500).expect("pos");
        files.write_block(loc, &vec![2u8; 50]).expect("write");
        {
            let mut state = files.state.lock().expect("lock");
            state.infos[0].size = MAX_BLOCKFILE_SIZE;
        }
        let loc1 = files.find_block_pos(50, 6, 600).expect("pos");
        assert_eq!(loc1.file_id, 1);

        assert_eq!(files.files_below_height(5), vec![0]);
        assert!(files.files_below_height(4).is_empty());

        files.delete_files(&[0]).expect("delete");
        assert!(!dir.path().join("blk00000.dat").exists());
        assert_eq!(files.file_info(0).expect("info"), BlockFileInfo::default());
    }

    #[test]
    fn location_codec_round_trip() {
        let loc = FileLocation {
            file_id: 3,
            offset: 77,
            len: 1_024,
        };
        assert_eq!(FileLocation::decode(&loc.encode()), Some(loc));
        assert_eq!(FileLocation::decode(&[0u8; 5]), None);
    }
}
