//! Per-file bookkeeping for the numbered block and undo files.

use coind_primitives::encoding::{DecodeError, Decoder, Encoder};

pub const META_LAST_BLOCK_FILE_KEY: &[u8] = b"files:last_block_file";

const FILE_INFO_PREFIX: &[u8] = b"files:info:";

/// What the index remembers about one `blk`/`rev` file pair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    /// Bytes of block records written (logical size, not preallocation).
    pub size: u64,
    /// Bytes of undo records written to the companion file.
    pub undo_size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: i32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
        self.blocks += 1;
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_u64_le(self.undo_size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let blocks = decoder.read_u32_le()?;
        let size = decoder.read_u64_le()?;
        let undo_size = decoder.read_u64_le()?;
        let height_first = decoder.read_i32_le()?;
        let height_last = decoder.read_i32_le()?;
        let time_first = decoder.read_u32_le()?;
        let time_last = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            blocks,
            size,
            undo_size,
            height_first,
            height_last,
            time_first,
            time_last,
        })
    }
}

pub fn file_info_key(file_id: u32) -> [u8; FILE_INFO_PREFIX.len() + 4] {
    let mut key = [0u8; FILE_INFO_PREFIX.len() + 4];
    key[..FILE_INFO_PREFIX.len()].copy_from_slice(FILE_INFO_PREFIX);
    key[FILE_INFO_PREFIX.len()..].copy_from_slice(&file_id.to_le_bytes());
    key
}

pub fn parse_file_info_key(key: &[u8]) -> Option<u32> {
    if key.len() != FILE_INFO_PREFIX.len() + 4 || !key.starts_with(FILE_INFO_PREFIX) {
        return None;
    }
    let mut id_bytes = [0u8; 4];
    id_bytes.copy_from_slice(&key[FILE_INFO_PREFIX.len()..]);
    Some(u32::from_le_bytes(id_bytes))
}
