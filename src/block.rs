use crate::error::{Result, TransferError};

/// Unit of write progress inside a chunk.
pub const BLOCK_SIZE: u64 = 8 * 1024;
/// Unit of completion tracking and of pull requests.
pub const CHUNK_SIZE: u64 = 1024 * 1024;
pub const BLOCKS_PER_CHUNK: u64 = CHUNK_SIZE / BLOCK_SIZE;

// Two 64-bit words hold exactly one chunk worth of blocks.
const _: () = assert!(BLOCKS_PER_CHUNK == 128);

/// Write progress of one chunk, one bit per block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    low: u64,
    high: u64,
    chunk_len: u64,
    total_blocks: u32,
}

impl BlockMap {
    /// `chunk_len` is at most [`CHUNK_SIZE`]; the last chunk of a file is usually shorter.
    pub fn new(chunk_len: u64) -> Self {
        assert!(
            chunk_len <= CHUNK_SIZE,
            "chunk length {chunk_len} is greater than {CHUNK_SIZE}"
        );
        Self {
            low: 0,
            high: 0,
            chunk_len,
            total_blocks: chunk_len.div_ceil(BLOCK_SIZE) as u32,
        }
    }

    /// Marks the blocks covered by `len` bytes written at the file offset `offset`.
    ///
    /// Only blocks that are fully covered count, except the trailing block of a
    /// short chunk which counts once the data reaches the end of the chunk.
    pub fn mark_written(&mut self, offset: u64, len: u64) -> Result<()> {
        if offset % BLOCK_SIZE != 0 {
            return Err(TransferError::MisalignedOffset(offset));
        }
        let start = offset % CHUNK_SIZE;
        let end = (start + len).min(self.chunk_len);

        let mut block_start = start;
        while block_start < end {
            let block_end = (block_start + BLOCK_SIZE).min(self.chunk_len);
            if end < block_end {
                break;
            }
            self.set((block_start / BLOCK_SIZE) as u32);
            block_start += BLOCK_SIZE;
        }
        Ok(())
    }

    fn set(&mut self, index: u32) {
        if index < 64 {
            self.low |= 1u64 << index;
        } else {
            self.high |= 1u64 << (index - 64);
        }
    }

    pub fn is_set(&self, index: u32) -> bool {
        match index {
            0..=63 => self.low & (1u64 << index) != 0,
            64..=127 => self.high & (1u64 << (index - 64)) != 0,
            _ => false,
        }
    }

    pub fn written_blocks(&self) -> u32 {
        self.low.count_ones() + self.high.count_ones()
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    pub fn is_complete(&self) -> bool {
        self.written_blocks() == self.total_blocks
    }
}
