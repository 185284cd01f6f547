//! Sequential offsets
//!
//! Walks the range front to back in block-size steps. Offsets are strictly
//! increasing and never overlap; the final block is shortened if the range length
//! is not a multiple of the block size.

use super::{FileOffsetGenerator, FileRange};

pub struct SequentialOffsets {
    range: FileRange,
    block_size: usize,
    bytes_left: u64,
}

impl SequentialOffsets {
    pub fn new(range: FileRange, block_size: usize) -> Self {
        Self {
            range,
            block_size,
            bytes_left: range.len,
        }
    }
}

impl FileOffsetGenerator for SequentialOffsets {
    fn reset(&mut self) {
        self.bytes_left = self.range.len;
    }

    fn num_bytes_total(&self) -> u64 {
        self.range.len
    }

    fn num_bytes_left_to_submit(&self) -> u64 {
        self.bytes_left
    }

    #[inline(always)]
    fn next_offset(&mut self) -> u64 {
        self.range.start + (self.range.len - self.bytes_left)
    }

    #[inline(always)]
    fn next_block_size(&self) -> usize {
        (self.block_size as u64).min(self.bytes_left) as usize
    }

    #[inline(always)]
    fn add_bytes_submitted(&mut self, num_bytes: u64) {
        self.bytes_left = self.bytes_left.saturating_sub(num_bytes);
    }
}
