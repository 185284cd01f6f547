//! File offset generation
//!
//! An offset generator produces the `(offset, length)` sequence one worker issues
//! against one file (or one range of a shared file) during one phase. Generators
//! are lazy and finite: the worker pulls blocks until
//! [`FileOffsetGenerator::num_bytes_left_to_submit`] reaches zero, then calls
//! [`FileOffsetGenerator::reset`] before moving on to the next file.
//!
//! # Access patterns
//!
//! - **Sequential**: partitions `[start, start+len)` into consecutive blocks, the
//!   last one possibly shorter than the block size.
//! - **Random aligned** (default random mode): block-aligned offsets drawn
//!   uniformly from the range, repetition allowed, until the random amount has
//!   been submitted.
//! - **Random unaligned**: like random aligned, but offsets may start at any byte
//!   as long as a full block fits into the range.
//!
//! # Example
//!
//! ```
//! use phasebench::offset::{create_offset_generator, AccessPattern, FileRange};
//!
//! let range = FileRange { start: 0, len: 10 * 4096 };
//! let mut gen = create_offset_generator(AccessPattern::Sequential, range, 4096, None);
//!
//! let mut blocks = 0;
//! while let Some(block) = gen.next_block() {
//!     assert_eq!(block.offset, blocks * 4096);
//!     blocks += 1;
//! }
//! assert_eq!(blocks, 10);
//! ```

pub mod random;
pub mod sequential;

use serde::{Deserialize, Serialize};

/// One block to submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub len: usize,
}

/// Byte range `[start, start+len)` of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileRange {
    pub start: u64,
    pub len: u64,
}

impl FileRange {
    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// Offset access pattern for data phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessPattern {
    #[default]
    Sequential,
    RandomAligned,
    RandomUnaligned,
}

impl AccessPattern {
    pub fn is_random(&self) -> bool {
        !matches!(self, AccessPattern::Sequential)
    }
}

/// Producer of the per-file block sequence
///
/// Implementations are owned by exactly one worker and are `Send` so they can be
/// moved into the worker thread.
pub trait FileOffsetGenerator: Send {
    /// Rewind to the beginning for the next file
    fn reset(&mut self);

    /// Total number of bytes this generator yields between resets
    fn num_bytes_total(&self) -> u64;

    /// Bytes not yet handed out by [`add_bytes_submitted`](Self::add_bytes_submitted)
    fn num_bytes_left_to_submit(&self) -> u64;

    /// Offset for the next block
    ///
    /// Sequential generators return the same value until bytes are submitted;
    /// random generators draw a new offset on every call, so call this once per
    /// block.
    fn next_offset(&mut self) -> u64;

    /// Length of the next block (the block size, or the remainder at the end)
    fn next_block_size(&self) -> usize;

    /// Advance the generator by `num_bytes`
    fn add_bytes_submitted(&mut self, num_bytes: u64);

    /// Pull the next block, or `None` once the generator is exhausted
    fn next_block(&mut self) -> Option<Block> {
        if self.num_bytes_left_to_submit() == 0 {
            return None;
        }

        let len = self.next_block_size();
        let offset = self.next_offset();
        self.add_bytes_submitted(len as u64);

        Some(Block { offset, len })
    }
}

/// Create the generator for one phase
///
/// `random_amount` bounds the bytes a random generator yields per file; it
/// defaults to the range length. Sequential generators ignore it.
pub fn create_offset_generator(
    pattern: AccessPattern,
    range: FileRange,
    block_size: usize,
    random_amount: Option<u64>,
) -> Box<dyn FileOffsetGenerator> {
    let amount = random_amount.unwrap_or(range.len);

    match pattern {
        AccessPattern::Sequential => Box::new(sequential::SequentialOffsets::new(range, block_size)),
        AccessPattern::RandomAligned => {
            Box::new(random::RandomAlignedOffsets::new(range, block_size, amount))
        }
        AccessPattern::RandomUnaligned => {
            Box::new(random::RandomUnalignedOffsets::new(range, block_size, amount))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_respects_random_amount() {
        let range = FileRange { start: 0, len: 1 << 20 };
        let gen = create_offset_generator(AccessPattern::RandomAligned, range, 4096, Some(64 * 1024));
        assert_eq!(gen.num_bytes_total(), 64 * 1024);

        let gen = create_offset_generator(AccessPattern::Sequential, range, 4096, Some(64 * 1024));
        assert_eq!(gen.num_bytes_total(), 1 << 20);
    }

    #[test]
    fn test_next_block_stops_after_exhaustion() {
        let range = FileRange { start: 0, len: 3000 };
        let mut gen = create_offset_generator(AccessPattern::Sequential, range, 4096, None);

        assert_eq!(gen.next_block(), Some(Block { offset: 0, len: 3000 }));
        assert_eq!(gen.next_block(), None);
        assert_eq!(gen.next_block(), None);
    }

    #[test]
    fn test_access_pattern_is_random() {
        assert!(!AccessPattern::Sequential.is_random());
        assert!(AccessPattern::RandomAligned.is_random());
        assert!(AccessPattern::RandomUnaligned.is_random());
    }
}
