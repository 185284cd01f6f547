//! Random offsets
//!
//! Both generators draw offsets uniformly from the range with xoshiro256++ and
//! stop once `amount` bytes have been submitted. Offsets may repeat. Every block
//! fits entirely inside the range.

use super::{FileOffsetGenerator, FileRange};
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Block-aligned random offsets
///
/// Offsets are `start + k * block_size` for a uniformly drawn block index `k`, so
/// they are aligned whenever the range start is.
pub struct RandomAlignedOffsets {
    range: FileRange,
    block_size: usize,
    num_blocks: u64,
    amount: u64,
    bytes_left: u64,
    rng: Xoshiro256PlusPlus,
}

impl RandomAlignedOffsets {
    pub fn new(range: FileRange, block_size: usize, amount: u64) -> Self {
        Self::with_rng(range, block_size, amount, Xoshiro256PlusPlus::from_entropy())
    }

    /// Reproducible sequence for tests
    pub fn with_seed(range: FileRange, block_size: usize, amount: u64, seed: u64) -> Self {
        Self::with_rng(range, block_size, amount, Xoshiro256PlusPlus::seed_from_u64(seed))
    }

    fn with_rng(range: FileRange, block_size: usize, amount: u64, rng: Xoshiro256PlusPlus) -> Self {
        let num_blocks = if block_size == 0 {
            0
        } else {
            range.len / block_size as u64
        };

        Self {
            range,
            block_size,
            num_blocks,
            amount,
            bytes_left: amount,
            rng,
        }
    }
}

impl FileOffsetGenerator for RandomAlignedOffsets {
    fn reset(&mut self) {
        self.bytes_left = self.amount;
    }

    fn num_bytes_total(&self) -> u64 {
        self.amount
    }

    fn num_bytes_left_to_submit(&self) -> u64 {
        self.bytes_left
    }

    #[inline(always)]
    fn next_offset(&mut self) -> u64 {
        if self.num_blocks == 0 {
            return self.range.start;
        }
        self.range.start + self.rng.gen_range(0..self.num_blocks) * self.block_size as u64
    }

    #[inline(always)]
    fn next_block_size(&self) -> usize {
        let len = (self.block_size as u64).min(self.bytes_left);
        // a range shorter than one block can only take a short block
        len.min(self.range.len) as usize
    }

    #[inline(always)]
    fn add_bytes_submitted(&mut self, num_bytes: u64) {
        self.bytes_left = self.bytes_left.saturating_sub(num_bytes);
    }
}

/// Unaligned random offsets
///
/// Offsets are drawn from `[start, start + len - block_size]`, so they can start
/// at any byte.
pub struct RandomUnalignedOffsets {
    range: FileRange,
    block_size: usize,
    amount: u64,
    bytes_left: u64,
    rng: Xoshiro256PlusPlus,
}

impl RandomUnalignedOffsets {
    pub fn new(range: FileRange, block_size: usize, amount: u64) -> Self {
        Self {
            range,
            block_size,
            amount,
            bytes_left: amount,
            rng: Xoshiro256PlusPlus::from_entropy(),
        }
    }

    pub fn with_seed(range: FileRange, block_size: usize, amount: u64, seed: u64) -> Self {
        Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            ..Self::new(range, block_size, amount)
        }
    }
}

impl FileOffsetGenerator for RandomUnalignedOffsets {
    fn reset(&mut self) {
        self.bytes_left = self.amount;
    }

    fn num_bytes_total(&self) -> u64 {
        self.amount
    }

    fn num_bytes_left_to_submit(&self) -> u64 {
        self.bytes_left
    }

    #[inline(always)]
    fn next_offset(&mut self) -> u64 {
        let bs = self.block_size as u64;
        if self.range.len <= bs {
            return self.range.start;
        }
        self.range.start + self.rng.gen_range(0..=self.range.len - bs)
    }

    #[inline(always)]
    fn next_block_size(&self) -> usize {
        (self.block_size as u64).min(self.bytes_left).min(self.range.len) as usize
    }

    #[inline(always)]
    fn add_bytes_submitted(&mut self, num_bytes: u64) {
        self.bytes_left = self.bytes_left.saturating_sub(num_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_offsets_stay_in_range_and_aligned() {
        let cases: &[(u64, u64, usize, u64)] = &[
            (0, 1 << 20, 4096, 1 << 20),
            (64 * 1024, 256 * 1024, 64 * 1024, 1 << 20),
            (3 * 8192, 8192 * 5 + 100, 8192, 40_000),
        ];

        for (seed, &(start, len, bs, amount)) in cases.iter().enumerate() {
            let range = FileRange { start, len };
            let mut gen = RandomAlignedOffsets::with_seed(range, bs, amount, seed as u64);

            let mut total = 0u64;
            let mut count = 0u64;
            while let Some(block) = gen.next_block() {
                assert_eq!(block.offset % bs as u64, 0, "unaligned offset {}", block.offset);
                assert!(block.offset >= start);
                assert!(block.offset + block.len as u64 <= range.end());
                total += block.len as u64;
                count += 1;
            }

            assert_eq!(total, amount);
            assert_eq!(count, (amount + bs as u64 - 1) / bs as u64);
        }
    }

    #[test]
    fn test_aligned_offsets_are_reproducible_with_seed() {
        let range = FileRange { start: 0, len: 1 << 24 };
        let mut a = RandomAlignedOffsets::with_seed(range, 4096, 1 << 20, 42);
        let mut b = RandomAlignedOffsets::with_seed(range, 4096, 1 << 20, 42);

        for _ in 0..64 {
            assert_eq!(a.next_block(), b.next_block());
        }
    }

    #[test]
    fn test_aligned_reset_allows_next_file() {
        let range = FileRange { start: 0, len: 1 << 16 };
        let mut gen = RandomAlignedOffsets::with_seed(range, 4096, 1 << 16, 1);
        while gen.next_block().is_some() {}
        assert_eq!(gen.num_bytes_left_to_submit(), 0);

        gen.reset();
        assert_eq!(gen.num_bytes_left_to_submit(), 1 << 16);
    }

    #[test]
    fn test_aligned_covers_whole_range() {
        let range = FileRange { start: 0, len: 16 * 4096 };
        let mut gen = RandomAlignedOffsets::with_seed(range, 4096, 4096 * 2000, 9);
        let mut seen = [false; 16];
        while let Some(block) = gen.next_block() {
            seen[(block.offset / 4096) as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_unaligned_offsets_fit_range() {
        let range = FileRange { start: 1000, len: 50_000 };
        let mut gen = RandomUnalignedOffsets::with_seed(range, 4096, 200_000, 3);

        let mut total = 0;
        let mut any_unaligned = false;
        while let Some(block) = gen.next_block() {
            assert!(block.offset >= range.start);
            assert!(block.offset + block.len as u64 <= range.end());
            any_unaligned |= block.offset % 4096 != 0;
            total += block.len as u64;
        }

        assert_eq!(total, 200_000);
        assert!(any_unaligned);
    }

    #[test]
    fn test_range_shorter_than_block() {
        let range = FileRange { start: 4096, len: 100 };
        let mut gen = RandomAlignedOffsets::with_seed(range, 4096, 100, 5);
        let block = gen.next_block().unwrap();
        assert_eq!(block.offset, 4096);
        assert_eq!(block.len, 100);
        assert!(gen.next_block().is_none());
    }
}
