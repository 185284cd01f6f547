//! Page-aligned IO buffers
//!
//! Every worker owns exactly one host IO buffer of one block size. The buffer is
//! aligned to the system page size so it can be handed to `O_DIRECT` reads and
//! writes as well as to the kernel async queues without a bounce copy.
//!
//! Allocation failure is reported as an error instead of aborting, so a worker can
//! surface it as a setup failure to the manager.

use crate::Result;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Seed used for the initial buffer contents
///
/// All workers write the same pseudo-random pattern, which keeps written files
/// incompressible but deterministic between runs.
pub const DEFAULT_FILL_SEED: u64 = 0;

/// Memory-aligned buffer suitable for O_DIRECT operations
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    alignment: usize,
    layout: Layout,
}

// The buffer is exclusively owned by one worker; the raw pointer is never shared
// with another thread while the owner is alive.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes aligned to `alignment`
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero, `alignment` is not a power of two, or
    /// the allocator cannot satisfy the request.
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("Buffer size must be greater than 0");
        }
        if !alignment.is_power_of_two() {
            anyhow::bail!("Buffer alignment must be a power of 2, got {}", alignment);
        }

        let layout = Layout::from_size_align(size, alignment).map_err(|e| {
            anyhow::anyhow!(
                "Invalid buffer layout: size={}, alignment={}: {}",
                size,
                alignment,
                e
            )
        })?;

        // SAFETY: layout has non-zero size (checked above)
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            anyhow::anyhow!(
                "Aligned memory allocation failed. Buffer size: {}; Alignment: {}",
                size,
                alignment
            )
        })?;

        // SAFETY: freshly allocated region of `size` bytes
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };

        Ok(Self {
            ptr,
            size,
            alignment,
            layout,
        })
    }

    /// Allocate a buffer aligned to the system page size
    pub fn page_aligned(size: usize) -> Result<Self> {
        Self::new(size, page_size())
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline(always)]
    pub fn is_aligned(&self) -> bool {
        (self.ptr.as_ptr() as usize) % self.alignment == 0
    }

    /// Fill the buffer with a deterministic pseudo-random pattern
    ///
    /// Uses the same LCG for every worker so that two runs with the same seed
    /// produce byte-identical files.
    pub fn fill_random(&mut self, seed: u64) {
        let mut state = seed;
        for byte in self.as_mut_slice().iter_mut() {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            *byte = (state >> 16) as u8;
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// System page size, falling back to 4 KiB if sysconf fails
pub fn page_size() -> usize {
    let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if res > 0 {
        res as usize
    } else {
        4096
    }
}
