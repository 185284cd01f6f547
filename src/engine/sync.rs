//! Synchronous positional IO
//!
//! Blocking `pread`/`pwrite` wrappers used by io-depth-1 phases. Descriptors may be
//! shared between workers in file and block device mode, so every call is
//! positional and never moves the file offset.
//!
//! Both helpers retry partial transfers until the full length is done. A return
//! value smaller than the requested length means end of file (read) or a device
//! that stopped accepting data (write); the caller decides whether that is an
//! error.

use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;

/// Read `length` bytes at `offset` into `buffer`
///
/// # Errors
///
/// Returns an error if the pread syscall fails.
#[inline(always)]
pub fn pread_full(fd: RawFd, buffer: *mut u8, length: usize, offset: u64) -> Result<usize> {
    let mut total_read = 0;
    let mut current_offset = offset;

    while total_read < length {
        let remaining = length - total_read;
        let buf_ptr = unsafe { buffer.add(total_read) };

        // SAFETY: the caller provides a buffer of at least `length` bytes that stays
        // valid for the duration of this call.
        let result = unsafe {
            libc::pread(
                fd,
                buf_ptr as *mut libc::c_void,
                remaining,
                current_offset as libc::off_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context(format!(
                "pread failed: fd={}, offset={}, length={}",
                fd, current_offset, remaining
            ));
        }

        if result == 0 {
            break; // EOF
        }

        total_read += result as usize;
        current_offset += result as u64;
    }

    Ok(total_read)
}

/// Write `length` bytes from `buffer` to `offset`
///
/// # Errors
///
/// Returns an error if the pwrite syscall fails.
#[inline(always)]
pub fn pwrite_full(fd: RawFd, buffer: *const u8, length: usize, offset: u64) -> Result<usize> {
    let mut total_written = 0;
    let mut current_offset = offset;

    while total_written < length {
        let remaining = length - total_written;
        let buf_ptr = unsafe { buffer.add(total_written) };

        // SAFETY: see pread_full
        let result = unsafe {
            libc::pwrite(
                fd,
                buf_ptr as *const libc::c_void,
                remaining,
                current_offset as libc::off_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context(format!(
                "pwrite failed: fd={}, offset={}, length={}",
                fd, current_offset, remaining
            ));
        }

        if result == 0 {
            break;
        }

        total_written += result as usize;
        current_offset += result as u64;
    }

    Ok(total_written)
}
