//! Host-memory GPU emulation
//!
//! Device buffers live in host memory and direct transfers use positional
//! syscalls on the registered descriptor. Bookkeeping counters let tests check
//! that handles and buffers are released.

use super::{DevicePtr, GpuBackend, GpuError, GpuResult, RawCuFileHandle};
use crate::engine::sync::{pread_full, pwrite_full};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct EmulatedState {
    buffers: HashMap<u64, Vec<u8>>,
    handles: HashMap<u64, RawFd>,
}

#[derive(Default)]
pub struct EmulatedGpu {
    state: Mutex<EmulatedState>,
    next_id: AtomicU64,
    deregistrations: AtomicU64,
}

impl EmulatedGpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn num_registered_handles(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn num_deregistrations(&self) -> u64 {
        self.deregistrations.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EmulatedState> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn handle_fd(state: &EmulatedState, handle: RawCuFileHandle) -> GpuResult<RawFd> {
        state
            .handles
            .get(&handle.0)
            .copied()
            .ok_or_else(|| GpuError::Driver(format!("unknown handle {}", handle.0)))
    }
}

impl GpuBackend for EmulatedGpu {
    fn alloc_buffer(&self, gpu_id: i32, size: usize) -> GpuResult<DevicePtr> {
        if gpu_id < 0 {
            return Err(GpuError::Device {
                gpu_id,
                msg: "invalid device ordinal".to_string(),
            });
        }
        let id = self.alloc_id();
        self.lock().buffers.insert(id, vec![0u8; size]);
        Ok(DevicePtr(id))
    }

    fn free_buffer(&self, buf: DevicePtr) {
        self.lock().buffers.remove(&buf.0);
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> GpuResult<()> {
        let mut state = self.lock();
        let mem = state
            .buffers
            .get_mut(&dst.0)
            .ok_or_else(|| GpuError::Driver(format!("unknown device buffer {}", dst.0)))?;
        let n = src.len().min(mem.len());
        mem[..n].copy_from_slice(&src[..n]);
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> GpuResult<()> {
        let state = self.lock();
        let mem = state
            .buffers
            .get(&src.0)
            .ok_or_else(|| GpuError::Driver(format!("unknown device buffer {}", src.0)))?;
        let n = dst.len().min(mem.len());
        dst[..n].copy_from_slice(&mem[..n]);
        Ok(())
    }

    fn register_handle(&self, fd: RawFd) -> GpuResult<RawCuFileHandle> {
        if fd < 0 {
            return Err(GpuError::Driver(format!("cannot register invalid fd {}", fd)));
        }
        let id = self.alloc_id();
        self.lock().handles.insert(id, fd);
        Ok(RawCuFileHandle(id))
    }

    fn deregister_handle(&self, handle: RawCuFileHandle) {
        if self.lock().handles.remove(&handle.0).is_some() {
            self.deregistrations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn read_direct(
        &self,
        handle: RawCuFileHandle,
        buf: DevicePtr,
        len: usize,
        file_offset: u64,
    ) -> GpuResult<usize> {
        let mut state = self.lock();
        let fd = Self::handle_fd(&state, handle)?;
        let mem = state
            .buffers
            .get_mut(&buf.0)
            .ok_or_else(|| GpuError::Driver(format!("unknown device buffer {}", buf.0)))?;
        let len = len.min(mem.len());

        pread_full(fd, mem.as_mut_ptr(), len, file_offset)
            .map_err(|e| GpuError::Driver(format!("{:#}", e)))
    }

    fn write_direct(
        &self,
        handle: RawCuFileHandle,
        buf: DevicePtr,
        len: usize,
        file_offset: u64,
    ) -> GpuResult<usize> {
        let state = self.lock();
        let fd = Self::handle_fd(&state, handle)?;
        let mem = state
            .buffers
            .get(&buf.0)
            .ok_or_else(|| GpuError::Driver(format!("unknown device buffer {}", buf.0)))?;
        let len = len.min(mem.len());

        pwrite_full(fd, mem.as_ptr(), len, file_offset)
            .map_err(|e| GpuError::Driver(format!("{:#}", e)))
    }
}
