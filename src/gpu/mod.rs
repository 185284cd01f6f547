//! GPU buffers and GPU-Direct-Storage handles
//!
//! The worker never talks to a GPU driver directly. It goes through a
//! [`GpuBackend`], which exposes device buffer management, host/device copies,
//! cuFile-style handle registration and direct storage transfers.
//!
//! Two backends ship with the crate:
//!
//! - [`Unavailable`]: the default for builds without GPU support. Every call
//!   fails with [`GpuError::NotAvailable`], so configuring GPU ids turns into a
//!   setup error on the worker.
//! - [`emulated::EmulatedGpu`]: device memory backed by host memory and direct
//!   transfers backed by `pread`/`pwrite`. Useful to exercise the GPU code paths
//!   on machines without a GPU.

pub mod emulated;

use std::os::unix::io::RawFd;
use std::sync::Arc;
use thiserror::Error;

/// GPU backend failures
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU given, but this executable was built without GPU support")]
    NotAvailable,

    #[error("GPU device error. GPU ID: {gpu_id}; {msg}")]
    Device { gpu_id: i32, msg: String },

    #[error("GPU direct storage driver error: {0}")]
    Driver(String),
}

pub type GpuResult<T> = std::result::Result<T, GpuError>;

/// Opaque device memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

/// Opaque registered direct-storage handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawCuFileHandle(pub u64);

/// GPU device and direct-storage capability
///
/// Shared by all workers of a run, so implementations must be thread-safe.
pub trait GpuBackend: Send + Sync {
    /// Allocate `size` bytes of device memory on `gpu_id`
    fn alloc_buffer(&self, gpu_id: i32, size: usize) -> GpuResult<DevicePtr>;

    fn free_buffer(&self, buf: DevicePtr);

    /// Copy host memory into device memory
    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> GpuResult<()>;

    /// Copy device memory into host memory
    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> GpuResult<()>;

    /// Register an open file descriptor for direct transfers
    fn register_handle(&self, fd: RawFd) -> GpuResult<RawCuFileHandle>;

    fn deregister_handle(&self, handle: RawCuFileHandle);

    /// Read `len` bytes at `file_offset` straight into device memory
    fn read_direct(
        &self,
        handle: RawCuFileHandle,
        buf: DevicePtr,
        len: usize,
        file_offset: u64,
    ) -> GpuResult<usize>;

    /// Write `len` bytes of device memory to `file_offset`
    fn write_direct(
        &self,
        handle: RawCuFileHandle,
        buf: DevicePtr,
        len: usize,
        file_offset: u64,
    ) -> GpuResult<usize>;
}

/// Backend for builds without GPU support
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

impl GpuBackend for Unavailable {
    fn alloc_buffer(&self, _gpu_id: i32, _size: usize) -> GpuResult<DevicePtr> {
        Err(GpuError::NotAvailable)
    }

    fn free_buffer(&self, _buf: DevicePtr) {}

    fn copy_to_device(&self, _dst: DevicePtr, _src: &[u8]) -> GpuResult<()> {
        Err(GpuError::NotAvailable)
    }

    fn copy_to_host(&self, _dst: &mut [u8], _src: DevicePtr) -> GpuResult<()> {
        Err(GpuError::NotAvailable)
    }

    fn register_handle(&self, _fd: RawFd) -> GpuResult<RawCuFileHandle> {
        Err(GpuError::NotAvailable)
    }

    fn deregister_handle(&self, _handle: RawCuFileHandle) {}

    fn read_direct(&self, _: RawCuFileHandle, _: DevicePtr, _: usize, _: u64) -> GpuResult<usize> {
        Err(GpuError::NotAvailable)
    }

    fn write_direct(&self, _: RawCuFileHandle, _: DevicePtr, _: usize, _: u64) -> GpuResult<usize> {
        Err(GpuError::NotAvailable)
    }
}

/// Device buffer owned by one worker, freed on drop
pub struct GpuBuffer {
    backend: Arc<dyn GpuBackend>,
    ptr: DevicePtr,
    size: usize,
    gpu_id: i32,
}

impl GpuBuffer {
    /// Allocate a device buffer and initialise it from `init`
    pub fn new_from_host(backend: Arc<dyn GpuBackend>, gpu_id: i32, init: &[u8]) -> GpuResult<Self> {
        let ptr = backend.alloc_buffer(gpu_id, init.len())?;
        let buf = Self {
            backend,
            ptr,
            size: init.len(),
            gpu_id,
        };
        buf.backend.copy_to_device(buf.ptr, init)?;
        Ok(buf)
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn gpu_id(&self) -> i32 {
        self.gpu_id
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.backend.free_buffer(self.ptr);
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("gpu_id", &self.gpu_id)
            .finish()
    }
}

/// Registration state of one file descriptor for direct transfers
///
/// Registering an already registered handle and deregistering an unregistered
/// one are both no-ops, so cleanup paths can call
/// [`deregister_handle`](Self::deregister_handle) unconditionally.
#[derive(Debug, Default)]
pub struct CuFileHandleData {
    fd: Option<RawFd>,
    handle: Option<RawCuFileHandle>,
}

impl CuFileHandleData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.handle.is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn handle(&self) -> Option<RawCuFileHandle> {
        self.handle
    }

    pub fn register_handle(&mut self, backend: &dyn GpuBackend, fd: RawFd) -> GpuResult<()> {
        if self.is_registered() {
            return Ok(());
        }

        let handle = backend.register_handle(fd)?;
        self.fd = Some(fd);
        self.handle = Some(handle);
        Ok(())
    }

    pub fn deregister_handle(&mut self, backend: &dyn GpuBackend) {
        if let Some(handle) = self.handle.take() {
            backend.deregister_handle(handle);
        }
        self.fd = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::emulated::EmulatedGpu;

    #[test]
    fn test_unavailable_backend_fails_allocation() {
        let backend: Arc<dyn GpuBackend> = Arc::new(Unavailable);
        let err = GpuBuffer::new_from_host(backend, 0, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, GpuError::NotAvailable));
        assert!(err.to_string().contains("without GPU support"));
    }

    #[test]
    fn test_handle_double_register_is_noop() {
        let gpu = EmulatedGpu::new();
        let mut data = CuFileHandleData::new();

        data.register_handle(&gpu, 5).unwrap();
        let first = data.handle();
        data.register_handle(&gpu, 5).unwrap();

        assert_eq!(data.handle(), first);
        assert_eq!(gpu.num_registered_handles(), 1);
    }

    #[test]
    fn test_deregister_without_register_is_noop() {
        let gpu = EmulatedGpu::new();
        let mut data = CuFileHandleData::new();

        data.deregister_handle(&gpu);
        assert!(!data.is_registered());
        assert_eq!(gpu.num_deregistrations(), 0);

        data.register_handle(&gpu, 7).unwrap();
        assert_eq!(data.fd(), Some(7));
        data.deregister_handle(&gpu);
        data.deregister_handle(&gpu);
        assert_eq!(gpu.num_deregistrations(), 1);
        assert_eq!(data.fd(), None);
    }

    #[test]
    fn test_failed_register_leaves_unregistered() {
        let mut data = CuFileHandleData::new();
        assert!(data.register_handle(&Unavailable, 3).is_err());
        assert!(!data.is_registered());
    }

    #[test]
    fn test_gpu_buffer_freed_on_drop() {
        let gpu = Arc::new(EmulatedGpu::new());
        {
            let buf = GpuBuffer::new_from_host(gpu.clone(), 1, &[7u8; 64]).unwrap();
            assert_eq!(buf.size(), 64);
            assert_eq!(gpu.num_live_buffers(), 1);
        }
        assert_eq!(gpu.num_live_buffers(), 0);
    }
}
