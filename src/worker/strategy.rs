//! Per-phase IO strategy
//!
//! At the start of every phase a worker selects one [`PhaseBindings`] value and
//! keeps it unchanged until the phase ends, so the block loops never branch on
//! phase or configuration again. Each axis is chosen independently:
//!
//! | axis                | choice                                               |
//! |---------------------|------------------------------------------------------|
//! | sync / async        | io depth 1 is sync, anything larger is async         |
//! | positional op       | pwrite / pread, or direct GPU write / read (cuFile)  |
//! | pre-write copy      | device to host, only with GPU buffers and no cuFile  |
//! | post-read copy      | host to device, only with GPU buffers and no cuFile  |
//! | handle registration | none, per file (dir mode), per phase (file/bdev)     |
//!
//! Create phases write, every other phase uses the read side. Phases without
//! data transfer never call the IO bindings.

use crate::engine::sync::{pread_full, pwrite_full};
use crate::engine::{IOOperation, OperationType};
use crate::gpu::{CuFileHandleData, GpuBackend, GpuBuffer};
use crate::target::BenchPathType;
use crate::util::buffer::{AlignedBuffer, DEFAULT_FILL_SEED};
use crate::worker::BenchPhase;
use crate::Result;
use anyhow::Context;
use std::os::unix::io::RawFd;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// One blocking positional call per block
    Sync,
    /// Queue submissions of the given type, reap completions
    Async(OperationType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionalOp {
    Pread,
    Pwrite,
    CuFileRead,
    CuFileWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRegistration {
    NoOp,
    /// Register after open, deregister before close of every file
    PerFile,
    /// Register a shared descriptor on first use, deregister at phase end
    PerPhase,
}

/// Where a register/deregister call comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleScope {
    File,
    Phase,
}

/// IO bindings of one worker for one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseBindings {
    pub io_mode: IoMode,
    pub positional: PositionalOp,
    pub pre_write_copy: bool,
    pub post_read_copy: bool,
    pub handles: HandleRegistration,
}

impl PhaseBindings {
    pub fn select(
        phase: BenchPhase,
        path_type: BenchPathType,
        io_depth: usize,
        use_cufile: bool,
        has_gpu_buf: bool,
    ) -> Self {
        let is_write = phase == BenchPhase::CreateFiles;
        let op_type = if is_write {
            OperationType::Write
        } else {
            OperationType::Read
        };

        let io_mode = if io_depth <= 1 {
            IoMode::Sync
        } else {
            IoMode::Async(op_type)
        };

        let positional = match (is_write, use_cufile) {
            (true, true) => PositionalOp::CuFileWrite,
            (true, false) => PositionalOp::Pwrite,
            (false, true) => PositionalOp::CuFileRead,
            (false, false) => PositionalOp::Pread,
        };

        let staged_gpu = has_gpu_buf && !use_cufile;

        let handles = match (use_cufile, path_type) {
            (false, _) => HandleRegistration::NoOp,
            (true, BenchPathType::Dir) => HandleRegistration::PerFile,
            (true, BenchPathType::File | BenchPathType::BlockDev) => HandleRegistration::PerPhase,
        };

        Self {
            io_mode,
            positional,
            pre_write_copy: is_write && staged_gpu,
            post_read_copy: !is_write && staged_gpu,
            handles,
        }
    }

    pub fn op_type(&self) -> OperationType {
        match self.positional {
            PositionalOp::Pwrite | PositionalOp::CuFileWrite => OperationType::Write,
            PositionalOp::Pread | PositionalOp::CuFileRead => OperationType::Read,
        }
    }

    /// Transfer one block synchronously, returns the bytes transferred
    pub fn positional_rw(
        &self,
        bufs: &mut IoBuffers,
        fd: RawFd,
        handle: &CuFileHandleData,
        len: usize,
        offset: u64,
    ) -> Result<usize> {
        let len = len.min(bufs.host.size());

        match self.positional {
            PositionalOp::Pread => pread_full(fd, bufs.host.as_mut_ptr(), len, offset),
            PositionalOp::Pwrite => pwrite_full(fd, bufs.host.as_ptr(), len, offset),
            PositionalOp::CuFileRead | PositionalOp::CuFileWrite => {
                let raw_handle = handle
                    .handle()
                    .ok_or_else(|| anyhow::anyhow!("cuFile handle not registered. FD: {}", fd))?;
                let device = bufs
                    .device
                    .as_ref()
                    .context("cuFile transfer without GPU buffer")?;

                let n = if self.positional == PositionalOp::CuFileRead {
                    bufs.gpu.read_direct(raw_handle, device.ptr(), len, offset)?
                } else {
                    bufs.gpu.write_direct(raw_handle, device.ptr(), len, offset)?
                };
                Ok(n)
            }
        }
    }

    /// Describe one block for an async queue
    ///
    /// All in-flight operations share the host buffer.
    pub fn prepare_async_op(
        &self,
        bufs: &mut IoBuffers,
        fd: RawFd,
        len: usize,
        offset: u64,
        user_data: u64,
    ) -> IOOperation {
        IOOperation {
            op_type: self.op_type(),
            target_fd: fd,
            offset,
            buffer: bufs.host.as_mut_ptr(),
            length: len.min(bufs.host.size()),
            user_data,
        }
    }

    /// Stage device data in the host buffer before a write
    pub fn pre_write_copy(&self, bufs: &mut IoBuffers, len: usize) -> Result<()> {
        if !self.pre_write_copy {
            return Ok(());
        }

        let device = bufs.device.as_ref().context("GPU copy without GPU buffer")?;
        let len = len.min(bufs.host.size());
        bufs.gpu
            .copy_to_host(&mut bufs.host.as_mut_slice()[..len], device.ptr())
            .with_context(|| format!("GPU to host copy failed. Byte count: {}; GPU ID: {}", len, device.gpu_id()))
    }

    /// Move read data from the host buffer to the device
    pub fn post_read_copy(&self, bufs: &mut IoBuffers, len: usize) -> Result<()> {
        if !self.post_read_copy {
            return Ok(());
        }

        let device = bufs.device.as_ref().context("GPU copy without GPU buffer")?;
        let len = len.min(bufs.host.size());
        bufs.gpu
            .copy_to_device(device.ptr(), &bufs.host.as_slice()[..len])
            .with_context(|| format!("Host to GPU copy failed. Byte count: {}; GPU ID: {}", len, device.gpu_id()))
    }

    fn handles_apply_to(&self, scope: HandleScope) -> bool {
        matches!(
            (self.handles, scope),
            (HandleRegistration::PerFile, HandleScope::File) | (HandleRegistration::PerPhase, HandleScope::Phase)
        )
    }

    pub fn register_handle(
        &self,
        scope: HandleScope,
        gpu: &dyn GpuBackend,
        data: &mut CuFileHandleData,
        fd: RawFd,
    ) -> Result<()> {
        if !self.handles_apply_to(scope) {
            return Ok(());
        }

        data.register_handle(gpu, fd)
            .with_context(|| format!("cuFile handle registration failed. FD: {}", fd))
    }

    pub fn deregister_handle(&self, scope: HandleScope, gpu: &dyn GpuBackend, data: &mut CuFileHandleData) {
        if self.handles_apply_to(scope) {
            data.deregister_handle(gpu);
        }
    }
}

/// Host and optional device IO buffer of one worker
pub struct IoBuffers {
    gpu: Arc<dyn GpuBackend>,
    host: AlignedBuffer,
    device: Option<GpuBuffer>,
}

impl IoBuffers {
    /// Allocate a page-aligned host buffer of one block filled with random
    /// data, plus a device copy of it on `gpu_id` if given
    pub fn allocate(block_size: usize, gpu: Arc<dyn GpuBackend>, gpu_id: Option<i32>) -> Result<Self> {
        let mut host = AlignedBuffer::page_aligned(block_size)?;
        host.fill_random(DEFAULT_FILL_SEED);

        let device = match gpu_id {
            Some(id) => {
                tracing::debug!("Initializing GPU buffer. GPU ID: {}", id);
                Some(GpuBuffer::new_from_host(gpu.clone(), id, host.as_slice())?)
            }
            None => None,
        };

        Ok(Self { gpu, host, device })
    }

    pub fn host(&self) -> &AlignedBuffer {
        &self.host
    }

    pub fn device(&self) -> Option<&GpuBuffer> {
        self.device.as_ref()
    }

    pub fn has_device_buffer(&self) -> bool {
        self.device.is_some()
    }
}

impl std::fmt::Debug for IoBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffers")
            .field("host", &self.host)
            .field("device", &self.device)
            .finish()
    }
}
