//! libaio queue
//!
//! Linux native async IO through the raw `io_setup`/`io_submit`/`io_getevents`/
//! `io_destroy` syscalls. Using the syscalls directly avoids linking the LGPL
//! libaio library.
//!
//! Each submission occupies one iocb slot until its completion is reaped, so the
//! number of slots equals the io depth passed to [`AsyncQueue::init`].

use super::{AsyncQueue, IOCompletion, IOOperation, OperationType};
use crate::Result;
use anyhow::Context;
use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::time::Duration;

type AioContext = libc::c_ulong;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct IoControlBlock {
    data: u64,           // aio_data, returned in the event
    key: u32,
    aio_rw_flags: u32,
    lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    buf: u64,
    nbytes: u64,
    offset: i64,
    aio_reserved2: u64,
    flags: u32,
    aio_resfd: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IoEvent {
    data: u64,
    obj: u64,
    res: i64,    // bytes transferred or -errno
    res2: i64,
}

unsafe fn io_setup(maxevents: libc::c_int, ctxp: *mut AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_setup, maxevents as libc::c_long, ctxp)
}

unsafe fn io_destroy(ctx: AioContext) -> libc::c_long {
    libc::syscall(libc::SYS_io_destroy, ctx)
}

unsafe fn io_submit(ctx: AioContext, nr: libc::c_long, iocbpp: *mut *mut IoControlBlock) -> libc::c_long {
    libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp)
}

unsafe fn io_getevents(
    ctx: AioContext,
    min_nr: libc::c_long,
    nr: libc::c_long,
    events: *mut IoEvent,
    timeout: *mut libc::timespec,
) -> libc::c_long {
    libc::syscall(libc::SYS_io_getevents, ctx, min_nr, nr, events, timeout)
}

/// libaio-backed async queue
pub struct LibaioQueue {
    ctx: Option<AioContext>,
    queue_depth: usize,
    iocbs: Vec<IoControlBlock>,
    free_slots: Vec<usize>,
    /// user_data -> (slot, op type) of every in-flight operation
    pending: HashMap<u64, (usize, OperationType)>,
    events: Vec<IoEvent>,
}

impl LibaioQueue {
    pub fn new() -> Self {
        Self {
            ctx: None,
            queue_depth: 0,
            iocbs: Vec::new(),
            free_slots: Vec::new(),
            pending: HashMap::new(),
            events: Vec::new(),
        }
    }

    fn context(&self) -> Result<AioContext> {
        self.ctx
            .ok_or_else(|| anyhow::anyhow!("libaio queue used before init"))
    }
}

impl Default for LibaioQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue for LibaioQueue {
    fn init(&mut self, queue_depth: usize) -> Result<()> {
        let mut ctx: AioContext = 0;
        let result = unsafe { io_setup(queue_depth as libc::c_int, &mut ctx) };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!(
                "Initializing async IO (io_setup) failed. queue_depth={}",
                queue_depth
            ));
        }

        self.ctx = Some(ctx);
        self.queue_depth = queue_depth;
        self.iocbs = vec![unsafe { MaybeUninit::zeroed().assume_init() }; queue_depth];
        self.free_slots = (0..queue_depth).rev().collect();
        self.events = vec![unsafe { MaybeUninit::zeroed().assume_init() }; queue_depth];
        self.pending.clear();

        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let ctx = self.context()?;

        let slot = self
            .free_slots
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No free iocb slot (queue full)"))?;

        let iocb = &mut self.iocbs[slot];
        *iocb = IoControlBlock {
            data: op.user_data,
            key: 0,
            aio_rw_flags: 0,
            lio_opcode: match op.op_type {
                OperationType::Read => IOCB_CMD_PREAD,
                OperationType::Write => IOCB_CMD_PWRITE,
            },
            aio_reqprio: 0,
            aio_fildes: op.target_fd as u32,
            buf: op.buffer as u64,
            nbytes: op.length as u64,
            offset: op.offset as i64,
            aio_reserved2: 0,
            flags: 0,
            aio_resfd: 0,
        };

        let mut iocb_ptr = iocb as *mut IoControlBlock;
        let result = unsafe { io_submit(ctx, 1, &mut iocb_ptr) };

        if result != 1 {
            self.free_slots.push(slot);
            let err = std::io::Error::last_os_error();
            return Err(err).context(format!(
                "Async IO submission (io_submit) failed. NumPending: {}; ReturnCode: {}",
                self.pending.len(),
                result
            ));
        }

        self.pending.insert(op.user_data, (slot, op.op_type));
        Ok(())
    }

    fn reap(&mut self, timeout: Duration) -> Result<Vec<IOCompletion>> {
        let ctx = self.context()?;

        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };

        let result = unsafe {
            io_getevents(
                ctx,
                1,
                self.queue_depth as libc::c_long,
                self.events.as_mut_ptr(),
                &mut ts,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err).context(format!(
                "Getting async IO events (io_getevents) failed. NumPending: {}; Wait time: {:?}",
                self.pending.len(),
                timeout
            ));
        }

        let mut completions = Vec::with_capacity(result as usize);

        for event in &self.events[..result as usize] {
            let (slot, op_type) = match self.pending.remove(&event.data) {
                Some(entry) => entry,
                None => anyhow::bail!("Completion for unknown request {}", event.data),
            };
            self.free_slots.push(slot);

            let result = if event.res >= 0 {
                Ok(event.res as usize)
            } else {
                let errno = (-event.res) as i32;
                Err(std::io::Error::from_raw_os_error(errno))
                    .context(format!("{} operation failed: errno={}", op_type, errno))
            };

            completions.push(IOCompletion {
                user_data: event.data,
                result,
                op_type,
            });
        }

        Ok(completions)
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn cleanup(&mut self) -> Result<()> {
        if let Some(ctx) = self.ctx {
            // buffers of in-flight requests must outlive the kernel's use of them
            while !self.pending.is_empty() {
                if self.reap(super::AIO_MAX_WAIT).is_err() {
                    break;
                }
            }

            let result = unsafe { io_destroy(ctx) };
            self.ctx = None;
            if result < 0 {
                let err = std::io::Error::last_os_error();
                return Err(err).context("io_destroy failed");
            }
        }

        self.pending.clear();
        self.free_slots.clear();

        Ok(())
    }

    fn name(&self) -> &'static str {
        "libaio"
    }
}

impl Drop for LibaioQueue {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
