//! Local worker: runs phases against local files and directories
//!
//! At the start of every phase the worker builds a fresh offset generator and
//! selects its [`PhaseBindings`], then walks its share of the bench paths:
//!
//! - **Dir mode**: a private tree `r<rank>/d<dir>/f<file>` below the bench
//!   paths. Every file is opened, transferred and closed by this worker only.
//! - **File / block device mode**: the descriptors opened by the manager are
//!   shared; the worker transfers its own range of every file, starting with
//!   file `rank % num_files` to spread the load.
//!
//! Block transfers go through [`LocalWorker::rw_block_sized`], which either
//! issues blocking positional calls or drives an async queue, depending on the
//! io depth.

use super::strategy::{HandleScope, IoBuffers, IoMode, PhaseBindings};
use super::{BenchId, BenchPhase, Worker, WorkerBase, WorkerError, WorkerResult, WorkerResultExt};
use crate::config::Config;
use crate::engine::{queue_factory, AsyncQueue, QueueFactory, AIO_MAX_WAIT};
use crate::gpu::{CuFileHandleData, GpuBackend};
use crate::offset::{create_offset_generator, FileOffsetGenerator, FileRange};
use crate::stats::histogram::LatencyHistogram;
use crate::stats::WorkerPhaseResult;
use crate::target::{tree, worker_file_range, BenchPathType, BenchTargets, MKFILE_MODE};
use crate::Result;
use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Dirs and files between two interruption checks in entry loops
pub const INTERRUPTION_CHECK_INTERVAL: usize = 128;

/// External capabilities a worker runs on
#[derive(Clone)]
pub struct WorkerBackends {
    pub gpu: Arc<dyn GpuBackend>,
    pub queue_factory: QueueFactory,
}

impl WorkerBackends {
    pub fn from_config(config: &Config) -> Self {
        Self {
            gpu: config.targets.gpu_backend.build(),
            queue_factory: queue_factory(config.workload.aio_engine),
        }
    }
}

impl std::fmt::Debug for WorkerBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBackends").finish_non_exhaustive()
    }
}

/// Which registered handle a transfer uses
#[derive(Debug, Clone, Copy)]
enum HandleSlot {
    /// The handle of the file currently open in dir mode
    DirFile,
    /// The handle of shared bench path `n`
    BenchPath(usize),
}

pub struct LocalWorker {
    base: WorkerBase,
    targets: Arc<BenchTargets>,
    backends: WorkerBackends,

    /// None if the block size is 0 (entry phases only)
    bufs: Option<IoBuffers>,

    phase: BenchPhase,
    phase_start: Instant,
    phase_finished: bool,
    bindings: PhaseBindings,
    offset_gen: Box<dyn FileOffsetGenerator>,

    dir_mode_handle: CuFileHandleData,
    file_mode_handles: Vec<CuFileHandleData>,

    io_latency: LatencyHistogram,
    entry_latency: LatencyHistogram,
}

impl LocalWorker {
    pub fn new(base: WorkerBase, targets: Arc<BenchTargets>, backends: WorkerBackends) -> Result<Self> {
        let config = base.config();
        let bindings = PhaseBindings::select(
            BenchPhase::Idle,
            targets.path_type(),
            config.workload.io_depth,
            config.targets.use_cufile,
            false,
        );
        let offset_gen = create_offset_generator(
            config.workload.access,
            FileRange::default(),
            config.workload.block_size as usize,
            None,
        );
        let file_mode_handles = (0..targets.num_paths()).map(|_| CuFileHandleData::new()).collect();

        Ok(Self {
            base,
            targets,
            backends,
            bufs: None,
            phase: BenchPhase::Idle,
            phase_start: Instant::now(),
            phase_finished: false,
            bindings,
            offset_gen,
            dir_mode_handle: CuFileHandleData::new(),
            file_mode_handles,
            io_latency: LatencyHistogram::new()?,
            entry_latency: LatencyHistogram::new()?,
        })
    }

    pub fn rank(&self) -> usize {
        self.base.rank()
    }

    fn run_phases(&mut self) -> WorkerResult<()> {
        self.prepare()?;

        // preparation counts as the first phase
        self.base.inc_num_workers_done();
        self.phase_finished = true;

        let mut current_bench_id = BenchId::NIL;

        loop {
            let (bench_id, phase, phase_start) = self.base.wait_for_next_phase(current_bench_id)?;

            current_bench_id = bench_id;
            self.phase = phase;
            self.phase_start = phase_start;
            self.phase_finished = false;

            if phase == BenchPhase::Terminate {
                tracing::debug!("Terminating as requested");
                self.base.inc_num_workers_done();
                return Ok(());
            }

            match self.run_phase(phase) {
                Ok(()) => self.finish_phase(),
                Err(WorkerError::Phase(msg)) => {
                    tracing::error!(rank = self.rank(), %phase, "{}", msg);
                    self.finish_phase_with_error();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Bind to the NUMA zone, then allocate IO buffers on it
    fn prepare(&mut self) -> WorkerResult<()> {
        self.base.apply_numa_binding()?;

        let config = self.base.config();
        let block_size = config.workload.block_size as usize;

        if block_size == 0 {
            return Ok(());
        }

        let gpu_ids = &config.targets.gpu_ids;
        let gpu_id = if gpu_ids.is_empty() {
            None
        } else {
            Some(gpu_ids[self.base.rank() % gpu_ids.len()])
        };

        let bufs = IoBuffers::allocate(block_size, self.backends.gpu.clone(), gpu_id).setup_err()?;
        self.bufs = Some(bufs);

        Ok(())
    }

    fn run_phase(&mut self, phase: BenchPhase) -> WorkerResult<()> {
        self.init_phase_offset_gen();
        self.init_phase_bindings();
        self.io_latency.reset();
        self.entry_latency.reset();

        let path_type = self.targets.path_type();

        match phase {
            BenchPhase::CreateDirs | BenchPhase::DeleteDirs => {
                if path_type != BenchPathType::Dir {
                    return Err(WorkerError::Phase(
                        "Directory creation and deletion are not available in file and block device mode."
                            .to_string(),
                    ));
                }
                self.iterate_dirs()
            }
            BenchPhase::CreateFiles | BenchPhase::ReadFiles | BenchPhase::StatFiles | BenchPhase::DeleteFiles => {
                if path_type == BenchPathType::Dir {
                    self.dir_mode_iterate_files()
                } else {
                    self.file_mode_iterate_files()
                }
            }
            BenchPhase::Idle | BenchPhase::Terminate => {
                Err(WorkerError::Phase(format!("Unknown/invalid next phase type: {}", phase)))
            }
        }
    }

    /// Dir mode transfers whole files; file mode transfers this worker's
    /// range of every shared file
    fn init_phase_offset_gen(&mut self) {
        let workload = &self.base.config().workload;
        let block_size = workload.block_size;
        let file_size = self.targets.file_size();
        let random_amount = workload.random_amount.unwrap_or(file_size);

        let (range, amount) = match self.targets.path_type() {
            BenchPathType::Dir => (FileRange { start: 0, len: file_size }, random_amount),
            BenchPathType::File | BenchPathType::BlockDev => {
                let num_workers = self.base.shared().num_workers();
                let range = worker_file_range(self.rank(), num_workers, file_size, block_size);
                (range, random_amount / num_workers.max(1) as u64)
            }
        };

        self.offset_gen = create_offset_generator(workload.access, range, block_size as usize, Some(amount));
    }

    fn init_phase_bindings(&mut self) {
        let config = self.base.config();
        let has_gpu_buf = self.bufs.as_ref().is_some_and(|b| b.has_device_buffer());

        self.bindings = PhaseBindings::select(
            self.phase,
            self.targets.path_type(),
            config.workload.io_depth,
            config.targets.use_cufile,
            has_gpu_buf,
        );
    }

    /// Create or remove this worker's dirs
    ///
    /// The rank dir is created in every bench path before the numbered dirs
    /// and removed from every bench path after them.
    fn iterate_dirs(&mut self) -> WorkerResult<()> {
        let targets = self.targets.clone();
        let paths = targets.paths();
        let rank = self.rank();
        let num_dirs = self.base.config().targets.num_dirs;
        let ignore_del_errors = self.base.config().targets.ignore_del_errors;
        let phase = self.phase;

        if phase == BenchPhase::CreateDirs {
            for path in paths {
                self.base.check_interruption()?;
                tree::make_dir(path, &tree::rank_dir(rank))
                    .context("Rank directory creation failed")
                    .phase_err()?;
            }
        }

        for dir_index in 0..num_dirs {
            self.base.check_interruption()?;

            let base_path = &paths[tree::bench_path_index(rank, dir_index, paths.len())];
            let rel_path = tree::dir_path(rank, dir_index);

            let start = Instant::now();

            if phase == BenchPhase::CreateDirs {
                tree::make_dir(base_path, &rel_path).phase_err()?;
            } else {
                tree::remove_dir(base_path, &rel_path, ignore_del_errors).phase_err()?;
            }

            self.entry_latency.record(start.elapsed());
            self.base.status().live_ops().add_entries(1);
        }

        if phase == BenchPhase::DeleteDirs {
            for path in paths {
                self.base.check_interruption()?;
                tree::remove_dir(path, &tree::rank_dir(rank), ignore_del_errors).phase_err()?;
            }
        }

        Ok(())
    }

    /// Visit every file of this worker's tree, filling one dir before moving
    /// on to the next
    fn dir_mode_iterate_files(&mut self) -> WorkerResult<()> {
        let targets = self.targets.clone();
        let paths = targets.paths();
        let rank = self.rank();
        let num_dirs = self.base.config().targets.num_dirs;
        let num_files = self.base.config().targets.num_files;
        let ignore_del_errors = self.base.config().targets.ignore_del_errors;

        for dir_index in 0..num_dirs {
            if dir_index % INTERRUPTION_CHECK_INTERVAL == 0 {
                self.base.check_interruption()?;
            }

            let base_path = &paths[tree::bench_path_index(rank, dir_index, paths.len())];

            for file_index in 0..num_files {
                if file_index % INTERRUPTION_CHECK_INTERVAL == 0 {
                    self.base.check_interruption()?;
                }

                let path = base_path.join(tree::file_path(rank, dir_index, file_index));

                self.offset_gen.reset();

                let start = Instant::now();

                match self.phase {
                    BenchPhase::CreateFiles | BenchPhase::ReadFiles => self.dir_mode_rw_file(&path)?,
                    BenchPhase::StatFiles => {
                        std::fs::metadata(&path)
                            .with_context(|| format!("File stat failed. Path: {}", path.display()))
                            .phase_err()?;
                    }
                    BenchPhase::DeleteFiles => tree::remove_file(&path, ignore_del_errors).phase_err()?,
                    _ => {}
                }

                // for create and read this includes open and close
                self.entry_latency.record(start.elapsed());
                self.base.status().live_ops().add_entries(1);
            }
        }

        Ok(())
    }

    fn dir_mode_open(&self, path: &Path) -> Result<File> {
        let workload = &self.base.config().workload;
        let mut options = OpenOptions::new();

        if self.phase == BenchPhase::CreateFiles {
            options
                .read(true)
                .write(true)
                .create(true)
                .truncate(workload.truncate)
                .mode(MKFILE_MODE);
        } else {
            options.read(true);
        }

        if workload.direct_io {
            options.custom_flags(libc::O_DIRECT);
        }

        options
            .open(path)
            .with_context(|| format!("File open failed. Path: {}", path.display()))
    }

    /// Open, transfer and close one file of the dir tree
    fn dir_mode_rw_file(&mut self, path: &Path) -> WorkerResult<()> {
        let file = self.dir_mode_open(path).phase_err()?;
        let fd = file.as_raw_fd();

        let result = self.dir_mode_rw_open_file(fd, path);

        // handle must go before the descriptor
        self.bindings
            .deregister_handle(HandleScope::File, &*self.backends.gpu, &mut self.dir_mode_handle);

        let closed = close_file(file, path).phase_err();

        result?;
        closed
    }

    fn dir_mode_rw_open_file(&mut self, fd: RawFd, path: &Path) -> WorkerResult<()> {
        self.bindings
            .register_handle(HandleScope::File, &*self.backends.gpu, &mut self.dir_mode_handle, fd)
            .phase_err()?;

        let num_bytes_done = self
            .rw_block_sized(fd, HandleSlot::DirFile)
            .map_err(|e| with_path(e, self.phase, path))?;

        self.check_transfer_size(num_bytes_done, path)
    }

    /// Transfer, stat or delete every shared bench path
    fn file_mode_iterate_files(&mut self) -> WorkerResult<()> {
        let targets = self.targets.clone();
        let paths = targets.paths();
        let fds = targets.fds();
        let num_files = fds.len();
        let rank = self.rank();
        let ignore_del_errors = self.base.config().targets.ignore_del_errors;

        tracing::debug!(
            "File mode {}: files={}, bytes per file={}",
            self.phase,
            num_files,
            self.offset_gen.num_bytes_total()
        );

        for file_index in 0..num_files {
            if file_index % INTERRUPTION_CHECK_INTERVAL == 0 {
                self.base.check_interruption()?;
            }

            let current = (rank + file_index) % num_files;
            let fd = fds[current];
            let path = &paths[current];

            match self.phase {
                BenchPhase::CreateFiles | BenchPhase::ReadFiles => {
                    self.bindings
                        .register_handle(
                            HandleScope::Phase,
                            &*self.backends.gpu,
                            &mut self.file_mode_handles[current],
                            fd,
                        )
                        .phase_err()?;

                    self.offset_gen.reset();

                    let num_bytes_done = self
                        .rw_block_sized(fd, HandleSlot::BenchPath(current))
                        .map_err(|e| with_path(e, self.phase, path))?;

                    self.check_transfer_size(num_bytes_done, path)?;
                }
                BenchPhase::StatFiles => {
                    let start = Instant::now();
                    fstat(fd)
                        .with_context(|| format!("File stat failed. Path: {}", path.display()))
                        .phase_err()?;
                    self.entry_latency.record(start.elapsed());
                    self.base.status().live_ops().add_entries(1);
                }
                BenchPhase::DeleteFiles => {
                    let start = Instant::now();
                    tree::remove_file(path, ignore_del_errors).phase_err()?;
                    self.entry_latency.record(start.elapsed());
                    self.base.status().live_ops().add_entries(1);
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn check_transfer_size(&self, num_bytes_done: u64, path: &Path) -> WorkerResult<()> {
        let expected = self.offset_gen.num_bytes_total();

        if num_bytes_done != expected {
            let (op, done) = if self.phase == BenchPhase::CreateFiles {
                ("write", "written")
            } else {
                ("read", "read")
            };
            return Err(WorkerError::Phase(format!(
                "Unexpected short file {}. Path: {}; Bytes {}: {}; Expected {}: {}",
                op,
                path.display(),
                done,
                num_bytes_done,
                done,
                expected
            )));
        }

        Ok(())
    }

    /// Transfer the offset generator's blocks for `fd`
    ///
    /// Returns the number of bytes transferred, which is short of the
    /// generator's total if the file ended early.
    fn rw_block_sized(&mut self, fd: RawFd, slot: HandleSlot) -> WorkerResult<u64> {
        match self.bindings.io_mode {
            IoMode::Sync => self.sync_block_sized(fd, slot),
            IoMode::Async(_) => self.async_block_sized(fd),
        }
    }

    fn sync_block_sized(&mut self, fd: RawFd, slot: HandleSlot) -> WorkerResult<u64> {
        let bindings = self.bindings;
        let bufs = self
            .bufs
            .as_mut()
            .ok_or_else(|| WorkerError::Phase("No IO buffer (block size 0)".to_string()))?;
        let handle = match slot {
            HandleSlot::DirFile => &self.dir_mode_handle,
            HandleSlot::BenchPath(index) => &self.file_mode_handles[index],
        };
        let live_ops = self.base.status().live_ops();

        while self.offset_gen.num_bytes_left_to_submit() > 0 {
            let offset = self.offset_gen.next_offset();
            let block_size = self.offset_gen.next_block_size();

            let start = Instant::now();

            bindings.pre_write_copy(bufs, block_size).phase_err()?;

            let num_bytes = bindings
                .positional_rw(bufs, fd, handle, block_size, offset)
                .phase_err()?;

            if num_bytes == 0 {
                tracing::debug!(
                    "rw ended early: block_size={}, offset={}, left_to_submit={}",
                    block_size,
                    offset,
                    self.offset_gen.num_bytes_left_to_submit()
                );
                return Ok(self.offset_gen.num_bytes_total() - self.offset_gen.num_bytes_left_to_submit());
            }

            bindings.post_read_copy(bufs, num_bytes).phase_err()?;

            let elapsed = start.elapsed();
            self.io_latency.record(elapsed);

            self.offset_gen.add_bytes_submitted(num_bytes as u64);
            live_ops.add_io_latency(elapsed);
            live_ops.add_bytes(num_bytes as u64);
            live_ops.add_iops(1);

            self.base.check_interruption()?;
        }

        Ok(self.offset_gen.num_bytes_total())
    }

    /// One queue per file, cleaned up whatever the outcome
    fn async_block_sized(&mut self, fd: RawFd) -> WorkerResult<u64> {
        let io_depth = self.base.config().workload.io_depth;

        let mut queue = (self.backends.queue_factory)()
            .context("Initializing async IO failed")
            .phase_err()?;
        queue
            .init(io_depth)
            .with_context(|| format!("Initializing async IO failed. Queue: {}", queue.name()))
            .phase_err()?;

        let result = self.async_submit_and_reap(queue.as_mut(), fd, io_depth);
        let cleanup = queue.cleanup().context("Async IO cleanup failed").phase_err();

        let num_bytes_done = result?;
        cleanup?;
        Ok(num_bytes_done)
    }

    fn async_submit_and_reap(&mut self, queue: &mut dyn AsyncQueue, fd: RawFd, io_depth: usize) -> WorkerResult<u64> {
        let bindings = self.bindings;
        let bufs = self
            .bufs
            .as_mut()
            .ok_or_else(|| WorkerError::Phase("No IO buffer (block size 0)".to_string()))?;
        let live_ops = self.base.status().live_ops();

        let mut start_times = vec![Instant::now(); io_depth];
        let mut lengths = vec![0usize; io_depth];
        let mut num_pending = 0usize;

        // seed up to io depth
        while self.offset_gen.num_bytes_left_to_submit() > 0 && num_pending < io_depth {
            let block_size = self.offset_gen.next_block_size();
            let offset = self.offset_gen.next_offset();
            let slot = num_pending;

            bindings.pre_write_copy(bufs, block_size).phase_err()?;

            start_times[slot] = Instant::now();
            lengths[slot] = block_size;

            queue
                .submit(bindings.prepare_async_op(bufs, fd, block_size, offset, slot as u64))
                .with_context(|| format!("Async IO submission failed. NumRequests: {}", num_pending))
                .phase_err()?;

            num_pending += 1;
            self.offset_gen.add_bytes_submitted(block_size as u64);
        }

        while num_pending > 0 {
            let completions = queue
                .reap(AIO_MAX_WAIT)
                .with_context(|| format!("Getting async IO events failed. NumPending: {}", num_pending))
                .phase_err()?;

            if completions.is_empty() {
                self.base.check_interruption()?;

                if queue.in_flight() == 0 {
                    return Err(WorkerError::Phase(format!(
                        "Async IO completion mismatch. Pending: {}; In flight: 0; Queue: {}",
                        num_pending,
                        queue.name()
                    )));
                }
                continue;
            }

            for completion in completions {
                let slot = completion.user_data as usize;
                if slot >= io_depth {
                    return Err(WorkerError::Phase(format!(
                        "Async IO completion for unknown request: {}",
                        completion.user_data
                    )));
                }

                let num_bytes = completion
                    .result
                    .with_context(|| format!("Async {} failed", completion.op_type))
                    .phase_err()?;

                if num_bytes != lengths[slot] {
                    return Err(WorkerError::Phase(format!(
                        "Unexpected short async {}. Bytes: {}; Expected: {}",
                        completion.op_type, num_bytes, lengths[slot]
                    )));
                }

                bindings.post_read_copy(bufs, num_bytes).phase_err()?;

                let elapsed = start_times[slot].elapsed();
                self.io_latency.record(elapsed);
                live_ops.add_io_latency(elapsed);
                live_ops.add_bytes(num_bytes as u64);
                live_ops.add_iops(1);

                self.base.check_interruption()?;

                if self.offset_gen.num_bytes_left_to_submit() == 0 {
                    num_pending -= 1;
                    continue;
                }

                // reuse the slot for the next block
                let block_size = self.offset_gen.next_block_size();
                let offset = self.offset_gen.next_offset();

                bindings.pre_write_copy(bufs, block_size).phase_err()?;

                start_times[slot] = Instant::now();
                lengths[slot] = block_size;

                queue
                    .submit(bindings.prepare_async_op(bufs, fd, block_size, offset, slot as u64))
                    .with_context(|| format!("Async IO resubmission failed. NumRequests: {}", num_pending))
                    .phase_err()?;

                self.offset_gen.add_bytes_submitted(block_size as u64);
            }
        }

        Ok(self.offset_gen.num_bytes_total())
    }

    fn release_phase_handles(&mut self) {
        let gpu = &*self.backends.gpu;

        self.bindings
            .deregister_handle(HandleScope::File, gpu, &mut self.dir_mode_handle);
        for handle in &mut self.file_mode_handles {
            self.bindings.deregister_handle(HandleScope::Phase, gpu, handle);
        }
    }

    fn store_phase_result(&self) {
        let status = self.base.status();

        status.set_phase_result(WorkerPhaseResult {
            elapsed_ms: self.phase_start.elapsed().as_millis() as u64,
            ops: status.live_ops().snapshot(),
            io_latency: self.io_latency.clone(),
            entry_latency: self.entry_latency.clone(),
        });
    }

    /// Record the result, release handles and report done
    fn finish_phase(&mut self) {
        self.release_phase_handles();
        self.store_phase_result();
        self.base.inc_num_workers_done();
        self.phase_finished = true;
    }

    fn finish_phase_with_error(&mut self) {
        self.release_phase_handles();
        self.store_phase_result();
        self.base.inc_num_workers_done_with_error();
        self.phase_finished = true;
    }
}

impl Worker for LocalWorker {
    fn base(&self) -> &WorkerBase {
        &self.base
    }

    fn run(&mut self) {
        match self.run_phases() {
            Ok(()) => {}
            Err(WorkerError::Interrupted) => {
                tracing::debug!("Interrupted");

                // interruption during a phase still counts as done for that phase
                if !self.phase_finished {
                    self.finish_phase();
                }
            }
            Err(err) => {
                tracing::error!(rank = self.rank(), "{}", err);
                self.release_phase_handles();
                self.base.inc_num_workers_done_with_error();
            }
        }
    }
}

fn with_path(err: WorkerError, phase: BenchPhase, path: &Path) -> WorkerError {
    match err {
        WorkerError::Phase(msg) => {
            let what = if phase == BenchPhase::CreateFiles {
                "write"
            } else {
                "read"
            };
            WorkerError::Phase(format!("File {} failed. Path: {}; {}", what, path.display(), msg))
        }
        other => other,
    }
}

/// Close `file` and report errors that `Drop` would swallow
fn close_file(file: File, path: &Path) -> Result<()> {
    let fd = file.into_raw_fd();

    // SAFETY: fd was just released from `file` and is closed exactly once here
    if unsafe { libc::close(fd) } == -1 {
        let err = std::io::Error::last_os_error();
        return Err(err).with_context(|| format!("File close failed. Path: {}; FD: {}", path.display(), fd));
    }

    Ok(())
}

fn fstat(fd: RawFd) -> Result<()> {
    // SAFETY: stat buffer is plain old data, written by the kernel
    let mut stat_buf: libc::stat = unsafe { std::mem::zeroed() };

    if unsafe { libc::fstat(fd, &mut stat_buf) } == -1 {
        return Err(std::io::Error::last_os_error()).context("fstat failed");
    }

    Ok(())
}
