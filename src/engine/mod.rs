//! IO engine abstraction
//!
//! Workers issue data IO in one of two ways, chosen once per phase:
//!
//! - **Synchronous** (io depth 1): blocking positional `pread`/`pwrite` calls,
//!   see [`sync`].
//! - **Asynchronous** (io depth > 1): a kernel queue that accepts submissions
//!   and hands back completions, abstracted by the [`AsyncQueue`] trait.
//!
//! # Queue implementations
//!
//! - **libaio**: Linux native async IO via raw syscalls
//! - **io_uring**: modern Linux async IO (behind the `io_uring` feature)
//! - **mock**: in-memory queue for tests, can be told to lose completions
//!
//! # Lifecycle
//!
//! A worker creates one queue per file it works on:
//!
//! 1. [`AsyncQueue::init`] with the configured io depth
//! 2. seed up to `depth` operations with [`AsyncQueue::submit`]
//! 3. [`AsyncQueue::reap`] completions and resubmit until the input is exhausted
//! 4. [`AsyncQueue::cleanup`]
//!
//! Every submission must produce exactly one completion. A worker that still
//! waits for completions while the queue reports nothing in flight treats the
//! file as failed.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

pub mod mock;
pub mod sync;

#[cfg(feature = "io_uring")]
pub mod io_uring;

#[cfg(target_os = "linux")]
pub mod libaio;

/// Upper bound for one reap call
///
/// Short enough that a worker blocked on slow storage notices an interruption
/// request within a few seconds.
pub const AIO_MAX_WAIT: Duration = Duration::from_secs(5);

/// Kernel async IO queue
///
/// Queues are `Send` so they can be created on one thread and used on another,
/// but every queue instance is used by exactly one worker.
pub trait AsyncQueue: Send {
    /// Set up kernel structures for up to `queue_depth` in-flight operations
    fn init(&mut self, queue_depth: usize) -> Result<()>;

    /// Submit one operation
    ///
    /// # Safety contract
    ///
    /// The buffer behind `op.buffer` must stay valid until the matching
    /// completion has been reaped or [`cleanup`](Self::cleanup) has returned.
    fn submit(&mut self, op: IOOperation) -> Result<()>;

    /// Wait up to `timeout` for at least one completion
    ///
    /// An empty vector means the timeout expired.
    fn reap(&mut self, timeout: Duration) -> Result<Vec<IOCompletion>>;

    /// Number of submitted operations that have not been reaped yet
    fn in_flight(&self) -> usize;

    /// Wait for outstanding operations and release kernel resources
    fn cleanup(&mut self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// One IO operation handed to a queue
#[derive(Debug)]
pub struct IOOperation {
    pub op_type: OperationType,
    pub target_fd: RawFd,
    pub offset: u64,
    /// Source (write) or destination (read) of the transfer
    pub buffer: *mut u8,
    pub length: usize,
    /// Returned unchanged in the matching [`IOCompletion`]
    pub user_data: u64,
}

// Safety: IOOperation contains a raw pointer but is only used within a single thread
// and the pointer lifetime is managed by the caller
unsafe impl Send for IOOperation {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Read,
    Write,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Read => write!(f, "read"),
            OperationType::Write => write!(f, "write"),
        }
    }
}

/// Completed IO operation
#[derive(Debug)]
pub struct IOCompletion {
    pub user_data: u64,
    /// Bytes transferred, or the error the kernel reported
    pub result: Result<usize>,
    pub op_type: OperationType,
}

/// Async queue implementation selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AsyncEngineKind {
    #[default]
    Libaio,
    IoUring,
}

impl std::fmt::Display for AsyncEngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsyncEngineKind::Libaio => write!(f, "libaio"),
            AsyncEngineKind::IoUring => write!(f, "io_uring"),
        }
    }
}

/// Creates a fresh, uninitialised queue for one file
pub type QueueFactory = Arc<dyn Fn() -> Result<Box<dyn AsyncQueue>> + Send + Sync>;

/// Build the queue factory for the configured engine
pub fn queue_factory(kind: AsyncEngineKind) -> QueueFactory {
    Arc::new(move || create_queue(kind))
}

/// Create an uninitialised queue of the given kind
pub fn create_queue(kind: AsyncEngineKind) -> Result<Box<dyn AsyncQueue>> {
    let queue: Box<dyn AsyncQueue> = match kind {
        #[cfg(target_os = "linux")]
        AsyncEngineKind::Libaio => Box::new(libaio::LibaioQueue::new()),

        #[cfg(not(target_os = "linux"))]
        AsyncEngineKind::Libaio => anyhow::bail!("libaio engine only available on Linux"),

        #[cfg(feature = "io_uring")]
        AsyncEngineKind::IoUring => Box::new(io_uring::IoUringQueue::new()),

        #[cfg(not(feature = "io_uring"))]
        AsyncEngineKind::IoUring => {
            anyhow::bail!("io_uring engine not available (feature not enabled)")
        }
    };

    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_libaio_queue() {
        let queue = create_queue(AsyncEngineKind::Libaio).unwrap();
        assert_eq!(queue.name(), "libaio");
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_engine_kind_serde_names() {
        let kind: AsyncEngineKind = serde_json::from_str("\"io_uring\"").unwrap();
        assert_eq!(kind, AsyncEngineKind::IoUring);
        assert_eq!(kind.to_string(), "io_uring");
    }
}
