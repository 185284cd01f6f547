//! In-memory async queue for tests
//!
//! Completes operations without touching the kernel. Clones share state, so a
//! test keeps one handle to inspect submissions while a worker owns another.
//!
//! Besides plain success the queue can simulate:
//!
//! - failed completions ([`MockQueue::set_should_fail`])
//! - short transfers ([`MockQueue::set_bytes_per_op`])
//! - lost completions: after [`MockQueue::set_complete_limit`] submissions, every
//!   further submission is accepted but never completes and is not reported as
//!   in flight
//! - a stalled device ([`MockQueue::set_stalled`]): reap waits and returns nothing
//!
//! ```
//! use phasebench::engine::{AsyncQueue, IOOperation, OperationType};
//! use phasebench::engine::mock::MockQueue;
//! use std::time::Duration;
//!
//! let mut queue = MockQueue::new();
//! queue.init(4).unwrap();
//!
//! queue.submit(IOOperation {
//!     op_type: OperationType::Read,
//!     target_fd: 1,
//!     offset: 0,
//!     buffer: std::ptr::null_mut(),
//!     length: 4096,
//!     user_data: 42,
//! }).unwrap();
//!
//! let completions = queue.reap(Duration::from_millis(1)).unwrap();
//! assert_eq!(completions.len(), 1);
//! assert_eq!(completions[0].user_data, 42);
//! ```

use super::{AsyncQueue, IOCompletion, IOOperation, OperationType};
use crate::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Submitted operation as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    pub op_type: OperationType,
    pub target_fd: i32,
    pub offset: u64,
    pub length: usize,
    pub user_data: u64,
}

#[derive(Debug, Default)]
struct MockState {
    queue_depth: usize,
    submitted: Vec<OperationRecord>,
    pending: VecDeque<OperationRecord>,
    num_completable: usize,
    num_lost: usize,
    complete_limit: Option<usize>,
    should_fail: bool,
    bytes_per_op: usize,
    stalled: bool,
    num_inits: usize,
    num_cleanups: usize,
}

#[derive(Clone, Default)]
pub struct MockQueue {
    state: Arc<Mutex<MockState>>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Complete at most `limit` submissions over the queue's lifetime
    pub fn set_complete_limit(&self, limit: usize) {
        self.lock().complete_limit = Some(limit);
    }

    pub fn set_should_fail(&self, should_fail: bool) {
        self.lock().should_fail = should_fail;
    }

    /// Report `bytes` transferred per operation, 0 means the requested length
    pub fn set_bytes_per_op(&self, bytes: usize) {
        self.lock().bytes_per_op = bytes;
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    pub fn submitted_operations(&self) -> Vec<OperationRecord> {
        self.lock().submitted.clone()
    }

    pub fn submitted_count(&self) -> usize {
        self.lock().submitted.len()
    }

    pub fn lost_count(&self) -> usize {
        self.lock().num_lost
    }

    pub fn queue_depth(&self) -> usize {
        self.lock().queue_depth
    }

    pub fn num_inits(&self) -> usize {
        self.lock().num_inits
    }

    pub fn num_cleanups(&self) -> usize {
        self.lock().num_cleanups
    }

    /// Factory handing out clones of this queue
    pub fn factory(&self) -> super::QueueFactory {
        let queue = self.clone();
        Arc::new(move || Ok(Box::new(queue.clone()) as Box<dyn AsyncQueue>))
    }
}

impl AsyncQueue for MockQueue {
    fn init(&mut self, queue_depth: usize) -> Result<()> {
        let mut state = self.lock();
        state.queue_depth = queue_depth;
        state.num_inits += 1;
        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let record = OperationRecord {
            op_type: op.op_type,
            target_fd: op.target_fd,
            offset: op.offset,
            length: op.length,
            user_data: op.user_data,
        };

        let mut state = self.lock();
        state.submitted.push(record.clone());

        if state.complete_limit.is_some_and(|limit| state.num_completable >= limit) {
            state.num_lost += 1;
            return Ok(());
        }

        state.num_completable += 1;
        state.pending.push_back(record);
        Ok(())
    }

    fn reap(&mut self, timeout: Duration) -> Result<Vec<IOCompletion>> {
        let mut state = self.lock();

        if state.stalled {
            drop(state);
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
            return Ok(Vec::new());
        }

        let should_fail = state.should_fail;
        let bytes_per_op = state.bytes_per_op;

        let completions = state
            .pending
            .drain(..)
            .map(|op| {
                let result = if should_fail {
                    Err(anyhow::anyhow!("Mock IO error"))
                } else if bytes_per_op == 0 {
                    Ok(op.length)
                } else {
                    Ok(bytes_per_op.min(op.length))
                };

                IOCompletion {
                    user_data: op.user_data,
                    result,
                    op_type: op.op_type,
                }
            })
            .collect();

        Ok(completions)
    }

    fn in_flight(&self) -> usize {
        self.lock().pending.len()
    }

    fn cleanup(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.pending.clear();
        state.num_cleanups += 1;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(user_data: u64, length: usize) -> IOOperation {
        IOOperation {
            op_type: OperationType::Read,
            target_fd: 3,
            offset: user_data * length as u64,
            buffer: std::ptr::null_mut(),
            length,
            user_data,
        }
    }

    #[test]
    fn test_completion_limit_loses_later_submissions() {
        let mut queue = MockQueue::new();
        queue.init(16).unwrap();
        queue.set_complete_limit(15);

        for i in 0..16 {
            queue.submit(op(i, 4096)).unwrap();
        }

        assert_eq!(queue.submitted_count(), 16);
        assert_eq!(queue.lost_count(), 1);
        assert_eq!(queue.in_flight(), 15);

        let completions = queue.reap(Duration::from_millis(1)).unwrap();
        assert_eq!(completions.len(), 15);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_failure_and_short_transfer() {
        let mut queue = MockQueue::new();
        queue.init(2).unwrap();

        queue.set_bytes_per_op(1024);
        queue.submit(op(1, 4096)).unwrap();
        let completions = queue.reap(Duration::from_millis(1)).unwrap();
        assert_eq!(*completions[0].result.as_ref().unwrap(), 1024);

        queue.set_should_fail(true);
        queue.submit(op(2, 4096)).unwrap();
        let completions = queue.reap(Duration::from_millis(1)).unwrap();
        assert!(completions[0].result.is_err());
    }

    #[test]
    fn test_stalled_queue_keeps_ops_in_flight() {
        let mut queue = MockQueue::new();
        queue.init(2).unwrap();
        queue.set_stalled(true);
        queue.submit(op(0, 512)).unwrap();

        assert!(queue.reap(Duration::from_millis(1)).unwrap().is_empty());
        assert_eq!(queue.in_flight(), 1);
    }

    #[test]
    fn test_factory_clones_share_state() {
        let queue = MockQueue::new();
        let factory = queue.factory();

        let mut created = factory().unwrap();
        created.init(8).unwrap();
        created.submit(op(7, 128)).unwrap();
        created.cleanup().unwrap();

        assert_eq!(queue.queue_depth(), 8);
        assert_eq!(queue.submitted_operations()[0].user_data, 7);
        assert_eq!(queue.num_cleanups(), 1);
    }
}
