//! io_uring queue
//!
//! Async IO through Linux io_uring (kernel 5.11+ for timed waits). Submissions
//! are pushed to the submission ring and handed to the kernel in the next
//! [`reap`](AsyncQueue::reap) call together with the wait, so a full io depth
//! of seeded operations costs one syscall.

use super::{AsyncQueue, IOCompletion, IOOperation, OperationType};
use crate::Result;
use anyhow::Context;
use io_uring::{opcode, types, IoUring};
use std::collections::HashMap;
use std::time::Duration;

pub struct IoUringQueue {
    ring: Option<IoUring>,

    /// user_data -> op type of every in-flight operation
    pending_ops: HashMap<u64, OperationType>,
}

impl IoUringQueue {
    pub fn new() -> Self {
        Self {
            ring: None,
            pending_ops: HashMap::new(),
        }
    }

    fn drain_completions(ring: &mut IoUring, pending_ops: &mut HashMap<u64, OperationType>) -> Vec<IOCompletion> {
        let mut completions = Vec::new();

        for cqe in ring.completion() {
            let user_data = cqe.user_data();
            let result_code = cqe.result();

            let op_type = match pending_ops.remove(&user_data) {
                Some(op_type) => op_type,
                None => continue,
            };

            let result = if result_code >= 0 {
                Ok(result_code as usize)
            } else {
                let errno = -result_code;
                Err(std::io::Error::from_raw_os_error(errno))
                    .context(format!("{} operation failed: errno={}", op_type, errno))
            };

            completions.push(IOCompletion {
                user_data,
                result,
                op_type,
            });
        }

        completions
    }
}

impl Default for IoUringQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue for IoUringQueue {
    fn init(&mut self, queue_depth: usize) -> Result<()> {
        let ring = IoUring::new(queue_depth.max(1) as u32).context(format!(
            "Failed to create io_uring instance. queue_depth={}",
            queue_depth
        ))?;

        self.ring = Some(ring);
        self.pending_ops.clear();

        Ok(())
    }

    fn submit(&mut self, op: IOOperation) -> Result<()> {
        let ring = self
            .ring
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("io_uring queue used before init"))?;

        let entry = match op.op_type {
            OperationType::Read => opcode::Read::new(types::Fd(op.target_fd), op.buffer, op.length as u32)
                .offset(op.offset)
                .build()
                .user_data(op.user_data),
            OperationType::Write => {
                opcode::Write::new(types::Fd(op.target_fd), op.buffer as *const u8, op.length as u32)
                    .offset(op.offset)
                    .build()
                    .user_data(op.user_data)
            }
        };

        // SAFETY: the caller keeps op.buffer valid until the completion is reaped
        unsafe {
            ring.submission()
                .push(&entry)
                .map_err(|_| anyhow::anyhow!("Submission queue full"))?;
        }

        self.pending_ops.insert(op.user_data, op.op_type);
        Ok(())
    }

    fn reap(&mut self, timeout: Duration) -> Result<Vec<IOCompletion>> {
        let ring = self
            .ring
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("io_uring queue used before init"))?;

        if self.pending_ops.is_empty() {
            return Ok(Vec::new());
        }

        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);

        if let Err(err) = ring.submitter().submit_with_args(1, &args) {
            match err.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) => {}
                _ => {
                    return Err(err).context(format!(
                        "Waiting for io_uring completions failed. NumPending: {}",
                        self.pending_ops.len()
                    ))
                }
            }
        }

        Ok(Self::drain_completions(ring, &mut self.pending_ops))
    }

    fn in_flight(&self) -> usize {
        self.pending_ops.len()
    }

    fn cleanup(&mut self) -> Result<()> {
        if let Some(ref mut ring) = self.ring {
            let _ = ring.submit();

            while !self.pending_ops.is_empty() {
                Self::drain_completions(ring, &mut self.pending_ops);

                if !self.pending_ops.is_empty() && ring.submit_and_wait(1).is_err() {
                    break;
                }
            }
        }

        self.ring = None;
        self.pending_ops.clear();

        Ok(())
    }

    fn name(&self) -> &'static str {
        "io_uring"
    }
}

impl Drop for IoUringQueue {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(1);

    fn reap_all(queue: &mut IoUringQueue, expected: usize) -> Vec<IOCompletion> {
        let mut completions = Vec::new();
        while completions.len() < expected {
            completions.extend(queue.reap(WAIT).unwrap());
        }
        completions
    }

    #[test]
    fn test_io_uring_queue_reads_at_offsets() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("read.dat");
        std::fs::write(&file_path, b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ").unwrap();
        let file = File::open(&file_path).unwrap();

        let mut queue = IoUringQueue::new();
        queue.init(8).unwrap();

        let mut buffers = vec![vec![0u8; 5]; 3];
        for (i, buffer) in buffers.iter_mut().enumerate() {
            queue
                .submit(IOOperation {
                    op_type: OperationType::Read,
                    target_fd: file.as_raw_fd(),
                    offset: (i * 5) as u64,
                    buffer: buffer.as_mut_ptr(),
                    length: buffer.len(),
                    user_data: i as u64,
                })
                .unwrap();
        }
        assert_eq!(queue.in_flight(), 3);

        let completions = reap_all(&mut queue, 3);
        assert!(completions.iter().all(|c| *c.result.as_ref().unwrap() == 5));
        assert_eq!(queue.in_flight(), 0);

        assert_eq!(&buffers[0][..], b"01234");
        assert_eq!(&buffers[1][..], b"56789");
        assert_eq!(&buffers[2][..], b"ABCDE");
    }

    #[test]
    fn test_io_uring_queue_write() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("write.dat");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&file_path)
            .unwrap();

        let mut queue = IoUringQueue::new();
        queue.init(2).unwrap();

        let mut data = b"Writing through io_uring".to_vec();
        queue
            .submit(IOOperation {
                op_type: OperationType::Write,
                target_fd: file.as_raw_fd(),
                offset: 0,
                buffer: data.as_mut_ptr(),
                length: data.len(),
                user_data: 99,
            })
            .unwrap();

        let completions = reap_all(&mut queue, 1);
        assert_eq!(completions[0].user_data, 99);
        assert_eq!(completions[0].op_type, OperationType::Write);
        queue.cleanup().unwrap();
        drop(file);

        assert_eq!(std::fs::read(&file_path).unwrap(), data);
    }

    #[test]
    fn test_io_uring_queue_invalid_fd_completes_with_error() {
        let mut queue = IoUringQueue::new();
        queue.init(2).unwrap();

        let mut buffer = vec![0u8; 100];
        queue
            .submit(IOOperation {
                op_type: OperationType::Read,
                target_fd: -1,
                offset: 0,
                buffer: buffer.as_mut_ptr(),
                length: buffer.len(),
                user_data: 1,
            })
            .unwrap();

        let completions = reap_all(&mut queue, 1);
        assert!(completions[0].result.is_err());
    }

    #[test]
    fn test_reap_with_nothing_pending_returns_empty() {
        let mut queue = IoUringQueue::new();
        queue.init(4).unwrap();
        assert!(queue.reap(WAIT).unwrap().is_empty());
        queue.cleanup().unwrap();
        assert!(queue.ring.is_none());
    }
}
