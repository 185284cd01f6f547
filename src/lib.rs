//! phasebench - phase-synchronized storage IO exerciser
//!
//! A pool of worker threads runs a fixed sequence of benchmark phases
//! (create dirs, write, read, stat, delete files, delete dirs) in lockstep
//! against directories, files or block devices. Each phase starts on all
//! workers at once and ends when the last worker reports back.
//!
//! # Architecture
//!
//! - **Coordinator**: prepares workers, runs the selected phases, collects summaries
//! - **Workers**: one thread per worker, synchronized by a phase barrier
//! - **IO engines**: positional sync IO, libaio or io_uring for queue depth > 1
//! - **Offset generators**: sequential, random aligned and random unaligned
//! - **GPU buffers**: optional device staging or direct storage transfers
//! - **Stats**: live counters, stonewall snapshots, latency histograms

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod gpu;
pub mod offset;
pub mod output;
pub mod stats;
pub mod target;
pub mod util;
pub mod worker;

pub use config::Config;

/// Result type used throughout phasebench
pub type Result<T> = anyhow::Result<T>;
