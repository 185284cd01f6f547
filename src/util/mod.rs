//! Shared utilities

pub mod buffer;
pub mod format;
