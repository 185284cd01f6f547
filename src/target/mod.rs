//! Bench targets
//!
//! A run works on a list of bench paths that are all of the same kind:
//!
//! - **Dir**: every worker builds its own tree of dirs and files below each path
//!   (see [`tree`]).
//! - **File**: regular files shared by all workers. Each worker reads or writes
//!   its own slice of every file.
//! - **BlockDev**: like file mode, but the paths are block devices that can't be
//!   created or truncated.
//!
//! In file and block device mode the paths are opened once during preparation
//! and the descriptors are shared by all workers. All IO on them is positional.

pub mod tree;

use crate::offset::FileRange;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

// ioctl request code for getting block device size
const BLKGETSIZE64: libc::c_ulong = 0x80081272;

/// Mode for creating new files
pub const MKFILE_MODE: u32 = 0o664;

/// Mode for creating new directories
pub const MKDIR_MODE: u32 = 0o777;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchPathType {
    Dir,
    File,
    BlockDev,
}

impl std::fmt::Display for BenchPathType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchPathType::Dir => write!(f, "directory"),
            BenchPathType::File => write!(f, "file"),
            BenchPathType::BlockDev => write!(f, "block device"),
        }
    }
}

/// Type of an existing path, `None` if it does not exist
pub fn detect_path_type(path: &Path) -> Result<Option<BenchPathType>> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Unable to check bench path: {}", path.display()))
        }
    };

    let file_type = metadata.file_type();

    if file_type.is_dir() {
        Ok(Some(BenchPathType::Dir))
    } else if file_type.is_block_device() {
        Ok(Some(BenchPathType::BlockDev))
    } else if file_type.is_file() {
        Ok(Some(BenchPathType::File))
    } else {
        anyhow::bail!(
            "Unsupported bench path type (neither dir, file nor block device): {}",
            path.display()
        )
    }
}

/// Common type of all bench paths
///
/// Paths that don't exist yet count as files. Mixing types is an error.
pub fn detect_bench_path_type(paths: &[PathBuf]) -> Result<BenchPathType> {
    if paths.is_empty() {
        anyhow::bail!("No bench paths given");
    }

    let mut common: Option<BenchPathType> = None;

    for path in paths {
        let path_type = detect_path_type(path)?.unwrap_or(BenchPathType::File);

        match common {
            None => common = Some(path_type),
            Some(t) if t != path_type => anyhow::bail!(
                "Bench paths must all be of the same type. {} is a {}, expected a {}",
                path.display(),
                path_type,
                t
            ),
            Some(_) => {}
        }
    }

    Ok(common.unwrap_or(BenchPathType::File))
}

/// Size of a block device in bytes
pub fn block_device_size(file: &File, path: &Path) -> Result<u64> {
    let mut size: u64 = 0;
    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        return Err(err).context(format!("ioctl(BLKGETSIZE64) failed: path={}", path.display()));
    }

    Ok(size)
}

/// Bench paths prepared for a run
#[derive(Debug)]
pub struct BenchTargets {
    paths: Vec<PathBuf>,
    path_type: BenchPathType,
    /// Shared descriptors in file and block device mode, empty in dir mode
    files: Vec<File>,
    file_size: u64,
}

impl BenchTargets {
    /// Detect the path type and open shared descriptors if needed
    ///
    /// In file mode missing files are created. With `truncate` existing files
    /// are cut to zero first. In block device mode a `file_size` of 0 selects
    /// the size of the smallest device.
    pub fn prepare(paths: &[PathBuf], file_size: u64, direct_io: bool, truncate: bool) -> Result<Self> {
        let path_type = detect_bench_path_type(paths)?;
        let mut files = Vec::new();
        let mut resolved_size = file_size;

        match path_type {
            BenchPathType::Dir => {}
            BenchPathType::File => {
                for path in paths {
                    let mut options = OpenOptions::new();
                    options
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(truncate)
                        .mode(MKFILE_MODE);
                    if direct_io {
                        options.custom_flags(libc::O_DIRECT);
                    }

                    let file = options
                        .open(path)
                        .with_context(|| format!("Unable to open benchmark file: {}", path.display()))?;
                    files.push(file);
                }
            }
            BenchPathType::BlockDev => {
                let mut min_size = u64::MAX;

                for path in paths {
                    let mut options = OpenOptions::new();
                    options.read(true).write(true);
                    if direct_io {
                        options.custom_flags(libc::O_DIRECT);
                    }

                    let file = options
                        .open(path)
                        .with_context(|| format!("Unable to open block device: {}", path.display()))?;
                    min_size = min_size.min(block_device_size(&file, path)?);
                    files.push(file);
                }

                if resolved_size == 0 {
                    resolved_size = min_size;
                } else if resolved_size > min_size {
                    anyhow::bail!(
                        "File size exceeds smallest block device. File size: {}; Device size: {}",
                        resolved_size,
                        min_size
                    );
                }
            }
        }

        tracing::debug!(
            "Prepared {} bench path(s) of type {}, file size {}",
            paths.len(),
            path_type,
            resolved_size
        );

        Ok(Self {
            paths: paths.to_vec(),
            path_type,
            files,
            file_size: resolved_size,
        })
    }

    pub fn path_type(&self) -> BenchPathType {
        self.path_type
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn num_paths(&self) -> usize {
        self.paths.len()
    }

    /// Effective file size for data phases
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Shared descriptors (file and block device mode)
    pub fn fds(&self) -> Vec<RawFd> {
        self.files.iter().map(|f| f.as_raw_fd()).collect()
    }
}

/// Slice of a shared file owned by one worker
///
/// The file is split into `file_size / block_size` blocks, each worker gets an
/// equal number of whole blocks and the last worker additionally gets whatever
/// is left up to the end of the file.
pub fn worker_file_range(rank: usize, num_workers: usize, file_size: u64, block_size: u64) -> FileRange {
    let num_workers = num_workers.max(1) as u64;
    let rank = rank as u64;
    let num_blocks = if block_size == 0 { 0 } else { file_size / block_size };
    let blocks_per_worker = num_blocks / num_workers;

    let start = rank * block_size * blocks_per_worker;
    let len = if rank == num_workers - 1 {
        file_size.saturating_sub(start)
    } else {
        block_size * blocks_per_worker
    };

    FileRange { start, len }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_worker_ranges_cover_file() {
        let file_size = 10 * 4096 + 100;
        let ranges: Vec<_> = (0..3)
            .map(|rank| worker_file_range(rank, 3, file_size, 4096))
            .collect();

        assert_eq!(ranges[0], FileRange { start: 0, len: 3 * 4096 });
        assert_eq!(ranges[1], FileRange { start: 3 * 4096, len: 3 * 4096 });
        assert_eq!(ranges[2].start, 6 * 4096);
        assert_eq!(ranges[2].end(), file_size);

        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start);
        }
    }

    #[test]
    fn test_single_worker_gets_whole_file() {
        let range = worker_file_range(0, 1, 1 << 20, 4096);
        assert_eq!(range, FileRange { start: 0, len: 1 << 20 });
    }

    #[test]
    fn test_detect_types() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        assert_eq!(detect_path_type(dir.path()).unwrap(), Some(BenchPathType::Dir));
        assert_eq!(detect_path_type(&file).unwrap(), Some(BenchPathType::File));
        assert_eq!(detect_path_type(&dir.path().join("missing")).unwrap(), None);
    }

    #[test]
    fn test_mixed_path_types_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();

        let err = detect_bench_path_type(&[dir.path().to_path_buf(), file]).unwrap_err();
        assert!(err.to_string().contains("same type"));
    }

    #[test]
    fn test_prepare_file_mode_creates_missing_files() {
        let dir = TempDir::new().unwrap();
        let paths = vec![dir.path().join("a"), dir.path().join("b")];

        let targets = BenchTargets::prepare(&paths, 8192, false, false).unwrap();

        assert_eq!(targets.path_type(), BenchPathType::File);
        assert_eq!(targets.fds().len(), 2);
        assert_eq!(targets.file_size(), 8192);
        assert!(paths.iter().all(|p| p.exists()));
    }

    #[test]
    fn test_prepare_dir_mode_opens_nothing() {
        let dir = TempDir::new().unwrap();
        let targets = BenchTargets::prepare(&[dir.path().to_path_buf()], 4096, false, false).unwrap();

        assert_eq!(targets.path_type(), BenchPathType::Dir);
        assert!(targets.fds().is_empty());
    }
}
