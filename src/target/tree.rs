//! Per-worker directory tree for dir mode
//!
//! Every worker owns a private subtree below each bench path:
//!
//! ```text
//! <bench path>/r<rank>/d<dir>/f<file>
//! ```
//!
//! The rank dir exists in every bench path. Dir `d<i>` and all of its files live
//! in bench path `(rank + i) % num_paths`, which spreads workers round-robin
//! across the paths.

use super::MKDIR_MODE;
use crate::Result;
use anyhow::Context;
use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

pub fn rank_dir(rank: usize) -> PathBuf {
    PathBuf::from(format!("r{}", rank))
}

pub fn dir_path(rank: usize, dir_index: usize) -> PathBuf {
    PathBuf::from(format!("r{}/d{}", rank, dir_index))
}

pub fn file_path(rank: usize, dir_index: usize, file_index: usize) -> PathBuf {
    PathBuf::from(format!("r{}/d{}/f{}", rank, dir_index, file_index))
}

/// Bench path that holds dir `dir_index` of worker `rank`
pub fn bench_path_index(rank: usize, dir_index: usize, num_paths: usize) -> usize {
    (rank + dir_index) % num_paths.max(1)
}

/// Create `base/rel`, an existing directory is fine
pub fn make_dir(base: &Path, rel: &Path) -> Result<()> {
    let path = base.join(rel);

    match DirBuilder::new().mode(MKDIR_MODE).create(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Directory creation failed. Path: {}", path.display())),
    }
}

/// Remove directory `base/rel`
///
/// A missing directory is only tolerated with `ignore_missing`.
pub fn remove_dir(base: &Path, rel: &Path, ignore_missing: bool) -> Result<()> {
    let path = base.join(rel);

    match std::fs::remove_dir(&path) {
        Ok(()) => Ok(()),
        Err(e) if ignore_missing && e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Directory deletion failed. Path: {}", path.display())),
    }
}

/// Unlink file `path`
///
/// A missing file is only tolerated with `ignore_missing`.
pub fn remove_file(path: &Path, ignore_missing: bool) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if ignore_missing && e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("File delete failed. Path: {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_names() {
        assert_eq!(rank_dir(3), PathBuf::from("r3"));
        assert_eq!(dir_path(3, 7), PathBuf::from("r3/d7"));
        assert_eq!(file_path(0, 1, 2), PathBuf::from("r0/d1/f2"));
    }

    #[test]
    fn test_bench_path_round_robin() {
        assert_eq!(bench_path_index(0, 0, 2), 0);
        assert_eq!(bench_path_index(0, 1, 2), 1);
        assert_eq!(bench_path_index(1, 0, 2), 1);
        assert_eq!(bench_path_index(1, 1, 2), 0);
        assert_eq!(bench_path_index(5, 3, 1), 0);
    }

    #[test]
    fn test_make_dir_twice_is_fine() {
        let base = TempDir::new().unwrap();
        make_dir(base.path(), &rank_dir(0)).unwrap();
        make_dir(base.path(), &rank_dir(0)).unwrap();
        make_dir(base.path(), &dir_path(0, 0)).unwrap();
        assert!(base.path().join("r0/d0").is_dir());
    }

    #[test]
    fn test_make_dir_without_parent_fails() {
        let base = TempDir::new().unwrap();
        let err = make_dir(base.path(), &dir_path(9, 0)).unwrap_err();
        assert!(err.to_string().contains("Directory creation failed"));
    }

    #[test]
    fn test_remove_missing_only_with_ignore() {
        let base = TempDir::new().unwrap();
        assert!(remove_dir(base.path(), &rank_dir(4), false).is_err());
        assert!(remove_dir(base.path(), &rank_dir(4), true).is_ok());

        let missing = base.path().join("nofile");
        assert!(remove_file(&missing, false).is_err());
        assert!(remove_file(&missing, true).is_ok());
    }
}
