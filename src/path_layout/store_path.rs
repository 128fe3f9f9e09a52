//! Store path table and write-path selection (`spec.md` §3 "Storage Path",
//! §4.A pick modes).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::PathSelectionMode;
use crate::error::{Result, StorageError};

/// One of up to 256 local base directories a node stores payload under.
#[derive(Debug)]
pub struct StorePath {
    /// Index of this path; encoded into every filename it owns.
    pub index: u8,
    /// Root directory, e.g. `/data/fastdfs/store0`.
    pub root: PathBuf,
    /// Free space, refreshed by the tracker-reporter's statvfs sweep
    /// (`spec.md` §4.G).
    pub free_mb: AtomicU64,
    /// Total space in megabytes.
    pub total_mb: AtomicU64,
}

impl StorePath {
    pub fn new(index: u8, root: PathBuf) -> StorePath {
        StorePath { index, root, free_mb: AtomicU64::new(0), total_mb: AtomicU64::new(0) }
    }

    /// `<root>/data/XX/YY`.
    pub fn data_dir(&self, dir1: u8, dir2: u8) -> PathBuf {
        self.root.join("data").join(format!("{:02X}", dir1)).join(format!("{:02X}", dir2))
    }

    /// `<root>/data/trunk/NN/MM`.
    pub fn trunk_dir(&self, dir1: u8, dir2: u8) -> PathBuf {
        self.root
            .join("data")
            .join("trunk")
            .join(format!("{:02X}", dir1))
            .join(format!("{:02X}", dir2))
    }

    pub fn free_mb(&self) -> u64 {
        self.free_mb.load(Ordering::Relaxed)
    }

    pub fn set_free_mb(&self, mb: u64) {
        self.free_mb.store(mb, Ordering::Relaxed);
    }

    pub fn total_mb(&self) -> u64 {
        self.total_mb.load(Ordering::Relaxed)
    }

    pub fn set_total_mb(&self, mb: u64) {
        self.total_mb.store(mb, Ordering::Relaxed);
    }

    /// Statvfs's this path's root and returns `(free_mb, total_mb)`,
    /// updating the cached atomics (`spec.md` §4.G "Disk-usage report":
    /// "statvfs each base path").
    pub fn refresh_statvfs_mb(&self) -> Result<(u64, u64)> {
        let (free_mb, total_mb) = statvfs_mb(&self.root)?;
        self.set_free_mb(free_mb);
        self.set_total_mb(total_mb);
        Ok((free_mb, total_mb))
    }
}

#[cfg(target_os = "linux")]
fn statvfs_mb(path: &Path) -> Result<(u64, u64)> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    std::fs::create_dir_all(path)?;
    let c_path = CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| StorageError::DiskIo(std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains a NUL byte")))?;

    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(StorageError::from(std::io::Error::last_os_error()));
    }
    let stat = unsafe { stat.assume_init() };
    let block_size = stat.f_frsize as u64;
    let free_mb = (stat.f_bavail as u64 * block_size) / (1024 * 1024);
    let total_mb = (stat.f_blocks as u64 * block_size) / (1024 * 1024);
    Ok((free_mb, total_mb))
}

#[cfg(not(target_os = "linux"))]
fn statvfs_mb(path: &Path) -> Result<(u64, u64)> {
    std::fs::create_dir_all(path)?;
    Ok((0, 0))
}

/// Picks which store path a new upload lands on (`spec.md` §4.A).
///
/// `ROUND_ROBIN` cycles through paths in order; `LOAD_BALANCE` is
/// re-evaluated on every call against the most recent statvfs snapshot.
pub struct PathSelector {
    mode: PathSelectionMode,
    reserved_mb: u64,
    next: AtomicU64,
}

impl PathSelector {
    pub fn new(mode: PathSelectionMode, reserved_mb: u64) -> PathSelector {
        PathSelector { mode, reserved_mb, next: AtomicU64::new(0) }
    }

    /// Chooses a store path index for a new write.
    ///
    /// In `LOAD_BALANCE` mode, fails with [`StorageError::NoSpace`] when no
    /// path clears `reserved_mb` plus the average reserve across all paths
    /// (the tie-break in `spec.md` §4.D).
    pub fn pick(&self, paths: &[StorePath]) -> Result<u8> {
        if paths.is_empty() {
            return Err(StorageError::NoSpace);
        }
        match self.mode {
            PathSelectionMode::RoundRobin => {
                let i = self.next.fetch_add(1, Ordering::Relaxed) as usize % paths.len();
                Ok(paths[i].index)
            }
            PathSelectionMode::LoadBalance => {
                let avg_reserved = self.reserved_mb;
                paths
                    .iter()
                    .filter(|p| p.free_mb() > self.reserved_mb + avg_reserved)
                    .max_by_key(|p| p.free_mb())
                    .map(|p| p.index)
                    .ok_or(StorageError::NoSpace)
            }
        }
    }
}

/// Computes the local on-disk path for an already-decoded logical filename.
pub fn physical_path(base: &Path, dir1: u8, dir2: u8, encoded: &str, ext: &str) -> PathBuf {
    let dir = base.join("data").join(format!("{:02X}", dir1)).join(format!("{:02X}", dir2));
    if ext.is_empty() {
        dir.join(encoded)
    } else {
        dir.join(format!("{encoded}.{ext}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_all_paths() {
        let paths = vec![
            StorePath::new(0, "/a".into()),
            StorePath::new(1, "/b".into()),
            StorePath::new(2, "/c".into()),
        ];
        let selector = PathSelector::new(PathSelectionMode::RoundRobin, 0);
        let picks: Vec<u8> = (0..6).map(|_| selector.pick(&paths).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn load_balance_picks_most_free_space() {
        let paths = vec![StorePath::new(0, "/a".into()), StorePath::new(1, "/b".into())];
        paths[0].set_free_mb(500);
        paths[1].set_free_mb(2000);
        let selector = PathSelector::new(PathSelectionMode::LoadBalance, 10);
        assert_eq!(selector.pick(&paths).unwrap(), 1);
    }

    #[test]
    fn load_balance_fails_when_no_path_clears_reserve() {
        let paths = vec![StorePath::new(0, "/a".into())];
        paths[0].set_free_mb(50);
        let selector = PathSelector::new(PathSelectionMode::LoadBalance, 1000);
        assert!(matches!(selector.pick(&paths), Err(StorageError::NoSpace)));
    }
}
