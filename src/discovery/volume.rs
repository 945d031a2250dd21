//! OS-level volume probes
//!
//! Classification and capacity checks for the entries found under each
//! class's discovery directory. Only Filesystem volumes are supported on
//! non-UNIX hosts; block probes there return [`Error::Unsupported`].

use crate::config::VolumeMode;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

// =============================================================================
// Volume Util Port
// =============================================================================

/// OS probes used by the discoverer and deleter.
pub trait VolumeUtil: Send + Sync {
    fn is_dir(&self, path: &Path) -> Result<bool>;

    fn is_block(&self, path: &Path) -> Result<bool>;

    /// Entry names under `path`, sorted for a stable scan order.
    fn read_dir(&self, path: &Path) -> Result<Vec<String>>;

    /// Capacity in bytes of the filesystem containing `path`.
    fn fs_capacity(&self, path: &Path) -> Result<u64>;

    /// Size in bytes of the block device at `path`.
    fn block_capacity(&self, path: &Path) -> Result<u64>;

    /// Heuristic mount-point check: `path` sits on a different device than
    /// its parent directory.
    fn is_likely_mount_point(&self, path: &Path) -> Result<bool>;
}

/// Classify a path as Filesystem (directory) or Block (device node).
/// `Ok(None)` means both probes answered and the entry is neither; probe
/// failures report the directory error first.
pub fn probe_volume_mode(util: &dyn VolumeUtil, path: &Path) -> Result<Option<VolumeMode>> {
    if cfg!(not(unix)) {
        return Ok(Some(VolumeMode::Filesystem));
    }

    let dir_result = util.is_dir(path);
    if let Ok(true) = dir_result {
        return Ok(Some(VolumeMode::Filesystem));
    }
    let block_result = util.is_block(path);
    if let Ok(true) = block_result {
        return Ok(Some(VolumeMode::Block));
    }

    match (dir_result, block_result) {
        (Ok(_), Ok(_)) => Ok(None),
        (Err(e), _) => Err(e),
        (_, Err(e)) => Err(e),
    }
}

// =============================================================================
// OS Implementation
// =============================================================================

/// [`VolumeUtil`] backed by the host OS.
#[derive(Debug, Default)]
pub struct OsVolumeUtil;

impl OsVolumeUtil {
    pub fn new() -> Self {
        Self
    }
}

fn probe_err(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::Probe {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

impl VolumeUtil for OsVolumeUtil {
    fn is_dir(&self, path: &Path) -> Result<bool> {
        let meta = fs::metadata(path).map_err(|e| probe_err(path, e))?;
        Ok(meta.is_dir())
    }

    #[cfg(unix)]
    fn is_block(&self, path: &Path) -> Result<bool> {
        use std::os::unix::fs::FileTypeExt;
        let meta = fs::metadata(path).map_err(|e| probe_err(path, e))?;
        Ok(meta.file_type().is_block_device())
    }

    #[cfg(not(unix))]
    fn is_block(&self, _path: &Path) -> Result<bool> {
        Err(Error::Unsupported(
            "block device probes require a UNIX host".to_string(),
        ))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| probe_err(path, e))? {
            let entry = entry.map_err(|e| probe_err(path, e))?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    #[cfg(unix)]
    fn fs_capacity(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(|e| probe_err(path, e))?;
        Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
    }

    #[cfg(not(unix))]
    fn fs_capacity(&self, _path: &Path) -> Result<u64> {
        Err(Error::Unsupported(
            "filesystem capacity probe requires a UNIX host".to_string(),
        ))
    }

    #[cfg(unix)]
    fn block_capacity(&self, path: &Path) -> Result<u64> {
        use std::os::fd::AsRawFd;

        // BLKGETSIZE64: total device size in bytes.
        nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

        let file = fs::File::open(path).map_err(|e| probe_err(path, e))?;
        let mut size: u64 = 0;
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }
            .map_err(|e| probe_err(path, e))?;
        Ok(size)
    }

    #[cfg(not(unix))]
    fn block_capacity(&self, _path: &Path) -> Result<u64> {
        Err(Error::Unsupported(
            "block device probes require a UNIX host".to_string(),
        ))
    }

    #[cfg(unix)]
    fn is_likely_mount_point(&self, path: &Path) -> Result<bool> {
        use std::os::unix::fs::MetadataExt;

        let meta = fs::metadata(path).map_err(|e| probe_err(path, e))?;
        let parent = match path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            None => return Ok(true),
        };
        let parent_meta = fs::metadata(parent).map_err(|e| probe_err(parent, e))?;
        Ok(meta.dev() != parent_meta.dev())
    }

    #[cfg(not(unix))]
    fn is_likely_mount_point(&self, _path: &Path) -> Result<bool> {
        Err(Error::Unsupported(
            "mount point probe requires a UNIX host".to_string(),
        ))
    }
}
