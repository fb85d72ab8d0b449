//! File ownership queries
//!
//! Device nodes are handed to the current user while an image is connected
//! and handed back afterwards; these helpers answer "who owns this now" and
//! "who am I". [`drop_cached_range`] makes the next read of a range go to
//! the device instead of the page cache.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use crate::error::{HalError, HalResult};

/// Numeric owner of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// `uid:gid`, the form `chown` expects.
    pub fn spec(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }
}

/// Owner of `path` as recorded in its metadata.
#[cfg(unix)]
pub fn owner_of<P: AsRef<Path>>(path: P) -> HalResult<Ownership> {
    use std::os::unix::fs::MetadataExt;

    let path = path.as_ref();
    let metadata = fs::metadata(path)
        .map_err(|e| HalError::io_error("metadata", Some(&path.to_string_lossy()), e))?;
    Ok(Ownership::new(metadata.uid(), metadata.gid()))
}

#[cfg(not(unix))]
pub fn owner_of<P: AsRef<Path>>(path: P) -> HalResult<Ownership> {
    let path = path.as_ref();
    fs::metadata(path)
        .map_err(|e| HalError::io_error("metadata", Some(&path.to_string_lossy()), e))?;
    Err(HalError::unsupported("file ownership is only tracked on Unix"))
}

/// Real uid/gid of the running process.
#[cfg(unix)]
pub fn current_owner() -> HalResult<Ownership> {
    use nix::unistd::{getgid, getuid};

    Ok(Ownership::new(getuid().as_raw(), getgid().as_raw()))
}

#[cfg(not(unix))]
pub fn current_owner() -> HalResult<Ownership> {
    Err(HalError::unsupported("file ownership is only tracked on Unix"))
}

/// Flush `file` to its device and evict `[offset, offset + len)` from the
/// page cache.
#[cfg(target_os = "linux")]
pub fn drop_cached_range(file: &File, offset: u64, len: u64) -> HalResult<()> {
    use nix::fcntl::{posix_fadvise, PosixFadviseAdvice};
    use std::os::unix::io::AsRawFd;

    file.sync_all()
        .map_err(|e| HalError::io_error("sync_all", None, e))?;

    let out_of_range = || {
        HalError::io_error(
            "posix_fadvise",
            None,
            io::Error::new(io::ErrorKind::InvalidInput, "range does not fit off_t"),
        )
    };
    let offset = offset.try_into().map_err(|_| out_of_range())?;
    let len = len.try_into().map_err(|_| out_of_range())?;
    posix_fadvise(
        file.as_raw_fd(),
        offset,
        len,
        PosixFadviseAdvice::POSIX_FADV_DONTNEED,
    )
    .map(|_| ())
    .map_err(|errno| HalError::io_error("posix_fadvise", None, io::Error::from(errno)))
}

#[cfg(not(target_os = "linux"))]
pub fn drop_cached_range(file: &File, _offset: u64, _len: u64) -> HalResult<()> {
    file.sync_all()
        .map_err(|e| HalError::io_error("sync_all", None, e))
}
