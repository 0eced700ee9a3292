//! Thin wrappers over the handful of syscalls the trie lifecycle needs.
//!
//! Files are always addressed by path rather than by fd for `truncate` and
//! `stat`: the library is injected into processes that close and dup2
//! descriptors at will, so a path is the only name that stays trustworthy.

use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::{self, OFlag};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::{self, Mode};
use nix::unistd::{self, AccessFlags};

use crate::Result;

/// Mode 0600 for both backing files.
fn file_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR
}

/// Plain `open(O_RDWR)` of an existing file.
pub(crate) fn open_rw(path: &Path) -> Result<RawFd> {
    Ok(fcntl::open(path, OFlag::O_RDWR, file_mode())?)
}

/// Open the file, creating it if absent, without ever clobbering a peer's
/// concurrent creation:
///
/// - try `open(O_RDWR)` first, the common case;
/// - if the file does not exist, create it with `O_CREAT | O_EXCL`; losing
///   that race to another process degrades to a plain re-open;
/// - any other failure gets a single re-open, in case the file appeared
///   between the first `open` and the existence check.
pub(crate) fn open_or_create(path: &Path) -> Result<RawFd> {
    match fcntl::open(path, OFlag::O_RDWR, file_mode()) {
        Ok(fd) => Ok(fd),
        Err(_) if unistd::access(path, AccessFlags::F_OK).is_err() => {
            let create = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_TRUNC | OFlag::O_RDWR;
            match fcntl::open(path, create, file_mode()) {
                Ok(fd) => Ok(fd),
                Err(_) => open_rw(path),
            }
        }
        Err(_) => open_rw(path),
    }
}

pub(crate) fn file_size(path: &Path) -> Result<usize> {
    let st = stat::stat(path)?;
    Ok(st.st_size as usize)
}

pub(crate) fn truncate(path: &Path, len: usize) -> Result<()> {
    Ok(unistd::truncate(path, len as _)?)
}

/// `mmap(PROT_READ | PROT_WRITE, MAP_SHARED)` over `[0, len)` of `fd`.
///
/// # Safety
///
/// The caller owns the lifetime of the returned region and must not let
/// accesses outrun `len`.
pub(crate) unsafe fn map_shared(fd: RawFd, len: usize) -> Result<*mut u8> {
    let base = mman::mmap(
        std::ptr::null_mut(),
        len,
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        MapFlags::MAP_SHARED,
        fd,
        0,
    )?;
    Ok(base as *mut u8)
}

/// # Safety
///
/// `base` must be a mapping of exactly `len` bytes with no live references
/// into it.
pub(crate) unsafe fn unmap(base: *mut u8, len: usize) {
    if let Err(e) = mman::munmap(base as *mut _, len) {
        warn!("munmap of {} bytes failed: {}", len, e);
    }
}
