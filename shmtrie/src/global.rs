//! One trie per process, for interposition layers.
//!
//! A library injected into arbitrary processes cannot thread a handle
//! through the wrapped syscalls, so this module keeps a single
//! [`SharedPathTrie`] behind a process-wide pointer installed by CAS. A
//! `close`/`dup2` wrapper is expected to compare its target fd against
//! [`status_file_fd`]/[`data_file_fd`] and call [`reset_fd`] before
//! delegating, so outside code can never destroy the descriptors the
//! mappings depend on.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::{PathFlags, Result, SharedPathTrie, TrieError};

static PROCESS_TRIE: AtomicPtr<SharedPathTrie> = AtomicPtr::new(ptr::null_mut());

/// Attach the process to the given file pair. Idempotent: once a trie is
/// installed, later calls (with any paths) succeed without touching it.
pub fn attach(status_path: impl AsRef<Path>, data_path: impl AsRef<Path>) -> Result<()> {
    if !PROCESS_TRIE.load(Ordering::Acquire).is_null() {
        return Ok(());
    }
    let trie = SharedPathTrie::attach(status_path, data_path)?;
    let candidate = Arc::into_raw(trie) as *mut SharedPathTrie;
    match PROCESS_TRIE.compare_exchange(
        ptr::null_mut(),
        candidate,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Ok(()),
        Err(_) => {
            // Another thread attached first; ours unmaps on drop.
            unsafe { drop(Arc::from_raw(candidate)) };
            Ok(())
        }
    }
}

fn current<'a>() -> Result<&'a SharedPathTrie> {
    let installed = PROCESS_TRIE.load(Ordering::Acquire);
    if installed.is_null() {
        return Err(TrieError::NullManager);
    }
    // Installed once and never removed, so the reference lives as long as
    // the process.
    Ok(unsafe { &*installed })
}

/// See [`SharedPathTrie::insert`]. Fails with `NullManager` before attach.
pub fn insert(path: &str, flags: PathFlags) -> Result<()> {
    current()?.insert(path, flags)
}

/// See [`SharedPathTrie::search`]. Fails with `NullManager` before attach.
pub fn search(path: &str) -> Result<Option<PathFlags>> {
    current()?.search(path)
}

/// See [`SharedPathTrie::reset_fd`]. A no-op success before attach: there
/// are no fds to protect yet.
pub fn reset_fd() -> Result<()> {
    match current() {
        Ok(trie) => trie.reset_fd(),
        Err(_) => Ok(()),
    }
}

/// Status-file fd, or -1 before attach.
pub fn status_file_fd() -> RawFd {
    current().map(|trie| trie.status_file_fd()).unwrap_or(-1)
}

/// Data-file fd, or -1 before attach.
pub fn data_file_fd() -> RawFd {
    current().map(|trie| trie.data_file_fd()).unwrap_or(-1)
}

/// Bytes of shared memory in actual use, or 0 before attach.
pub fn used_size() -> usize {
    current().map(|trie| trie.used_size()).unwrap_or(0)
}
