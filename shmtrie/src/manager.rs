//! The per-process view of the two backing files.
//!
//! A manager is immutable after it is published through the trie's atomic
//! pointer; growth and fd resets build a fresh copy and CAS it in, so a
//! thread in the middle of an operation keeps a coherent fd/base/size
//! triple no matter what its peers do.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::structs::{Geometry, INode, StatusRecord, INODE_SIZE, ROOT_SIZE, STATUS_SIZE};
use crate::sys;
use crate::{Result, TrieError};

#[derive(Clone, Copy)]
pub(crate) struct SharedMemoryManager {
    pub(crate) data_base: *mut u8,
    pub(crate) data_mapping_size: usize,
    pub(crate) data_fd: RawFd,
    pub(crate) status_base: *mut StatusRecord,
    pub(crate) status_fd: RawFd,
}

// The bases point into MAP_SHARED mappings that are only read and written
// through atomics; the record itself is immutable once published.
unsafe impl Send for SharedMemoryManager {}
unsafe impl Sync for SharedMemoryManager {}

impl SharedMemoryManager {
    pub(crate) fn status(&self) -> &StatusRecord {
        unsafe { &*self.status_base }
    }

    /// Bootstrap both files and build the first manager of this process.
    ///
    /// Either file may already exist (created by a peer process, or left
    /// over from an earlier run) or be created here; a zero-length file is
    /// truncated to its target size, and the zero fill doubles as a valid
    /// initial state that the CAS initializations below upgrade exactly
    /// once per file lifetime.
    pub(crate) fn open(
        status_path: &Path,
        data_path: &Path,
        geometry: &Geometry,
    ) -> Result<Box<SharedMemoryManager>> {
        if geometry.initial_file_size < ROOT_SIZE {
            return Err(TrieError::InvalidGeometry);
        }

        // Status file first: the data file's size comes out of it.
        let status_fd = sys::open_or_create(status_path)?;
        if sys::file_size(status_path)? == 0 {
            sys::truncate(status_path, STATUS_SIZE)?;
        }
        let status_base = unsafe { sys::map_shared(status_fd, STATUS_SIZE)? as *mut StatusRecord };
        let status = unsafe { &*status_base };

        let _ = status.data_file_size.compare_exchange(
            0,
            geometry.initial_file_size,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        if status.data_file_size.load(Ordering::Relaxed) == 0 {
            return Err(TrieError::CorruptHeader);
        }
        let _ = status.write_from_offset.compare_exchange(
            0,
            ROOT_SIZE,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        if status.write_from_offset.load(Ordering::Relaxed) == 0 {
            return Err(TrieError::CorruptHeader);
        }

        let data_fd = sys::open_or_create(data_path)?;
        let data_mapping_size = status.data_file_size.load(Ordering::Acquire);
        if sys::file_size(data_path)? == 0 {
            sys::truncate(data_path, data_mapping_size)?;
        }
        let data_base = unsafe { sys::map_shared(data_fd, data_mapping_size)? };

        // Point the root edge at the zero-filled CNode right behind it.
        let root = unsafe { &*(data_base as *const INode) };
        let _ = root
            .main_node
            .compare_exchange(0, INODE_SIZE, Ordering::AcqRel, Ordering::Relaxed);
        if root.main_node.load(Ordering::Relaxed) == 0 {
            return Err(TrieError::CorruptHeader);
        }

        debug!(
            "attached: data file {} bytes, write offset {:#x}",
            data_mapping_size,
            status.write_from_offset.load(Ordering::Relaxed)
        );

        Ok(Box::new(SharedMemoryManager {
            data_base,
            data_mapping_size,
            data_fd,
            status_base,
            status_fd,
        }))
    }
}
