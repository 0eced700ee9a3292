//! The trie itself: guarded node access, lock-free insert and search,
//! mapping growth and the fd guard.

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use nix::unistd;

use crate::manager::SharedMemoryManager;
use crate::structs::{
    CNode, CNodeImage, Geometry, INode, Offset, PathFlags, StatusRecord, ALPHABET_HIGH,
    ALPHABET_LOW, CNODE_SIZE, CUSTOM_ICON_BYTE, INODE_SIZE, SLASH_SLOT, STATUS_SIZE,
};
use crate::sys;
use crate::{Result, TrieError};

/// A handle on one pair of backing files.
///
/// All operations take `&self`; the only mutable state is the manager
/// pointer, swapped by CAS whenever the data mapping grows or the fds are
/// reset. Clones of the `Arc` and any number of threads may insert and
/// search concurrently, and other processes attached to the same files see
/// every committed insert.
pub struct SharedPathTrie {
    manager: AtomicPtr<SharedMemoryManager>,
    status_path: PathBuf,
    data_path: PathBuf,
    geometry: Geometry,
}

impl SharedPathTrie {
    /// Attach to (creating if necessary) the given status and data files
    /// with the default [`Geometry`].
    pub fn attach(
        status_path: impl AsRef<Path>,
        data_path: impl AsRef<Path>,
    ) -> Result<Arc<SharedPathTrie>> {
        Self::attach_with(status_path, data_path, Geometry::default())
    }

    /// Attach with explicit sizing. An `expanding_size` of zero disables
    /// growth; operations that would need it fail with `MappingExhausted`.
    pub fn attach_with(
        status_path: impl AsRef<Path>,
        data_path: impl AsRef<Path>,
        geometry: Geometry,
    ) -> Result<Arc<SharedPathTrie>> {
        let status_path = status_path.as_ref().to_path_buf();
        let data_path = data_path.as_ref().to_path_buf();
        let manager = SharedMemoryManager::open(&status_path, &data_path, &geometry)?;
        Ok(Arc::new(SharedPathTrie {
            manager: AtomicPtr::new(Box::into_raw(manager)),
            status_path,
            data_path,
            geometry,
        }))
    }

    /// Insert `path` with `flags`. Re-inserting a path replaces its flags
    /// wholesale, the last writer winning. With [`PathFlags::PREFIX`] set,
    /// every later search for `path` plus a `/`-separated continuation
    /// reports a match carrying these flags.
    pub fn insert(&self, path: &str, flags: PathFlags) -> Result<()> {
        let mut traverser: usize = 0;
        let mut parent_off: usize = 0;
        let mut last_byte: u8 = 0;

        for &byte in path.as_bytes() {
            if byte == CUSTOM_ICON_BYTE {
                continue;
            }
            if byte < ALPHABET_LOW || byte > ALPHABET_HIGH {
                return Err(TrieError::OutOfRangeCharacter(byte));
            }
            let slot = (byte - ALPHABET_LOW) as usize;
            last_byte = byte;
            parent_off = traverser;

            let inode = self.inode_at(parent_off)?;
            let child = self.guarded_read(inode, |cnode| cnode.child(slot))?;
            traverser = if child != 0 {
                child
            } else {
                self.insert_edge(parent_off, slot)?
            };
        }

        // A prefix path's trailing '/' is not part of the terminal node:
        // the node before it carries the prefix bit, and its zeroed '/'
        // slot is what search keys on.
        let terminal_off = if last_byte == b'/' && flags.contains(PathFlags::PREFIX) {
            parent_off
        } else {
            traverser
        };

        let inode = self.inode_at(terminal_off)?;
        let copy_off = match self.status().recycle(terminal_off) {
            Some(off) => off,
            None => self.status().reserve(CNODE_SIZE)?,
        };
        loop {
            let expected = inode.main_node.load(Ordering::Acquire);
            let mut image = self.guarded_read(inode, |cnode| cnode.snapshot())?;
            image.is_end_of_string = true;
            image.flags = flags.bits();
            if flags.contains(PathFlags::PREFIX) {
                // Searches detect the prefix by running into this hole.
                image.possibilities[SLASH_SLOT] = 0;
            }
            image.write_into(self.cnode_at(copy_off)?);
            if inode
                .main_node
                .compare_exchange(expected, copy_off, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.status().dump(expected, terminal_off);
                return Ok(());
            }
        }
    }

    /// Look `path` up. `Ok(Some(flags))` covers both an exact terminal
    /// match and a prefix match; `Ok(None)` means no inserted path covers
    /// it.
    pub fn search(&self, path: &str) -> Result<Option<PathFlags>> {
        let mut traverser: usize = 0;

        for &byte in path.as_bytes() {
            if byte == CUSTOM_ICON_BYTE {
                continue;
            }
            if byte < ALPHABET_LOW || byte > ALPHABET_HIGH {
                return Err(TrieError::OutOfRangeCharacter(byte));
            }
            let slot = (byte - ALPHABET_LOW) as usize;

            let inode = self.inode_at(traverser)?;
            let (child, raw_flags) = self.guarded_read(inode, |cnode| {
                (cnode.child(slot), cnode.flags.load(Ordering::Acquire))
            })?;
            if child == 0 {
                let node_flags = PathFlags::from_bits_truncate(raw_flags);
                if byte == b'/' && node_flags.contains(PathFlags::PREFIX) {
                    return Ok(Some(node_flags));
                }
                return Ok(None);
            }
            traverser = child;
        }

        let inode = self.inode_at(traverser)?;
        let (is_end, raw_flags) = self.guarded_read(inode, |cnode| {
            (
                cnode.is_end_of_string.load(Ordering::Acquire) != 0,
                cnode.flags.load(Ordering::Acquire),
            )
        })?;
        Ok(if is_end {
            Some(PathFlags::from_bits_truncate(raw_flags))
        } else {
            None
        })
    }

    /// Reopen both files and swap a manager copy carrying the fresh fds.
    ///
    /// Called by close/dup2 interposers that are about to clobber one of
    /// our descriptors; the old fds are deliberately left open for the
    /// caller to dispose of.
    pub fn reset_fd(&self) -> Result<()> {
        let data_fd = sys::open_rw(&self.data_path)?;
        let status_fd = sys::open_rw(&self.status_path)?;
        loop {
            let installed = self.manager.load(Ordering::Acquire);
            let replacement = Box::into_raw(Box::new(SharedMemoryManager {
                data_fd,
                status_fd,
                ..unsafe { *installed }
            }));
            if self
                .manager
                .compare_exchange(installed, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!("reset fds: status {}, data {}", status_fd, data_fd);
                return Ok(());
            }
            unsafe { drop(Box::from_raw(replacement)) };
        }
    }

    /// Fd of the status file as currently held by this process.
    pub fn status_file_fd(&self) -> RawFd {
        self.manager().status_fd
    }

    /// Fd of the data file as currently held by this process.
    pub fn data_file_fd(&self) -> RawFd {
        self.manager().data_fd
    }

    /// Bytes of the arena actually consumed (the bump pointer), as opposed
    /// to the data file's truncated size.
    pub fn used_size(&self) -> usize {
        self.status().write_from_offset.load(Ordering::Relaxed)
    }

    fn manager(&self) -> &SharedMemoryManager {
        unsafe { &*self.manager.load(Ordering::Acquire) }
    }

    fn status(&self) -> &StatusRecord {
        self.manager().status()
    }

    /// Base pointer of a mapping sure to cover `[off, off + INode + CNode)`.
    ///
    /// The span is over-guarded: whoever fetches an INode offset will next
    /// read its `main_node`, and whoever fetches a CNode offset will read
    /// its slots, so covering one of each at every dereference spares the
    /// callers a per-field check.
    fn ensure_reachable(&self, off: usize) -> Result<*mut u8> {
        let needed = off + INODE_SIZE + CNODE_SIZE;
        while needed > self.manager().data_mapping_size {
            let before = self.manager().data_mapping_size;
            self.expand(needed)?;
            if self.manager().data_mapping_size <= before {
                return Err(TrieError::MappingExhausted);
            }
        }
        Ok(self.manager().data_base)
    }

    fn inode_at(&self, off: usize) -> Result<&INode> {
        let base = self.ensure_reachable(off)?;
        Ok(unsafe { &*(base.add(off) as *const INode) })
    }

    fn cnode_at(&self, off: usize) -> Result<&CNode> {
        let base = self.ensure_reachable(off)?;
        Ok(unsafe { &*(base.add(off) as *const CNode) })
    }

    /// Read through `inode`'s CNode, retrying until the INode still points
    /// at the same CNode afterwards. Without the re-check a concurrently
    /// recycled CNode could be observed mid-overwrite.
    fn guarded_read<T>(&self, inode: &INode, read: impl Fn(&CNode) -> T) -> Result<T> {
        loop {
            let main = inode.main_node.load(Ordering::Acquire);
            let value = read(self.cnode_at(main)?);
            if inode.main_node.load(Ordering::Acquire) == main {
                return Ok(value);
            }
        }
    }

    /// Link a new edge `slot` below the INode at `parent_off` by
    /// copy-on-write, or adopt the edge a winning peer linked meanwhile.
    /// Returns the child INode offset either way.
    fn insert_edge(&self, parent_off: usize, slot: usize) -> Result<usize> {
        let inode = self.inode_at(parent_off)?;
        let copy_off = match self.status().recycle(parent_off) {
            Some(off) => off,
            None => self.status().reserve(CNODE_SIZE)?,
        };
        loop {
            let expected = inode.main_node.load(Ordering::Acquire);
            let existing = self.guarded_read(inode, |cnode| cnode.child(slot))?;
            if existing != 0 {
                // A peer inserted this edge between our check and CAS; the
                // reserved copy goes back to the yard.
                self.status().dump(copy_off, parent_off);
                return Ok(existing);
            }
            let image = self.guarded_read(inode, |cnode| cnode.snapshot())?;
            let child_off = self.write_copy_with_edge(copy_off, &image, slot)?;
            if inode
                .main_node
                .compare_exchange(expected, copy_off, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.status().dump(expected, parent_off);
                return Ok(child_off);
            }
        }
    }

    /// Populate the unpublished CNode at `copy_off` from `image` plus a
    /// fresh edge at `slot`: a new child INode pre-pointed at the
    /// zero-filled CNode reserved right behind it. Returns the child INode
    /// offset.
    fn write_copy_with_edge(
        &self,
        copy_off: usize,
        image: &CNodeImage,
        slot: usize,
    ) -> Result<usize> {
        let child_off = self.status().reserve(INODE_SIZE + CNODE_SIZE)?;
        let child_inode = self.inode_at(child_off)?;
        child_inode
            .main_node
            .store(child_off + INODE_SIZE, Ordering::Release);

        let copy = self.cnode_at(copy_off)?;
        image.write_into(copy);
        copy.possibilities[slot].store(child_off as Offset, Ordering::Release);
        Ok(child_off)
    }

    /// Grow the data file and install a manager whose mapping covers
    /// `needed`. Whoever loses the install race discards its own candidate
    /// mapping; a superseded mapping is never unmapped, because peers may
    /// still read through its base.
    fn expand(&self, needed: usize) -> Result<()> {
        let mgr = self.manager();
        let status = mgr.status();

        // Grow from the largest size any process is known to have reached.
        let mut new_size = status.data_file_size.load(Ordering::Acquire);
        if mgr.data_mapping_size > new_size {
            new_size = mgr.data_mapping_size;
        }
        new_size += self.geometry.expanding_size;

        // A peer may have grown past the offset in need already.
        if self.manager().data_mapping_size > needed {
            return Ok(());
        }

        if status.data_file_size.load(Ordering::Acquire) < new_size {
            sys::truncate(&self.data_path, new_size)?;
        }

        let current = self.manager();
        let data_base = unsafe { sys::map_shared(current.data_fd, new_size)? };
        let replacement = Box::into_raw(Box::new(SharedMemoryManager {
            data_base,
            data_mapping_size: new_size,
            ..*current
        }));

        loop {
            let installed = self.manager.load(Ordering::Acquire);
            if unsafe { (*installed).data_mapping_size } >= new_size {
                // Lost to an equal or larger mapping.
                unsafe {
                    sys::unmap(data_base, new_size);
                    drop(Box::from_raw(replacement));
                }
                return Ok(());
            }
            if self
                .manager
                .compare_exchange(installed, replacement, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        debug!("grew data mapping to {} bytes", new_size);

        // Publish the new size so late attachers map enough up front.
        let mut known = status.data_file_size.load(Ordering::Relaxed);
        while known < new_size {
            match status.data_file_size.compare_exchange(
                known,
                new_size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => known = current,
            }
        }
        Ok(())
    }
}

impl Drop for SharedPathTrie {
    /// Releases only the final manager. Managers superseded by growth or
    /// fd resets, and their mappings, are leaked for the life of the
    /// process: a thread that loaded the old pointer may still be
    /// dereferencing through it.
    fn drop(&mut self) {
        let installed = *self.manager.get_mut();
        if installed.is_null() {
            return;
        }
        let manager = unsafe { Box::from_raw(installed) };
        unsafe {
            sys::unmap(manager.data_base, manager.data_mapping_size);
            sys::unmap(manager.status_base as *mut u8, STATUS_SIZE);
        }
        let _ = unistd::close(manager.data_fd);
        let _ = unistd::close(manager.status_fd);
    }
}
