//! On-disk structures shared between processes.
//!
//! Both backing files are mapped `MAP_SHARED` into every attached process,
//! so everything here is `#[repr(C)]` with atomic fields: a field that any
//! peer may read while another writes is only ever touched through atomic
//! loads, stores and compare-and-swap. Layout is native alignment and
//! endianness in declaration order; the files are not portable across
//! architectures (offset width, pointer width and the alphabet all
//! participate in the format).

use std::mem::size_of;
use std::sync::atomic::{AtomicU8, AtomicUsize};

use static_assertions::const_assert;

#[cfg(not(feature = "large-memory"))]
pub(crate) type Offset = u32;
#[cfg(not(feature = "large-memory"))]
pub(crate) type AtomicOffset = std::sync::atomic::AtomicU32;

#[cfg(feature = "large-memory")]
pub(crate) type Offset = usize;
#[cfg(feature = "large-memory")]
pub(crate) type AtomicOffset = AtomicUsize;

/// Lowest storable path byte, inclusive.
pub const ALPHABET_LOW: u8 = 32;
/// Highest storable path byte, inclusive.
pub const ALPHABET_HIGH: u8 = 122;
/// Number of outgoing edges per trie node.
pub const ALPHABET: usize = (ALPHABET_HIGH - ALPHABET_LOW + 1) as usize;

/// ASCII 13 marks a custom icon in HFS+ metadata; both insert and search
/// skip it so a path carrying it is indistinguishable from one without.
pub const CUSTOM_ICON_BYTE: u8 = 13;

pub(crate) const SLASH_SLOT: usize = (b'/' - ALPHABET_LOW) as usize;

/// Slots in the wasted-offset dump yard.
pub const DUMP_YARD_SIZE: usize = 64;

pub(crate) const WORD_BITS: usize = usize::BITS as usize;
pub(crate) const DUMP_YARD_WORDS: usize = (DUMP_YARD_SIZE + WORD_BITS - 1) / WORD_BITS;

/// Reserved after every arena allocation so a recycled offset can carry a
/// +1 tag while it sits in the dump yard.
pub(crate) const PADDING_BYTES: usize = 2;

/// Every node offset must be usable as an atomic, so reservations are
/// rounded to keep the arena word-aligned.
pub(crate) const NODE_ALIGN: usize = std::mem::align_of::<INode>();

/// Bytes the arena consumes for an n-byte reservation: the tag padding
/// plus alignment rounding.
pub(crate) const fn reserve_stride(bytes: usize) -> usize {
    (bytes + PADDING_BYTES + NODE_ALIGN - 1) & !(NODE_ALIGN - 1)
}

pub(crate) const INODE_SIZE: usize = size_of::<INode>();
pub(crate) const CNODE_SIZE: usize = size_of::<CNode>();
/// Minimum data-file footprint: the root INode plus its CNode.
pub(crate) const ROOT_SIZE: usize = INODE_SIZE + CNODE_SIZE;
pub(crate) const STATUS_SIZE: usize = size_of::<StatusRecord>();

const MB: usize = 1024 * 1024;

bitflags! {
    /// Per-path characteristics stored at the node that terminates a path.
    ///
    /// Bits are OR-able; undefined bits must stay zero. `PREFIX` marks the
    /// path as matching every continuation below it: after inserting
    /// `/bin` with `PREFIX | ALLOW`, a search for `/bin/ls` succeeds and
    /// returns `/bin`'s flags, while `/binary` still misses.
    pub struct PathFlags: u8 {
        const ALLOW             = 1 << 0;
        const DENY              = 1 << 1;
        const SANDBOX_VIOLATION = 1 << 2;
        const SANDBOX_UNKNOWN   = 1 << 3;
        const PREFIX            = 1 << 4;
    }
}

/// Sizing knobs for the data file.
///
/// The defaults suit a build-tracing workload; tests shrink them to force
/// growth. `initial_file_size` must cover at least the root node pair.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Size a freshly created data file is truncated to.
    pub initial_file_size: usize,
    /// Increment added to the mapping on every growth step.
    pub expanding_size: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            initial_file_size: 20 * MB,
            expanding_size: 20 * MB,
        }
    }
}

/// Indirection node: one machine word holding the offset of the current
/// CNode. Every parent-to-child edge dereferences through an INode so that
/// replacing a child is a single CAS on `main_node`.
///
/// `main_node` is 0 only before the root edge is bootstrapped; afterwards it
/// always holds a valid CNode offset inside the data file.
#[repr(C)]
pub(crate) struct INode {
    pub(crate) main_node: AtomicUsize,
}

/// Content node: outgoing edges plus terminal metadata.
///
/// A CNode is immutable once any other thread can observe it; updates
/// allocate a fresh CNode, populate it, and CAS it into the parent INode.
/// An edge slot holds 0 when absent, so `possibilities[i] != 0` is the
/// presence test. A node that terminates a PREFIX-flagged path keeps its
/// `'/'` slot forced to 0, which is what lets search detect the prefix.
#[repr(C)]
pub(crate) struct CNode {
    pub(crate) possibilities: [AtomicOffset; ALPHABET],
    pub(crate) is_end_of_string: AtomicU8,
    pub(crate) flags: AtomicU8,
}

impl CNode {
    // Node fields are written with release and read with acquire: when a
    // guarded reader happens to observe a value a recycler is writing into
    // a reused region, the acquire read carries the recycler's history
    // with it, so the guard's re-read of the parent INode is certain to
    // notice the replacement and retry.

    #[inline]
    pub(crate) fn child(&self, slot: usize) -> usize {
        use std::sync::atomic::Ordering;
        self.possibilities[slot].load(Ordering::Acquire) as usize
    }

    /// Copy of the node contents, taken field by field so a concurrent
    /// recycler writing the same region cannot tear the reads. Callers wrap
    /// this in a guarded access to discard torn logical states.
    pub(crate) fn snapshot(&self) -> CNodeImage {
        use std::sync::atomic::Ordering;
        let mut possibilities = [0 as Offset; ALPHABET];
        for (slot, value) in possibilities.iter_mut().enumerate() {
            *value = self.possibilities[slot].load(Ordering::Acquire);
        }
        CNodeImage {
            possibilities,
            is_end_of_string: self.is_end_of_string.load(Ordering::Acquire) != 0,
            flags: self.flags.load(Ordering::Acquire),
        }
    }
}

/// Plain-value copy of a CNode, used as the source of a copy-on-write.
#[derive(Clone)]
pub(crate) struct CNodeImage {
    pub(crate) possibilities: [Offset; ALPHABET],
    pub(crate) is_end_of_string: bool,
    pub(crate) flags: u8,
}

impl CNodeImage {
    /// Write every field of the image into a mapped CNode. The target is
    /// unpublished (freshly reserved or recycled); release stores let a
    /// stale reader that races a recycled region detect it (see the note
    /// on `CNode`).
    pub(crate) fn write_into(&self, target: &CNode) {
        use std::sync::atomic::Ordering;
        for (slot, &value) in self.possibilities.iter().enumerate() {
            target.possibilities[slot].store(value, Ordering::Release);
        }
        target
            .is_end_of_string
            .store(self.is_end_of_string as u8, Ordering::Release);
        target.flags.store(self.flags, Ordering::Release);
    }
}

/// Mutable global state at offset 0 of the status file.
///
/// A zero-filled record (fresh truncate) is valid: the first process to map
/// it CAS-installs the initial values. Declaration order is the on-disk
/// layout.
#[repr(C)]
pub(crate) struct StatusRecord {
    /// Abandoned CNode offsets, tagged +1 while they sit here.
    pub(crate) wasted_dump_yard: [AtomicUsize; DUMP_YARD_SIZE],
    /// INode offset that was the parent when the matching slot was dumped.
    /// Recorded so a sibling of the dumper can never recycle the slot.
    pub(crate) dumper_parents: [AtomicUsize; DUMP_YARD_SIZE],
    /// Arena bump pointer.
    pub(crate) write_from_offset: AtomicUsize,
    /// Largest data-file size any process has established; late attachers
    /// use it to pick their initial mapping length.
    pub(crate) data_file_size: AtomicUsize,
    /// Bit i set: dump-yard slot i is claimed (being written or ready).
    pub(crate) bitmap_for_dumping: [AtomicUsize; DUMP_YARD_WORDS],
    /// Bit i set: dump-yard slot i holds an offset ready to recycle.
    pub(crate) bitmap_for_recycling: [AtomicUsize; DUMP_YARD_WORDS],
}

impl StatusRecord {
    #[cfg(test)]
    pub(crate) fn zeroed() -> Box<StatusRecord> {
        // All fields are integer atomics, for which zero is a valid state.
        unsafe { Box::new(std::mem::zeroed()) }
    }
}

const_assert!(ALPHABET == 91);
const_assert!(INODE_SIZE == size_of::<usize>());
// Every offset the arena hands out stays aligned for both node types and
// even, so the dump yard can tag it odd.
const_assert!(ROOT_SIZE % NODE_ALIGN == 0);
const_assert!(reserve_stride(CNODE_SIZE) % NODE_ALIGN == 0);
const_assert!(reserve_stride(INODE_SIZE + CNODE_SIZE) % NODE_ALIGN == 0);
const_assert!(NODE_ALIGN % 2 == 0);
const_assert!(DUMP_YARD_WORDS * WORD_BITS >= DUMP_YARD_SIZE);
