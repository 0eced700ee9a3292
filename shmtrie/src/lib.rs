//! Lock-free, multi-process path trie over a pair of shared mapped files.
//!
//! The trie stores filesystem-path strings, each annotated with a byte of
//! [`PathFlags`], and answers membership and prefix queries from any number
//! of threads in any number of processes that map the same two files:
//!
//! - a small fixed-size **status file** holding the arena bump pointer, the
//!   largest known data-file size and the wasted-offset dump yard;
//! - a growable **data file** holding the trie nodes, addressed by byte
//!   offsets from the mapping base.
//!
//! All shared mutation is a compare-and-swap on a single mapped word, so
//! insert and search are lock-free; a thread whose CAS fails retries only
//! because another thread made progress. Nodes are never removed and node
//! updates are copy-on-write, with replaced node offsets recycled through a
//! fixed-size dump yard instead of being leaked.
//!
//! [`SharedPathTrie`] is the per-instance handle; the [`global`] module
//! exposes the one-trie-per-process surface that a syscall interposition
//! layer consults on every intercepted filesystem call.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

use std::fmt;

mod arena;
mod manager;
mod structs;
mod sys;
mod trie;

pub mod global;

#[cfg(test)]
mod tests;

pub use structs::{Geometry, PathFlags};
pub use trie::SharedPathTrie;

/// The error type for trie operations.
#[derive(Debug, PartialEq, Eq)]
pub enum TrieError {
    /// An API call was made before a trie was attached to this process.
    NullManager,
    /// `open`/`mmap`/`truncate`/`stat` failed; carries the errno.
    SystemError(nix::Error),
    /// The path contains a byte outside the storable alphabet.
    OutOfRangeCharacter(u8),
    /// The arena bump pointer wrapped, or hit the 4 GiB cap of u32 offsets.
    ArenaExhausted,
    /// The data mapping could not be grown to cover a required offset.
    MappingExhausted,
    /// Initial file size below the root node footprint, or no growth step.
    InvalidGeometry,
    /// The status or data file exists but its header never initialized.
    CorruptHeader,
}

impl fmt::Display for TrieError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for TrieError {}

impl From<nix::Error> for TrieError {
    fn from(e: nix::Error) -> Self {
        TrieError::SystemError(e)
    }
}

/// A specialized `Result` type for trie operations.
pub type Result<T> = std::result::Result<T, TrieError>;
