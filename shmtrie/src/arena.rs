//! Arena allocation and the wasted-offset dump yard.
//!
//! Both live entirely in the status record, so every operation here is a
//! CAS or RMW on one mapped word and is shared by all attached processes.
//!
//! The dump yard exists because node updates are copy-on-write: the CAS
//! that installs a new CNode strands the old one. Rather than leak every
//! replaced node, its offset parks in a fixed table until some later
//! insert reuses it, which cuts arena growth roughly in half. A slot moves
//! through two bitmaps — `bitmap_for_dumping` claims it, writing the yard
//! entry, and `bitmap_for_recycling` publishes it — so a dumper and a
//! recycler never touch the same slot concurrently.
//!
//! Recycling must respect one rule: an offset may not be handed to a
//! sibling of the thread that dumped it. Two siblings share a parent
//! INode, and if one re-used the other's abandoned offset, the parent's
//! next CAS could see its expected value spuriously intact and overwrite
//! an interleaved update (the ABA problem). Each yard slot therefore
//! records the dumper's parent INode, and a recycle by the same parent
//! puts the offset straight back and reports the yard empty.

use std::sync::atomic::Ordering;

use crate::structs::{reserve_stride, StatusRecord, DUMP_YARD_SIZE, WORD_BITS};
use crate::{Result, TrieError};

impl StatusRecord {
    /// Bump `write_from_offset` by the stride of `bytes` (tag padding plus
    /// alignment rounding) under CAS and return the start of the reserved
    /// range. The caller owns the range exclusively but must route
    /// accesses through the mapping guard, which grows the mapping on
    /// demand.
    pub(crate) fn reserve(&self, bytes: usize) -> Result<usize> {
        let stride = reserve_stride(bytes);
        let mut old = self.write_from_offset.load(Ordering::Relaxed);
        loop {
            let new = old.wrapping_add(stride);
            if new <= old {
                return Err(TrieError::ArenaExhausted);
            }
            #[cfg(not(feature = "large-memory"))]
            {
                // Child offsets are stored as u32; past this point they
                // would no longer round-trip.
                if new >= u32::MAX as usize {
                    return Err(TrieError::ArenaExhausted);
                }
            }
            match self.write_from_offset.compare_exchange(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    trace!("reserve {:#x}..{:#x}", old, new);
                    return Ok(old);
                }
                Err(current) => old = current,
            }
        }
    }

    /// Park an abandoned CNode offset for reuse. `parent_inode` is the
    /// INode whose CAS stranded it. Returns false when the offset is
    /// dropped instead: the yard is full, or the offset is odd and its
    /// original parent identity has already been lost.
    pub(crate) fn dump(&self, wasted: usize, parent_inode: usize) -> bool {
        if wasted % 2 != 0 {
            return false;
        }
        // Tag odd while in the yard; recycle strips the tag again.
        let tagged = wasted + 1;

        let (slot, word, bit) = loop {
            let mut found = None;
            for slot in 0..DUMP_YARD_SIZE {
                let (word, bit) = (slot / WORD_BITS, slot % WORD_BITS);
                if self.bitmap_for_dumping[word].load(Ordering::Relaxed) & (1 << bit) == 0 {
                    found = Some((slot, word, bit));
                    break;
                }
            }
            let (slot, word, bit) = match found {
                Some(free) => free,
                // Yard full: the offset is lost, which only costs memory.
                None => return false,
            };
            if self.bitmap_for_dumping[word].fetch_or(1 << bit, Ordering::AcqRel) & (1 << bit) == 0
            {
                break (slot, word, bit);
            }
            // Another dumper claimed the slot first; rescan.
        };

        self.wasted_dump_yard[slot].store(tagged, Ordering::Relaxed);
        self.dumper_parents[slot].store(parent_inode, Ordering::Relaxed);
        // Release pairs with the recycler's acquire claim below, making the
        // two stores above visible before the slot reads as ready.
        self.bitmap_for_recycling[word].fetch_or(1 << bit, Ordering::Release);
        trace!("dump wasted {:#x} (parent {:#x})", wasted, parent_inode);
        true
    }

    /// Take a parked offset out of the yard, unless the only candidates
    /// were dumped under the caller's own parent INode. Returns the
    /// original (untagged) offset.
    pub(crate) fn recycle(&self, parent_inode: usize) -> Option<usize> {
        let (slot, word, bit) = loop {
            let mut found = None;
            for slot in 0..DUMP_YARD_SIZE {
                let (word, bit) = (slot / WORD_BITS, slot % WORD_BITS);
                if self.bitmap_for_recycling[word].load(Ordering::Relaxed) & (1 << bit) != 0 {
                    found = Some((slot, word, bit));
                    break;
                }
            }
            let (slot, word, bit) = found?;
            if self.bitmap_for_recycling[word].fetch_and(!(1 << bit), Ordering::AcqRel)
                & (1 << bit)
                != 0
            {
                break (slot, word, bit);
            }
            // Another recycler drained the slot first; rescan.
        };

        let tagged = self.wasted_dump_yard[slot].load(Ordering::Relaxed);
        let dumper_parent = self.dumper_parents[slot].load(Ordering::Relaxed);
        self.wasted_dump_yard[slot].store(0, Ordering::Relaxed);
        self.bitmap_for_dumping[word].fetch_and(!(1 << bit), Ordering::Release);

        debug_assert!(tagged % 2 == 1);
        let offset = tagged - 1;

        if dumper_parent == parent_inode {
            // Sibling of the dumper: hand the offset back untouched.
            self.dump(offset, dumper_parent);
            return None;
        }
        trace!("recycle {:#x} (dumped under {:#x})", offset, dumper_parent);
        Some(offset)
    }
}

#[cfg(test)]
mod tests {
    use crate::structs::{reserve_stride, StatusRecord, DUMP_YARD_SIZE, PADDING_BYTES};

    #[test]
    fn reserve_bumps_by_stride() {
        let status = StatusRecord::zeroed();
        let first = status.reserve(10).expect("reserve failed");
        let second = status.reserve(10).expect("reserve failed");
        assert_eq!(first, 0);
        assert_eq!(second, reserve_stride(10));
        assert!(reserve_stride(10) >= 10 + PADDING_BYTES);
        assert_eq!(second % 2, 0);
    }

    #[cfg(not(feature = "large-memory"))]
    #[test]
    fn reserve_stops_at_offset_width() {
        use std::sync::atomic::Ordering;
        let status = StatusRecord::zeroed();
        status
            .write_from_offset
            .store(u32::MAX as usize - 4, Ordering::Relaxed);
        assert_eq!(status.reserve(16), Err(crate::TrieError::ArenaExhausted));
    }

    #[test]
    fn dump_recycle_roundtrip() {
        let status = StatusRecord::zeroed();
        assert!(status.dump(0x1000, 16));
        // A different parent gets the untagged offset back.
        assert_eq!(status.recycle(32), Some(0x1000));
        // The yard is empty again.
        assert_eq!(status.recycle(32), None);
    }

    #[test]
    fn sibling_cannot_recycle() {
        let status = StatusRecord::zeroed();
        assert!(status.dump(0x1000, 16));
        // Same parent as the dumper: rejected, offset re-parked.
        assert_eq!(status.recycle(16), None);
        assert_eq!(status.recycle(32), Some(0x1000));
    }

    #[test]
    fn odd_offset_is_dropped() {
        let status = StatusRecord::zeroed();
        assert!(!status.dump(0x1001, 16));
        assert_eq!(status.recycle(32), None);
    }

    #[test]
    fn full_yard_drops_overflow() {
        let status = StatusRecord::zeroed();
        for i in 0..DUMP_YARD_SIZE {
            assert!(status.dump(0x100 + 2 * i, 16), "slot {} rejected", i);
        }
        assert!(!status.dump(0x5000, 16));

        let mut drained = Vec::new();
        while let Some(off) = status.recycle(32) {
            drained.push(off);
        }
        drained.sort_unstable();
        let expected: Vec<usize> = (0..DUMP_YARD_SIZE).map(|i| 0x100 + 2 * i).collect();
        assert_eq!(drained, expected);
    }
}
