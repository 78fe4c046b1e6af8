//! `N16`: sign-flipped keys + ctz scan (spec.md §3, §4.5).
//!
//! Grounded in `original_source/ART/N.h`'s `N16::flipSign`/`ctz` helpers:
//! flipping the key byte's sign bit lets a signed byte-wise compare treat
//! unsigned key bytes correctly, which is what the original's SSE compare
//! needed; this build keeps the flip (for fidelity to the on-disk/ABI
//! convention) but does the compare scalar rather than via SIMD intrinsics.

use std::sync::atomic::Ordering;

use crate::art::node_header::{NodeHeader, NodeType, Prefix};
use crate::art::pointer::{Child, ChildSlot};

pub(crate) const CAPACITY: usize = 16;

pub(crate) enum InsertOutcome {
    Inserted,
    NeedsCompact,
    NeedsGrow,
}

#[inline]
fn flip_sign(key_byte: u8) -> u8 {
    key_byte ^ 0x80
}

/// Count trailing zeros of a 16-bit match bitmask, used the way the
/// original picks the lowest set slot after a SIMD compare.
#[inline]
fn ctz(x: u16) -> u32 {
    x.trailing_zeros()
}

#[repr(C, align(64))]
pub(crate) struct N16 {
    pub(crate) header: NodeHeader,
    keys: [std::sync::atomic::AtomicU8; CAPACITY],
    children: [ChildSlot; CAPACITY],
}

impl N16 {
    pub(crate) fn new(level: u32, prefix: Prefix) -> Self {
        Self {
            header: NodeHeader::new(NodeType::N16, level, prefix),
            keys: std::array::from_fn(|_| std::sync::atomic::AtomicU8::new(0)),
            children: std::array::from_fn(|_| ChildSlot::empty()),
        }
    }

    fn match_mask(&self, key: u8, compact: usize) -> u16 {
        let target = flip_sign(key);
        let mut mask = 0u16;
        for i in 0..compact {
            if flip_sign(self.keys[i].load(Ordering::Acquire)) == target {
                mask |= 1 << i;
            }
        }
        mask
    }

    pub(crate) fn find_child(&self, key: u8) -> Option<(Child, bool)> {
        let compact = self.header.compact_count() as usize;
        let mut mask = self.match_mask(key, compact);
        while mask != 0 {
            let i = ctz(mask) as usize;
            let (child, dirty) = self.children[i].load();
            if !child.is_none() {
                return Some((child, dirty));
            }
            mask &= mask - 1;
        }
        None
    }

    pub(crate) fn help_flush(&self, key: u8) {
        let compact = self.header.compact_count() as usize;
        let mask = self.match_mask(key, compact);
        if mask != 0 {
            self.children[ctz(mask) as usize].help_flush();
        }
    }

    pub(crate) fn insert(&self, key: u8, child: Child) -> InsertOutcome {
        let count = self.header.count() as usize;
        let compact = self.header.compact_count() as usize;
        if compact < CAPACITY {
            self.keys[compact].store(key, Ordering::Release);
            self.children[compact].publish(child);
            self.header.inc_count();
            InsertOutcome::Inserted
        } else if count < CAPACITY {
            InsertOutcome::NeedsCompact
        } else {
            InsertOutcome::NeedsGrow
        }
    }

    pub(crate) fn compact(&self) {
        let compact = self.header.compact_count() as usize;
        let mut write = 0usize;
        for read in 0..compact {
            let (child, _) = self.children[read].load();
            if child.is_none() {
                continue;
            }
            if write != read {
                self.keys[write].store(self.keys[read].load(Ordering::Acquire), Ordering::Release);
                self.children[write].set_unpublished(child);
                self.children[read].set_unpublished(Child::None);
            }
            write += 1;
        }
        let count = self.header.count();
        self.header.set_counts(count, write as u16);
    }

    pub(crate) fn replace(&self, key: u8, child: Child) {
        let compact = self.header.compact_count() as usize;
        let mut mask = self.match_mask(key, compact);
        while mask != 0 {
            let i = ctz(mask) as usize;
            let (existing, _) = self.children[i].load();
            if !existing.is_none() {
                self.children[i].publish(child);
                return;
            }
            mask &= mask - 1;
        }
        unreachable!("replace called for a key with no existing child");
    }

    /// If exactly one child is live, return its key byte and pointer.
    pub(crate) fn sole_child(&self) -> Option<(u8, Child)> {
        if self.header.count() != 1 {
            return None;
        }
        let compact = self.header.compact_count() as usize;
        for i in 0..compact {
            let (child, _) = self.children[i].load();
            if !child.is_none() {
                return Some((self.keys[i].load(Ordering::Acquire), child));
            }
        }
        None
    }

    pub(crate) fn remove(&self, key: u8) -> Option<Child> {
        let compact = self.header.compact_count() as usize;
        let mut mask = self.match_mask(key, compact);
        while mask != 0 {
            let i = ctz(mask) as usize;
            let (child, _) = self.children[i].load();
            if !child.is_none() {
                self.children[i].publish(Child::None);
                self.header.dec_count();
                return Some(child);
            }
            mask &= mask - 1;
        }
        None
    }

    pub(crate) fn any_child(&self) -> Option<Child> {
        let compact = self.header.compact_count() as usize;
        (0..compact).find_map(|i| {
            let (child, _) = self.children[i].load();
            (!child.is_none()).then_some(child)
        })
    }

    pub(crate) fn children_in_range(&self, start: u8, end: u8) -> Vec<(u8, Child)> {
        let compact = self.header.compact_count() as usize;
        let mut out = Vec::new();
        for i in 0..compact {
            let k = self.keys[i].load(Ordering::Acquire);
            if k < start || k > end {
                continue;
            }
            let (child, _) = self.children[i].load();
            if !child.is_none() {
                out.push((k, child));
            }
        }
        out.sort_unstable_by_key(|(k, _)| *k);
        out
    }

    pub(crate) fn copy_into<F: FnMut(u8, Child)>(&self, mut insert: F) {
        let compact = self.header.compact_count() as usize;
        for i in 0..compact {
            let (child, _) = self.children[i].load();
            if !child.is_none() {
                insert(self.keys[i].load(Ordering::Acquire), child);
            }
        }
    }
}
