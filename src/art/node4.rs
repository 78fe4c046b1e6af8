//! `N4`: smallest node family, unsorted parallel arrays (spec.md §3, §4.5).
//!
//! Grounded in `original_source/ART/N.h`'s `N4` (`keys[4]`/`children[4]`,
//! linear scan) and in this crate's own `NodeHeader`/`ChildSlot` rather than
//! `aris::utils::art::node::Node4`, which only sketches the layout without
//! insert/remove/compact.

use std::sync::atomic::Ordering;

use crate::art::node_header::{NodeHeader, NodeType, Prefix};
use crate::art::pointer::{Child, ChildSlot};

pub(crate) const CAPACITY: usize = 4;

/// Outcome of attempting to insert into an already-locked node.
pub(crate) enum InsertOutcome {
    Inserted,
    /// `compact_count == CAPACITY` but `count < CAPACITY`: tombstoned slots
    /// exist and can be reclaimed without growing (spec.md §4.5
    /// `insertCompact`).
    NeedsCompact,
    /// `count == CAPACITY`: must grow to the next node family.
    NeedsGrow,
}

#[repr(C, align(64))]
pub(crate) struct N4 {
    pub(crate) header: NodeHeader,
    keys: [std::sync::atomic::AtomicU8; CAPACITY],
    children: [ChildSlot; CAPACITY],
}

impl N4 {
    pub(crate) fn new(level: u32, prefix: Prefix) -> Self {
        Self {
            header: NodeHeader::new(NodeType::N4, level, prefix),
            keys: std::array::from_fn(|_| std::sync::atomic::AtomicU8::new(0)),
            children: std::array::from_fn(|_| ChildSlot::empty()),
        }
    }

    pub(crate) fn find_child(&self, key: u8) -> Option<(Child, bool)> {
        let compact = self.header.compact_count() as usize;
        for i in 0..compact {
            if self.keys[i].load(Ordering::Acquire) == key {
                let (child, dirty) = self.children[i].load();
                if !child.is_none() {
                    return Some((child, dirty));
                }
            }
        }
        None
    }

    pub(crate) fn help_flush(&self, key: u8) {
        let compact = self.header.compact_count() as usize;
        for i in 0..compact {
            if self.keys[i].load(Ordering::Acquire) == key {
                self.children[i].help_flush();
                return;
            }
        }
    }

    /// Insert a new child for `key`, which must not already be present.
    /// Only legal while the node is write-locked.
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

    /// Reorganize tombstoned slots so `compact_count == count`, the
    /// non-growing alternative to `insert_grow` (spec.md §4.5).
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

    /// Overwrite an existing child's slot in place (update, not insert,
    /// counts are unaffected).
    pub(crate) fn replace(&self, key: u8, child: Child) {
        let compact = self.header.compact_count() as usize;
        for i in 0..compact {
            if self.keys[i].load(Ordering::Acquire) == key {
                let (existing, _) = self.children[i].load();
                if !existing.is_none() {
                    self.children[i].publish(child);
                    return;
                }
            }
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

    /// Tombstone the child at `key`. Returns the removed child.
    pub(crate) fn remove(&self, key: u8) -> Option<Child> {
        let compact = self.header.compact_count() as usize;
        for i in 0..compact {
            if self.keys[i].load(Ordering::Acquire) == key {
                let (child, _) = self.children[i].load();
                if child.is_none() {
                    return None;
                }
                self.children[i].publish(Child::None);
                self.header.dec_count();
                return Some(child);
            }
        }
        None
    }

    /// Any one live child, used to reconstruct prefixes beyond the 4
    /// inlined bytes (spec.md §3 invariant 6) and to descend for
    /// `getAnyChildTid`-style full enumeration.
    pub(crate) fn any_child(&self) -> Option<Child> {
        let compact = self.header.compact_count() as usize;
        (0..compact).find_map(|i| {
            let (child, _) = self.children[i].load();
            (!child.is_none()).then_some(child)
        })
    }

    /// Snapshot-scan `[start, end]` in key-byte order (spec.md §4.6).
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

    /// Copy every live child into a freshly allocated, larger node.
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
