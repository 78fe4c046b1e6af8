//! `N48`: dense `childIndex[256]` indirection into a 48-slot child array
//! (spec.md §3, §4.5), grounded in `original_source/ART/N.h`'s `N48`.

use std::sync::atomic::Ordering;

use crate::art::node_header::{NodeHeader, NodeType, Prefix};
use crate::art::pointer::{Child, ChildSlot};

pub(crate) const CAPACITY: usize = 48;

/// Sentinel in `child_index` meaning "this key byte has no child"
/// (`original_source/ART/N.h`'s `emptyMarker`).
pub(crate) const EMPTY_MARKER: u8 = 48;

pub(crate) enum InsertOutcome {
    Inserted,
    NeedsGrow,
}

#[repr(C, align(64))]
pub(crate) struct N48 {
    pub(crate) header: NodeHeader,
    child_index: [std::sync::atomic::AtomicU8; 256],
    children: [ChildSlot; CAPACITY],
}

impl N48 {
    pub(crate) fn new(level: u32, prefix: Prefix) -> Self {
        Self {
            header: NodeHeader::new(NodeType::N48, level, prefix),
            child_index: std::array::from_fn(|_| std::sync::atomic::AtomicU8::new(EMPTY_MARKER)),
            children: std::array::from_fn(|_| ChildSlot::empty()),
        }
    }

    fn slot_of(&self, key: u8) -> Option<usize> {
        let idx = self.child_index[key as usize].load(Ordering::Acquire);
        (idx != EMPTY_MARKER).then_some(idx as usize)
    }

    pub(crate) fn find_child(&self, key: u8) -> Option<(Child, bool)> {
        let slot = self.slot_of(key)?;
        let (child, dirty) = self.children[slot].load();
        (!child.is_none()).then_some((child, dirty))
    }

    pub(crate) fn help_flush(&self, key: u8) {
        if let Some(slot) = self.slot_of(key) {
            self.children[slot].help_flush();
        }
    }

    /// Insert a child for `key`, which must not already be present. A free
    /// slot is found by scanning `children`, cheap at 48 entries, and
    /// avoids needing a separate freelist alongside the bitmap-like
    /// `child_index`.
    pub(crate) fn insert(&self, key: u8, child: Child) -> InsertOutcome {
        if self.header.count() as usize >= CAPACITY {
            return InsertOutcome::NeedsGrow;
        }
        let free = (0..CAPACITY)
            .find(|&i| self.children[i].load().0.is_none())
            .expect("count < CAPACITY implies a free slot exists");
        self.children[free].publish(child);
        self.child_index[key as usize].store(free as u8, Ordering::Release);
        crate::persist::flush_value(&self.child_index[key as usize]);
        self.header.inc_count();
        InsertOutcome::Inserted
    }

    pub(crate) fn replace(&self, key: u8, child: Child) {
        let slot = self.slot_of(key).expect("replace called for a key with no existing child");
        self.children[slot].publish(child);
    }

    /// If exactly one child is live, return its key byte and pointer.
    pub(crate) fn sole_child(&self) -> Option<(u8, Child)> {
        if self.header.count() != 1 {
            return None;
        }
        for key in 0..=255u8 {
            if let Some(slot) = self.slot_of(key) {
                let (child, _) = self.children[slot].load();
                if !child.is_none() {
                    return Some((key, child));
                }
            }
            if key == u8::MAX {
                break;
            }
        }
        None
    }

    pub(crate) fn remove(&self, key: u8) -> Option<Child> {
        let slot = self.slot_of(key)?;
        let (child, _) = self.children[slot].load();
        if child.is_none() {
            return None;
        }
        self.children[slot].publish(Child::None);
        self.child_index[key as usize].store(EMPTY_MARKER, Ordering::Release);
        crate::persist::flush_value(&self.child_index[key as usize]);
        self.header.dec_count();
        Some(child)
    }

    pub(crate) fn any_child(&self) -> Option<Child> {
        self.children.iter().find_map(|slot| {
            let (child, _) = slot.load();
            (!child.is_none()).then_some(child)
        })
    }

    pub(crate) fn children_in_range(&self, start: u8, end: u8) -> Vec<(u8, Child)> {
        let mut out = Vec::new();
        for k in start..=end {
            if let Some(slot) = self.slot_of(k) {
                let (child, _) = self.children[slot].load();
                if !child.is_none() {
                    out.push((k, child));
                }
            }
            if k == u8::MAX {
                break;
            }
        }
        out
    }

    pub(crate) fn copy_into<F: FnMut(u8, Child)>(&self, mut insert: F) {
        for key in 0..=255u8 {
            if let Some(slot) = self.slot_of(key) {
                let (child, _) = self.children[slot].load();
                if !child.is_none() {
                    insert(key, child);
                }
            }
            if key == u8::MAX {
                break;
            }
        }
    }
}
