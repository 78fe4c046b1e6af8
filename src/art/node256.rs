//! `N256`: direct-indexed child array (spec.md §3, §4.5), grounded in
//! `original_source/ART/N.h`'s `N256`.

use crate::art::node_header::{NodeHeader, NodeType, Prefix};
use crate::art::pointer::{Child, ChildSlot};

pub(crate) const CAPACITY: usize = 256;

#[repr(C, align(64))]
pub(crate) struct N256 {
    pub(crate) header: NodeHeader,
    children: [ChildSlot; CAPACITY],
}

impl N256 {
    pub(crate) fn new(level: u32, prefix: Prefix) -> Self {
        Self {
            header: NodeHeader::new(NodeType::N256, level, prefix),
            children: std::array::from_fn(|_| ChildSlot::empty()),
        }
    }

    pub(crate) fn find_child(&self, key: u8) -> Option<(Child, bool)> {
        let (child, dirty) = self.children[key as usize].load();
        (!child.is_none()).then_some((child, dirty))
    }

    pub(crate) fn help_flush(&self, key: u8) {
        self.children[key as usize].help_flush();
    }

    /// `N256` never needs to grow further; this always succeeds.
    pub(crate) fn insert(&self, key: u8, child: Child) {
        self.children[key as usize].publish(child);
        self.header.inc_count();
    }

    pub(crate) fn replace(&self, key: u8, child: Child) {
        self.children[key as usize].publish(child);
    }

    /// If exactly one child is live, return its key byte and pointer.
    pub(crate) fn sole_child(&self) -> Option<(u8, Child)> {
        if self.header.count() != 1 {
            return None;
        }
        self.children.iter().enumerate().find_map(|(k, slot)| {
            let (child, _) = slot.load();
            (!child.is_none()).then_some((k as u8, child))
        })
    }

    pub(crate) fn remove(&self, key: u8) -> Option<Child> {
        let (child, _) = self.children[key as usize].load();
        if child.is_none() {
            return None;
        }
        self.children[key as usize].publish(Child::None);
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
            let (child, _) = self.children[k as usize].load();
            if !child.is_none() {
                out.push((k, child));
            }
            if k == u8::MAX {
                break;
            }
        }
        out
    }

    pub(crate) fn copy_into<F: FnMut(u8, Child)>(&self, mut insert: F) {
        for (key, slot) in self.children.iter().enumerate() {
            let (child, _) = slot.load();
            if !child.is_none() {
                insert(key as u8, child);
            }
        }
    }
}
