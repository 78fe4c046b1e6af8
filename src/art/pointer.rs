//! Child pointer encoding (spec.md §3 "Child pointer encoding", §9).
//!
//! A child slot is a single `AtomicU64`: 0 means null, bit 0 tags a leaf
//! vs. an internal node, and bit 60 is the "dirty" / not-yet-flushed
//! marker. Every internal node and every leaf is 64-byte aligned, so the
//! six low address bits are always free; spec.md §9 only asks for one of
//! them (bit 0) plus the high dirty bit, which is safe as long as the
//! address space in use stays under 2^60. This finishes what
//! `aris::utils::art::node::NodePtr` only sketches (`Intenal`/`Leaf`/`None`
//! without a dirty bit or a packed representation).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::art::leaf::Leaf;
use crate::art::node_header::NodeHeader;
use crate::persist::flush_value;

const LEAF_TAG: u64 = 0b1;
const DIRTY_BIT: u64 = 1 << 60;
const ADDR_MASK: u64 = !(LEAF_TAG | DIRTY_BIT);

/// A type-erased pointer to one of the four inner node families. The
/// concrete layout is recovered via [`NodeHeader::node_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpaqueNodePtr(pub(crate) NonNull<NodeHeader>);

impl OpaqueNodePtr {
    pub(crate) unsafe fn header(&self) -> &NodeHeader {
        self.0.as_ref()
    }

    pub(crate) unsafe fn cast<T>(&self) -> NonNull<T> {
        self.0.cast()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Child {
    None,
    Internal(OpaqueNodePtr),
    Leaf(NonNull<Leaf>),
}

impl Child {
    pub(crate) fn internal(ptr: NonNull<NodeHeader>) -> Self {
        Child::Internal(OpaqueNodePtr(ptr))
    }

    pub(crate) fn leaf(ptr: NonNull<Leaf>) -> Self {
        Child::Leaf(ptr)
    }

    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Child::None)
    }

    fn encode(self) -> u64 {
        match self {
            Child::None => 0,
            Child::Internal(p) => p.0.as_ptr() as u64,
            Child::Leaf(p) => p.as_ptr() as u64 | LEAF_TAG,
        }
    }

    fn decode(raw: u64) -> Self {
        let addr = raw & ADDR_MASK;
        if addr == 0 {
            Child::None
        } else if raw & LEAF_TAG != 0 {
            Child::Leaf(NonNull::new(addr as *mut Leaf).expect("non-null checked above"))
        } else {
            Child::Internal(OpaqueNodePtr(
                NonNull::new(addr as *mut NodeHeader).expect("non-null checked above"),
            ))
        }
    }
}

/// One child slot inside an inner node.
pub(crate) struct ChildSlot(AtomicU64);

impl ChildSlot {
    pub(crate) fn empty() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Read the slot along with whether it is currently mid-flush.
    pub(crate) fn load(&self) -> (Child, bool) {
        let raw = self.0.load(Ordering::Acquire);
        (Child::decode(raw), raw & DIRTY_BIT != 0)
    }

    /// Install a child with no publication ceremony. Only safe before the
    /// owning node itself has been published to any other thread (e.g.
    /// while initializing a brand-new node before it is linked into the
    /// tree).
    pub(crate) fn set_unpublished(&self, child: Child) {
        self.0.store(child.encode(), Ordering::Release);
    }

    /// Publish `child` into a slot that other threads may already observe:
    /// store with the dirty bit set, flush the cacheline, then clear the
    /// dirty bit (spec.md §4.3 write ordering).
    pub(crate) fn publish(&self, child: Child) {
        self.0.store(child.encode() | DIRTY_BIT, Ordering::Release);
        flush_value(&self.0);
        self.0.store(child.encode(), Ordering::Release);
    }

    /// Any thread that observes a dirty pointer must flush it on behalf of
    /// the writer before acting on it (spec.md §3, §9 "help needed" signal).
    pub(crate) fn help_flush(&self) {
        flush_value(&self.0);
    }
}

impl std::fmt::Debug for ChildSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChildSlot({:#x})", self.0.load(Ordering::Relaxed))
    }
}
