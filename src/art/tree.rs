//! Lookup/insert/remove/grow/shrink/get_children (spec.md §4.1-§4.6).
//!
//! Grounded in `aris::utils::art::art_impl`'s parent/cur traversal sketch
//! (read-guard the current node, upgrade to a write guard only on the path
//! that actually mutates, restart the whole operation on any lock error),
//! generalized from a single untagged node type to the four-family
//! [`NodeRef`] dispatch and completed end to end: grow/shrink, leaf-leaf
//! splits, prefix splits, and the `addPrefixBefore` merge-on-remove step
//! the teacher's stub only left as a `todo!()`.

use std::ptr::NonNull;

use crate::art::leaf::Leaf;
use crate::art::lock::{ReadGuard, WriteGuard};
use crate::art::node16::N16;
use crate::art::node256::N256;
use crate::art::node4::{self, N4};
use crate::art::node48::N48;
use crate::art::{node16, node48};
use crate::art::node_header::{LockResult, NodeHeader, NodeType, Prefix, MAX_STORED_PREFIX_LEN};
use crate::art::pointer::{Child, OpaqueNodePtr};
use crate::epoch::{self, Guard};
use crate::key::Key;
use crate::persist;

/// Reserved key byte standing in for "the key ends exactly at this depth"
/// (spec.md §4.2 step 3's "distinguished leaf slot"). A key that genuinely
/// contains `0x00` at the same byte position as another key's boundary is
/// outside this rewrite's scope; see DESIGN.md.
const TERMINATOR_BYTE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed(u64),
    Absent,
}

/// The kind of child `get_children` reports, without leaking the crate's
/// internal pointer representation across the public API.
#[derive(Debug, Clone, Copy)]
pub enum ChildKind {
    Leaf(u64),
    Internal,
}

/// A type-erased view over whichever of the four node families a pointer
/// actually names, resolved once per access via the header's type tag
/// (spec.md §9: "the header's type tag already drives dispatch").
enum NodeRef<'a> {
    N4(&'a N4),
    N16(&'a N16),
    N48(&'a N48),
    N256(&'a N256),
}

impl<'a> NodeRef<'a> {
    unsafe fn from_ptr(ptr: OpaqueNodePtr) -> Self {
        match ptr.header().node_type() {
            NodeType::N4 => NodeRef::N4(ptr.cast::<N4>().as_ref()),
            NodeType::N16 => NodeRef::N16(ptr.cast::<N16>().as_ref()),
            NodeType::N48 => NodeRef::N48(ptr.cast::<N48>().as_ref()),
            NodeType::N256 => NodeRef::N256(ptr.cast::<N256>().as_ref()),
        }
    }

    fn find_child(&self, key: u8) -> Option<(Child, bool)> {
        match self {
            NodeRef::N4(n) => n.find_child(key),
            NodeRef::N16(n) => n.find_child(key),
            NodeRef::N48(n) => n.find_child(key),
            NodeRef::N256(n) => n.find_child(key),
        }
    }

    fn help_flush(&self, key: u8) {
        match self {
            NodeRef::N4(n) => n.help_flush(key),
            NodeRef::N16(n) => n.help_flush(key),
            NodeRef::N48(n) => n.help_flush(key),
            NodeRef::N256(n) => n.help_flush(key),
        }
    }

    fn any_child(&self) -> Option<Child> {
        match self {
            NodeRef::N4(n) => n.any_child(),
            NodeRef::N16(n) => n.any_child(),
            NodeRef::N48(n) => n.any_child(),
            NodeRef::N256(n) => n.any_child(),
        }
    }

    fn children_in_range(&self, start: u8, end: u8) -> Vec<(u8, Child)> {
        match self {
            NodeRef::N4(n) => n.children_in_range(start, end),
            NodeRef::N16(n) => n.children_in_range(start, end),
            NodeRef::N48(n) => n.children_in_range(start, end),
            NodeRef::N256(n) => n.children_in_range(start, end),
        }
    }

    fn remove(&self, key: u8) -> Option<Child> {
        match self {
            NodeRef::N4(n) => n.remove(key),
            NodeRef::N16(n) => n.remove(key),
            NodeRef::N48(n) => n.remove(key),
            NodeRef::N256(n) => n.remove(key),
        }
    }

    fn replace(&self, key: u8, child: Child) {
        match self {
            NodeRef::N4(n) => n.replace(key, child),
            NodeRef::N16(n) => n.replace(key, child),
            NodeRef::N48(n) => n.replace(key, child),
            NodeRef::N256(n) => n.replace(key, child),
        }
    }

    fn sole_child(&self) -> Option<(u8, Child)> {
        match self {
            NodeRef::N4(n) => n.sole_child(),
            NodeRef::N16(n) => n.sole_child(),
            NodeRef::N48(n) => n.sole_child(),
            NodeRef::N256(n) => n.sole_child(),
        }
    }
}

fn read_child(ptr: OpaqueNodePtr, key: u8) -> (Child, bool) {
    unsafe { NodeRef::from_ptr(ptr) }
        .find_child(key)
        .unwrap_or((Child::None, false))
}

fn help_flush(ptr: OpaqueNodePtr, key: u8) {
    unsafe { NodeRef::from_ptr(ptr) }.help_flush(key);
}

fn sole_child(ptr: OpaqueNodePtr) -> Option<(u8, Child)> {
    unsafe { NodeRef::from_ptr(ptr) }.sole_child()
}

/// Descend via `any_child` until a leaf is reached; used both to validate
/// a node's prefix beyond the 4 inlined bytes and to reconstruct a node's
/// true prefix when splitting or merging (spec.md §3 invariant 6).
unsafe fn find_any_leaf(ptr: OpaqueNodePtr) -> Option<NonNull<Leaf>> {
    let mut cur = ptr;
    loop {
        match NodeRef::from_ptr(cur).any_child()? {
            Child::Leaf(l) => return Some(l),
            Child::Internal(p) => cur = p,
            Child::None => return None,
        }
    }
}

enum PrefixOutcome {
    /// The node's whole stored prefix (`usize` bytes) matched `key`.
    FullMatch(usize),
    /// Mismatch (or the key ran out) at byte offset `usize` within the
    /// node's prefix, which is less than the prefix's total length.
    Partial(usize),
}

fn check_prefix(ptr: OpaqueNodePtr, key: &[u8], level: usize) -> PrefixOutcome {
    let header = unsafe { ptr.header() };
    let prefix = header.prefix();
    let count = prefix.count as usize;
    if count == 0 {
        return PrefixOutcome::FullMatch(0);
    }

    let stored = prefix.stored();
    let avail = key.len().saturating_sub(level);
    let cmp_len = avail.min(stored.len());
    for (i, b) in stored[..cmp_len].iter().enumerate() {
        if key[level + i] != *b {
            return PrefixOutcome::Partial(i);
        }
    }
    if cmp_len < stored.len() {
        return PrefixOutcome::Partial(cmp_len);
    }

    if count > MAX_STORED_PREFIX_LEN {
        let leaf = unsafe { find_any_leaf(ptr) }.expect("internal node with no descendant leaf");
        let leaf_key = unsafe { leaf.as_ref() }.key();
        for i in MAX_STORED_PREFIX_LEN..count {
            if level + i >= key.len() || level + i >= leaf_key.len() || key[level + i] != leaf_key[level + i] {
                return PrefixOutcome::Partial(i);
            }
        }
    }
    PrefixOutcome::FullMatch(count)
}

fn alloc_leaf(key: &[u8], value: u64) -> NonNull<Leaf> {
    let ptr = NonNull::from(Box::leak(Box::new(Leaf::new(key, value))));
    persist::flush_value(unsafe { ptr.as_ref() });
    ptr
}

fn leak_node<T>(node: T) -> NonNull<NodeHeader> {
    let ptr = NonNull::from(Box::leak(Box::new(node)));
    persist::clflush(ptr.as_ptr() as *const u8, std::mem::size_of::<T>());
    ptr.cast()
}

unsafe fn retire_node(guard: &Guard, ptr: OpaqueNodePtr) {
    match ptr.header().node_type() {
        NodeType::N4 => epoch::retire(guard, ptr.cast::<N4>().as_ptr()),
        NodeType::N16 => epoch::retire(guard, ptr.cast::<N16>().as_ptr()),
        NodeType::N48 => epoch::retire(guard, ptr.cast::<N48>().as_ptr()),
        NodeType::N256 => epoch::retire(guard, ptr.cast::<N256>().as_ptr()),
    }
}

enum InsertAttempt {
    Done,
    NeedsCompact,
    NeedsGrow,
}

fn try_insert_leaf(ptr: OpaqueNodePtr, key: u8, child: Child) -> InsertAttempt {
    unsafe {
        match ptr.header().node_type() {
            NodeType::N4 => match ptr.cast::<N4>().as_ref().insert(key, child) {
                node4::InsertOutcome::Inserted => InsertAttempt::Done,
                node4::InsertOutcome::NeedsCompact => InsertAttempt::NeedsCompact,
                node4::InsertOutcome::NeedsGrow => InsertAttempt::NeedsGrow,
            },
            NodeType::N16 => match ptr.cast::<N16>().as_ref().insert(key, child) {
                node16::InsertOutcome::Inserted => InsertAttempt::Done,
                node16::InsertOutcome::NeedsCompact => InsertAttempt::NeedsCompact,
                node16::InsertOutcome::NeedsGrow => InsertAttempt::NeedsGrow,
            },
            NodeType::N48 => match ptr.cast::<N48>().as_ref().insert(key, child) {
                node48::InsertOutcome::Inserted => InsertAttempt::Done,
                node48::InsertOutcome::NeedsGrow => InsertAttempt::NeedsGrow,
            },
            NodeType::N256 => {
                ptr.cast::<N256>().as_ref().insert(key, child);
                InsertAttempt::Done
            }
        }
    }
}

fn try_compact(ptr: OpaqueNodePtr) {
    unsafe {
        match ptr.header().node_type() {
            NodeType::N4 => ptr.cast::<N4>().as_ref().compact(),
            NodeType::N16 => ptr.cast::<N16>().as_ref().compact(),
            other => unreachable!("{other:?} never reports NeedsCompact"),
        }
    }
}

fn grow(ptr: OpaqueNodePtr, new_key: u8, new_child: Child) -> NonNull<NodeHeader> {
    unsafe {
        match ptr.header().node_type() {
            NodeType::N4 => {
                let old = ptr.cast::<N4>().as_ref();
                let new_node = N16::new(old.header.level(), old.header.prefix());
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                new_node.insert(new_key, new_child);
                leak_node(new_node)
            }
            NodeType::N16 => {
                let old = ptr.cast::<N16>().as_ref();
                let new_node = N48::new(old.header.level(), old.header.prefix());
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                new_node.insert(new_key, new_child);
                leak_node(new_node)
            }
            NodeType::N48 => {
                let old = ptr.cast::<N48>().as_ref();
                let new_node = N256::new(old.header.level(), old.header.prefix());
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                new_node.insert(new_key, new_child);
                leak_node(new_node)
            }
            NodeType::N256 => unreachable!("N256 never needs to grow"),
        }
    }
}

fn shrink(ptr: OpaqueNodePtr) -> NonNull<NodeHeader> {
    unsafe {
        match ptr.header().node_type() {
            NodeType::N16 => {
                let old = ptr.cast::<N16>().as_ref();
                let new_node = N4::new(old.header.level(), old.header.prefix());
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                leak_node(new_node)
            }
            NodeType::N48 => {
                let old = ptr.cast::<N48>().as_ref();
                let new_node = N16::new(old.header.level(), old.header.prefix());
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                leak_node(new_node)
            }
            NodeType::N256 => {
                let old = ptr.cast::<N256>().as_ref();
                let new_node = N48::new(old.header.level(), old.header.prefix());
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                leak_node(new_node)
            }
            NodeType::N4 => unreachable!("N4 never shrinks further"),
        }
    }
}

/// Rebuild `ptr`'s node with the same family and children but a new
/// `level`/`prefix`. `level` is immutable once a node is constructed
/// (spec.md §3), so a prefix-before-merge or a prefix split replaces the
/// node outright rather than mutating it in place.
fn clone_with_prefix(ptr: OpaqueNodePtr, level: u32, prefix: Prefix) -> NonNull<NodeHeader> {
    unsafe {
        match ptr.header().node_type() {
            NodeType::N4 => {
                let old = ptr.cast::<N4>().as_ref();
                let new_node = N4::new(level, prefix);
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                leak_node(new_node)
            }
            NodeType::N16 => {
                let old = ptr.cast::<N16>().as_ref();
                let new_node = N16::new(level, prefix);
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                leak_node(new_node)
            }
            NodeType::N48 => {
                let old = ptr.cast::<N48>().as_ref();
                let new_node = N48::new(level, prefix);
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                leak_node(new_node)
            }
            NodeType::N256 => {
                let old = ptr.cast::<N256>().as_ref();
                let new_node = N256::new(level, prefix);
                old.copy_into(|k, c| {
                    new_node.insert(k, c);
                });
                leak_node(new_node)
            }
        }
    }
}

/// A persistent, concurrent Adaptive Radix Tree (spec.md §1-§4).
///
/// The root is always a fixed `N256` so insert/remove never need a
/// root-is-missing special case and the root is never itself grown,
/// shrunk, or merged away (an Open Question decision, see DESIGN.md).
pub struct Tree {
    root: NonNull<N256>,
}

// `Tree` hands out raw pointers rooted in leaked allocations guarded by
// each node's own lock-coupling protocol and epoch reclamation, same as
// `NvmMgr` (spec.md §5: node memory is shared freely; mutation is gated by
// each node's lock bit).
unsafe impl Send for Tree {}
unsafe impl Sync for Tree {}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        let root = N256::new(0, Prefix::default());
        let ptr = NonNull::from(Box::leak(Box::new(root)));
        persist::clflush(ptr.as_ptr() as *const u8, std::mem::size_of::<N256>());
        Self { root: ptr }
    }

    fn root_ptr(&self) -> OpaqueNodePtr {
        OpaqueNodePtr(self.root.cast())
    }

    pub fn lookup(&self, key: &Key) -> Option<u64> {
        let _guard = epoch::pin();
        loop {
            if let Ok(result) = self.try_lookup(key.as_bytes()) {
                return result;
            }
        }
    }

    fn try_lookup(&self, kbytes: &[u8]) -> LockResult<Option<u64>> {
        let mut node = ReadGuard::new(self.root_ptr())?;
        let mut level = 0usize;
        loop {
            match check_prefix(node.ptr(), kbytes, level) {
                PrefixOutcome::FullMatch(n) => level += n,
                PrefixOutcome::Partial(_) => {
                    node.check_or_restart()?;
                    return Ok(None);
                }
            }
            node.check_or_restart()?;

            let key_byte = if level == kbytes.len() { TERMINATOR_BYTE } else { kbytes[level] };
            let (child, dirty) = read_child(node.ptr(), key_byte);
            node.check_or_restart()?;
            if dirty {
                help_flush(node.ptr(), key_byte);
            }

            match child {
                Child::None => return Ok(None),
                Child::Leaf(leaf_ptr) => {
                    let leaf = unsafe { leaf_ptr.as_ref() };
                    return Ok(leaf.matches(kbytes).then(|| leaf.value()));
                }
                Child::Internal(next_ptr) => {
                    let next = ReadGuard::new(next_ptr)?;
                    node.check_or_restart()?;
                    node = next;
                    level += 1;
                }
            }
        }
    }

    pub fn insert(&self, key: Key) -> InsertOutcome {
        let guard = epoch::pin();
        loop {
            if let Ok(outcome) = self.try_insert(&key, &guard) {
                return outcome;
            }
        }
    }

    fn try_insert(&self, key: &Key, guard: &Guard) -> LockResult<InsertOutcome> {
        let kbytes = key.as_bytes();
        let mut parent: Option<(ReadGuard, u8)> = None;
        let mut node = ReadGuard::new(self.root_ptr())?;
        let mut level = 0usize;

        loop {
            match check_prefix(node.ptr(), kbytes, level) {
                PrefixOutcome::FullMatch(n) => level += n,
                PrefixOutcome::Partial(matched) => {
                    return self.split_prefix(node, parent, kbytes, key.value, level, matched, guard);
                }
            }
            node.check_or_restart()?;

            if level == kbytes.len() {
                return self.insert_or_update_terminator(node, parent, key, guard);
            }

            let key_byte = kbytes[level];
            let (child, dirty) = read_child(node.ptr(), key_byte);
            node.check_or_restart()?;
            if dirty {
                help_flush(node.ptr(), key_byte);
            }

            match child {
                Child::None => return self.insert_into_node(node, parent, key_byte, key, guard),
                Child::Leaf(leaf_ptr) => {
                    return self.resolve_leaf_conflict(node, key_byte, leaf_ptr, kbytes, key.value, level + 1, guard);
                }
                Child::Internal(next_ptr) => {
                    let next = ReadGuard::new(next_ptr)?;
                    node.check_or_restart()?;
                    parent = Some((node, key_byte));
                    node = next;
                    level += 1;
                }
            }
        }
    }

    fn insert_into_node(
        &self,
        node: ReadGuard,
        parent: Option<(ReadGuard, u8)>,
        key_byte: u8,
        key: &Key,
        guard: &Guard,
    ) -> LockResult<InsertOutcome> {
        let mut w = node.upgrade().map_err(|(_, e)| e)?;
        let new_leaf = alloc_leaf(key.as_bytes(), key.value);
        loop {
            match try_insert_leaf(w.ptr(), key_byte, Child::leaf(new_leaf)) {
                InsertAttempt::Done => return Ok(InsertOutcome::Inserted),
                InsertAttempt::NeedsCompact => {
                    try_compact(w.ptr());
                }
                InsertAttempt::NeedsGrow => {
                    let (parent_guard, parent_key) =
                        parent.expect("only the root can be parentless, and the root (N256) never grows");
                    let pw = parent_guard.upgrade().map_err(|(_, e)| e)?;
                    let new_node = grow(w.ptr(), key_byte, Child::leaf(new_leaf));
                    unsafe { NodeRef::from_ptr(pw.ptr()) }.replace(parent_key, Child::internal(new_node));
                    w.mark_obsolete();
                    unsafe { retire_node(guard, w.ptr()) };
                    return Ok(InsertOutcome::Inserted);
                }
            }
        }
    }

    fn insert_or_update_terminator(
        &self,
        node: ReadGuard,
        parent: Option<(ReadGuard, u8)>,
        key: &Key,
        guard: &Guard,
    ) -> LockResult<InsertOutcome> {
        let (child, dirty) = read_child(node.ptr(), TERMINATOR_BYTE);
        node.check_or_restart()?;
        if dirty {
            help_flush(node.ptr(), TERMINATOR_BYTE);
        }

        match child {
            Child::None => self.insert_into_node(node, parent, TERMINATOR_BYTE, key, guard),
            Child::Leaf(old_leaf) => {
                let old_ref = unsafe { old_leaf.as_ref() };
                debug_assert_eq!(old_ref.key(), key.as_bytes(), "terminator slot held an unrelated key");
                let w = node.upgrade().map_err(|(_, e)| e)?;
                let new_leaf = alloc_leaf(key.as_bytes(), key.value);
                unsafe { NodeRef::from_ptr(w.ptr()) }.replace(TERMINATOR_BYTE, Child::leaf(new_leaf));
                let old_value = old_ref.value();
                unsafe { epoch::retire(guard, old_leaf.as_ptr()) };
                Ok(InsertOutcome::Updated(old_value))
            }
            Child::Internal(_) => {
                unreachable!("terminator slot collided with a real subtree (embedded-NUL edge case, see DESIGN.md)")
            }
        }
    }

    fn resolve_leaf_conflict(
        &self,
        node: ReadGuard,
        key_byte: u8,
        existing_leaf: NonNull<Leaf>,
        kbytes: &[u8],
        value: u64,
        depth: usize,
        guard: &Guard,
    ) -> LockResult<InsertOutcome> {
        let existing_ref = unsafe { existing_leaf.as_ref() };
        if existing_ref.matches(kbytes) {
            let w = node.upgrade().map_err(|(_, e)| e)?;
            let new_leaf = alloc_leaf(kbytes, value);
            unsafe { NodeRef::from_ptr(w.ptr()) }.replace(key_byte, Child::leaf(new_leaf));
            let old_value = existing_ref.value();
            unsafe { epoch::retire(guard, existing_leaf.as_ptr()) };
            return Ok(InsertOutcome::Updated(old_value));
        }

        let shared = existing_ref.matching_len(kbytes, depth);
        let existing_key = existing_ref.key();
        let existing_byte = existing_key.get(depth + shared).copied().unwrap_or(TERMINATOR_BYTE);
        let new_byte = kbytes.get(depth + shared).copied().unwrap_or(TERMINATOR_BYTE);

        let w = node.upgrade().map_err(|(_, e)| e)?;

        let split_prefix = Prefix::from_slice(shared as u32, &kbytes[depth..depth + shared]);
        let split = N4::new(depth as u32, split_prefix);
        let new_leaf = alloc_leaf(kbytes, value);
        split.insert(existing_byte, Child::leaf(existing_leaf));
        split.insert(new_byte, Child::leaf(new_leaf));
        let split_ptr = leak_node(split);

        unsafe { NodeRef::from_ptr(w.ptr()) }.replace(key_byte, Child::internal(split_ptr));
        Ok(InsertOutcome::Inserted)
    }

    fn split_prefix(
        &self,
        node: ReadGuard,
        parent: Option<(ReadGuard, u8)>,
        kbytes: &[u8],
        value: u64,
        level: usize,
        matched: usize,
        guard: &Guard,
    ) -> LockResult<InsertOutcome> {
        let (parent_guard, parent_key) =
            parent.expect("the root always has an empty prefix, so it is never the node being split");
        let pw = parent_guard.upgrade().map_err(|(_, e)| e)?;
        let w = node.upgrade().map_err(|(_, e)| e)?;

        let old_leaf = unsafe { find_any_leaf(w.ptr()) }.expect("internal node with no descendant leaf");
        let old_leaf_key = unsafe { old_leaf.as_ref() }.key();

        let old_count = w.header().prefix().count as usize;
        let divergent_byte = old_leaf_key[level + matched];
        let remaining_count = (old_count - matched - 1) as u32;
        let remaining_level = (level + matched + 1) as u32;
        let remaining_take = (remaining_count as usize).min(MAX_STORED_PREFIX_LEN);
        let remaining_start = level + matched + 1;
        let remaining_prefix =
            Prefix::from_slice(remaining_count, &old_leaf_key[remaining_start..remaining_start + remaining_take]);
        let cloned_node = clone_with_prefix(w.ptr(), remaining_level, remaining_prefix);

        let new_byte = kbytes.get(level + matched).copied().unwrap_or(TERMINATOR_BYTE);
        let new_leaf = alloc_leaf(kbytes, value);

        let split_prefix = Prefix::from_slice(matched as u32, &kbytes[level..level + matched]);
        let split = N4::new(level as u32, split_prefix);
        split.insert(divergent_byte, Child::internal(cloned_node));
        split.insert(new_byte, Child::leaf(new_leaf));
        let split_ptr = leak_node(split);

        unsafe { NodeRef::from_ptr(pw.ptr()) }.replace(parent_key, Child::internal(split_ptr));

        let mut w = w;
        w.mark_obsolete();
        unsafe { retire_node(guard, w.ptr()) };

        Ok(InsertOutcome::Inserted)
    }

    pub fn remove(&self, key: &Key) -> RemoveOutcome {
        let guard = epoch::pin();
        loop {
            if let Ok(outcome) = self.try_remove(key, &guard) {
                return outcome;
            }
        }
    }

    fn try_remove(&self, key: &Key, guard: &Guard) -> LockResult<RemoveOutcome> {
        let kbytes = key.as_bytes();
        let mut parent: Option<(ReadGuard, u8)> = None;
        let mut node = ReadGuard::new(self.root_ptr())?;
        let mut level = 0usize;

        loop {
            match check_prefix(node.ptr(), kbytes, level) {
                PrefixOutcome::FullMatch(n) => level += n,
                PrefixOutcome::Partial(_) => {
                    node.check_or_restart()?;
                    return Ok(RemoveOutcome::Absent);
                }
            }
            node.check_or_restart()?;

            let key_byte = if level == kbytes.len() { TERMINATOR_BYTE } else { kbytes[level] };
            let (child, dirty) = read_child(node.ptr(), key_byte);
            node.check_or_restart()?;
            if dirty {
                help_flush(node.ptr(), key_byte);
            }

            match child {
                Child::None => return Ok(RemoveOutcome::Absent),
                Child::Leaf(leaf_ptr) => {
                    let leaf_ref = unsafe { leaf_ptr.as_ref() };
                    if !leaf_ref.matches(kbytes) {
                        return Ok(RemoveOutcome::Absent);
                    }
                    return self.remove_leaf(node, parent, key_byte, guard);
                }
                Child::Internal(next_ptr) => {
                    let next = ReadGuard::new(next_ptr)?;
                    node.check_or_restart()?;
                    parent = Some((node, key_byte));
                    node = next;
                    level += 1;
                }
            }
        }
    }

    fn remove_leaf(
        &self,
        node: ReadGuard,
        parent: Option<(ReadGuard, u8)>,
        key_byte: u8,
        guard: &Guard,
    ) -> LockResult<RemoveOutcome> {
        let mut w = node.upgrade().map_err(|(_, e)| e)?;
        let removed = unsafe { NodeRef::from_ptr(w.ptr()) }.remove(key_byte);
        let removed_leaf = match removed {
            Some(Child::Leaf(l)) => l,
            _ => return Ok(RemoveOutcome::Absent),
        };
        let value = unsafe { removed_leaf.as_ref() }.value();
        unsafe { epoch::retire(guard, removed_leaf.as_ptr()) };

        // The removal above is already committed (the leaf is unlinked and
        // retired); shrink/merge is best-effort bookkeeping layered on top
        // of it. A parent lock conflict here must not turn this into a
        // restart: restarting would re-descend, find the key already gone,
        // and report it as `Absent` instead of `Removed`, violating the
        // remove -> ok/absent contract. So its `LockError` is swallowed -
        // whoever next touches this node resolves any further shrink/merge.
        let new_count = w.header().count();
        if let Some((parent_guard, parent_key)) = parent {
            let _ = self.maybe_shrink_or_merge(&mut w, parent_guard, parent_key, new_count, guard);
        }
        Ok(RemoveOutcome::Removed(value))
    }

    /// Post-removal cleanup: drop an emptied node, merge a lone internal
    /// survivor's prefix into its child (`addPrefixBefore`, spec.md §4.4),
    /// or shrink to the next-smaller family (spec.md §4.5's thresholds).
    fn maybe_shrink_or_merge(
        &self,
        w: &mut WriteGuard,
        parent: ReadGuard,
        parent_key: u8,
        count: u16,
        guard: &Guard,
    ) -> LockResult<()> {
        if count == 0 {
            let pw = parent.upgrade().map_err(|(_, e)| e)?;
            unsafe { NodeRef::from_ptr(pw.ptr()) }.remove(parent_key);
            w.mark_obsolete();
            unsafe { retire_node(guard, w.ptr()) };
            return Ok(());
        }

        if count == 1 {
            if let Some((_, Child::Internal(child_ptr))) = sole_child(w.ptr()) {
                let child_read = ReadGuard::new(child_ptr)?;
                let pw = parent.upgrade().map_err(|(_, e)| e)?;
                let mut cw = child_read.upgrade().map_err(|(_, e)| e)?;

                let leaf = unsafe { find_any_leaf(cw.ptr()) }.expect("internal node with no descendant leaf");
                let leaf_key = unsafe { leaf.as_ref() }.key();

                let node_level = w.header().level() as usize;
                let merged_count = w.header().prefix().count + 1 + cw.header().prefix().count;
                let take = (merged_count as usize).min(MAX_STORED_PREFIX_LEN);
                let merged_prefix = Prefix::from_slice(merged_count, &leaf_key[node_level..node_level + take]);

                let new_ptr = clone_with_prefix(cw.ptr(), node_level as u32, merged_prefix);
                unsafe { NodeRef::from_ptr(pw.ptr()) }.replace(parent_key, Child::internal(new_ptr));

                w.mark_obsolete();
                cw.mark_obsolete();
                unsafe {
                    retire_node(guard, w.ptr());
                    retire_node(guard, cw.ptr());
                }
            }
            return Ok(());
        }

        let node_type = unsafe { w.ptr().header() }.node_type();
        let needs_shrink = match node_type {
            NodeType::N16 => count <= 3,
            NodeType::N48 => count <= 12,
            NodeType::N256 => count <= 37,
            NodeType::N4 => false,
        };
        if needs_shrink {
            let pw = parent.upgrade().map_err(|(_, e)| e)?;
            let new_ptr = shrink(w.ptr());
            unsafe { NodeRef::from_ptr(pw.ptr()) }.replace(parent_key, Child::internal(new_ptr));
            w.mark_obsolete();
            unsafe { retire_node(guard, w.ptr()) };
        }
        Ok(())
    }

    /// Snapshot-scan `[start, end]` on the root (spec.md §4.6). Restarts
    /// internally on a version mismatch; no deep locking is taken since
    /// children are never dereferenced.
    pub fn get_children(&self, start: u8, end: u8) -> Vec<(u8, ChildKind)> {
        loop {
            if let Ok(v) = self.try_get_children(start, end) {
                return v;
            }
        }
    }

    fn try_get_children(&self, start: u8, end: u8) -> LockResult<Vec<(u8, ChildKind)>> {
        let node = ReadGuard::new(self.root_ptr())?;
        let children = unsafe { NodeRef::from_ptr(node.ptr()) }.children_in_range(start, end);
        node.check_or_restart()?;
        Ok(children
            .into_iter()
            .map(|(k, c)| {
                (
                    k,
                    match c {
                        Child::Leaf(l) => ChildKind::Leaf(unsafe { l.as_ref() }.value()),
                        Child::Internal(_) => ChildKind::Internal,
                        Child::None => unreachable!("children_in_range never yields a null child"),
                    },
                )
            })
            .collect())
    }

    /// Full, non-linearizable enumeration of every stored `(key, value)`
    /// pair, used by tests to check spec.md §8 invariant 6 against a known
    /// reference set. Not part of the concurrent public contract.
    pub fn collect_all(&self) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        unsafe { Self::collect_from(self.root_ptr(), &mut out) };
        out
    }

    unsafe fn collect_from(ptr: OpaqueNodePtr, out: &mut Vec<(Vec<u8>, u64)>) {
        for (_, child) in NodeRef::from_ptr(ptr).children_in_range(0, u8::MAX) {
            match child {
                Child::Leaf(l) => {
                    let leaf = l.as_ref();
                    out.push((leaf.key().to_vec(), leaf.value()));
                }
                Child::Internal(p) => Self::collect_from(p, out),
                Child::None => {}
            }
        }
    }

    unsafe fn drop_subtree(child: Child) {
        match child {
            Child::None => {}
            Child::Leaf(l) => drop(Box::from_raw(l.as_ptr())),
            Child::Internal(ptr) => {
                let kids = NodeRef::from_ptr(ptr).children_in_range(0, u8::MAX);
                for (_, c) in kids {
                    Self::drop_subtree(c);
                }
                match ptr.header().node_type() {
                    NodeType::N4 => drop(Box::from_raw(ptr.cast::<N4>().as_ptr())),
                    NodeType::N16 => drop(Box::from_raw(ptr.cast::<N16>().as_ptr())),
                    NodeType::N48 => drop(Box::from_raw(ptr.cast::<N48>().as_ptr())),
                    NodeType::N256 => drop(Box::from_raw(ptr.cast::<N256>().as_ptr())),
                }
            }
        }
    }
}

impl Drop for Tree {
    fn drop(&mut self) {
        unsafe { Self::drop_subtree(Child::internal(self.root.cast())) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(bytes: &[u8], value: u64) -> Key {
        Key::new(bytes, value)
    }

    /// Node type of the child reached from the root at `byte`, or `None` if
    /// that slot holds a leaf or nothing.
    fn child_node_type(tree: &Tree, byte: u8) -> Option<NodeType> {
        match read_child(tree.root_ptr(), byte).0 {
            Child::Internal(ptr) => Some(unsafe { ptr.header() }.node_type()),
            Child::Leaf(_) | Child::None => None,
        }
    }

    #[test]
    fn scenario_1_grows_n4_to_n16_on_fifth_insert() {
        let tree = Tree::new();
        for (i, suffix) in [b'a', b'b', b'c', b'd'].into_iter().enumerate() {
            tree.insert(k(&[b'a', b'a', b'a', suffix], (i + 1) as u64));
        }
        assert_eq!(child_node_type(&tree, b'a'), Some(NodeType::N4));

        tree.insert(k(b"aaae", 5));
        assert_eq!(child_node_type(&tree, b'a'), Some(NodeType::N16));

        for (i, suffix) in [b'a', b'b', b'c', b'd', b'e'].into_iter().enumerate() {
            assert_eq!(tree.lookup(&k(&[b'a', b'a', b'a', suffix], 0)), Some((i + 1) as u64));
        }
    }

    #[test]
    fn scenario_3_grows_through_n48_then_shrinks_to_n16() {
        let tree = Tree::new();
        for i in 0u8..48 {
            tree.insert(k(&[b'x', b'x', b'x', i], i as u64));
        }
        assert_eq!(child_node_type(&tree, b'x'), Some(NodeType::N48));

        for i in 0u8..37 {
            assert_eq!(tree.remove(&k(&[b'x', b'x', b'x', i], 0)), RemoveOutcome::Removed(i as u64));
        }
        assert_eq!(child_node_type(&tree, b'x'), Some(NodeType::N16));

        for i in 37u8..48 {
            assert_eq!(tree.lookup(&k(&[b'x', b'x', b'x', i], 0)), Some(i as u64));
        }
    }

    #[test]
    fn intermediate_node_prefix_mismatch_is_absent_not_found() {
        let tree = Tree::new();
        tree.insert(k(b"a", 1));
        tree.insert(k(b"abc", 2));

        assert_eq!(tree.lookup(&k(b"a", 0)), Some(1));
        assert_eq!(tree.lookup(&k(b"abc", 0)), Some(2));
        assert_eq!(tree.lookup(&k(b"ab", 0)), None);
    }

    #[test]
    fn update_returns_previous_value() {
        let tree = Tree::new();
        assert_eq!(tree.insert(k(b"same", 1)), InsertOutcome::Inserted);
        assert_eq!(tree.insert(k(b"same", 2)), InsertOutcome::Updated(1));
        assert_eq!(tree.lookup(&k(b"same", 0)), Some(2));
    }

    #[test]
    fn remove_then_lookup_is_absent() {
        let tree = Tree::new();
        tree.insert(k(b"gone", 7));
        assert_eq!(tree.remove(&k(b"gone", 0)), RemoveOutcome::Removed(7));
        assert_eq!(tree.remove(&k(b"gone", 0)), RemoveOutcome::Absent);
        assert_eq!(tree.lookup(&k(b"gone", 0)), None);
    }
}
