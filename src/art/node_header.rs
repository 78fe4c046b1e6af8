//! The header shared by all four inner node families (spec.md §3, §9).
//!
//! The control word packs type tag, version counter, lock bit, and obsolete
//! bit into one `AtomicU64`, generalizing the `typeVersionLockObsolete`
//! word from `original_source/ART/N.h` and the lock/version scheme already
//! sketched (for a single, untagged node type) in
//! `aris::utils::opt_lock::OptLock` / `aris::utils::art::node::IntenalNode`.
//! Spec.md §9 requires the type tag to live in the *same* atomic word as the
//! version; `aris`'s own stub keeps `node_type` as a separate plain field,
//! so this is the one place this crate diverges from the teacher's existing
//! code rather than reusing it outright.
//!
//! The classic seqlock trick applies: `write_lock` and `write_unlock` both
//! add `LOCK_BIT` (0b10) to the word. Locking flips the lock bit on;
//! unlocking adds it again, which carries into the version bits and clears
//! the lock bit back off, so a single `fetch_add` serves both roles, and
//! the version visibly advances by one full "tick" per write.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeType {
    N4 = 1,
    N16 = 2,
    N48 = 3,
    N256 = 4,
}

impl NodeType {
    pub(crate) fn from_tag(tag: u64) -> Self {
        match tag {
            1 => NodeType::N4,
            2 => NodeType::N16,
            3 => NodeType::N48,
            4 => NodeType::N256,
            other => unreachable!("invalid node type tag {other}"),
        }
    }
}

const TYPE_SHIFT: u32 = 61;
const LOCK_BIT: u64 = 0b10;
const OBSOLETE_BIT: u64 = 0b01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockError {
    VersionMismatch,
    Locked,
    Obsolete,
}

pub(crate) type LockResult<T> = Result<T, LockError>;

pub(crate) const MAX_STORED_PREFIX_LEN: usize = 4;

/// Unpacked view of the node header's `prefix` word.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Prefix {
    /// Total prefix length along the path from the parent; may exceed
    /// [`MAX_STORED_PREFIX_LEN`], in which case bytes past the stored 4
    /// must be re-derived from a descendant leaf (spec.md §3 invariant 6).
    pub count: u32,
    pub bytes: [u8; MAX_STORED_PREFIX_LEN],
}

impl Prefix {
    pub(crate) fn from_slice(count: u32, bytes: &[u8]) -> Self {
        let mut inline = [0u8; MAX_STORED_PREFIX_LEN];
        let n = bytes.len().min(MAX_STORED_PREFIX_LEN);
        inline[..n].copy_from_slice(&bytes[..n]);
        Self { count, bytes: inline }
    }

    /// The prefix bytes actually materialized inline (`min(count, 4)`).
    pub(crate) fn stored(&self) -> &[u8] {
        &self.bytes[..(self.count as usize).min(MAX_STORED_PREFIX_LEN)]
    }

    fn pack(self) -> u64 {
        let mut word = (self.count as u64) << 32;
        for (i, b) in self.bytes.iter().enumerate() {
            word |= (*b as u64) << (i * 8);
        }
        word
    }

    fn unpack(word: u64) -> Self {
        let count = (word >> 32) as u32;
        let mut bytes = [0u8; MAX_STORED_PREFIX_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = ((word >> (i * 8)) & 0xff) as u8;
        }
        Self { count, bytes }
    }
}

/// Header shared by `N4`/`N16`/`N48`/`N256`. Always the first field of the
/// concrete node struct, so a pointer to any family can be reinterpreted as
/// `*const NodeHeader` without an offset (spec.md §9's "tagged variant or
/// common header with per-variant payload").
#[repr(C)]
pub(crate) struct NodeHeader {
    control: AtomicU64,
    prefix: AtomicU64,
    level: u32,
    count: AtomicU16,
    compact_count: AtomicU16,
}

impl NodeHeader {
    pub(crate) fn new(node_type: NodeType, level: u32, prefix: Prefix) -> Self {
        Self {
            control: AtomicU64::new((node_type as u64) << TYPE_SHIFT),
            prefix: AtomicU64::new(prefix.pack()),
            level,
            count: AtomicU16::new(0),
            compact_count: AtomicU16::new(0),
        }
    }

    pub(crate) fn node_type(&self) -> NodeType {
        NodeType::from_tag(self.control.load(Ordering::Acquire) >> TYPE_SHIFT)
    }

    pub(crate) fn level(&self) -> u32 {
        self.level
    }

    pub(crate) fn prefix(&self) -> Prefix {
        Prefix::unpack(self.prefix.load(Ordering::Acquire))
    }

    pub(crate) fn set_prefix(&self, prefix: Prefix) {
        self.prefix.store(prefix.pack(), Ordering::Release);
    }

    pub(crate) fn count(&self) -> u16 {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn compact_count(&self) -> u16 {
        self.compact_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_counts(&self, count: u16, compact_count: u16) {
        self.count.store(count, Ordering::Release);
        self.compact_count.store(compact_count, Ordering::Release);
    }

    pub(crate) fn inc_count(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.compact_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_count(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current version word, including the type tag, lock and obsolete
    /// bits. The type tag never changes after construction, so comparing
    /// whole words (rather than masking it out) is sufficient, the same
    /// approach `original_source/ART/N.h`'s `getVersion` takes.
    pub(crate) fn version(&self) -> u64 {
        self.control.load(Ordering::Acquire)
    }

    pub(crate) fn is_locked_word(version: u64) -> bool {
        version & LOCK_BIT != 0
    }

    pub(crate) fn is_obsolete_word(version: u64) -> bool {
        version & OBSOLETE_BIT != 0
    }

    pub(crate) fn check_version(&self) -> LockResult<u64> {
        let v = self.version();
        if Self::is_obsolete_word(v) {
            return Err(LockError::Obsolete);
        }
        if Self::is_locked_word(v) {
            return Err(LockError::Locked);
        }
        Ok(v)
    }

    pub(crate) fn check_or_restart(&self, start: u64) -> LockResult<()> {
        let v = self.control.load(Ordering::Acquire);
        if v == start {
            return Ok(());
        }
        if Self::is_obsolete_word(v) {
            return Err(LockError::Obsolete);
        }
        Err(LockError::VersionMismatch)
    }

    pub(crate) fn write_lock_or_restart(&self) -> LockResult<()> {
        let v = self.check_version()?;
        self.lock_version_or_restart(v)
    }

    pub(crate) fn lock_version_or_restart(&self, expected: u64) -> LockResult<()> {
        self.control
            .compare_exchange(expected, expected + LOCK_BIT, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| LockError::VersionMismatch)
    }

    pub(crate) fn write_unlock(&self) {
        self.control.fetch_add(LOCK_BIT, Ordering::Release);
    }

    pub(crate) fn write_unlock_obsolete(&self) {
        self.control.fetch_add(LOCK_BIT | OBSOLETE_BIT, Ordering::Release);
    }
}
