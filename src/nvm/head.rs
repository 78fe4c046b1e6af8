//! Layout of the fixed head page (spec.md §4.7, §6).

use std::sync::atomic::{AtomicU32, AtomicU8};

use crate::config::PGSIZE;

/// Distinguishes an already-initialized backing file from a freshly
/// truncated one.
pub const MAGIC: u64 = 0x4152545f4e564d21; // "ART_NVM!" read as bytes, roughly

/// Bitmap byte meaning "this data page is free".
pub const FREE_MARKER: u8 = 0;

const HEAD_FIXED_FIELDS: usize = std::mem::size_of::<u64>() + std::mem::size_of::<AtomicU32>();

/// One byte per data page; capped by the page's remaining space.
pub const BITMAP_LEN: usize = PGSIZE - HEAD_FIXED_FIELDS;

/// The head page: magic, thread counter, and the free-page bitmap.
///
/// `status`/`threads` are read and written with explicit flushes around
/// every mutation (spec.md invariant 3); the bitmap bytes are flushed
/// individually by whoever mutates them, in [`super::NvmMgr`].
#[repr(C)]
pub struct Head {
    pub status: u64,
    pub threads: AtomicU32,
    pub bitmap: [AtomicU8; BITMAP_LEN],
}

impl Head {
    pub fn is_initialized(&self) -> bool {
        self.status == MAGIC
    }
}
