//! Epoch-based reclamation (spec.md §4.8).
//!
//! `aris`'s own `Cargo.toml` already enables the `crossbeam-epoch` feature,
//! even though the teacher's ART stub only plumbs a `&Guard` through without
//! retiring anything through it (`utils/art/art_impl.rs`). This module
//! finishes that wiring: a node unlinked from the tree is deferred through
//! the pinned epoch's garbage list and only destroyed once every thread has
//! advanced past the epoch in which it was retired, exactly the contract
//! `readUnlockOrRestart` depends on to stay memory-safe against stale
//! pointers (spec.md §9).

pub use crossbeam::epoch::{pin, Guard};

/// Defer destruction of a heap value until it is safe to reclaim.
///
/// # Safety
///
/// `ptr` must not be dereferenced by any other thread after this call
/// returns to the caller (the node must already be unreachable from the
/// root before it is retired, per spec.md invariant 4).
pub unsafe fn retire<T: Send + 'static>(guard: &Guard, ptr: *mut T) {
    guard.defer_unchecked(move || {
        drop(Box::from_raw(ptr));
    });
}
