//! Optimistic lock-coupling guards over an [`OpaqueNodePtr`] (spec.md §4.1).
//!
//! Grounded in `aris::utils::opt_lock::OptLock` and
//! `aris::utils::art::node::{ReadGuard, WriteGuard}`, generalized from a
//! single untagged node type to the tagged [`OpaqueNodePtr`] this crate
//! uses, and with an explicit `upgrade` path from read to write (spec.md
//! §4.1's "optimistic upgrade").

use crate::art::node_header::{LockError, LockResult, NodeHeader};
use crate::art::pointer::OpaqueNodePtr;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadGuard {
    ptr: OpaqueNodePtr,
    version: u64,
}

impl ReadGuard {
    pub(crate) fn new(ptr: OpaqueNodePtr) -> LockResult<Self> {
        let version = unsafe { ptr.header() }.check_version()?;
        Ok(Self { ptr, version })
    }

    pub(crate) fn ptr(&self) -> OpaqueNodePtr {
        self.ptr
    }

    pub(crate) fn header(&self) -> &NodeHeader {
        unsafe { self.ptr.header() }
    }

    /// Re-validate that nothing has changed since this guard was taken.
    pub(crate) fn check_or_restart(&self) -> LockResult<()> {
        self.header().check_or_restart(self.version)
    }

    /// Consume the guard, validating one last time (spec.md
    /// `readUnlockOrRestart`).
    pub(crate) fn unlock(self) -> LockResult<()> {
        self.check_or_restart()
    }

    /// Attempt to upgrade this read to a write lock without a window where
    /// another writer could have intervened (spec.md `lockVersionOrRestart`).
    pub(crate) fn upgrade(self) -> Result<WriteGuard, (Self, LockError)> {
        match self.header().lock_version_or_restart(self.version) {
            Ok(()) => Ok(WriteGuard {
                ptr: self.ptr,
                obsolete_on_drop: false,
            }),
            Err(e) => Err((self, e)),
        }
    }
}

#[derive(Debug)]
pub(crate) struct WriteGuard {
    ptr: OpaqueNodePtr,
    obsolete_on_drop: bool,
}

impl WriteGuard {
    pub(crate) fn acquire(ptr: OpaqueNodePtr) -> LockResult<Self> {
        unsafe { ptr.header() }.write_lock_or_restart()?;
        Ok(Self {
            ptr,
            obsolete_on_drop: false,
        })
    }

    pub(crate) fn ptr(&self) -> OpaqueNodePtr {
        self.ptr
    }

    pub(crate) fn header(&self) -> &NodeHeader {
        unsafe { self.ptr.header() }
    }

    /// Mark the node obsolete; the unlock performed by `Drop` will then
    /// also set the obsolete bit in the same atomic step (spec.md
    /// `writeUnlockObsolete`). Callers must have already redirected every
    /// pointer into this node before calling this (spec.md invariant 4).
    pub(crate) fn mark_obsolete(&mut self) {
        self.obsolete_on_drop = true;
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.obsolete_on_drop {
            self.header().write_unlock_obsolete();
        } else {
            self.header().write_unlock();
        }
    }
}
