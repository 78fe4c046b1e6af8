//! Persistence primitives: memory fence and cacheline flush.
//!
//! Ordering discipline is: write the data, `clflush` it, `mfence`, and only
//! then make the pointer that exposes it visible (spec.md §4.1, §9).

pub const CACHELINE_SIZE: usize = 64;

#[inline]
pub fn mfence() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Flush every cacheline covering `[data, data + len)`.
///
/// On x86_64 this issues real `clflush` instructions; elsewhere (where the
/// crate is compiled for portability rather than for its NVM target) this
/// degrades to a fence-only no-op, matching how ported ROWEX
/// implementations treat ISAs without an explicit flush instruction.
pub fn clflush(data: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let mut addr = (data as usize) & !(CACHELINE_SIZE - 1);
        let end = data as usize + len;
        while addr < end {
            unsafe { core::arch::x86_64::_mm_clflush(addr as *const u8) };
            addr += CACHELINE_SIZE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (data, len);
    }
    mfence();
}

/// Flush the cacheline(s) backing a single value in place.
pub fn flush_value<T>(value: &T) {
    clflush(value as *const T as *const u8, std::mem::size_of::<T>());
}
