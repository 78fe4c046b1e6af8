//! Fixed-address NVM page manager (spec.md §4.7, §6).
//!
//! Grounded directly in `original_source/nvm_mgr/nvm_mgr.cpp`: create-or-open
//! the backing file, `mmap` it `MAP_SHARED` at a fixed virtual address (hard
//! abort if the kernel hands back a different address; the tree's pointers
//! are absolute within this region), and hand out `PGSIZE` pages to callers
//! from a bitmap-backed free list. `aris` doesn't have an equivalent module
//! of its own (it stores SSTables as regular files via `rio`), so the
//! lifecycle style below (a `Drop`-based resource owner guarded by a
//! process-wide mutex for the slow path, with a lock-free fast path for
//! `get_nvm_mgr`) follows the "prefer a handle... global singletons...
//! init -> get* -> close" guidance in spec.md §9 and mirrors how `aris`
//! itself owns its log-file file descriptors for the process's lifetime.

mod head;

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::config::{NvmConfig, PGSIZE};
use crate::error::{ArtError, ArtResult};
use crate::persist::{clflush, flush_value};

pub use head::{Head, BITMAP_LEN, FREE_MARKER, MAGIC};

/// A process-wide NVM manager. Owns the mapping and the free-page metadata.
pub struct NvmMgr {
    fd: RawFd,
    base: usize,
    filesize: u64,
    max_threads: usize,
    thread_local_start: usize,
    data_block_start: usize,
    num_data_pages: usize,
    free_page_list: Mutex<VecDeque<u64>>,
    free_bit_offset: AtomicU64,
}

// The manager hands out raw addresses into the mapped region; the mapping
// itself, the fd, and the bitmap are safe to share across threads (spec.md
// §5: the allocator mutex is the only blocking primitive).
unsafe impl Send for NvmMgr {}
unsafe impl Sync for NvmMgr {}

impl NvmMgr {
    fn open(cfg: &NvmConfig) -> ArtResult<Self> {
        let fresh = !cfg.path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&cfg.path)?;
        file.set_len(cfg.filesize)?;
        let fd = file.into_raw_fd();

        let addr = unsafe {
            libc::mmap(
                cfg.start_addr as *mut libc::c_void,
                cfg.filesize as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ArtError::Io(std::io::Error::last_os_error()));
        }
        if addr as usize != cfg.start_addr {
            // Fatal per spec.md §7: pointers stored in the tree are absolute,
            // so a relocated mapping cannot be salvaged without a swizzle
            // pass this crate does not implement.
            return Err(ArtError::MmapAddressMismatch {
                requested: cfg.start_addr,
                got: addr as usize,
            });
        }

        let thread_local_start = PGSIZE;
        let data_block_start = PGSIZE * (1 + cfg.max_threads);
        let num_data_pages = ((cfg.filesize as usize).saturating_sub(data_block_start)) / PGSIZE;
        assert!(
            num_data_pages <= BITMAP_LEN,
            "filesize implies {num_data_pages} data pages but the head page only tracks {BITMAP_LEN}"
        );

        let mgr = Self {
            fd,
            base: addr as usize,
            filesize: cfg.filesize,
            max_threads: cfg.max_threads,
            thread_local_start,
            data_block_start,
            num_data_pages,
            free_page_list: Mutex::new(VecDeque::new()),
            free_bit_offset: AtomicU64::new(0),
        };

        if fresh {
            info!(path = %cfg.path.display(), "nvm mgr: initializing fresh backing file");
            unsafe { ptr::write_bytes(mgr.base as *mut u8, 0, PGSIZE) };
            let head = mgr.head();
            unsafe { ptr::write(&head.status as *const u64 as *mut u64, MAGIC) };
            head.threads.store(0, Ordering::Relaxed);
            clflush(mgr.base as *const u8, PGSIZE);
        } else if !mgr.head().is_initialized() {
            return Err(ArtError::MagicMismatch);
        } else {
            info!(path = %cfg.path.display(), "nvm mgr: reopened existing backing file");
        }

        mgr.reload_free_blocks();
        Ok(mgr)
    }

    fn head(&self) -> &Head {
        unsafe { &*(self.base as *const Head) }
    }

    /// Rescan the persistent bitmap starting at `free_bit_offset`, adding
    /// every free page id found to the in-memory free list. Returns `false`
    /// once the whole bitmap has been scanned with nothing free remaining.
    fn reload_free_blocks(&self) -> bool {
        let mut list = self.free_page_list.lock().unwrap();
        debug_assert!(list.is_empty());

        let mut offset = self.free_bit_offset.load(Ordering::Relaxed) as usize;
        if offset >= self.num_data_pages {
            return false;
        }
        let head = self.head();
        while offset < self.num_data_pages {
            if head.bitmap[offset].load(Ordering::Acquire) == FREE_MARKER {
                list.push_back(offset as u64);
            }
            offset += 1;
        }
        self.free_bit_offset.store(offset as u64, Ordering::Relaxed);
        debug!(free = list.len(), "nvm mgr: reloaded free blocks");
        !list.is_empty()
    }

    /// Reserve this thread's scratch page; the returned address is stable
    /// for the process's lifetime.
    pub fn alloc_thread_info(&self) -> *mut u8 {
        let head = self.head();
        let index = head.threads.fetch_add(1, Ordering::AcqRel) as usize;
        assert!(index < self.max_threads, "thread-local region exhausted");
        flush_value(&head.threads);
        (self.base + self.thread_local_start + index * PGSIZE) as *mut u8
    }

    /// Allocate one `PGSIZE` page, stamping the bitmap with `kind` (an
    /// opaque 1..=255 type marker the caller defines, per spec.md §6).
    /// Surfaces `ArtError::OutOfSpace` once the bitmap has no free page left
    /// (spec.md §7: "out-of-space surfaces to the caller").
    pub fn alloc_block(&self, kind: u8) -> ArtResult<*mut u8> {
        assert_ne!(kind, FREE_MARKER, "0 is reserved to mean 'free'");
        let mut list = self.free_page_list.lock().unwrap();
        if list.is_empty() && !self.reload_free_blocks_locked(&mut list) {
            return Err(ArtError::OutOfSpace);
        }
        let id = list.pop_front().ok_or(ArtError::OutOfSpace)?;
        let head = self.head();
        head.bitmap[id as usize].store(kind, Ordering::Release);
        flush_value(&head.bitmap[id as usize]);
        debug!(id, kind, "nvm mgr: allocated block");
        Ok((self.base + self.data_block_start + id as usize * PGSIZE) as *mut u8)
    }

    /// Return a page to the free list, marking the bitmap byte free again.
    ///
    /// Like `alloc_block`, this is not crash-consistent against a torn
    /// free/allocate race (spec.md §9 Open Question a); a redo log or
    /// allocation-intent record would be needed to close that gap.
    pub fn free_block(&self, addr: *mut u8) {
        let offset = addr as usize - self.base - self.data_block_start;
        assert_eq!(offset % PGSIZE, 0, "address is not page-aligned");
        let id = (offset / PGSIZE) as u64;

        let head = self.head();
        head.bitmap[id as usize].store(FREE_MARKER, Ordering::Release);
        flush_value(&head.bitmap[id as usize]);

        self.free_page_list.lock().unwrap().push_back(id);
    }

    fn reload_free_blocks_locked(&self, list: &mut VecDeque<u64>) -> bool {
        debug_assert!(list.is_empty());
        let mut offset = self.free_bit_offset.load(Ordering::Relaxed) as usize;
        if offset >= self.num_data_pages {
            return false;
        }
        let head = self.head();
        while offset < self.num_data_pages {
            if head.bitmap[offset].load(Ordering::Acquire) == FREE_MARKER {
                list.push_back(offset as u64);
            }
            offset += 1;
        }
        self.free_bit_offset.store(offset as u64, Ordering::Relaxed);
        !list.is_empty()
    }
}

impl Drop for NvmMgr {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.filesize as libc::size_t);
            libc::close(self.fd);
        }
        info!("nvm mgr: unmapped and closed");
    }
}

static NVM_MGR_PTR: AtomicPtr<NvmMgr> = AtomicPtr::new(ptr::null_mut());
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize the process-wide manager. Returns `true` the first time it is
/// called, `false` if a manager is already installed (spec.md §6).
pub fn init_nvm_mgr(cfg: &NvmConfig) -> bool {
    let _guard = INIT_LOCK.lock().unwrap();
    if !NVM_MGR_PTR.load(Ordering::Acquire).is_null() {
        return false;
    }
    let mgr = Box::new(
        NvmMgr::open(cfg).unwrap_or_else(|e| panic!("fatal: nvm manager init failed: {e}")),
    );
    NVM_MGR_PTR.store(Box::into_raw(mgr), Ordering::Release);
    true
}

/// Fetch the singleton. Aborts (panics) if uninitialized, per spec.md §7's
/// Fatal error kind.
pub fn get_nvm_mgr() -> &'static NvmMgr {
    let ptr = NVM_MGR_PTR.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "nvm manager is not initialized");
    unsafe { &*ptr }
}

/// Flush, unmap, and close the backing file.
pub fn close_nvm_mgr() {
    let _guard = INIT_LOCK.lock().unwrap();
    let ptr = NVM_MGR_PTR.swap(ptr::null_mut(), Ordering::AcqRel);
    if !ptr.is_null() {
        unsafe { drop(Box::from_raw(ptr)) };
    }
}
