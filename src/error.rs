//! Crate-wide error types.
//!
//! The optimistic lock-coupling protocol's restart signal is deliberately
//! *not* part of [`ArtError`]: it never escapes a tree operation, see
//! [`crate::art::lock`].

#[derive(Debug, thiserror::Error)]
pub enum ArtError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("mmap returned {got:#x}, expected fixed address {requested:#x}")]
    MmapAddressMismatch { requested: usize, got: usize },

    #[error("nvm file has an unrecognized header magic number")]
    MagicMismatch,

    #[error("nvm page allocator exhausted")]
    OutOfSpace,
}

pub type ArtResult<T, E = ArtError> = std::result::Result<T, E>;
