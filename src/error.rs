//! Error types surfaced by the arena subsystem.
//!
//! Most public operations keep their C-shaped `bool`/`Option` return
//! (that shape is part of their tested behavior); internally they build
//! one of these variants, log it via [`log::warn!`], then collapse it.
//! A few operations — [`crate::Arena::reserve_os_memory`] and
//! [`crate::Arena::manage_os_memory`] — additionally surface the typed
//! error to the caller, since nothing downstream depends on their
//! returning a bare sentinel.

use thiserror::Error;

/// Failure reasons this subsystem can report.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ArenaError {
    /// The OS refused to reserve address space of the requested size.
    #[error("out of address space: failed to reserve {requested} bytes")]
    OutOfAddressSpace { requested: usize },

    /// The registry already holds `MAX_ARENAS` entries.
    #[error("out of arena slots: registry is at capacity ({capacity})")]
    OutOfArenaSlots { capacity: usize },

    /// Externally supplied memory was not aligned to `BLOCK_ALIGN`.
    #[error("misaligned external memory: base is not aligned to {required}")]
    MisalignedExternalMemory { required: usize },

    /// Externally supplied memory was smaller than one block.
    #[error("external memory too small: {given} bytes, need at least {minimum}")]
    TooSmallExternalMemory { given: usize, minimum: usize },

    /// Externally supplied memory exceeded the bitmap's representable
    /// block count.
    #[error("external memory too large: {blocks} blocks exceeds BITMAP_MAX_BITS ({max})")]
    TooLargeExternalMemory { blocks: usize, max: usize },

    /// `free` was called with an arena id that does not identify a live
    /// arena.
    #[error("invalid arena on free: arena id {0} is not live")]
    InvalidArenaOnFree(u32),

    /// `free` was called twice on the same block run.
    #[error("double free: block {block_index} in arena {arena_id} is already free")]
    DoubleFree { arena_id: u32, block_index: u32 },

    /// The OS failed to commit previously reserved address space.
    #[error("commit failed for {bytes} bytes: {source}")]
    CommitFailed { bytes: usize, source: OsError },
}

/// Failure reported by the OS abstraction layer ([`crate::os::OsMemory`]).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum OsError {
    #[error("mmap failed (errno {errno})")]
    MmapFailed { errno: i32 },

    #[error("mprotect failed (errno {errno})")]
    ProtectFailed { errno: i32 },

    #[error("madvise failed (errno {errno})")]
    AdviseFailed { errno: i32 },
}
