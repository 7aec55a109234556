//! Sizing constants for the arena subsystem.
//!
//! Values are chosen within the ranges the design allows rather than
//! measured; see `DESIGN.md` for the reasoning behind each one.

use static_assertions::const_assert;

/// Granularity of a single arena block.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Required alignment of a block run's base address.
pub const BLOCK_ALIGN: usize = BLOCK_SIZE;

/// Number of `u64` words backing a single `BitmapChunk`.
pub const WORDS_PER_CHUNK: usize = 8;

/// Bits per `BitmapChunk`, i.e. the longest run a single claim can span.
pub const BITS_PER_CHUNK: usize = WORDS_PER_CHUNK * 64;

/// Smallest allocation this subsystem serves; below this a caller
/// belongs in the small-object allocator instead.
pub const MIN_OBJ_SIZE: usize = BLOCK_SIZE / 2;

/// Largest allocation this subsystem serves. A claim cannot straddle a
/// chunk boundary, so this is exactly one chunk's worth of blocks.
pub const MAX_OBJ_SIZE: usize = BITS_PER_CHUNK * BLOCK_SIZE;

/// Hard cap on the number of arenas the registry can hold.
pub const MAX_ARENAS: usize = 1024;

/// Number of size-class bins tracked by `blocks_abandoned`.
pub const BIN_COUNT: usize = 74;

/// Hard cap on the number of blocks a single arena's bitmap can
/// represent.
pub const BITMAP_MAX_BITS: usize = 1 << 20;

/// Size of a single huge OS page, for `alloc_huge_os_pages` requests.
pub const HUGE_PAGE_SIZE: usize = 1 << 30;

const_assert!(BLOCK_SIZE.is_power_of_two());
const_assert!(HUGE_PAGE_SIZE.is_power_of_two());
const_assert!(MIN_OBJ_SIZE < MAX_OBJ_SIZE);
const_assert!(BITS_PER_CHUNK == 512);
