//! The arena descriptor: block-count, placement attributes, and the
//! four primary bitmaps plus the per-bin abandoned-page bitmaps.
//!
//! The descriptor is meant to live at the start of its own backing
//! memory so that the reserved prefix blocks
//! guarantee it is never handed out as user memory. `ReserveEngine`
//! honors this literally: it `ptr::write`s an `ArenaDescriptor` into the
//! first bytes of the OS allocation it just made, and the registry holds
//! a raw pointer into that same memory rather than a separately
//! heap-allocated copy. The bitmaps' own backing storage (the `Vec`s
//! inside each `Bitmap`) are ordinary heap allocations, not carved out of
//! the arena's blocks — colocating those too would need a bump allocator
//! inside the descriptor itself, which buys nothing here.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering::*};

use parking_lot::Mutex;

use crate::bitmap::{Bitmap, Toggle};
use crate::constants::{BIN_COUNT, BLOCK_SIZE};
use crate::memid::Memid;
use crate::registry::ArenaId;

pub struct ArenaDescriptor {
    /// Provenance of this descriptor's own backing memory.
    pub memid: Memid,
    pub id: ArenaId,
    pub block_count: usize,
    /// Blocks `[0, info_blocks)` hold this descriptor and a guard page;
    /// they are permanently committed, permanently not-free, and never
    /// cleared in `blocks_dirty`.
    pub info_blocks: usize,
    pub numa_node: i32,
    pub exclusive: bool,
    pub is_large: bool,
    /// False for arenas adopted via `manage_os_memory`: their backing
    /// memory is owned by the caller, so `destroy_all` must not free it.
    pub owns_memory: bool,

    base: NonNull<u8>,
    size: usize,

    pub abandoned_visit_lock: Mutex<()>,
    pub purge_expire: AtomicI64,

    pub blocks_free: Bitmap,
    pub blocks_committed: Bitmap,
    pub blocks_purge: Bitmap,
    pub blocks_dirty: Bitmap,
    pub blocks_abandoned: Box<[Bitmap]>,
}

unsafe impl Send for ArenaDescriptor {}
unsafe impl Sync for ArenaDescriptor {}

impl ArenaDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ArenaId,
        memid: Memid,
        base: NonNull<u8>,
        size: usize,
        block_count: usize,
        info_blocks: usize,
        numa_node: i32,
        exclusive: bool,
        is_large: bool,
        owns_memory: bool,
    ) -> Self {
        debug_assert!(info_blocks < block_count);

        let initially_committed = memid.initially_committed || is_large;

        let blocks_free = Bitmap::new(block_count, true);
        blocks_free.xset_range(Toggle::Clear, 0, info_blocks);

        let blocks_committed = Bitmap::new(block_count, initially_committed);
        if !initially_committed {
            blocks_committed.xset_range(Toggle::Set, 0, info_blocks);
        }

        let blocks_purge = Bitmap::new(block_count, false);

        // Dirty tracks the zero guarantee, not commit status: freshly
        // committed memory can still be non-zero (e.g. adopted external
        // memory), while a lazily-committed range backed by demand-zero
        // OS pages is clean before anyone has touched it.
        let blocks_dirty = Bitmap::new(block_count, !memid.initially_zero);
        blocks_dirty.xset_range(Toggle::Clear, 0, info_blocks);

        let blocks_abandoned = (0..BIN_COUNT)
            .map(|_| Bitmap::new(block_count, false))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        ArenaDescriptor {
            memid,
            id,
            block_count,
            info_blocks,
            numa_node,
            exclusive,
            is_large,
            owns_memory,
            base,
            size,
            abandoned_visit_lock: Mutex::new(()),
            purge_expire: AtomicI64::new(0),
            blocks_free,
            blocks_committed,
            blocks_purge,
            blocks_dirty,
            blocks_abandoned,
        }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn block_start(&self, block_index: usize) -> *mut u8 {
        unsafe { self.base.as_ptr().add(block_index * BLOCK_SIZE) }
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let end = start + self.size;
        let p = ptr as usize;
        p >= start && p < end
    }

    /// Pinned memory can never be purged: huge/large pages that came in
    /// already committed, or memory explicitly marked pinned at adoption.
    pub fn is_pinned(&self) -> bool {
        self.memid.is_pinned || (self.is_large && self.memid.initially_committed)
    }

    pub fn block_index_in_range(&self, block_index: usize) -> bool {
        block_index >= self.info_blocks && block_index < self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(
        block_count: usize,
        info_blocks: usize,
        initially_committed: bool,
        initially_zero: bool,
    ) -> ArenaDescriptor {
        let base = NonNull::<u8>::dangling();
        let memid = Memid::os(initially_committed, initially_zero);
        ArenaDescriptor::new(
            1,
            memid,
            base,
            block_count * BLOCK_SIZE,
            block_count,
            info_blocks,
            -1,
            false,
            false,
            true,
        )
    }

    #[test]
    fn prefix_blocks_are_reserved() {
        let d = descriptor(16, 1, false, false);
        assert!(d.blocks_free.is_range_clear(0, 1));
        assert!(d.blocks_free.is_range_set(1, 15));
        assert!(d.blocks_committed.is_range_set(0, 1));
        assert!(d.blocks_dirty.is_range_clear(0, 1));
    }

    #[test]
    fn lazily_committed_arena_starts_dirty_outside_prefix() {
        let d = descriptor(16, 1, false, false);
        assert!(d.blocks_dirty.is_range_set(1, 15));
        assert!(d.blocks_committed.is_range_clear(1, 15));
    }

    #[test]
    fn eagerly_committed_arena_is_fully_committed_and_clean() {
        let d = descriptor(16, 1, true, true);
        assert!(d.blocks_committed.is_range_set(0, 16));
        assert!(d.blocks_dirty.is_range_clear(0, 16));
    }

    #[test]
    fn dirty_tracking_follows_the_zero_guarantee_not_commit_status() {
        // Committed but not guaranteed zero (e.g. adopted external
        // memory of unknown contents) must still read as dirty.
        let committed_not_zero = descriptor(16, 1, true, false);
        assert!(committed_not_zero.blocks_dirty.is_range_set(1, 15));

        // Lazily committed but backed by demand-zero pages must read
        // as clean, so the first claim reports `initially_zero = true`.
        let lazy_but_zero = descriptor(16, 1, false, true);
        assert!(lazy_but_zero.blocks_dirty.is_range_clear(1, 15));
    }

    #[test]
    fn large_pages_are_pinned() {
        let base = NonNull::<u8>::dangling();
        let memid = Memid::os(true, true);
        let d = ArenaDescriptor::new(1, memid, base, 16 * BLOCK_SIZE, 16, 1, -1, false, true, true);
        assert!(d.is_pinned());
    }
}
