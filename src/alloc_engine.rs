//! The placement loop: turn a `(size, alignment, ...)` request into a
//! claimed block run, falling back to the OS when no arena can serve it.
//!
//! Mirrors `SharedArena::find_place`'s shape — scan, try to claim, retry
//! — but the "pages" being scanned are whole arenas in the registry
//! rather than pages inside one arena, and there is no writer-guard
//! slow path: growing the registry is `ReserveEngine`'s job, invoked
//! directly rather than behind a non-blocking-then-blocking handoff.

use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use crate::bitmap::Toggle;
use crate::constants::{BLOCK_ALIGN, BLOCK_SIZE, MAX_OBJ_SIZE, MIN_OBJ_SIZE};
use crate::descriptor::ArenaDescriptor;
use crate::memid::Memid;
use crate::options::ArenaOptions;
use crate::os::OsMemory;
use crate::registry::{ArenaId, ArenaRegistry, ANY_ARENA};
use crate::reserve_engine::ReserveEngine;
use crate::stats::Stats;

thread_local! {
    static THREAD_SEQ: usize = next_thread_seq();
}

static THREAD_SEQ_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_thread_seq() -> usize {
    THREAD_SEQ_COUNTER.fetch_add(1, Relaxed)
}

/// This thread's sequence number, assigned once on first use and cached
/// for the life of the thread. Spreads concurrent claims across
/// different starting chunks instead of funneling everyone through
/// chunk 0.
fn thread_seq() -> usize {
    THREAD_SEQ.with(|seq| *seq)
}

pub struct AllocRequest {
    pub size: usize,
    pub alignment: usize,
    pub align_offset: usize,
    pub commit: bool,
    pub allow_large: bool,
    pub requested_arena: ArenaId,
    pub numa_node: i32,
}

pub struct AllocEngine;

impl AllocEngine {
    /// Core allocation entry. Admits the request to the arena path when
    /// it fits arena-shaped allocation, otherwise (or on total arena
    /// failure) delegates to the OS layer directly.
    pub fn alloc_aligned(
        registry: &ArenaRegistry,
        stats: &Stats,
        options: &ArenaOptions,
        os: &dyn OsMemory,
        req: &AllocRequest,
    ) -> Option<(*mut u8, Memid)> {
        if Self::admits_arena_path(options, req) {
            if let Some(result) = Self::try_arena_path(registry, stats, options, os, req) {
                return Some(result);
            }
        }

        if options.disallow_os_alloc {
            return None;
        }
        Self::fall_back_to_os(stats, os, req)
    }

    fn admits_arena_path(options: &ArenaOptions, req: &AllocRequest) -> bool {
        if options.disallow_arena_alloc && req.requested_arena == ANY_ARENA {
            return false;
        }
        if req.size < MIN_OBJ_SIZE || req.size > MAX_OBJ_SIZE {
            return false;
        }
        if req.alignment > BLOCK_ALIGN || req.align_offset != 0 {
            return false;
        }
        true
    }

    fn try_arena_path(
        registry: &ArenaRegistry,
        stats: &Stats,
        options: &ArenaOptions,
        os: &dyn OsMemory,
        req: &AllocRequest,
    ) -> Option<(*mut u8, Memid)> {
        let bcount = (req.size + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let tseq = thread_seq();

        if req.requested_arena != ANY_ARENA {
            let arena = registry.get_by_id(req.requested_arena)?;
            return Self::claim_in(arena, stats, os, tseq, bcount, req);
        }

        if let Some(result) = Self::two_pass(registry, stats, os, tseq, bcount, req) {
            return Some(result);
        }

        if options.disallow_os_alloc {
            return None;
        }

        let grown = ReserveEngine::grow(registry, stats, options, os, bcount * BLOCK_SIZE).ok()?;
        let arena = registry.get(grown)?;
        if Self::arena_is_eligible(arena, req) {
            Self::claim_in(arena, stats, os, tseq, bcount, req)
        } else {
            None
        }
    }

    /// Pass A considers NUMA-unbound or matching arenas; pass B (only
    /// when the caller's node is known) considers the rest.
    fn two_pass(
        registry: &ArenaRegistry,
        stats: &Stats,
        os: &dyn OsMemory,
        tseq: usize,
        bcount: usize,
        req: &AllocRequest,
    ) -> Option<(*mut u8, Memid)> {
        for arena in registry.iter() {
            if Self::arena_is_eligible(arena, req)
                && (arena.numa_node < 0 || arena.numa_node == req.numa_node)
            {
                if let Some(result) = Self::claim_in(arena, stats, os, tseq, bcount, req) {
                    return Some(result);
                }
            }
        }

        if req.numa_node < 0 {
            return None;
        }
        for arena in registry.iter() {
            if Self::arena_is_eligible(arena, req)
                && arena.numa_node >= 0
                && arena.numa_node != req.numa_node
            {
                if let Some(result) = Self::claim_in(arena, stats, os, tseq, bcount, req) {
                    return Some(result);
                }
            }
        }
        None
    }

    fn arena_is_eligible(arena: &ArenaDescriptor, req: &AllocRequest) -> bool {
        if arena.is_large && !req.allow_large {
            return false;
        }
        (req.requested_arena == ANY_ARENA && !arena.exclusive) || req.requested_arena == arena.id
    }

    fn claim_in(
        arena: &ArenaDescriptor,
        stats: &Stats,
        os: &dyn OsMemory,
        tseq: usize,
        bcount: usize,
        req: &AllocRequest,
    ) -> Option<(*mut u8, Memid)> {
        let block_index = arena.blocks_free.try_find_and_clear_n(tseq, bcount)?;

        let ptr = arena.block_start(block_index);

        let (_, all_were_clear) = arena.blocks_dirty.xset_range(Toggle::Set, block_index, bcount);
        let initially_zero = all_were_clear;

        let mut memid = Memid::create_arena(arena.id, arena.exclusive, block_index);
        memid.is_pinned = arena.is_pinned();
        memid.initially_zero = initially_zero;

        if req.commit {
            let (all_already_committed, _) =
                arena.blocks_committed.xset_range(Toggle::Set, block_index, bcount);
            if !all_already_committed {
                let base = unsafe { std::ptr::NonNull::new_unchecked(ptr) };
                match os.commit(base, bcount * BLOCK_SIZE) {
                    Ok(zeroed) => {
                        stats.add_committed((bcount * BLOCK_SIZE) as i64);
                        memid.initially_committed = true;
                        if zeroed {
                            memid.initially_zero = true;
                        }
                    }
                    Err(_) => {
                        memid.initially_committed = false;
                    }
                }
            } else {
                memid.initially_committed = true;
            }
        } else {
            memid.initially_committed = arena.blocks_committed.is_range_set(block_index, bcount);
        }

        Some((ptr, memid))
    }

    fn fall_back_to_os(
        stats: &Stats,
        os: &dyn OsMemory,
        req: &AllocRequest,
    ) -> Option<(*mut u8, Memid)> {
        let alloc = os
            .alloc_aligned_at_offset(
                req.size,
                req.alignment.max(1),
                req.align_offset,
                req.commit,
                req.allow_large,
            )
            .ok()?;
        if alloc.is_committed {
            stats.add_committed(req.size as i64);
        }
        let memid = Memid::os(alloc.is_committed, alloc.is_zero);
        Some((alloc.ptr.as_ptr(), memid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::TestOs;

    fn default_request(size: usize) -> AllocRequest {
        AllocRequest {
            size,
            alignment: BLOCK_ALIGN,
            align_offset: 0,
            commit: true,
            allow_large: false,
            requested_arena: ANY_ARENA,
            numa_node: -1,
        }
    }

    #[test]
    fn rejects_undersized_request_to_arena_path() {
        let options = ArenaOptions::default();
        let req = default_request(MIN_OBJ_SIZE - 1);
        assert!(!AllocEngine::admits_arena_path(&options, &req));
    }

    #[test]
    fn rejects_oversized_alignment() {
        let options = ArenaOptions::default();
        let mut req = default_request(MIN_OBJ_SIZE);
        req.alignment = BLOCK_ALIGN * 2;
        assert!(!AllocEngine::admits_arena_path(&options, &req));
    }

    #[test]
    fn basic_claim_then_os_fallback_for_oversized_request() {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let options = ArenaOptions::default();
        let os = TestOs::new();

        let req = default_request(MAX_OBJ_SIZE + BLOCK_SIZE);
        let (ptr, memid) = AllocEngine::alloc_aligned(&registry, &stats, &options, &os, &req).unwrap();
        assert!(!ptr.is_null());
        assert!(!memid.is_arena_provenance());
    }
}
