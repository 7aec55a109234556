//! Scheduled decommit: `free` marks a run purge-eligible rather than
//! touching the OS immediately, and a later `collect` pass reclaims and
//! purges whatever has aged past its expiry.
//!
//! The collect pass follows the complete algorithm in
//! `original_source/src/arena.c`'s `#if 0` appendix (`mi_arena_try_purge`
//! / `mi_arenas_try_purge`), not the abridged primary source's
//! "purging not yet implemented" stubs: re-claim the purge-marked run
//! from `blocks_free` before touching the OS, shrinking the run on
//! conflict rather than giving up, so a concurrent allocator can never
//! observe decommitted memory as allocatable.

use std::ptr::NonNull;
use std::sync::atomic::Ordering::*;

use parking_lot::Mutex;

use crate::bitmap::Toggle;
use crate::constants::BLOCK_SIZE;
use crate::descriptor::ArenaDescriptor;
use crate::error::ArenaError;
use crate::memid::Memid;
use crate::options::ArenaOptions;
use crate::os::OsMemory;
use crate::registry::ArenaRegistry;
use crate::stats::Stats;

pub struct PurgeEngine {
    /// Serializes the collect pass across threads; a losing `try_lock`
    /// means another thread is already sweeping and this caller returns
    /// immediately rather than waiting.
    collect_lock: Mutex<()>,
}

impl PurgeEngine {
    pub fn new() -> Self {
        PurgeEngine {
            collect_lock: Mutex::new(()),
        }
    }

    /// Returns a run to its arena, scheduling (or performing) a purge.
    pub fn free(
        &self,
        registry: &ArenaRegistry,
        stats: &Stats,
        options: &ArenaOptions,
        os: &dyn OsMemory,
        size: usize,
        committed_size: usize,
        memid: Memid,
    ) -> Result<(), ArenaError> {
        let (arena_id, block_index, _) = memid
            .unpack()
            .ok_or(ArenaError::InvalidArenaOnFree(0))?;
        let arena = registry
            .get_by_id(arena_id)
            .ok_or(ArenaError::InvalidArenaOnFree(arena_id))?;

        let bcount = (size + BLOCK_SIZE - 1) / BLOCK_SIZE;
        if !arena.block_index_in_range(block_index) || block_index + bcount > arena.block_count {
            return Err(ArenaError::InvalidArenaOnFree(arena_id));
        }

        if committed_size < size {
            arena
                .blocks_committed
                .xset_range(Toggle::Clear, block_index, bcount);
            stats.sub_committed(committed_size as i64);
        }

        if !arena.is_pinned() {
            self.schedule_purge(arena, stats, options, os, block_index, bcount);
        }

        let (all_were_already_free, _) =
            arena.blocks_free.xset_range(Toggle::Set, block_index, bcount);
        if all_were_already_free {
            log::warn!(
                "double free: block {} in arena {} is already free",
                block_index,
                arena_id
            );
            return Err(ArenaError::DoubleFree {
                arena_id,
                block_index: block_index as u32,
            });
        }

        Ok(())
    }

    fn schedule_purge(
        &self,
        arena: &ArenaDescriptor,
        stats: &Stats,
        options: &ArenaOptions,
        os: &dyn OsMemory,
        start: usize,
        n: usize,
    ) {
        let delay_ms = match options.purge_delay_ms {
            None => return,
            Some(delay) => delay,
        };

        if delay_ms == 0 {
            perform_purge(arena, stats, options, os, start, n);
            return;
        }

        let now = os.now_ms();
        loop {
            let current = arena.purge_expire.load(Acquire);
            let next = if current == 0 {
                now + delay_ms as i64
            } else {
                current + (delay_ms / options.arena_purge_mult.max(1) as u64) as i64
            };
            if arena
                .purge_expire
                .compare_exchange(current, next, AcqRel, Relaxed)
                .is_ok()
            {
                break;
            }
        }

        arena.blocks_purge.xset_range(Toggle::Set, start, n);
    }

    /// Runs the collect pass over every registered arena. `force` makes
    /// every arena with a nonzero `purge_expire` eligible regardless of
    /// whether it has actually elapsed yet.
    pub fn collect(
        &self,
        registry: &ArenaRegistry,
        stats: &Stats,
        options: &ArenaOptions,
        os: &dyn OsMemory,
        force: bool,
    ) {
        let _guard = match self.collect_lock.try_lock() {
            Some(guard) => guard,
            None => return,
        };

        for arena in registry.iter() {
            collect_arena(arena, stats, options, os, force);
        }
    }
}

impl Default for PurgeEngine {
    fn default() -> Self {
        PurgeEngine::new()
    }
}

fn collect_arena(
    arena: &ArenaDescriptor,
    stats: &Stats,
    options: &ArenaOptions,
    os: &dyn OsMemory,
    force: bool,
) {
    let expire = arena.purge_expire.load(Acquire);
    if expire == 0 {
        return;
    }
    if !(force || expire <= os.now_ms()) {
        return;
    }
    if arena
        .purge_expire
        .compare_exchange(expire, 0, AcqRel, Relaxed)
        .is_err()
    {
        // Another thread already reset it (or rescheduled); let that
        // thread's view of the world stand.
        return;
    }

    let mut pos = arena.info_blocks;
    while let Some((run_start, run_len)) = next_purge_run(arena, pos) {
        reclaim_and_purge_run(arena, stats, options, os, run_start, run_len);
        pos = run_start + run_len;
    }
}

/// Finds the next contiguous run of `blocks_purge`-marked bits at or
/// after `from`, or `None` if none remain.
fn next_purge_run(arena: &ArenaDescriptor, from: usize) -> Option<(usize, usize)> {
    let total = arena.block_count;
    let mut i = from;
    while i < total && !arena.blocks_purge.is_range_set(i, 1) {
        i += 1;
    }
    if i >= total {
        return None;
    }
    let start = i;
    while i < total && arena.blocks_purge.is_range_set(i, 1) {
        i += 1;
    }
    Some((start, i - start))
}

/// Re-claims `[start, start+len)` from `blocks_free` one sub-run at a
/// time: on a conflict it shrinks the attempted sub-run from the end
/// rather than abandoning the whole thing, purges whatever prefix it
/// did manage to claim, then resumes scanning right after the
/// conflicting block so the remainder of the run is still visited.
/// Every block in `[start, start+len)` ends up either purged-and-free
/// or with its `blocks_purge` bit cleared, never left marked in
/// `blocks_purge` while no longer free.
fn reclaim_and_purge_run(
    arena: &ArenaDescriptor,
    stats: &Stats,
    options: &ArenaOptions,
    os: &dyn OsMemory,
    start: usize,
    len: usize,
) {
    let end = start + len;
    let mut pos = start;

    while pos < end {
        let mut run_len = end - pos;
        let mut claimed = false;

        while run_len > 0 {
            if arena.blocks_free.try_clear_exact_range(pos, run_len) {
                perform_purge(arena, stats, options, os, pos, run_len);
                arena.blocks_free.xset_range(Toggle::Set, pos, run_len);
                pos += run_len;
                claimed = true;
                break;
            }
            run_len -= 1;
        }

        if !claimed {
            // The block at `pos` was legitimately re-claimed by an
            // allocator before we reached it; nothing to purge there,
            // just drop its purge mark and move on to the rest of the run.
            arena.blocks_purge.xset_range(Toggle::Clear, pos, 1);
            pos += 1;
        }
    }
}

fn perform_purge(
    arena: &ArenaDescriptor,
    stats: &Stats,
    options: &ArenaOptions,
    os: &dyn OsMemory,
    start: usize,
    n: usize,
) {
    let ptr = arena.block_start(start);
    let base = unsafe { NonNull::new_unchecked(ptr) };
    let size = n * BLOCK_SIZE;

    let fully_committed = arena.blocks_committed.is_range_set(start, n);
    let needs_recommit = if fully_committed {
        os.purge_ex(base, size, !options.purge_decommits)
    } else {
        let needs = os.purge_ex(base, size, false);
        if needs {
            stats.add_committed(size as i64);
        }
        needs
    };

    arena.blocks_purge.xset_range(Toggle::Clear, start, n);

    if fully_committed && needs_recommit {
        arena.blocks_committed.xset_range(Toggle::Clear, start, n);
        stats.sub_committed(size as i64);
    }

    stats.note_purge(size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::TestOs;
    use crate::registry::ANY_ARENA;
    use crate::reserve_engine::ReserveEngine;
    use crate::constants::BLOCK_ALIGN;

    fn setup() -> (ArenaRegistry, Stats, ArenaOptions, TestOs) {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let options = ArenaOptions {
            purge_delay_ms: Some(0),
            ..ArenaOptions::default()
        };
        let os = TestOs::new();
        ReserveEngine::reserve(&registry, &stats, &options, &os, BLOCK_SIZE * 16, -1, false, false)
            .unwrap();
        (registry, stats, options, os)
    }

    #[test]
    fn free_then_immediate_purge_clears_committed_bit() {
        let (registry, stats, options, os) = setup();
        let arena = registry.get(0).unwrap();
        let block_index = arena.blocks_free.try_find_and_clear_n(0, 4).unwrap();
        arena
            .blocks_committed
            .xset_range(Toggle::Set, block_index, 4);

        let memid = Memid::create_arena(arena.id, false, block_index);
        let engine = PurgeEngine::new();
        engine
            .free(&registry, &stats, &options, &os, BLOCK_SIZE * 4, BLOCK_SIZE * 4, memid)
            .unwrap();

        assert!(arena.blocks_free.is_range_set(block_index, 4));
    }

    #[test]
    fn double_free_is_detected_and_does_not_corrupt_free_bitmap() {
        let _ = env_logger::try_init();
        let (registry, stats, options, os) = setup();
        let arena = registry.get(0).unwrap();
        let block_index = arena.blocks_free.try_find_and_clear_n(0, 4).unwrap();
        let memid = Memid::create_arena(arena.id, false, block_index);
        let engine = PurgeEngine::new();

        engine
            .free(&registry, &stats, &options, &os, BLOCK_SIZE * 4, BLOCK_SIZE * 4, memid)
            .unwrap();
        let result = engine.free(&registry, &stats, &options, &os, BLOCK_SIZE * 4, BLOCK_SIZE * 4, memid);
        assert!(matches!(result, Err(ArenaError::DoubleFree { .. })));
        assert!(arena.blocks_free.is_range_set(block_index, 4));
    }

    #[test]
    fn collect_reclaims_scheduled_purge_run_and_resets_expire() {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let options = ArenaOptions {
            purge_delay_ms: Some(1_000),
            ..ArenaOptions::default()
        };
        let os = TestOs::new();
        ReserveEngine::reserve(&registry, &stats, &options, &os, BLOCK_SIZE * 16, -1, false, false)
            .unwrap();
        let arena = registry.get(0).unwrap();
        let block_index = arena.blocks_free.try_find_and_clear_n(0, 4).unwrap();
        let memid = Memid::create_arena(arena.id, false, block_index);

        let engine = PurgeEngine::new();
        engine
            .free(&registry, &stats, &options, &os, BLOCK_SIZE * 4, BLOCK_SIZE * 4, memid)
            .unwrap();
        assert_ne!(arena.purge_expire.load(Acquire), 0);

        os.advance_clock(2_000);
        engine.collect(&registry, &stats, &options, &os, false);

        assert_eq!(arena.purge_expire.load(Acquire), 0);
        assert!(arena.blocks_purge.is_range_clear(block_index, 4));
        assert!(arena.blocks_free.is_range_set(block_index, 4));
    }

    #[test]
    fn reclaim_continues_past_a_conflict_instead_of_abandoning_the_rest() {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let options = ArenaOptions::default();
        let os = TestOs::new();
        ReserveEngine::reserve(&registry, &stats, &options, &os, BLOCK_SIZE * 16, -1, false, false)
            .unwrap();
        let arena = registry.get(0).unwrap();

        // Mark a 6-block run as purge-scheduled and free, as `free`
        // would after scheduling a purge.
        let start = arena.info_blocks;
        let len = 6;
        arena.blocks_free.xset_range(Toggle::Set, start, len);
        arena.blocks_purge.xset_range(Toggle::Set, start, len);

        // Simulate a concurrent allocator having legitimately claimed
        // the third block in the run (index start+2) in between the
        // free and the collect pass.
        arena.blocks_free.xset_range(Toggle::Clear, start + 2, 1);

        reclaim_and_purge_run(&arena, &stats, &options, &os, start, len);

        // The conflicting block stays in-use, but is no longer marked
        // for purge: nothing to purge there.
        assert!(arena.blocks_free.is_range_clear(start + 2, 1));
        assert!(arena.blocks_purge.is_range_clear(start + 2, 1));

        // Every other block in the run was purged and released, not
        // abandoned just because one block in the middle conflicted.
        assert!(arena.blocks_free.is_range_set(start, 2));
        assert!(arena.blocks_purge.is_range_clear(start, 2));
        assert!(arena.blocks_free.is_range_set(start + 3, len - 3));
        assert!(arena.blocks_purge.is_range_clear(start + 3, len - 3));
    }

    #[test]
    fn invalid_arena_id_on_free_is_rejected() {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let options = ArenaOptions::default();
        let os = TestOs::new();
        let engine = PurgeEngine::new();
        let memid = Memid::create_arena(ANY_ARENA + 1, false, 1);
        let result = engine.free(&registry, &stats, &options, &os, BLOCK_SIZE, BLOCK_SIZE, memid);
        assert!(matches!(result, Err(ArenaError::InvalidArenaOnFree(_))));
    }

    #[test]
    fn block_align_constant_matches_block_size() {
        assert_eq!(BLOCK_ALIGN, BLOCK_SIZE);
    }
}
