//! The single public entry point: bundles the registry, the three
//! engines, options, and stats behind one type, the way `SharedArena`
//! is the one entry point callers touch in a thread-safe object pool.

use std::ptr::NonNull;
use std::sync::atomic::Ordering::Acquire;

use crate::alloc_engine::{AllocEngine, AllocRequest};
use crate::constants::BLOCK_SIZE;
use crate::error::ArenaError;
use crate::memid::Memid;
use crate::options::ArenaOptions;
use crate::os::OsMemory;
#[cfg(unix)]
use crate::os::UnixMmap;
use crate::purge_engine::PurgeEngine;
use crate::registry::{ArenaId, ArenaRegistry, ANY_ARENA};
use crate::reserve_engine::ReserveEngine;
use crate::stats::Stats;

/// The arena subsystem's public facade: one registry of live arenas,
/// the placement/growth/purge engines that operate on it, and the
/// options and OS abstraction they're threaded through.
pub struct Arena {
    registry: ArenaRegistry,
    stats: Stats,
    options: ArenaOptions,
    purge: PurgeEngine,
    os: Box<dyn OsMemory>,
}

impl Arena {
    /// Builds a facade backed by the real platform OS layer.
    #[cfg(unix)]
    pub fn new(options: ArenaOptions) -> Self {
        Arena::with_os(options, Box::new(UnixMmap::new()))
    }

    /// Builds a facade backed by a caller-supplied `OsMemory`
    /// implementation — real `UnixMmap` in production, `TestOs` in
    /// tests.
    pub fn with_os(options: ArenaOptions, os: Box<dyn OsMemory>) -> Self {
        Arena {
            registry: ArenaRegistry::new(),
            stats: Stats::new(),
            options,
            purge: PurgeEngine::new(),
            os,
        }
    }

    pub fn options(&self) -> &ArenaOptions {
        &self.options
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Core allocation entry point. Returns the pointer and its
    /// provenance, or `None` if no arena and no OS fallback could serve
    /// the request.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_aligned(
        &self,
        size: usize,
        alignment: usize,
        align_offset: usize,
        commit: bool,
        allow_large: bool,
        requested_arena: ArenaId,
        numa_node: i32,
    ) -> Option<(*mut u8, Memid)> {
        let req = AllocRequest {
            size,
            alignment,
            align_offset,
            commit,
            allow_large,
            requested_arena,
            numa_node,
        };
        AllocEngine::alloc_aligned(&self.registry, &self.stats, &self.options, self.os.as_ref(), &req)
    }

    /// Returns a run to its arena (or to the OS, for OS-provenance
    /// memory), scheduling a purge as appropriate.
    pub fn free(
        &self,
        ptr: *mut u8,
        size: usize,
        committed_size: usize,
        memid: Memid,
    ) -> Result<(), ArenaError> {
        if !memid.is_arena_provenance() {
            self.os.free(
                NonNull::new(ptr).expect("free called with a null pointer"),
                size,
            );
            if committed_size > 0 {
                self.stats.sub_committed(committed_size as i64);
            }
            return Ok(());
        }

        self.purge.free(
            &self.registry,
            &self.stats,
            &self.options,
            self.os.as_ref(),
            size,
            committed_size,
            memid,
        )
    }

    /// Runs the purge collect pass. `force` makes every arena with a
    /// scheduled purge eligible regardless of elapsed time.
    pub fn collect(&self, force: bool) {
        self.purge
            .collect(&self.registry, &self.stats, &self.options, self.os.as_ref(), force);
    }

    /// Reserves a fresh OS-backed arena outright, bypassing the growth
    /// heuristic `AllocEngine` uses internally.
    pub fn reserve_os_memory(
        &self,
        size: usize,
        allow_large: bool,
        exclusive: bool,
    ) -> Result<ArenaId, ArenaError> {
        let index = ReserveEngine::reserve(
            &self.registry,
            &self.stats,
            &self.options,
            self.os.as_ref(),
            size,
            -1,
            exclusive,
            allow_large,
        )?;
        Ok(self.registry.get(index).expect("just-published slot").id)
    }

    /// Adopts externally-provided memory as a new arena.
    #[allow(clippy::too_many_arguments)]
    pub fn manage_os_memory(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        is_committed: bool,
        is_large: bool,
        is_zero: bool,
        numa_node: i32,
        exclusive: bool,
    ) -> Result<ArenaId, ArenaError> {
        let index = ReserveEngine::manage_external(
            &self.registry,
            &self.stats,
            ptr,
            size,
            is_committed,
            is_large,
            is_zero,
            numa_node,
            exclusive,
        )?;
        Ok(self.registry.get(index).expect("just-published slot").id)
    }

    /// Reserves a huge-page arena pinned to `numa_node` (`-1` for
    /// unbound). `pages = 0` is a successful no-op: no arena is added.
    pub fn reserve_huge_os_pages_at(
        &self,
        pages: usize,
        numa_node: i32,
        timeout_ms: u64,
        exclusive: bool,
    ) -> Result<Option<ArenaId>, ArenaError> {
        if pages == 0 {
            return Ok(None);
        }
        let alloc = self
            .os
            .alloc_huge_os_pages(pages, numa_node, timeout_ms)
            .map_err(|_| ArenaError::OutOfAddressSpace {
                requested: pages * crate::constants::HUGE_PAGE_SIZE,
            })?;
        self.stats.add_committed(alloc.size as i64);
        let id = self.manage_os_memory(
            alloc.ptr,
            alloc.size,
            alloc.is_committed,
            true,
            alloc.is_zero,
            numa_node,
            exclusive,
        )?;
        Ok(Some(id))
    }

    /// Spreads a huge-page reservation evenly across the first
    /// `numa_count` NUMA nodes, with any remainder going to the
    /// lowest-numbered nodes.
    pub fn reserve_huge_os_pages_interleave(
        &self,
        pages: usize,
        numa_count: usize,
        timeout_ms: u64,
    ) -> Result<Vec<ArenaId>, ArenaError> {
        if pages == 0 || numa_count == 0 {
            return Ok(Vec::new());
        }
        let base = pages / numa_count;
        let remainder = pages % numa_count;
        let mut ids = Vec::new();
        for node in 0..numa_count {
            let node_pages = base + if node < remainder { 1 } else { 0 };
            if node_pages == 0 {
                continue;
            }
            if let Some(id) =
                self.reserve_huge_os_pages_at(node_pages, node as i32, timeout_ms, false)?
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Queries a live arena's extent. Returns `None` for an id that
    /// doesn't (or no longer) identifies a live arena.
    pub fn arena_area(&self, id: ArenaId) -> Option<(*mut u8, usize)> {
        let arena = self.registry.get_by_id(id)?;
        Some((arena.base().as_ptr(), arena.size()))
    }

    /// Pointer-to-arena membership test.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.registry.contains(ptr)
    }

    /// Unsafe teardown for library-unload: frees every arena this
    /// facade owns the backing memory for. Must not run concurrently
    /// with any other operation on this `Arena`.
    ///
    /// # Safety
    /// The caller must guarantee no other thread holds a pointer into
    /// any arena this facade manages, and that no concurrent call into
    /// this `Arena` is in flight.
    pub unsafe fn destroy_all(&self) {
        let drained = self.registry.drain_for_destroy();
        for descriptor_ptr in drained {
            let descriptor = &*descriptor_ptr;
            let owns_memory = descriptor.owns_memory;
            let base = descriptor.base();
            let size = descriptor.size();
            std::ptr::drop_in_place(descriptor_ptr);
            if owns_memory {
                self.os.free(base, size);
            }
        }
    }

    /// Human-readable dump of every arena's bitmap state, for tests and
    /// embedders to eyeball. Reads only atomics; no lock is taken beyond
    /// what the bitmaps themselves already use.
    pub fn debug_dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "arenas: {}", self.registry.len());
        for arena in self.registry.iter() {
            let free_blocks = count_set(&arena.blocks_free, arena.block_count);
            let committed_blocks = count_set(&arena.blocks_committed, arena.block_count);
            let purge_blocks = count_set(&arena.blocks_purge, arena.block_count);
            let _ = writeln!(
                out,
                "  arena {} (numa={}, exclusive={}, large={}): {} blocks, {} free, {} committed, {} purge-scheduled, expire={}",
                arena.id,
                arena.numa_node,
                arena.exclusive,
                arena.is_large,
                arena.block_count,
                free_blocks,
                committed_blocks,
                purge_blocks,
                arena.purge_expire.load(Acquire),
            );
        }
        let _ = writeln!(
            out,
            "committed_bytes={} purge_count={} purged_bytes={}",
            self.stats.committed_bytes(),
            self.stats.purge_count(),
            self.stats.purged_bytes(),
        );
        out
    }
}

fn count_set(bitmap: &crate::bitmap::Bitmap, block_count: usize) -> usize {
    (0..block_count).filter(|&i| bitmap.is_range_set(i, 1)).count()
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.options.destroy_on_exit {
            unsafe { self.destroy_all() };
        }
    }
}
