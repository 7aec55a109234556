//! Grows the registry: computes the next arena's size from the current
//! arena count, reserves OS memory for it, writes the descriptor into
//! the reserved prefix, and publishes it.
//!
//! Growth formula and clamp values are ported directly from
//! `original_source/src/arena.c`'s `mi_arena_reserve`: exponential
//! doubling every 8 registered arenas, capped at 2^16x the base size,
//! halved (well, quartered) when the platform can't virtual-reserve
//! unbacked address space.

use std::ptr::NonNull;

use crate::constants::{BITMAP_MAX_BITS, BLOCK_ALIGN, BLOCK_SIZE};
use crate::descriptor::ArenaDescriptor;
use crate::error::ArenaError;
use crate::memid::Memid;
use crate::options::ArenaOptions;
use crate::os::OsMemory;
use crate::registry::ArenaRegistry;
use crate::stats::Stats;

/// Blocks reserved at the start of every arena for its own descriptor
/// plus a guard page. One block is always enough headroom: the
/// descriptor's fixed fields plus its boxed bitmap slices easily fit
/// inside 4 MiB, and the guard page falls inside the same block.
const INFO_BLOCKS: usize = 1;

pub struct ReserveEngine;

impl ReserveEngine {
    /// Computes the next growth size, reserves OS memory for it,
    /// initializes an `ArenaDescriptor` at its base, and publishes it.
    /// Returns the registry slot index of the new arena.
    pub fn grow(
        registry: &ArenaRegistry,
        stats: &Stats,
        options: &ArenaOptions,
        os: &dyn OsMemory,
        triggering_request: usize,
    ) -> Result<usize, ArenaError> {
        let arena_count = registry.len();
        let size = Self::next_size(options, os, arena_count, triggering_request)?;
        Self::reserve(registry, stats, options, os, size, -1, false, false)
    }

    /// Reserves OS memory and registers it as a new arena, unconditional
    /// on growth heuristics. Backs `Arena::reserve_os_memory`.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve(
        registry: &ArenaRegistry,
        stats: &Stats,
        options: &ArenaOptions,
        os: &dyn OsMemory,
        size: usize,
        numa_node: i32,
        exclusive: bool,
        allow_large: bool,
    ) -> Result<usize, ArenaError> {
        let eager_commit = options.arena_eager_commit.resolve(os);
        let alloc = os
            .alloc_aligned(size, BLOCK_ALIGN, eager_commit, allow_large)
            .map_err(|_| ArenaError::OutOfAddressSpace { requested: size })?;

        let (index, id) = match registry.reserve_slot() {
            Ok(slot) => slot,
            Err(err) => {
                os.free(alloc.ptr, alloc.size);
                return Err(err);
            }
        };

        if alloc.is_committed {
            stats.add_committed(alloc.size as i64);
        }

        // The descriptor is `ptr::write`-n into the reserved prefix
        // below; that memory must be actually OS-committed regardless
        // of `eager_commit`, or the write faults on a PROT_NONE mapping.
        if !alloc.is_committed {
            let prefix_size = INFO_BLOCKS * BLOCK_SIZE;
            if let Err(err) = os.commit(alloc.ptr, prefix_size) {
                os.free(alloc.ptr, alloc.size);
                return Err(ArenaError::CommitFailed {
                    bytes: prefix_size,
                    source: err,
                });
            }
            stats.add_committed(prefix_size as i64);
        }

        let block_count = alloc.size / BLOCK_SIZE;
        let memid = Memid::os(alloc.is_committed, alloc.is_zero);

        let descriptor = ArenaDescriptor::new(
            id,
            memid,
            alloc.ptr,
            alloc.size,
            block_count,
            INFO_BLOCKS,
            numa_node,
            exclusive,
            allow_large,
            true,
        );

        let descriptor_ptr = Self::write_descriptor(alloc.ptr, descriptor);
        registry.publish(index, descriptor_ptr);
        stats.note_arena_registered();

        Ok(index)
    }

    /// Adopts externally-provided memory as an arena, rejecting it with
    /// a typed, logged diagnostic if it cannot satisfy the descriptor's
    /// layout requirements.
    #[allow(clippy::too_many_arguments)]
    pub fn manage_external(
        registry: &ArenaRegistry,
        stats: &Stats,
        ptr: NonNull<u8>,
        size: usize,
        is_committed: bool,
        is_large: bool,
        is_zero: bool,
        numa_node: i32,
        exclusive: bool,
    ) -> Result<usize, ArenaError> {
        if (ptr.as_ptr() as usize) % BLOCK_ALIGN != 0 {
            log::warn!("manage_os_memory: base {:p} is not aligned to {}", ptr, BLOCK_ALIGN);
            return Err(ArenaError::MisalignedExternalMemory { required: BLOCK_ALIGN });
        }

        let minimum = (INFO_BLOCKS + 1) * BLOCK_SIZE;
        if size < minimum {
            log::warn!("manage_os_memory: {} bytes given, need at least {}", size, minimum);
            return Err(ArenaError::TooSmallExternalMemory {
                given: size,
                minimum,
            });
        }

        let block_count = size / BLOCK_SIZE;
        if block_count > BITMAP_MAX_BITS {
            log::warn!(
                "manage_os_memory: {} blocks exceeds BITMAP_MAX_BITS ({})",
                block_count,
                BITMAP_MAX_BITS
            );
            return Err(ArenaError::TooLargeExternalMemory {
                blocks: block_count,
                max: BITMAP_MAX_BITS,
            });
        }

        let (index, id) = registry.reserve_slot()?;

        if is_committed {
            stats.add_committed(size as i64);
        }
        let memid = Memid::os(is_committed, is_zero);

        let descriptor = ArenaDescriptor::new(
            id,
            memid,
            ptr,
            size,
            block_count,
            INFO_BLOCKS,
            numa_node,
            exclusive,
            is_large,
            false,
        );

        let descriptor_ptr = Self::write_descriptor(ptr, descriptor);
        registry.publish(index, descriptor_ptr);
        stats.note_arena_registered();

        Ok(index)
    }

    /// Places `descriptor` at the start of its own backing memory and
    /// returns a raw pointer into that same memory: the registry never
    /// owns a separately heap-allocated copy.
    fn write_descriptor(base: NonNull<u8>, descriptor: ArenaDescriptor) -> *mut ArenaDescriptor {
        let descriptor_ptr = base.as_ptr() as *mut ArenaDescriptor;
        unsafe {
            descriptor_ptr.write(descriptor);
        }
        descriptor_ptr
    }

    fn next_size(
        options: &ArenaOptions,
        os: &dyn OsMemory,
        arena_count: usize,
        triggering_request: usize,
    ) -> Result<usize, ArenaError> {
        let mut size = if options.arena_reserve > 0 {
            options.arena_reserve
        } else {
            triggering_request.max(BLOCK_SIZE * 8)
        };

        if !os.has_virtual_reserve() {
            size /= 4;
        }

        size = round_up(size, BLOCK_SIZE);

        if (8..=128).contains(&arena_count) {
            let shift = (arena_count / 8).min(16);
            size = size.saturating_mul(1usize << shift);
        }

        let min_reserve = (INFO_BLOCKS + 1) * BLOCK_SIZE;
        let max_reserve = BITMAP_MAX_BITS * BLOCK_SIZE;
        size = size.clamp(min_reserve, max_reserve);

        if size < triggering_request {
            return Err(ArenaError::OutOfAddressSpace {
                requested: triggering_request,
            });
        }

        Ok(size)
    }
}

fn round_up(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) / multiple * multiple
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::TestOs;

    #[test]
    fn reserve_publishes_a_descriptor_with_correct_block_count() {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let options = ArenaOptions::default();
        let os = TestOs::new();

        let index = ReserveEngine::reserve(
            &registry, &stats, &options, &os, BLOCK_SIZE * 16, -1, false, false,
        )
        .unwrap();

        let arena = registry.get(index).unwrap();
        assert_eq!(arena.block_count, 16);
        assert_eq!(stats.arena_count(), 1);
    }

    #[test]
    fn manage_external_rejects_misaligned_base() {
        let _ = env_logger::try_init();
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let layout = std::alloc::Layout::from_size_align(BLOCK_SIZE * 4 + 1, 1).unwrap();
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap();
        // Offsetting by one byte guarantees misalignment relative to BLOCK_ALIGN.
        let misaligned = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(1)) };

        let result = ReserveEngine::manage_external(
            &registry, &stats, misaligned, BLOCK_SIZE * 4, true, false, true, -1, false,
        );
        assert!(matches!(result, Err(ArenaError::MisalignedExternalMemory { .. })));

        unsafe { std::alloc::dealloc(raw, layout) };
    }

    #[test]
    fn manage_external_rejects_too_small_region() {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let os = TestOs::new();
        let alloc = os.alloc_aligned(BLOCK_SIZE, BLOCK_ALIGN, true, false).unwrap();

        let result = ReserveEngine::manage_external(
            &registry, &stats, alloc.ptr, BLOCK_SIZE, true, false, true, -1, false,
        );
        assert!(matches!(result, Err(ArenaError::TooSmallExternalMemory { .. })));

        os.free(alloc.ptr, alloc.size);
    }

    #[test]
    fn growth_scales_up_after_eight_arenas() {
        let options = ArenaOptions::default();
        let os = TestOs::new();
        let small = ReserveEngine::next_size(&options, &os, 0, BLOCK_SIZE).unwrap();
        let scaled = ReserveEngine::next_size(&options, &os, 8, BLOCK_SIZE).unwrap();
        assert!(scaled >= small * 2);
    }

    #[test]
    fn lazily_committed_reserve_still_commits_the_descriptor_prefix() {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        // Default options resolve to lazy commit when the OS reports
        // overcommit support, same as `TestOs::new()`'s defaults.
        let options = ArenaOptions::default();
        let os = TestOs::new();

        ReserveEngine::reserve(&registry, &stats, &options, &os, BLOCK_SIZE * 16, -1, false, false)
            .unwrap();

        // Even though the arena as a whole was reserved uncommitted, the
        // descriptor's own prefix block must have been committed so the
        // `ptr::write` that places the descriptor there is valid.
        assert!(stats.committed_bytes() as usize >= BLOCK_SIZE);
    }

    #[test]
    fn failed_slot_reservation_frees_the_os_allocation() {
        let registry = ArenaRegistry::new();
        let stats = Stats::new();
        let options = ArenaOptions::default();
        let os = TestOs::new();

        for _ in 0..registry.capacity() {
            registry.reserve_slot().unwrap();
        }

        let result = ReserveEngine::reserve(&registry, &stats, &options, &os, BLOCK_SIZE * 16, -1, false, false);
        assert!(matches!(result, Err(ArenaError::OutOfArenaSlots { .. })));
        assert_eq!(os.live_region_count(), 0);
    }
}
