//! The fixed-capacity, append-only table of live arenas.
//!
//! Mirrors `SharedArena`'s publication pattern (an atomic pointer array
//! plus an atomic count) generalized from "pages owned by one arena" to
//! "arenas owned by one process-wide registry". No deletion happens
//! during normal operation; [`ArenaRegistry::drain_for_destroy`] is the
//! one-shot exception used only for library-unload teardown.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering::*};

use crate::cache_line::CacheAligned;
use crate::constants::MAX_ARENAS;
use crate::descriptor::ArenaDescriptor;
use crate::error::ArenaError;

/// 1-based arena identifier; `0` means "any arena" / "no arena".
pub type ArenaId = u32;
pub const ANY_ARENA: ArenaId = 0;

pub struct ArenaRegistry {
    slots: Box<[AtomicPtr<ArenaDescriptor>]>,
    count: CacheAligned<AtomicUsize>,
}

impl ArenaRegistry {
    pub fn new() -> Self {
        let slots: Vec<AtomicPtr<ArenaDescriptor>> = (0..MAX_ARENAS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        ArenaRegistry {
            slots: slots.into_boxed_slice(),
            count: CacheAligned::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of published slots. Arenas in `[0, len())` are guaranteed
    /// non-null once `publish` has run; a reserved-but-not-yet-published
    /// slot is a narrow race window during `ReserveEngine::reserve`.
    pub fn len(&self) -> usize {
        self.count.load(Acquire)
    }

    pub fn get(&self, index: usize) -> Option<&ArenaDescriptor> {
        let ptr = self.slots.get(index)?.load(Acquire);
        unsafe { ptr.as_ref() }
    }

    pub fn get_by_id(&self, id: ArenaId) -> Option<&ArenaDescriptor> {
        let index = (id as usize).checked_sub(1)?;
        self.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArenaDescriptor> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Reserves the next slot for a new arena via an atomic
    /// compare-and-increment. Returns the slot index and the 1-based id
    /// the caller must publish into once the descriptor is initialized.
    /// On capacity exhaustion the increment is rolled back so a failed
    /// reserve never permanently burns a slot.
    pub fn reserve_slot(&self) -> Result<(usize, ArenaId), ArenaError> {
        let index = self.count.fetch_add(1, AcqRel);
        if index >= self.slots.len() {
            self.count.fetch_sub(1, AcqRel);
            return Err(ArenaError::OutOfArenaSlots {
                capacity: self.slots.len(),
            });
        }
        Ok((index, (index + 1) as ArenaId))
    }

    /// Publishes an initialized descriptor into a slot reserved by
    /// `reserve_slot`. Release-ordered so every acquire-load that
    /// follows observes a fully initialized `ArenaDescriptor`.
    pub fn publish(&self, index: usize, descriptor: *mut ArenaDescriptor) {
        self.slots[index].store(descriptor, Release);
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.iter().any(|arena| arena.contains(ptr))
    }

    /// One-shot teardown: snapshots every published slot, clears them,
    /// and resets the count to 0 (best-effort CAS). The caller — not
    /// this method — is responsible for dropping each descriptor and
    /// freeing its OS backing memory; this method only hands back the
    /// raw pointers so it never has to know about the OS layer.
    ///
    /// # Safety
    /// Must not run concurrently with any other registry operation.
    pub unsafe fn drain_for_destroy(&self) -> Vec<*mut ArenaDescriptor> {
        let n = self.count.load(Relaxed);
        let mut drained = Vec::with_capacity(n);
        for slot in self.slots[..n.min(self.slots.len())].iter() {
            let ptr = slot.swap(std::ptr::null_mut(), AcqRel);
            if !ptr.is_null() {
                drained.push(ptr);
            }
        }
        let _ = self
            .count
            .compare_exchange(n, 0, AcqRel, Relaxed);
        drained
    }
}

impl Default for ArenaRegistry {
    fn default() -> Self {
        ArenaRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_slot_is_monotonic_and_one_based() {
        let registry = ArenaRegistry::new();
        let (idx0, id0) = registry.reserve_slot().unwrap();
        let (idx1, id1) = registry.reserve_slot().unwrap();
        assert_eq!((idx0, id0), (0, 1));
        assert_eq!((idx1, id1), (1, 2));
    }

    #[test]
    fn reserve_past_capacity_rolls_back_the_increment() {
        let registry = ArenaRegistry::new();
        for _ in 0..registry.capacity() {
            registry.reserve_slot().unwrap();
        }
        assert!(registry.reserve_slot().is_err());
        // The failed attempt must not have permanently bumped the count
        // past capacity; a further failure should behave identically.
        assert!(registry.reserve_slot().is_err());
    }
}
