//! Abstraction over the platform's virtual-memory primitives.
//!
//! The "expected interface with the OS abstraction layer" reified as a
//! trait, since that layer is explicitly out of scope for the arena
//! subsystem proper — everything above only needs
//! to call through it. `UnixMmap` backs it with real `mmap`/`mprotect`/
//! `madvise` via `libc`. `TestOs` fakes it with a plain heap allocation
//! per "reservation" plus a manually-advanceable clock, so the test
//! suite can exercise NUMA fallback, growth, and purge-delay scenarios
//! deterministically without mapping real address space.

use std::ptr::NonNull;

pub use crate::error::OsError;

/// What an OS reservation handed back, beyond the pointer itself.
#[derive(Debug, Clone, Copy)]
pub struct OsAlloc {
    pub ptr: NonNull<u8>,
    pub size: usize,
    /// The OS guarantees the range reads as zero.
    pub is_zero: bool,
    pub is_committed: bool,
}

/// The handful of syscalls (and queries) the arena subsystem needs from
/// the platform. Never object-aware: everything here operates on raw
/// `(pointer, size)` ranges.
pub trait OsMemory: Send + Sync {
    fn alloc_aligned(
        &self,
        size: usize,
        align: usize,
        commit: bool,
        allow_large: bool,
    ) -> Result<OsAlloc, OsError>;

    fn alloc_aligned_at_offset(
        &self,
        size: usize,
        align: usize,
        align_offset: usize,
        commit: bool,
        allow_large: bool,
    ) -> Result<OsAlloc, OsError>;

    fn free(&self, ptr: NonNull<u8>, size: usize);

    /// Commits `[ptr, ptr+size)`. Returns whether the OS guarantees the
    /// newly committed range reads as zero.
    fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<bool, OsError>;

    /// Purges with the platform's preferred strategy (reset if allowed,
    /// decommit otherwise). Returns whether the range needs a recommit
    /// before its next use.
    fn purge(&self, ptr: NonNull<u8>, size: usize) -> bool;

    /// Purges `[ptr, ptr+size)`; `allow_reset` controls whether a
    /// madvise-style reset is permitted (it isn't, for ranges that may
    /// be only partially committed) or whether this must decommit.
    fn purge_ex(&self, ptr: NonNull<u8>, size: usize, allow_reset: bool) -> bool;

    fn alloc_huge_os_pages(
        &self,
        pages: usize,
        numa_node: i32,
        timeout_ms: u64,
    ) -> Result<OsAlloc, OsError>;

    fn numa_node_count(&self) -> usize;

    /// The NUMA node the calling thread is currently running on, or
    /// `-1` if unknown/unsupported.
    fn numa_node(&self) -> i32;

    fn has_overcommit(&self) -> bool;
    fn has_virtual_reserve(&self) -> bool;
    fn page_size(&self) -> usize;

    /// Milliseconds on a monotonic clock, for purge-expiry bookkeeping.
    fn now_ms(&self) -> i64;
}

#[cfg(unix)]
mod unix_mmap {
    use super::*;

    /// Real virtual memory, backed by `mmap`/`mprotect`/`madvise`.
    pub struct UnixMmap;

    fn errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    impl UnixMmap {
        pub fn new() -> Self {
            UnixMmap
        }
    }

    impl Default for UnixMmap {
        fn default() -> Self {
            UnixMmap::new()
        }
    }

    impl OsMemory for UnixMmap {
        fn alloc_aligned(
            &self,
            size: usize,
            align: usize,
            commit: bool,
            allow_large: bool,
        ) -> Result<OsAlloc, OsError> {
            self.alloc_aligned_at_offset(size, align, 0, commit, allow_large)
        }

        fn alloc_aligned_at_offset(
            &self,
            size: usize,
            align: usize,
            align_offset: usize,
            commit: bool,
            _allow_large: bool,
        ) -> Result<OsAlloc, OsError> {
            // No native aligned-mmap, so over-map and trim the unused
            // head/tail once we know where the alignment actually lands.
            let extra = align.max(1) - 1;
            let map_size = size + extra;
            let prot = if commit {
                libc::PROT_READ | libc::PROT_WRITE
            } else {
                libc::PROT_NONE
            };

            let raw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    map_size,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(OsError::MmapFailed { errno: errno() });
            }

            let raw_addr = raw as usize;
            let aligned_addr = (raw_addr + align_offset + extra) / align * align - align_offset;

            if aligned_addr > raw_addr {
                unsafe { libc::munmap(raw, aligned_addr - raw_addr) };
            }
            let tail_start = aligned_addr + size;
            let map_end = raw_addr + map_size;
            if map_end > tail_start {
                unsafe {
                    libc::munmap(tail_start as *mut libc::c_void, map_end - tail_start);
                }
            }

            let ptr = NonNull::new(aligned_addr as *mut u8)
                .ok_or(OsError::MmapFailed { errno: 0 })?;
            Ok(OsAlloc {
                ptr,
                size,
                is_zero: true,
                is_committed: commit,
            })
        }

        fn free(&self, ptr: NonNull<u8>, size: usize) {
            unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
            }
        }

        fn commit(&self, ptr: NonNull<u8>, size: usize) -> Result<bool, OsError> {
            let res = unsafe {
                libc::mprotect(
                    ptr.as_ptr() as *mut libc::c_void,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if res != 0 {
                return Err(OsError::ProtectFailed { errno: errno() });
            }
            // Freshly committed anonymous pages fault in zeroed.
            Ok(true)
        }

        fn purge(&self, ptr: NonNull<u8>, size: usize) -> bool {
            self.purge_ex(ptr, size, true)
        }

        fn purge_ex(&self, ptr: NonNull<u8>, size: usize, allow_reset: bool) -> bool {
            unsafe {
                if allow_reset {
                    libc::madvise(ptr.as_ptr() as *mut libc::c_void, size, libc::MADV_DONTNEED);
                    // The mapping stays readable/writable; pages just
                    // re-zero-fault on next touch, so no recommit needed.
                    false
                } else {
                    libc::mprotect(ptr.as_ptr() as *mut libc::c_void, size, libc::PROT_NONE);
                    true
                }
            }
        }

        fn alloc_huge_os_pages(
            &self,
            pages: usize,
            _numa_node: i32,
            _timeout_ms: u64,
        ) -> Result<OsAlloc, OsError> {
            let size = pages * crate::constants::HUGE_PAGE_SIZE;
            #[cfg(target_os = "linux")]
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB;
            #[cfg(not(target_os = "linux"))]
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let raw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(OsError::MmapFailed { errno: errno() });
            }
            let ptr = NonNull::new(raw as *mut u8).ok_or(OsError::MmapFailed { errno: 0 })?;
            Ok(OsAlloc {
                ptr,
                size,
                is_zero: true,
                is_committed: true,
            })
        }

        fn numa_node_count(&self) -> usize {
            // Real NUMA topology discovery (libnuma or /sys/devices/system/node)
            // is a platform integration outside this subsystem's scope;
            // a single-node answer keeps NUMA-preference passes a no-op
            // rather than wrong.
            1
        }

        fn numa_node(&self) -> i32 {
            -1
        }

        fn has_overcommit(&self) -> bool {
            cfg!(target_os = "linux")
        }

        fn has_virtual_reserve(&self) -> bool {
            true
        }

        fn page_size(&self) -> usize {
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                sz as usize
            } else {
                4096
            }
        }

        fn now_ms(&self) -> i64 {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            unsafe {
                libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
            }
            ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
        }
    }
}

#[cfg(unix)]
pub use unix_mmap::UnixMmap;

mod test_os {
    use super::*;
    use std::alloc::Layout;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI32, AtomicI64, Ordering::Relaxed};
    use std::sync::Mutex;

    const EINVAL: i32 = 22;

    struct Region {
        layout: Layout,
        size: usize,
    }

    struct State {
        regions: HashMap<usize, Region>,
    }

    /// An in-memory stand-in for [`OsMemory`] used by the whole test
    /// suite: "reservations" are ordinary zeroed heap allocations,
    /// "commit" and "purge" only update bookkeeping (no real protection
    /// change), and the clock is advanced explicitly rather than by
    /// sleeping, so purge-delay tests run instantly and deterministically.
    pub struct TestOs {
        state: Mutex<State>,
        clock_ms: AtomicI64,
        numa_nodes: usize,
        current_numa: AtomicI32,
        overcommit: bool,
        virtual_reserve: bool,
        page_size: usize,
    }

    impl TestOs {
        pub fn new() -> Self {
            TestOs {
                state: Mutex::new(State {
                    regions: HashMap::new(),
                }),
                clock_ms: AtomicI64::new(0),
                numa_nodes: 1,
                current_numa: AtomicI32::new(-1),
                overcommit: true,
                virtual_reserve: true,
                page_size: 4096,
            }
        }

        pub fn with_numa_nodes(numa_nodes: usize) -> Self {
            TestOs {
                numa_nodes,
                ..TestOs::new()
            }
        }

        pub fn set_current_numa_node(&self, node: i32) {
            self.current_numa.store(node, Relaxed);
        }

        pub fn set_overcommit(&mut self, overcommit: bool) {
            self.overcommit = overcommit;
        }

        pub fn set_virtual_reserve(&mut self, virtual_reserve: bool) {
            self.virtual_reserve = virtual_reserve;
        }

        /// Advances the simulated monotonic clock, for exercising
        /// purge-delay expiry without a real sleep.
        pub fn advance_clock(&self, ms: i64) {
            self.clock_ms.fetch_add(ms, Relaxed);
        }

        pub fn live_region_count(&self) -> usize {
            self.state.lock().unwrap().regions.len()
        }
    }

    impl Default for TestOs {
        fn default() -> Self {
            TestOs::new()
        }
    }

    impl OsMemory for TestOs {
        fn alloc_aligned(
            &self,
            size: usize,
            align: usize,
            commit: bool,
            _allow_large: bool,
        ) -> Result<OsAlloc, OsError> {
            let align = align.max(1);
            let layout =
                Layout::from_size_align(size.max(1), align).map_err(|_| OsError::MmapFailed { errno: EINVAL })?;
            let raw = unsafe { std::alloc::alloc_zeroed(layout) };
            let ptr = NonNull::new(raw).ok_or(OsError::MmapFailed { errno: EINVAL })?;

            self.state
                .lock()
                .unwrap()
                .regions
                .insert(ptr.as_ptr() as usize, Region { layout, size });

            Ok(OsAlloc {
                ptr,
                size,
                is_zero: true,
                is_committed: commit,
            })
        }

        fn alloc_aligned_at_offset(
            &self,
            size: usize,
            align: usize,
            _align_offset: usize,
            commit: bool,
            allow_large: bool,
        ) -> Result<OsAlloc, OsError> {
            // The arena admission filter never requests align_offset > 0,
            // so a plain aligned allocation is an equivalent fake here.
            self.alloc_aligned(size, align, commit, allow_large)
        }

        fn free(&self, ptr: NonNull<u8>, _size: usize) {
            if let Some(region) = self
                .state
                .lock()
                .unwrap()
                .regions
                .remove(&(ptr.as_ptr() as usize))
            {
                unsafe { std::alloc::dealloc(ptr.as_ptr(), region.layout) };
            }
        }

        fn commit(&self, _ptr: NonNull<u8>, _size: usize) -> Result<bool, OsError> {
            // Memory is already zeroed heap storage; "committing" is a
            // bookkeeping no-op that always reports zeroed pages.
            Ok(true)
        }

        fn purge(&self, ptr: NonNull<u8>, size: usize) -> bool {
            self.purge_ex(ptr, size, true)
        }

        fn purge_ex(&self, ptr: NonNull<u8>, size: usize, allow_reset: bool) -> bool {
            let addr = ptr.as_ptr() as usize;
            let within_live_region = self
                .state
                .lock()
                .unwrap()
                .regions
                .iter()
                .any(|(&base, region)| addr >= base && addr + size <= base + region.size);

            if within_live_region {
                if allow_reset {
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
                    false
                } else {
                    true
                }
            } else {
                false
            }
        }

        fn alloc_huge_os_pages(
            &self,
            pages: usize,
            _numa_node: i32,
            _timeout_ms: u64,
        ) -> Result<OsAlloc, OsError> {
            if pages == 0 {
                return Ok(OsAlloc {
                    ptr: NonNull::dangling(),
                    size: 0,
                    is_zero: true,
                    is_committed: true,
                });
            }
            let size = pages * crate::constants::HUGE_PAGE_SIZE;
            self.alloc_aligned(size, crate::constants::HUGE_PAGE_SIZE, true, true)
        }

        fn numa_node_count(&self) -> usize {
            self.numa_nodes
        }

        fn numa_node(&self) -> i32 {
            self.current_numa.load(Relaxed)
        }

        fn has_overcommit(&self) -> bool {
            self.overcommit
        }

        fn has_virtual_reserve(&self) -> bool {
            self.virtual_reserve
        }

        fn page_size(&self) -> usize {
            self.page_size
        }

        fn now_ms(&self) -> i64 {
            self.clock_ms.load(Relaxed)
        }
    }
}

pub use test_os::TestOs;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_round_trips_alloc_and_free() {
        let os = TestOs::new();
        let alloc = os.alloc_aligned(4096 * 4, 4096, true, false).unwrap();
        assert!(alloc.is_zero);
        assert_eq!(os.live_region_count(), 1);
        os.free(alloc.ptr, alloc.size);
        assert_eq!(os.live_region_count(), 0);
    }

    #[test]
    fn test_os_clock_advances_manually() {
        let os = TestOs::new();
        assert_eq!(os.now_ms(), 0);
        os.advance_clock(5_000);
        assert_eq!(os.now_ms(), 5_000);
    }

    #[test]
    fn test_os_huge_pages_with_zero_count_is_a_no_op() {
        let os = TestOs::new();
        let alloc = os.alloc_huge_os_pages(0, -1, 0).unwrap();
        assert_eq!(alloc.size, 0);
        assert_eq!(os.live_region_count(), 0);
    }

    #[test]
    fn test_os_purge_with_reset_zeroes_memory() {
        let os = TestOs::new();
        let alloc = os.alloc_aligned(4096, 4096, true, false).unwrap();
        unsafe {
            std::ptr::write_bytes(alloc.ptr.as_ptr(), 0xAB, 4096);
        }
        let needs_recommit = os.purge(alloc.ptr, 4096);
        assert!(!needs_recommit);
        let byte = unsafe { *alloc.ptr.as_ptr() };
        assert_eq!(byte, 0);
    }
}
