//! Runtime-tunable policy for the arena subsystem.
//!
//! Mirrors the handful of `mi_option_t` knobs `original_source/src/arena.c`
//! reads directly (reserve size, eager commit, purge delay/multiplier,
//! the two allocation-source kill switches). Threaded through the
//! engines by reference; this crate never reads global/process state.
/// Whether a freshly reserved arena's blocks are committed up front or
/// left for `AllocEngine` to commit lazily on first claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EagerCommit {
    /// Never commit ahead of a claim.
    Lazy,
    /// Always commit the whole arena at reservation time.
    Always,
    /// Commit eagerly only when the platform doesn't support
    /// overcommitting unbacked address space (where lazily committing
    /// gains nothing, since the OS would charge for it up front anyway).
    IfOvercommit,
}

impl EagerCommit {
    pub fn resolve(self, os: &dyn crate::os::OsMemory) -> bool {
        match self {
            EagerCommit::Lazy => false,
            EagerCommit::Always => true,
            EagerCommit::IfOvercommit => !os.has_overcommit(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArenaOptions {
    /// Default reservation size in bytes when growing via `ReserveEngine`.
    /// `0` lets the engine derive it from the growth formula alone.
    pub arena_reserve: usize,

    /// Commit new arenas' blocks eagerly at reservation time rather than
    /// lazily on first claim.
    pub arena_eager_commit: EagerCommit,

    /// Milliseconds a block run must sit idle before it becomes eligible
    /// for purge. `None` disables purging entirely.
    pub purge_delay_ms: Option<u64>,

    /// Multiplier applied to `purge_delay_ms` each time a purge is
    /// rescheduled without completing (back-off on contention).
    pub arena_purge_mult: u32,

    /// Disallow `AllocEngine` from claiming from existing arenas; forces
    /// every request through the OS path instead.
    pub disallow_arena_alloc: bool,

    /// Disallow `ReserveEngine` from reserving fresh OS memory; once the
    /// existing arenas are exhausted, allocation fails instead of growing.
    pub disallow_os_alloc: bool,

    /// Purge with a decommit (`madvise(DONTNEED)`-then-`mprotect(NONE)`)
    /// instead of a reset (`madvise(FREE)`), trading a future commit's
    /// page-fault cost for returning memory to the OS immediately.
    pub purge_decommits: bool,

    /// Destroy every arena (including exclusive ones still in use) when
    /// the owning `Arena` is dropped, rather than leaking them per the
    /// normal "arenas outlive their allocator" contract.
    pub destroy_on_exit: bool,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        ArenaOptions {
            arena_reserve: 0,
            arena_eager_commit: EagerCommit::IfOvercommit,
            purge_delay_ms: Some(10_000),
            arena_purge_mult: 2,
            disallow_arena_alloc: false,
            disallow_os_alloc: false,
            purge_decommits: true,
            destroy_on_exit: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::TestOs;

    #[test]
    fn eager_commit_resolves_against_the_os_overcommit_flag() {
        let mut os = TestOs::new();
        os.set_overcommit(true);
        assert!(!EagerCommit::Lazy.resolve(&os));
        assert!(EagerCommit::Always.resolve(&os));
        assert!(!EagerCommit::IfOvercommit.resolve(&os));

        os.set_overcommit(false);
        assert!(EagerCommit::IfOvercommit.resolve(&os));
    }
}
