//! Lock-free arena subsystem for a general-purpose memory allocator.
//!
//! An [`Arena`] hands out large, block-granular memory runs to callers
//! above it (a per-thread heap, a segment allocator, or any large-object
//! consumer), backed either by arenas it grows on demand or by falling
//! through to the OS directly. See `DESIGN.md` for how each module maps
//! onto this crate's reference material.

mod alloc_engine;
mod arena;
mod bitmap;
mod bitmap_chunk;
mod cache_line;
mod constants;
mod descriptor;
mod error;
mod memid;
mod options;
pub mod os;
mod purge_engine;
mod registry;
mod reserve_engine;
mod stats;

pub use arena::Arena;
pub use error::{ArenaError, OsError};
pub use memid::{MemKind, Memid};
pub use options::{ArenaOptions, EagerCommit};
pub use registry::{ArenaId, ANY_ARENA};
pub use stats::Stats;
