//! pagina: a concurrent page-granularity heap allocator.
//!
//! Tracks which 8 KiB pages of a large, lazily grown address range are free
//! and serves page runs with little cross-thread contention:
//! - a 512-page bitmap per chunk, summarized as packed `(start, max, end)` runs,
//! - a radix tree of summaries for first-fit search over the whole heap,
//! - per-core 64-page caches for lock-free small allocations,
//! - a paced background scavenger returning free pages to the OS.
//!
//! # Usage
//!
//! ```no_run
//! use pagina::{Config, Heap};
//!
//! let heap = Heap::new(Config::default())?;
//! let pages = heap.alloc_pages(4)?;
//! heap.free_pages(pages, 4);
//! # Ok::<(), pagina::Error>(())
//! ```

pub mod arena;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod heap;
mod page_alloc;
pub mod page_cache;
pub mod platform;
pub mod scavenger;
mod stats;
pub mod summary;
pub mod tree;

// =============================================================================
// Constants
// =============================================================================

/// Page size used by the allocator (8 KiB).
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Pages per chunk bitmap.
pub const LOG_CHUNK_PAGES: usize = 9;
pub const CHUNK_PAGES: usize = 1 << LOG_CHUNK_PAGES;
pub const CHUNK_BYTES: usize = CHUNK_PAGES * PAGE_SIZE; // 4MB

/// Unit of heap growth.
pub const ARENA_SIZE: usize = 64 << 20; // 64MB
pub const ARENA_PAGES: usize = ARENA_SIZE / PAGE_SIZE;
pub const CHUNKS_PER_ARENA: usize = ARENA_SIZE / CHUNK_BYTES;

/// Levels of the summary tree; the last level has one entry per chunk.
pub const SUMMARY_LEVELS: usize = 4;
/// Fan-out between adjacent levels is `1 << SUMMARY_LEVEL_BITS`.
pub const SUMMARY_LEVEL_BITS: usize = 3;
/// log2 of the pages covered by one root entry.
pub const LOG_MAX_PACKED: usize = LOG_CHUNK_PAGES + (SUMMARY_LEVELS - 1) * SUMMARY_LEVEL_BITS;

/// Pages held by one per-core cache window.
pub const CACHE_PAGES: usize = 64;
/// Requests above this many pages bypass the per-core cache.
pub const CACHE_THRESHOLD: usize = CACHE_PAGES / 4;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ARENA_SIZE.is_power_of_two());
const _: () = assert!(ARENA_SIZE % CHUNK_BYTES == 0);
const _: () = assert!(CHUNK_PAGES % 64 == 0);
const _: () = assert!(CHUNK_PAGES % CACHE_PAGES == 0);
const _: () = assert!(CACHE_PAGES == u64::BITS as usize);
const _: () = assert!(CHUNK_PAGES <= u16::MAX as usize);

pub use config::Config;
pub use error::{Error, Result};
pub use heap::Heap;
pub use page_cache::CacheHandle;
pub use platform::{MemoryProvider, OsMemory, SimMemory};
pub use scavenger::ScavengerHandle;
pub use stats::HeapStats;
pub use summary::Summary;

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
pub(crate) const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}
