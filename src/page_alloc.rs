//! The lock-protected page allocator state.
//!
//! `PageAlloc` owns the summary tree, the arena directory and the search hint.
//! Every method expects to run under the heap lock; it publishes the counters
//! and scavenge index that other threads read without the lock.
//!
//! Pages are identified by their index from the start of the reservation.
//! The search hint `search` satisfies: no page below `search` is free. It is
//! raised by allocations to the first free page the search observed and
//! lowered by every free.

use crate::arena::ArenaDirectory;
use crate::page_cache::PageCache;
use crate::scavenger::ScavengeIndex;
use crate::stats::Stats;
use crate::summary::Summary;
use crate::tree::{LEVEL_LOG_PAGES, SummaryTree};
use crate::{
  ARENA_PAGES, CACHE_PAGES, CHUNK_PAGES, CHUNKS_PER_ARENA, SUMMARY_LEVEL_BITS, SUMMARY_LEVELS,
  align_down,
};
use std::sync::Arc;

/// Written under the heap lock, read without it.
pub(crate) struct Published {
  pub stats: Stats,
  pub index: ScavengeIndex,
}

impl Published {
  pub fn new(max_chunks: usize) -> Self {
    Self {
      stats: Stats::default(),
      index: ScavengeIndex::new(max_chunks),
    }
  }
}

/// Narrowing window around the lowest free page a search has seen.
struct FirstFree {
  base: usize,
  bound: usize,
}

impl FirstFree {
  /// Records that `[page, page + npages)` contains a free page.
  fn found(&mut self, page: usize, npages: usize) {
    let last = page + npages - 1;
    if self.base <= page && last <= self.bound {
      self.base = page;
      self.bound = last;
    } else if !(last < self.base || self.bound < page) {
      panic!(
        "bad summary data: free range [{page}, {last}] overlaps search window [{}, {}]",
        self.base, self.bound
      );
    }
  }
}

pub(crate) struct PageAlloc {
  tree: SummaryTree,
  chunks: ArenaDirectory,
  /// No page below this index is free.
  search: usize,
  /// Chunks `[0, end)` have been looked at by growth.
  end: usize,
  published: Arc<Published>,
}

impl PageAlloc {
  pub fn new(max_arenas: usize, published: Arc<Published>) -> Self {
    Self {
      tree: SummaryTree::new(),
      chunks: ArenaDirectory::new(max_arenas),
      search: 0,
      end: 0,
      published,
    }
  }

  #[cfg(test)]
  pub fn search(&self) -> usize {
    self.search
  }

  #[cfg(test)]
  pub fn tree(&self) -> &SummaryTree {
    &self.tree
  }

  #[cfg(test)]
  pub fn chunk(&self, ci: usize) -> &crate::bitmap::ChunkBitmap {
    self.chunks.chunk(ci)
  }

  pub fn mapped_arenas(&self) -> usize {
    self.chunks.mapped()
  }

  pub fn max_arenas(&self) -> usize {
    self.chunks.capacity()
  }

  /// Pages `[0, limit)` may belong to the heap.
  pub fn page_limit(&self) -> usize {
    self.end * CHUNK_PAGES
  }

  // ===========================================================================
  // Growth
  // ===========================================================================

  /// Adds `arena` to the heap. The caller has already committed its memory;
  /// its pages start free and scavenged.
  pub fn grow(&mut self, arena: usize) {
    self.chunks.insert(arena);
    let first = arena * CHUNKS_PER_ARENA;
    self.end = self.end.max(first + CHUNKS_PER_ARENA);
    self.tree.grow(self.end);

    let page = first * CHUNK_PAGES;
    self.published.stats.returned(ARENA_PAGES, ARENA_PAGES);
    self.update(page, ARENA_PAGES, false);
    if page < self.search {
      self.search = page;
    }
  }

  // ===========================================================================
  // Search
  // ===========================================================================

  /// First-fit search over the tree for `npages` contiguous free pages at or
  /// above the hint. Returns the run and the lowest page that may be free.
  pub fn find(&self, npages: usize) -> Option<(usize, usize)> {
    let mut first_free = FirstFree {
      base: 0,
      bound: usize::MAX,
    };
    let mut i = 0;

    'levels: for l in 0..SUMMARY_LEVELS {
      let log_pages = LEVEL_LOG_PAGES[l];
      let level = self.tree.level(l);
      let entries = if l == 0 {
        level
      } else {
        i <<= SUMMARY_LEVEL_BITS;
        &level[i..i + (1 << SUMMARY_LEVEL_BITS)]
      };

      let hint = self.search >> log_pages;
      let j0 = if l == 0 {
        hint
      } else if hint & !((1 << SUMMARY_LEVEL_BITS) - 1) == i {
        hint & ((1 << SUMMARY_LEVEL_BITS) - 1)
      } else {
        0
      };

      // A run crossing entries: `size` free pages starting at `base` pages
      // into this block.
      let (mut base, mut size) = (0, 0);
      for (j, &sum) in entries.iter().enumerate().skip(j0) {
        if sum.is_occupied() {
          size = 0;
          continue;
        }
        first_free.found((i + j) << log_pages, 1 << log_pages);

        let start = sum.start();
        if size + start >= npages {
          if size == 0 {
            base = j << log_pages;
          }
          size += start;
          break;
        }
        if sum.max() >= npages {
          i += j;
          continue 'levels;
        }
        if size == 0 || start < 1 << log_pages {
          size = sum.end();
          base = ((j + 1) << log_pages) - size;
          continue;
        }
        size += 1 << log_pages;
      }

      if size >= npages {
        return Some(((i << log_pages) + base, first_free.base));
      }
      if l == 0 {
        return None;
      }
      panic!("bad summary data: level {l} entry {i} promised {npages} free pages");
    }

    let ci = i;
    let Some((j, first)) = self.chunks.chunk(ci).find(npages, 0) else {
      panic!("bad summary data: chunk {ci} has no run of {npages} pages");
    };
    let chunk_base = ci * CHUNK_PAGES;
    first_free.found(chunk_base + first, CHUNK_PAGES - first);
    Some((chunk_base + j, first_free.base))
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates `npages` contiguous pages, lowest address first. Returns the
  /// first page and how many of the pages were scavenged. `None` means the
  /// heap must grow.
  pub fn alloc(&mut self, npages: usize) -> Option<(usize, usize)> {
    assert!(npages > 0, "alloc: zero pages requested");
    if self.search / CHUNK_PAGES >= self.end {
      return None;
    }

    let ci = self.search / CHUNK_PAGES;
    let pi = self.search % CHUNK_PAGES;
    let (page, first_free) = if CHUNK_PAGES - pi >= npages && self.tree.leaf(ci).max() >= npages {
      // The hint's chunk can serve it: skip the tree walk.
      let Some((j, first)) = self.chunks.chunk(ci).find(npages, pi) else {
        panic!("bad summary data: chunk {ci} has no run of {npages} pages");
      };
      (ci * CHUNK_PAGES + j, ci * CHUNK_PAGES + first)
    } else {
      match self.find(npages) {
        Some(found) => found,
        None => {
          if npages == 1 {
            self.search = usize::MAX;
          }
          return None;
        }
      }
    };

    let scav = self.alloc_range(page, npages);
    if self.search < first_free {
      self.search = first_free;
    }
    Some((page, scav))
  }

  /// Marks `[page, page + npages)` in use and returns how many of those
  /// pages were scavenged.
  fn alloc_range(&mut self, page: usize, npages: usize) -> usize {
    let scav = self.claim_range(page, npages);
    self.published.stats.taken(npages, scav);
    scav
  }

  /// [`alloc_range`](Self::alloc_range) without the free-page accounting.
  fn claim_range(&mut self, page: usize, npages: usize) -> usize {
    let mut scav = 0;
    for (ci, i, n) in chunk_spans(page, npages) {
      scav += self.chunks.chunk_mut(ci).alloc_range(i, n);
    }
    self.update(page, npages, true);
    self.refresh_index(page, npages);
    scav
  }

  /// Returns `[page, page + npages)` to the heap.
  pub fn free(&mut self, page: usize, npages: usize) {
    self.free_range(page, npages);
    self.published.index.note_free((page + npages - 1) / CHUNK_PAGES);
  }

  fn free_range(&mut self, page: usize, npages: usize) {
    self.unclaim_range(page, npages);
    self.published.stats.returned(npages, 0);
  }

  fn unclaim_range(&mut self, page: usize, npages: usize) {
    assert!(npages > 0, "free: zero pages");
    assert!(
      page + npages <= self.page_limit(),
      "free: pages [{page}, {}) are outside the heap",
      page + npages
    );
    if page < self.search {
      self.search = page;
    }
    for (ci, i, n) in chunk_spans(page, npages) {
      self.chunks.chunk_mut(ci).free_range(i, n);
    }
    self.update(page, npages, false);
    self.refresh_index(page, npages);
  }

  /// Brings leaf summaries of the chunks under `[page, page + npages)` and
  /// their ancestors up to date. `alloc` tells which way whole interior
  /// chunks flipped, so they need no rescan.
  fn update(&mut self, page: usize, npages: usize, alloc: bool) {
    let sc = page / CHUNK_PAGES;
    let ec = (page + npages - 1) / CHUNK_PAGES;
    if sc == ec {
      let sum = self.chunks.chunk(sc).summarize();
      if self.tree.leaf(sc) == sum {
        return;
      }
      self.tree.set_leaf(sc, sum);
    } else {
      self.tree.set_leaf(sc, self.chunks.chunk(sc).summarize());
      let whole = if alloc {
        Summary::OCCUPIED
      } else {
        Summary::FREE_CHUNK
      };
      for ci in sc + 1..ec {
        self.tree.set_leaf(ci, whole);
      }
      self.tree.set_leaf(ec, self.chunks.chunk(ec).summarize());
    }
    self.tree.propagate(sc, ec);
  }

  fn refresh_index(&self, page: usize, npages: usize) {
    let sc = page / CHUNK_PAGES;
    let ec = (page + npages - 1) / CHUNK_PAGES;
    for ci in sc..=ec {
      let pages = self.chunks.chunk(ci).scavengable_pages();
      self.published.index.set(ci, pages);
    }
  }

  // ===========================================================================
  // Per-core caches
  // ===========================================================================

  /// Hands every free page of the lowest 64-page block holding a free page
  /// to a cache. The pages are marked in use until the cache is flushed.
  pub fn alloc_to_cache(&mut self) -> PageCache {
    if self.search / CHUNK_PAGES >= self.end {
      return PageCache::EMPTY;
    }

    let ci = self.search / CHUNK_PAGES;
    let page = if !self.tree.leaf(ci).is_occupied() {
      let Some((j, _)) = self.chunks.chunk(ci).find(1, self.search % CHUNK_PAGES) else {
        panic!("bad summary data: chunk {ci} has no free page");
      };
      ci * CHUNK_PAGES + j
    } else {
      match self.find(1) {
        Some((page, _)) => page,
        None => {
          self.search = usize::MAX;
          return PageCache::EMPTY;
        }
      }
    };

    let base = align_down(page, CACHE_PAGES);
    let ci = base / CHUNK_PAGES;
    let (free, scav) = self.chunks.chunk_mut(ci).take_block(base % CHUNK_PAGES);
    self.update(base, CACHE_PAGES, true);
    self
      .published
      .stats
      .taken(free.count_ones() as usize, scav.count_ones() as usize);
    self.refresh_index(base, CACHE_PAGES);
    self.search = base + CACHE_PAGES;
    PageCache::new(base, free, scav)
  }

  /// Returns a cache's remaining pages and empties it.
  pub fn flush_cache(&mut self, cache: &mut PageCache) {
    if cache.is_empty() {
      return;
    }
    let (base, free, scav) = cache.parts();
    let ci = base / CHUNK_PAGES;
    self.chunks.chunk_mut(ci).return_block(base % CHUNK_PAGES, free, scav);
    if base < self.search {
      self.search = base;
    }
    self.update(base, CACHE_PAGES, false);
    self
      .published
      .stats
      .returned(free.count_ones() as usize, scav.count_ones() as usize);
    self.refresh_index(base, CACHE_PAGES);
    self.published.index.note_free(ci);
    *cache = PageCache::EMPTY;
  }

  // ===========================================================================
  // Scavenging
  // ===========================================================================

  /// Re-checks chunk `ci` for free, resident pages and claims the highest
  /// run of at most `max_pages` of them so nothing allocates it while its
  /// memory is being released.
  pub fn reserve_scavenge(&mut self, ci: usize, max_pages: usize) -> Option<(usize, usize)> {
    if !self.chunks.contains_chunk(ci) {
      return None;
    }
    let candidate = if self.tree.leaf(ci).is_occupied() {
      None
    } else {
      self
        .chunks
        .chunk(ci)
        .find_scavenge_candidate(CHUNK_PAGES - 1, max_pages)
    };
    let Some((i, npages)) = candidate else {
      self.published.index.set(ci, 0);
      return None;
    };

    let page = ci * CHUNK_PAGES + i;
    // Still counted as free: the claim only fences off concurrent allocation.
    let scav = self.claim_range(page, npages);
    debug_assert_eq!(scav, 0, "scavenge candidate contained scavenged pages");
    Some((page, npages))
  }

  /// Frees a run claimed by [`reserve_scavenge`](Self::reserve_scavenge),
  /// marking it scavenged if its memory was released.
  pub fn complete_scavenge(&mut self, page: usize, npages: usize, released: bool) {
    self.unclaim_range(page, npages);
    if released {
      self.published.stats.released(npages);
      self.mark_scavenged(page, npages);
    }
  }

  /// Frees pages whose memory may not be resident, marking them scavenged
  /// so the next allocation recommits them.
  pub fn free_scavenged(&mut self, page: usize, npages: usize) {
    self.free_range(page, npages);
    self.mark_scavenged(page, npages);
  }

  fn mark_scavenged(&mut self, page: usize, npages: usize) {
    for (ci, i, n) in chunk_spans(page, npages) {
      self.chunks.chunk_mut(ci).mark_scavenged(i, n);
    }
    self.published.stats.scavenged(npages);
    self.refresh_index(page, npages);
  }
}

/// Splits `[page, page + npages)` into `(chunk, offset, len)` pieces.
fn chunk_spans(page: usize, npages: usize) -> impl Iterator<Item = (usize, usize, usize)> {
  let end = page + npages;
  let sc = page / CHUNK_PAGES;
  let ec = (end - 1) / CHUNK_PAGES;
  (sc..=ec).map(move |ci| {
    let lo = page.max(ci * CHUNK_PAGES);
    let hi = end.min((ci + 1) * CHUNK_PAGES);
    (ci, lo - ci * CHUNK_PAGES, hi - lo)
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bitmap::ChunkBitmap;
  use crate::tree::level_shift;
  use rand::rngs::SmallRng;
  use rand::{Rng, SeedableRng};

  fn page_alloc(arenas: usize) -> PageAlloc {
    let max = 64;
    let mut pa = PageAlloc::new(max, Arc::new(Published::new(max * CHUNKS_PER_ARENA)));
    for a in 0..arenas {
      pa.grow(a);
    }
    pa
  }

  fn snapshot(pa: &PageAlloc) -> (SummaryTree, Vec<ChunkBitmap>) {
    let chunks = (0..pa.end).map(|ci| pa.chunk(ci).clone()).collect();
    (pa.tree.clone(), chunks)
  }

  /// Alloc bits only; scavenged bits legitimately change on allocation.
  fn alloc_bits(pa: &PageAlloc) -> Vec<Vec<u64>> {
    (0..pa.end)
      .map(|ci| pa.chunk(ci).alloc_bits().words().to_vec())
      .collect()
  }

  fn brute_first_fit(pa: &PageAlloc, npages: usize) -> Option<usize> {
    let limit = pa.page_limit();
    let free = |p: usize| !pa.chunk(p / CHUNK_PAGES).is_allocated(p % CHUNK_PAGES);
    let mut run = 0;
    for p in 0..limit {
      run = if free(p) { run + 1 } else { 0 };
      if run == npages {
        return Some(p + 1 - npages);
      }
    }
    None
  }

  #[test]
  fn first_fit_reuses_freed_low_region() {
    let mut pa = page_alloc(1);
    assert_eq!(pa.alloc(10).map(|(p, _)| p), Some(0));
    assert_eq!(pa.alloc(5).map(|(p, _)| p), Some(10));
    pa.free(0, 10);
    assert_eq!(pa.alloc(3).map(|(p, _)| p), Some(0));
    assert!(pa.tree().is_consistent());
  }

  #[test]
  fn fresh_growth_is_scavenged() {
    let mut pa = page_alloc(1);
    assert_eq!(pa.alloc(4), Some((0, 4)));
    pa.free(0, 4);
    assert_eq!(pa.alloc(4), Some((0, 0)));
  }

  #[test]
  fn empty_heap_needs_growth() {
    let mut pa = page_alloc(0);
    assert_eq!(pa.alloc(1), None);
    pa.grow(0);
    assert_eq!(pa.alloc(1).map(|(p, _)| p), Some(0));
  }

  #[test]
  fn allocation_crosses_chunk_boundaries() {
    let mut pa = page_alloc(1);
    let (a, _) = pa.alloc(CHUNK_PAGES - 10).unwrap();
    assert_eq!(a, 0);
    let (b, _) = pa.alloc(30).unwrap();
    assert_eq!(b, CHUNK_PAGES - 10);
    let (c, _) = pa.alloc(3 * CHUNK_PAGES).unwrap();
    assert_eq!(c, CHUNK_PAGES + 20);
    assert!(pa.tree().is_consistent());
    assert!(pa.tree().leaf(2).is_occupied());
    assert!(pa.tree().leaf(3).is_occupied());
  }

  #[test]
  fn whole_heap_allocation_and_exhaustion() {
    let mut pa = page_alloc(2);
    assert_eq!(pa.alloc(2 * ARENA_PAGES).map(|(p, _)| p), Some(0));
    assert_eq!(pa.alloc(1), None);
    assert_eq!(pa.search(), usize::MAX);
    pa.free(ARENA_PAGES + 7, 1);
    assert_eq!(pa.alloc(1).map(|(p, _)| p), Some(ARENA_PAGES + 7));
  }

  #[test]
  fn free_alloc_round_trip_is_bit_identical() {
    let mut rng = SmallRng::seed_from_u64(3);
    let mut pa = page_alloc(2);
    let mut live = Vec::new();
    for _ in 0..200 {
      let n = rng.gen_range(1..=700);
      if let Some((p, _)) = pa.alloc(n) {
        live.push((p, n));
      }
    }
    for _ in 0..100 {
      let (p, n) = live.swap_remove(rng.gen_range(0..live.len()));
      pa.free(p, n);
    }

    for n in [1, 5, 64, 200, 513, 1500] {
      let tree = pa.tree().clone();
      let bits = alloc_bits(&pa);
      let Some((p, _)) = pa.alloc(n) else { continue };
      pa.free(p, n);
      assert_eq!(pa.tree, tree, "n={n}");
      assert_eq!(alloc_bits(&pa), bits, "n={n}");
    }
  }

  #[test]
  fn find_matches_brute_force_first_fit() {
    let mut rng = SmallRng::seed_from_u64(99);
    let mut pa = page_alloc(3);
    let mut live = Vec::new();
    for round in 0..400 {
      if round % 3 == 2 && !live.is_empty() {
        let (p, n) = live.swap_remove(rng.gen_range(0..live.len()));
        pa.free(p, n);
        continue;
      }
      let n = match rng.gen_range(0..10) {
        0 => rng.gen_range(513..2000),
        1..=3 => rng.gen_range(65..513),
        _ => rng.gen_range(1..65),
      };
      let expected = brute_first_fit(&pa, n);
      let got = pa.alloc(n).map(|(p, _)| p);
      assert_eq!(got, expected, "round {round}, npages {n}");
      if let Some(p) = got {
        live.push((p, n));
      }
      assert!(pa.tree().is_consistent());
    }
  }

  #[test]
  fn leaf_summaries_match_chunks() {
    let mut rng = SmallRng::seed_from_u64(5);
    let mut pa = page_alloc(1);
    for _ in 0..300 {
      let n = rng.gen_range(1..100);
      if pa.alloc(n).is_none() {
        break;
      }
    }
    for ci in 0..pa.end {
      assert_eq!(pa.tree().leaf(ci), pa.chunk(ci).summarize());
    }
  }

  #[test]
  fn hint_never_skips_free_pages() {
    let mut pa = page_alloc(1);
    pa.alloc(100).unwrap();
    pa.free(40, 1);
    pa.alloc(2).unwrap();
    assert!(pa.search() <= 40);
    assert_eq!(pa.alloc(1).map(|(p, _)| p), Some(40));
    assert_eq!(pa.alloc(1).map(|(p, _)| p), Some(102));
  }

  #[test]
  fn growth_widens_root() {
    let mut pa = page_alloc(0);
    let arenas_per_root = (1 << level_shift(0)) / CHUNKS_PER_ARENA;
    for a in 0..=arenas_per_root {
      pa.grow(a);
    }
    assert_eq!(pa.tree().root_len(), 2);
    let n = ARENA_PAGES * 2;
    let expect = (arenas_per_root - 1) * ARENA_PAGES;
    pa.alloc(expect).unwrap();
    assert_eq!(pa.alloc(n).map(|(p, _)| p), Some(expect));
    assert!(pa.tree().is_consistent());
  }

  #[test]
  fn cache_refill_and_flush_restore_state() {
    let mut pa = page_alloc(1);
    pa.alloc(3).unwrap();
    pa.free(1, 1);
    let (tree, chunks) = snapshot(&pa);

    let mut cache = pa.alloc_to_cache();
    assert_eq!(cache.parts().0, 0);
    assert_eq!(cache.free_pages(), 62);
    assert_eq!(pa.search(), CACHE_PAGES);
    assert!(pa.chunk(0).is_allocated(1));

    pa.flush_cache(&mut cache);
    assert!(cache.is_empty());
    let (tree_after, chunks_after) = snapshot(&pa);
    assert_eq!(chunks_after, chunks);
    assert_eq!(tree_after, tree);
  }

  #[test]
  fn scavenge_reservation_claims_highest_run() {
    let mut pa = page_alloc(1);
    let (p, _) = pa.alloc(ARENA_PAGES).unwrap();
    pa.free(p + 100, 50);
    let top = CHUNKS_PER_ARENA - 1;
    assert_eq!(pa.reserve_scavenge(top, 8), None);
    assert_eq!(pa.reserve_scavenge(0, 8), Some((142, 8)));
    assert!(pa.chunk(0).is_allocated(145));
    pa.complete_scavenge(142, 8, true);
    assert!(!pa.chunk(0).is_allocated(145));
    assert_eq!(pa.chunk(0).scavenged_bits().count_range(142, 8), 8);
    assert_eq!(pa.reserve_scavenge(0, 100), Some((100, 42)));
    pa.complete_scavenge(100, 42, false);
    assert_eq!(pa.chunk(0).scavengable_pages(), 42);
  }

  #[test]
  fn scavenge_reservation_keeps_free_bytes_steady() {
    let mut pa = page_alloc(1);
    let (p, _) = pa.alloc(CHUNK_PAGES).unwrap();
    pa.free(p, CHUNK_PAGES);
    let free = pa.published.stats.snapshot().free_bytes;

    let (page, npages) = pa.reserve_scavenge(0, 16).unwrap();
    assert_eq!(pa.published.stats.snapshot().free_bytes, free);
    pa.complete_scavenge(page, npages, true);
    let stats = pa.published.stats.snapshot();
    assert_eq!(stats.free_bytes, free);
    assert_eq!(stats.unscavenged_bytes, (CHUNK_PAGES - 16) * crate::PAGE_SIZE);

    let (page, npages) = pa.reserve_scavenge(0, 16).unwrap();
    pa.complete_scavenge(page, npages, false);
    let stats = pa.published.stats.snapshot();
    assert_eq!(stats.free_bytes, free);
    assert_eq!(stats.unscavenged_bytes, (CHUNK_PAGES - 16) * crate::PAGE_SIZE);
  }

  #[test]
  #[should_panic(expected = "outside the heap")]
  fn free_outside_heap_panics() {
    let mut pa = page_alloc(1);
    pa.free(ARENA_PAGES, 1);
  }
}
