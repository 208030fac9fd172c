//! Per-chunk page bitmaps.
//!
//! A chunk tracks `CHUNK_PAGES` pages with two parallel bitsets: allocation
//! bits (1 = in use) and scavenged bits (1 = returned to the OS). Bit `i`
//! of word `i / 64` is page `i`, so lower bits are lower addresses.

use crate::CHUNK_PAGES;
use crate::summary::{Runs, Summary};

pub const WORDS: usize = CHUNK_PAGES / 64;

/// Mask of `len` bits starting at bit `lo`. `lo + len` must not exceed 64.
#[inline(always)]
pub(crate) const fn span_mask(lo: usize, len: usize) -> u64 {
  if len >= 64 {
    !0
  } else {
    ((1u64 << len) - 1) << lo
  }
}

// =============================================================================
// PageBits
// =============================================================================

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PageBits([u64; WORDS]);

impl PageBits {
  pub const fn empty() -> Self {
    Self([0; WORDS])
  }

  pub const fn full() -> Self {
    Self([!0; WORDS])
  }

  #[inline]
  pub fn get(&self, i: usize) -> bool {
    self.0[i / 64] & (1 << (i % 64)) != 0
  }

  #[inline]
  pub fn words(&self) -> &[u64; WORDS] {
    &self.0
  }

  /// Calls `f(word, mask)` for every word overlapped by pages `[i, i + n)`.
  #[inline]
  fn for_each_word(i: usize, n: usize, mut f: impl FnMut(usize, u64)) {
    let end = i + n;
    let mut i = i;
    while i < end {
      let lo = i % 64;
      let len = (64 - lo).min(end - i);
      f(i / 64, span_mask(lo, len));
      i += len;
    }
  }

  pub fn set_range(&mut self, i: usize, n: usize) {
    Self::for_each_word(i, n, |w, mask| self.0[w] |= mask);
  }

  pub fn clear_range(&mut self, i: usize, n: usize) {
    Self::for_each_word(i, n, |w, mask| self.0[w] &= !mask);
  }

  pub fn count_range(&self, i: usize, n: usize) -> usize {
    let mut count = 0;
    Self::for_each_word(i, n, |w, mask| count += (self.0[w] & mask).count_ones() as usize);
    count
  }

  pub fn count(&self) -> usize {
    self.0.iter().map(|w| w.count_ones() as usize).sum()
  }
}

// =============================================================================
// ChunkBitmap
// =============================================================================

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ChunkBitmap {
  alloc: PageBits,
  scavenged: PageBits,
}

impl Default for ChunkBitmap {
  fn default() -> Self {
    Self::new()
  }
}

impl ChunkBitmap {
  /// All pages free and resident.
  pub const fn new() -> Self {
    Self {
      alloc: PageBits::empty(),
      scavenged: PageBits::empty(),
    }
  }

  /// All pages free and not yet backed by physical memory, as after growth.
  pub const fn fresh() -> Self {
    Self {
      alloc: PageBits::empty(),
      scavenged: PageBits::full(),
    }
  }

  pub fn alloc_bits(&self) -> &PageBits {
    &self.alloc
  }

  pub fn scavenged_bits(&self) -> &PageBits {
    &self.scavenged
  }

  #[inline]
  pub fn is_allocated(&self, i: usize) -> bool {
    self.alloc.get(i)
  }

  pub fn free_pages(&self) -> usize {
    CHUNK_PAGES - self.alloc.count()
  }

  /// Pages that are free and still resident.
  pub fn scavengable_pages(&self) -> usize {
    self
      .alloc
      .0
      .iter()
      .zip(self.scavenged.0.iter())
      .map(|(a, s)| (!(a | s)).count_ones() as usize)
      .sum()
  }

  /// Recomputes the free-run summary one word (or byte) at a time.
  pub fn summarize(&self) -> Summary {
    let mut runs = Runs::EMPTY;
    for &word in self.alloc.0.iter() {
      runs = match word {
        0 => runs.append(Runs::free(64)),
        u64::MAX => runs.append(Runs::used(64)),
        _ => word
          .to_le_bytes()
          .iter()
          .fold(runs, |acc, &byte| acc.append(Runs::of_byte(byte))),
      };
    }
    Summary::pack(runs.start, runs.max, runs.end)
  }

  /// Allocates the lowest run of `npages` free pages, returning its offset.
  pub fn allocate(&mut self, npages: usize) -> Option<usize> {
    assert!(npages > 0, "allocate: zero pages requested");
    assert!(npages <= CHUNK_PAGES, "allocate: {npages} pages exceed a chunk");
    if self.summarize().max() < npages {
      return None;
    }
    let (i, _) = self.find(npages, 0)?;
    self.alloc_range(i, npages);
    Some(i)
  }

  /// Finds the lowest run of `npages` free pages at or above word
  /// `search / 64`. Also returns the first free page seen, which is a new
  /// lower bound for future searches.
  pub fn find(&self, npages: usize, search: usize) -> Option<(usize, usize)> {
    assert!(npages > 0, "find: zero pages requested");
    assert!(npages <= CHUNK_PAGES, "find: {npages} pages exceed a chunk");
    match npages {
      1 => self.find1(search).map(|i| (i, i)),
      2..=64 => self.find_small(npages, search),
      _ => self.find_large(npages, search),
    }
  }

  fn find1(&self, search: usize) -> Option<usize> {
    (search / 64..WORDS)
      .find(|&w| self.alloc.0[w] != !0)
      .map(|w| w * 64 + (!self.alloc.0[w]).trailing_zeros() as usize)
  }

  fn find_small(&self, npages: usize, search: usize) -> Option<(usize, usize)> {
    let mut end = 0;
    let mut first_free = None;
    for w in search / 64..WORDS {
      let x = self.alloc.0[w];
      if x == !0 {
        end = 0;
        continue;
      }
      let first = *first_free.get_or_insert(w * 64 + (!x).trailing_zeros() as usize);
      let start = x.trailing_zeros() as usize;
      if end + start >= npages {
        return Some((w * 64 - end, first));
      }
      let j = find_bit_range64(!x, npages);
      if j < 64 {
        return Some((w * 64 + j, first));
      }
      end = x.leading_zeros() as usize;
    }
    None
  }

  fn find_large(&self, npages: usize, search: usize) -> Option<(usize, usize)> {
    let (mut start, mut size) = (0, 0);
    let mut first_free = None;
    for w in search / 64..WORDS {
      let x = self.alloc.0[w];
      if x == !0 {
        size = 0;
        continue;
      }
      first_free.get_or_insert(w * 64 + (!x).trailing_zeros() as usize);
      if size == 0 {
        size = x.leading_zeros() as usize;
        start = w * 64 + 64 - size;
        continue;
      }
      let s = x.trailing_zeros() as usize;
      if s + size >= npages {
        return first_free.map(|first| (start, first));
      }
      if s < 64 {
        size = x.leading_zeros() as usize;
        start = w * 64 + 64 - size;
        continue;
      }
      size += 64;
    }
    if size < npages {
      return None;
    }
    first_free.map(|first| (start, first))
  }

  /// Marks `[i, i + n)` in use. Returns how many of those pages were
  /// scavenged; allocated pages are never considered scavenged.
  pub fn alloc_range(&mut self, i: usize, n: usize) -> usize {
    assert!(n > 0 && i + n <= CHUNK_PAGES, "alloc_range: [{i}, {i}+{n}) out of chunk");
    debug_assert_eq!(self.alloc.count_range(i, n), 0, "alloc_range: pages already in use");
    let scav = self.scavenged.count_range(i, n);
    self.alloc.set_range(i, n);
    self.scavenged.clear_range(i, n);
    scav
  }

  /// Marks `[i, i + n)` free and unscavenged.
  pub fn free_range(&mut self, i: usize, n: usize) {
    assert!(n > 0 && i + n <= CHUNK_PAGES, "free_range: [{i}, {i}+{n}) out of chunk");
    debug_assert_eq!(self.alloc.count_range(i, n), n, "free_range: double free");
    self.alloc.clear_range(i, n);
    self.scavenged.clear_range(i, n);
  }

  pub fn mark_scavenged(&mut self, i: usize, n: usize) {
    assert!(n > 0 && i + n <= CHUNK_PAGES, "mark_scavenged: [{i}, {i}+{n}) out of chunk");
    self.scavenged.set_range(i, n);
  }

  /// Finds the highest run of free, unscavenged pages at or below page
  /// `search`, trimmed to its top `max` pages.
  pub fn find_scavenge_candidate(&self, search: usize, max: usize) -> Option<(usize, usize)> {
    assert!(max > 0);
    let blocked = |w: usize| {
      let x = self.alloc.0[w] | self.scavenged.0[w];
      if w == search / 64 {
        x | !span_mask(0, search % 64 + 1)
      } else {
        x
      }
    };

    let w = (0..=search / 64).rev().find(|&w| blocked(w) != !0)?;
    let x = blocked(w);
    let skip = (!x).leading_zeros() as usize;
    let end = w * 64 + 64 - skip;
    let run = if x << skip != 0 {
      (x << skip).leading_zeros() as usize
    } else {
      let mut run = 64 - skip;
      for lower in (0..w).rev() {
        let y = blocked(lower);
        run += y.leading_zeros() as usize;
        if y != 0 {
          break;
        }
      }
      run
    };
    let size = run.min(max);
    Some((end - size, size))
  }

  /// Takes every free page of the 64-page block containing page `i`,
  /// returning `(taken, scavenged)` masks relative to the block.
  pub(crate) fn take_block(&mut self, i: usize) -> (u64, u64) {
    let w = i / 64;
    let free = !self.alloc.0[w];
    let scav = self.scavenged.0[w] & free;
    self.alloc.0[w] = !0;
    self.scavenged.0[w] &= !free;
    (free, scav)
  }

  /// Inverse of [`take_block`](Self::take_block) for the pages still in `free`.
  pub(crate) fn return_block(&mut self, i: usize, free: u64, scav: u64) {
    let w = i / 64;
    debug_assert_eq!(self.alloc.0[w] & free, free, "return_block: pages not in use");
    self.alloc.0[w] &= !free;
    self.scavenged.0[w] |= scav & free;
  }
}

/// Returns the lowest bit index starting `n` consecutive set bits of `c`,
/// or 64 if there is none.
#[inline]
pub(crate) fn find_bit_range64(c: u64, n: usize) -> usize {
  debug_assert!(n > 0 && n <= 64);
  let mut c = c;
  let mut p = n - 1;
  let mut k = 1;
  while p > 0 {
    if p <= k {
      c &= c >> p;
      break;
    }
    c &= c >> k;
    if c == 0 {
      return 64;
    }
    p -= k;
    k *= 2;
  }
  c.trailing_zeros() as usize
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::rngs::SmallRng;
  use rand::{Rng, SeedableRng};

  fn brute_summary(chunk: &ChunkBitmap) -> (usize, usize, usize) {
    let free = |i: usize| !chunk.is_allocated(i);
    let start = (0..CHUNK_PAGES).take_while(|&i| free(i)).count();
    let end = (0..CHUNK_PAGES).rev().take_while(|&i| free(i)).count();
    let (mut max, mut cur) = (0, 0);
    for i in 0..CHUNK_PAGES {
      cur = if free(i) { cur + 1 } else { 0 };
      max = max.max(cur);
    }
    (start, max, end)
  }

  fn brute_find(chunk: &ChunkBitmap, npages: usize) -> Option<usize> {
    (0..=CHUNK_PAGES - npages).find(|&i| (i..i + npages).all(|j| !chunk.is_allocated(j)))
  }

  fn random_chunk(rng: &mut SmallRng) -> ChunkBitmap {
    let mut chunk = ChunkBitmap::new();
    let density = rng.gen_range(0.0..1.0);
    let mut i = 0;
    while i < CHUNK_PAGES {
      let len = rng.gen_range(1..=96).min(CHUNK_PAGES - i);
      if rng.gen_bool(density) {
        chunk.alloc_range(i, len);
      }
      i += len;
    }
    chunk
  }

  #[test]
  fn summary_matches_brute_force() {
    let mut rng = SmallRng::seed_from_u64(7);
    for _ in 0..2000 {
      let chunk = random_chunk(&mut rng);
      assert_eq!(chunk.summarize().unpack(), brute_summary(&chunk));
    }
  }

  #[test]
  fn summary_edge_shapes() {
    let mut chunk = ChunkBitmap::new();
    assert_eq!(chunk.summarize(), Summary::FREE_CHUNK);

    chunk.alloc_range(0, CHUNK_PAGES);
    assert!(chunk.summarize().is_occupied());

    chunk.free_range(100, 1);
    assert_eq!(chunk.summarize().unpack(), (0, 1, 0));

    chunk.free_range(0, 3);
    chunk.free_range(500, 12);
    assert_eq!(chunk.summarize().unpack(), (3, 12, 12));
  }

  #[test]
  fn find_is_first_fit() {
    let mut rng = SmallRng::seed_from_u64(11);
    for _ in 0..1000 {
      let chunk = random_chunk(&mut rng);
      for npages in [1, 2, 3, 7, 16, 63, 64, 65, 100, 200, 512] {
        let got = chunk.find(npages, 0).map(|(i, _)| i);
        assert_eq!(got, brute_find(&chunk, npages), "npages={npages}");
      }
    }
  }

  #[test]
  fn find_reports_first_free_page() {
    let mut chunk = ChunkBitmap::new();
    chunk.alloc_range(0, 70);
    chunk.alloc_range(71, 10);
    assert_eq!(chunk.find(1, 0), Some((70, 70)));
    assert_eq!(chunk.find(4, 0), Some((81, 70)));
    assert_eq!(chunk.find(100, 0), Some((81, 70)));
  }

  #[test]
  fn allocate_then_free_restores_state() {
    let mut chunk = ChunkBitmap::new();
    chunk.alloc_range(3, 5);
    let before = chunk.clone();
    let i = chunk.allocate(10).unwrap();
    assert_eq!(i, 8);
    chunk.free_range(i, 10);
    assert_eq!(chunk, before);
    assert_eq!(chunk.allocate(CHUNK_PAGES), None);
  }

  #[test]
  fn alloc_consumes_scavenged_pages() {
    let mut chunk = ChunkBitmap::fresh();
    assert_eq!(chunk.scavengable_pages(), 0);
    assert_eq!(chunk.alloc_range(0, 10), 10);
    chunk.free_range(0, 4);
    assert_eq!(chunk.scavengable_pages(), 4);
    chunk.mark_scavenged(0, 2);
    assert_eq!(chunk.scavengable_pages(), 2);
    assert_eq!(chunk.alloc_range(0, 4), 2);
    assert_eq!(chunk.scavenged_bits().count_range(0, 4), 0);
  }

  #[test]
  fn scavenge_candidate_prefers_high_pages() {
    let mut chunk = ChunkBitmap::new();
    chunk.alloc_range(0, CHUNK_PAGES);
    chunk.free_range(10, 20);
    chunk.free_range(300, 100);
    assert_eq!(chunk.find_scavenge_candidate(CHUNK_PAGES - 1, 8), Some((392, 8)));
    assert_eq!(chunk.find_scavenge_candidate(CHUNK_PAGES - 1, 1000), Some((300, 100)));

    chunk.mark_scavenged(300, 100);
    assert_eq!(chunk.find_scavenge_candidate(CHUNK_PAGES - 1, 1000), Some((10, 20)));
    assert_eq!(chunk.find_scavenge_candidate(15, 1000), Some((10, 6)));

    chunk.mark_scavenged(10, 20);
    assert_eq!(chunk.find_scavenge_candidate(CHUNK_PAGES - 1, 8), None);
  }

  #[test]
  fn scavenge_candidate_spans_words() {
    let chunk = ChunkBitmap::new();
    assert_eq!(chunk.find_scavenge_candidate(CHUNK_PAGES - 1, 1000), Some((0, CHUNK_PAGES)));
  }

  #[test]
  fn take_and_return_block() {
    let mut chunk = ChunkBitmap::fresh();
    chunk.alloc_range(64, 3);
    chunk.free_range(65, 1);
    let before = chunk.clone();

    let (free, scav) = chunk.take_block(70);
    assert_eq!(free, !0b101);
    assert_eq!(scav, !0b111);
    assert_eq!(chunk.alloc_bits().count_range(64, 64), 64);

    chunk.return_block(64, free, scav);
    assert_eq!(chunk, before);
  }

  #[test]
  fn bit_range64() {
    assert_eq!(find_bit_range64(!0, 64), 0);
    assert_eq!(find_bit_range64(0b1110_1100, 3), 5);
    assert_eq!(find_bit_range64(0b1110_1100, 4), 64);
    assert_eq!(find_bit_range64(1 << 63, 1), 63);
  }

  #[test]
  #[should_panic(expected = "zero pages")]
  fn zero_page_allocate_panics() {
    ChunkBitmap::new().allocate(0);
  }

  #[test]
  #[should_panic(expected = "exceed a chunk")]
  fn oversized_allocate_panics() {
    ChunkBitmap::new().allocate(CHUNK_PAGES + 1);
  }
}
