//! Radix tree of packed summaries.
//!
//! Level `SUMMARY_LEVELS - 1` has one entry per chunk; every entry above is
//! the merge of `1 << SUMMARY_LEVEL_BITS` consecutive children. The tree is
//! indexed by address bits, so entry `i` of level `l` covers chunks
//! `[i << shift(l), (i + 1) << shift(l))`. The root never gains a level: it
//! widens by one entry per root-sized span of chunks as the heap grows.

use crate::summary::{Summary, merge};
use crate::{LOG_CHUNK_PAGES, SUMMARY_LEVEL_BITS, SUMMARY_LEVELS};

/// log2 of the pages covered by one entry at each level.
pub const LEVEL_LOG_PAGES: [usize; SUMMARY_LEVELS] = level_log_pages();

const fn level_log_pages() -> [usize; SUMMARY_LEVELS] {
  let mut logs = [0; SUMMARY_LEVELS];
  let mut l = 0;
  while l < SUMMARY_LEVELS {
    logs[l] = LOG_CHUNK_PAGES + level_shift(l);
    l += 1;
  }
  logs
}

/// log2 of the chunks covered by one entry at level `l`.
#[inline(always)]
pub const fn level_shift(l: usize) -> usize {
  (SUMMARY_LEVELS - 1 - l) * SUMMARY_LEVEL_BITS
}

const FANOUT: usize = 1 << SUMMARY_LEVEL_BITS;
const LEAF: usize = SUMMARY_LEVELS - 1;

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SummaryTree {
  levels: [Vec<Summary>; SUMMARY_LEVELS],
}

impl SummaryTree {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn root_len(&self) -> usize {
    self.levels[0].len()
  }

  pub fn level(&self, l: usize) -> &[Summary] {
    &self.levels[l]
  }

  /// Leaf summary of chunk `ci`. Chunks beyond the tree read as occupied.
  #[inline]
  pub fn leaf(&self, ci: usize) -> Summary {
    self.levels[LEAF].get(ci).copied().unwrap_or(Summary::OCCUPIED)
  }

  #[inline]
  pub fn set_leaf(&mut self, ci: usize, sum: Summary) {
    self.levels[LEAF][ci] = sum;
  }

  /// Widens every level so chunks `[0, chunks)` have leaves. New entries are
  /// occupied until the caller publishes their real summaries.
  pub fn grow(&mut self, chunks: usize) {
    let root = chunks.div_ceil(1 << level_shift(0));
    if root <= self.root_len() {
      return;
    }
    for (l, level) in self.levels.iter_mut().enumerate() {
      level.resize(root << (l * SUMMARY_LEVEL_BITS), Summary::OCCUPIED);
    }
  }

  /// Recomputes the ancestors of leaves `[lo, hi]`, bottom-up, stopping at
  /// the first level where nothing changed.
  pub fn propagate(&mut self, lo: usize, hi: usize) {
    for l in (0..LEAF).rev() {
      let (upper, lower) = self.levels.split_at_mut(l + 1);
      let (parents, children) = (&mut upper[l], &lower[0]);
      let shift = level_shift(l);
      let mut changed = false;
      for i in (lo >> shift)..=(hi >> shift) {
        let sum = merge(&children[i * FANOUT..(i + 1) * FANOUT], LEVEL_LOG_PAGES[l + 1] as u32);
        if parents[i] != sum {
          parents[i] = sum;
          changed = true;
        }
      }
      if !changed {
        break;
      }
    }
  }

  /// Checks every parent against the merge of its children.
  pub fn is_consistent(&self) -> bool {
    (0..LEAF).all(|l| {
      self.levels[l].iter().enumerate().all(|(i, &sum)| {
        let children = &self.levels[l + 1][i * FANOUT..(i + 1) * FANOUT];
        merge(children, LEVEL_LOG_PAGES[l + 1] as u32) == sum
      })
    })
  }
}
