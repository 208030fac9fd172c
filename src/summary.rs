//! Packed `(start, max, end)` summaries of free page runs.
//!
//! A summary describes a bitmap (a chunk, or a subtree of chunks) by three
//! counts: free pages anchored at the low edge, the longest free run anywhere,
//! and free pages anchored at the high edge. Summaries are packed into one
//! `u64` so a tree level is a flat array of words.

use core::fmt;

use crate::{CHUNK_PAGES, LOG_MAX_PACKED};

/// Largest count a summary can describe. A field value of `MAX_PACKED` does
/// not fit in `LOG_MAX_PACKED` bits, so it is only representable when all
/// three fields are saturated, and is encoded as a single flag bit.
pub const MAX_PACKED: usize = 1 << LOG_MAX_PACKED;

const FIELD_MASK: u64 = (MAX_PACKED - 1) as u64;
const SATURATED: u64 = 1 << 63;

const _: () = assert!(3 * LOG_MAX_PACKED < 63);

#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Summary(u64);

impl Summary {
  /// No free pages. Also the value of every leaf outside the mapped heap.
  pub const OCCUPIED: Summary = Summary(0);

  /// A chunk with every page free.
  pub const FREE_CHUNK: Summary = Summary::pack(CHUNK_PAGES, CHUNK_PAGES, CHUNK_PAGES);

  pub const fn pack(start: usize, max: usize, end: usize) -> Self {
    debug_assert!(start <= max && end <= max && max <= MAX_PACKED);
    if max == MAX_PACKED {
      debug_assert!(start == MAX_PACKED && end == MAX_PACKED);
      return Summary(SATURATED);
    }
    Summary(
      (start as u64 & FIELD_MASK)
        | ((max as u64 & FIELD_MASK) << LOG_MAX_PACKED)
        | ((end as u64 & FIELD_MASK) << (2 * LOG_MAX_PACKED)),
    )
  }

  #[inline]
  pub const fn start(self) -> usize {
    if self.0 & SATURATED != 0 {
      return MAX_PACKED;
    }
    (self.0 & FIELD_MASK) as usize
  }

  #[inline]
  pub const fn max(self) -> usize {
    if self.0 & SATURATED != 0 {
      return MAX_PACKED;
    }
    ((self.0 >> LOG_MAX_PACKED) & FIELD_MASK) as usize
  }

  #[inline]
  pub const fn end(self) -> usize {
    if self.0 & SATURATED != 0 {
      return MAX_PACKED;
    }
    ((self.0 >> (2 * LOG_MAX_PACKED)) & FIELD_MASK) as usize
  }

  #[inline]
  pub const fn unpack(self) -> (usize, usize, usize) {
    (self.start(), self.max(), self.end())
  }

  /// True when no page under this summary is free. One comparison.
  #[inline]
  pub const fn is_occupied(self) -> bool {
    self.0 == 0
  }

  pub const fn to_bits(self) -> u64 {
    self.0
  }
}

impl fmt::Debug for Summary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (start, max, end) = self.unpack();
    write!(f, "Summary({start}, {max}, {end})")
  }
}

/// Merges the summaries of adjacent, equally sized children into the summary
/// of their parent. Each child covers `1 << log_pages` pages.
pub fn merge(children: &[Summary], log_pages: u32) -> Summary {
  let width = 1usize << log_pages;
  let runs = children.iter().fold(Runs::EMPTY, |acc, sum| {
    let (start, max, end) = sum.unpack();
    acc.append(Runs {
      start,
      max,
      end,
      width,
    })
  });
  Summary::pack(runs.start, runs.max, runs.end)
}

// =============================================================================
// Run reduction
// =============================================================================

/// Free-run shape of a prefix of a bitmap. Concatenating two shapes is the
/// single reduction used both inside a chunk (per byte) and across the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Runs {
  pub start: usize,
  pub max: usize,
  pub end: usize,
  pub width: usize,
}

impl Runs {
  pub const EMPTY: Runs = Runs {
    start: 0,
    max: 0,
    end: 0,
    width: 0,
  };

  #[inline]
  pub const fn free(width: usize) -> Runs {
    Runs {
      start: width,
      max: width,
      end: width,
      width,
    }
  }

  #[inline]
  pub const fn used(width: usize) -> Runs {
    Runs {
      start: 0,
      max: 0,
      end: 0,
      width,
    }
  }

  /// Shape of one byte of allocation bits (bit `i` = page `i`, set = in use).
  #[inline]
  pub const fn of_byte(byte: u8) -> Runs {
    let [start, max, end] = BYTE_RUNS[byte as usize];
    Runs {
      start: start as usize,
      max: max as usize,
      end: end as usize,
      width: 8,
    }
  }

  /// Appends `next`, which covers the pages directly above `self`.
  #[inline]
  pub const fn append(self, next: Runs) -> Runs {
    let start = if self.start == self.width {
      self.start + next.start
    } else {
      self.start
    };
    let mut max = self.end + next.start;
    if self.max > max {
      max = self.max;
    }
    if next.max > max {
      max = next.max;
    }
    let end = if next.end == next.width {
      self.end + next.width
    } else {
      next.end
    };
    Runs {
      start,
      max,
      end,
      width: self.width + next.width,
    }
  }
}

/// `(low free, longest free, high free)` for every byte value.
const BYTE_RUNS: [[u8; 3]; 256] = byte_runs();

const fn byte_runs() -> [[u8; 3]; 256] {
  let mut table = [[0u8; 3]; 256];
  let mut b = 0usize;
  while b < 256 {
    let mut start = 0;
    while start < 8 && (b >> start) & 1 == 0 {
      start += 1;
    }
    let mut end = 0;
    while end < 8 && (b >> (7 - end)) & 1 == 0 {
      end += 1;
    }
    let mut max = 0;
    let mut cur = 0;
    let mut i = 0;
    while i < 8 {
      if (b >> i) & 1 == 0 {
        cur += 1;
        if cur > max {
          max = cur;
        }
      } else {
        cur = 0;
      }
      i += 1;
    }
    table[b] = [start as u8, max as u8, end as u8];
    b += 1;
  }
  table
}
