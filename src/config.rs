use std::num::NonZeroUsize;
use std::thread;

use crate::error::{Error, Result};
use crate::{ARENA_SIZE, CHUNKS_PER_ARENA, PAGE_SIZE};

#[cfg(target_pointer_width = "64")]
const DEFAULT_RESERVATION: usize = 64 << 30; // 64GB
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_RESERVATION: usize = 1 << 30; // 1GB

/// Fallback when the parallelism of the machine is unknown.
const DEFAULT_CACHE_SLOTS: usize = 8;

/// Heap tuning. Construct with [`Config::default`] and adjust with the
/// `with_*` methods; [`Heap`](crate::Heap) validates it on creation.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
  /// Bytes of address space reserved up front. Bounds the heap size.
  pub reservation: usize,
  /// Number of per-core page caches.
  pub cache_slots: usize,
  /// Extra attempts after the platform refuses a commit.
  pub commit_retries: u32,
  /// CPU share the background scavenger aims for, in percent.
  pub scavenge_percent: f64,
  /// Free resident bytes the background scavenger leaves in place.
  pub retained_goal: usize,
  /// Largest run released by one scavenge step.
  pub scavenge_quantum: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      reservation: DEFAULT_RESERVATION,
      cache_slots: thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(DEFAULT_CACHE_SLOTS),
      commit_retries: 4,
      scavenge_percent: 1.0,
      retained_goal: 0,
      scavenge_quantum: 64 << 10,
    }
  }
}

impl Config {
  pub fn with_reservation(mut self, bytes: usize) -> Self {
    self.reservation = bytes;
    self
  }

  pub fn with_cache_slots(mut self, slots: usize) -> Self {
    self.cache_slots = slots;
    self
  }

  pub fn with_commit_retries(mut self, retries: u32) -> Self {
    self.commit_retries = retries;
    self
  }

  pub fn with_scavenge_percent(mut self, percent: f64) -> Self {
    self.scavenge_percent = percent;
    self
  }

  pub fn with_retained_goal(mut self, bytes: usize) -> Self {
    self.retained_goal = bytes;
    self
  }

  pub fn with_scavenge_quantum(mut self, bytes: usize) -> Self {
    self.scavenge_quantum = bytes;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.reservation < ARENA_SIZE || self.reservation % ARENA_SIZE != 0 {
      return Err(Error::InvalidConfig("reservation must be a non-zero multiple of the arena size"));
    }
    if (self.reservation / ARENA_SIZE).checked_mul(CHUNKS_PER_ARENA).is_none() {
      return Err(Error::InvalidConfig("reservation is too large"));
    }
    if self.cache_slots == 0 {
      return Err(Error::InvalidConfig("at least one cache slot is required"));
    }
    if !(self.scavenge_percent > 0.0 && self.scavenge_percent <= 100.0) {
      return Err(Error::InvalidConfig("scavenge_percent must be in (0, 100]"));
    }
    if self.scavenge_quantum < PAGE_SIZE {
      return Err(Error::InvalidConfig("scavenge_quantum must cover at least one page"));
    }
    Ok(())
  }
}
