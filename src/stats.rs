//! Telemetry counters.
//!
//! Counters are written while the heap lock is held (or by the scavenger
//! thread) and read without it, so a snapshot may be momentarily skewed
//! between fields.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::PAGE_SIZE;

#[derive(Default)]
pub(crate) struct Stats {
  mapped_bytes: AtomicUsize,
  free_pages: AtomicUsize,
  /// Free pages whose memory has been returned to the OS.
  scavenged_pages: AtomicUsize,
  released_bytes: AtomicU64,
  decommit_failures: AtomicU64,
  growths: AtomicU64,
  /// `f64` bits of the scavenger's last measured CPU fraction.
  utilization: AtomicU64,
}

impl Stats {
  pub fn grown(&self, bytes: usize) {
    self.mapped_bytes.fetch_add(bytes, Ordering::Relaxed);
    self.growths.fetch_add(1, Ordering::Relaxed);
  }

  /// `npages` left the free set; `scav` of them had been scavenged.
  pub fn taken(&self, npages: usize, scav: usize) {
    self.free_pages.fetch_sub(npages, Ordering::Relaxed);
    self.scavenged_pages.fetch_sub(scav, Ordering::Relaxed);
  }

  /// `npages` joined the free set; `scav` of them are scavenged.
  pub fn returned(&self, npages: usize, scav: usize) {
    self.free_pages.fetch_add(npages, Ordering::Relaxed);
    self.scavenged_pages.fetch_add(scav, Ordering::Relaxed);
  }

  /// `npages` free pages became scavenged.
  pub fn scavenged(&self, npages: usize) {
    self.scavenged_pages.fetch_add(npages, Ordering::Relaxed);
  }

  pub fn released(&self, npages: usize) {
    self
      .released_bytes
      .fetch_add((npages * PAGE_SIZE) as u64, Ordering::Relaxed);
  }

  pub fn decommit_failed(&self) {
    self.decommit_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn set_utilization(&self, fraction: f64) {
    self.utilization.store(fraction.to_bits(), Ordering::Relaxed);
  }

  pub fn unscavenged_bytes(&self) -> usize {
    let free = self.free_pages.load(Ordering::Relaxed);
    let scav = self.scavenged_pages.load(Ordering::Relaxed);
    free.saturating_sub(scav) * PAGE_SIZE
  }

  pub fn snapshot(&self) -> HeapStats {
    HeapStats {
      mapped_bytes: self.mapped_bytes.load(Ordering::Relaxed),
      free_bytes: self.free_pages.load(Ordering::Relaxed) * PAGE_SIZE,
      unscavenged_bytes: self.unscavenged_bytes(),
      released_bytes: self.released_bytes.load(Ordering::Relaxed),
      decommit_failures: self.decommit_failures.load(Ordering::Relaxed),
      growths: self.growths.load(Ordering::Relaxed),
      scavenger_utilization: f64::from_bits(self.utilization.load(Ordering::Relaxed)),
    }
  }
}

/// Point-in-time view of the heap's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HeapStats {
  /// Bytes of arenas committed to the heap.
  pub mapped_bytes: usize,
  /// Bytes in free pages. Pages held by per-core caches count as in use.
  pub free_bytes: usize,
  /// Free bytes still backed by memory the scavenger could release.
  pub unscavenged_bytes: usize,
  /// Total bytes released to the OS by the scavenger.
  pub released_bytes: u64,
  pub decommit_failures: u64,
  pub growths: u64,
  /// Fraction of wall-clock time the background scavenger spent working in
  /// its last pacing period.
  pub scavenger_utilization: f64,
}
