//! Per-core page caches.
//!
//! A cache owns one 64-page aligned block taken from the heap in a single
//! locked step. Small requests are served from it without the heap lock
//! until it runs dry. Each slot carries an ownership flag; whoever sets it
//! has exclusive access to the cache until the lease is dropped.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

use crate::bitmap::{find_bit_range64, span_mask};
use crate::error::Result;
use crate::heap::Heap;
use crate::platform::{MemoryProvider, OsMemory};
use crate::{CACHE_PAGES, CACHE_THRESHOLD};

// =============================================================================
// PageCache
// =============================================================================

/// A 64-page window: bit `i` of `free` set means page `base + i` belongs to
/// the cache, bit `i` of `scav` that its memory has been released.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PageCache {
  base: usize,
  free: u64,
  scav: u64,
}

/// Pages handed out by [`PageCache::take`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Taken {
  pub page: usize,
  pub npages: usize,
  /// Scavenged pages among them, relative to the cache base.
  pub scav: u64,
}

impl PageCache {
  pub const EMPTY: PageCache = PageCache {
    base: 0,
    free: 0,
    scav: 0,
  };

  pub fn new(base: usize, free: u64, scav: u64) -> Self {
    debug_assert_eq!(base % CACHE_PAGES, 0, "cache base {base} is not block aligned");
    debug_assert_eq!(scav & !free, 0, "scavenged pages outside the cache");
    Self { base, free, scav }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.free == 0
  }

  pub fn free_pages(&self) -> usize {
    self.free.count_ones() as usize
  }

  pub fn parts(&self) -> (usize, u64, u64) {
    (self.base, self.free, self.scav)
  }

  /// Takes the lowest run of `npages` pages.
  pub fn take(&mut self, npages: usize) -> Option<Taken> {
    debug_assert!(npages > 0 && npages <= CACHE_PAGES);
    if self.free == 0 {
      return None;
    }
    let i = if npages == 1 {
      self.free.trailing_zeros() as usize
    } else {
      find_bit_range64(self.free, npages)
    };
    if i >= CACHE_PAGES {
      return None;
    }
    let mask = span_mask(i, npages);
    let scav = self.scav & mask;
    self.free &= !mask;
    self.scav &= !mask;
    Some(Taken {
      page: self.base + i,
      npages,
      scav,
    })
  }

  /// Undoes a [`take`](Self::take) whose pages were never handed out.
  pub fn put_back(&mut self, taken: Taken) {
    let mask = span_mask(taken.page - self.base, taken.npages);
    debug_assert_eq!(self.free & mask, 0, "put_back: pages already cached");
    self.free |= mask;
    self.scav |= taken.scav;
  }
}

// =============================================================================
// Slots
// =============================================================================

struct CacheSlot {
  owned: AtomicBool,
  cache: UnsafeCell<PageCache>,
}

pub(crate) struct CacheSlots {
  slots: Box<[CachePadded<CacheSlot>]>,
}

// SAFETY: the cache is only reached through a lease, which requires owning the flag.
unsafe impl Sync for CacheSlots {}

impl CacheSlots {
  pub fn new(n: usize) -> Self {
    assert!(n > 0, "at least one cache slot is required");
    let slots = (0..n)
      .map(|_| {
        CachePadded::new(CacheSlot {
          owned: AtomicBool::new(false),
          cache: UnsafeCell::new(PageCache::EMPTY),
        })
      })
      .collect();
    Self { slots }
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  /// Claims slot `idx % len` if nobody owns it.
  pub fn try_acquire(&self, idx: usize) -> Option<CacheLease<'_>> {
    let slot = &self.slots[idx % self.slots.len()];
    slot
      .owned
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .ok()?;
    Some(CacheLease { slot })
  }

  /// Claims the first free slot starting from `idx`, or `None` if all are
  /// owned.
  pub fn try_acquire_any(&self, idx: usize) -> Option<CacheLease<'_>> {
    (0..self.slots.len()).find_map(|k| self.try_acquire(idx + k))
  }

  /// Claims some slot, spinning until one is released.
  pub fn acquire(&self, idx: usize) -> CacheLease<'_> {
    loop {
      if let Some(lease) = self.try_acquire_any(idx) {
        return lease;
      }
      let slot = &self.slots[idx % self.slots.len()];
      while slot.owned.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  /// Visits every cache, waiting for each to be released.
  pub fn for_each(&self, mut f: impl FnMut(&mut PageCache)) {
    for idx in 0..self.slots.len() {
      let slot = &self.slots[idx];
      while slot
        .owned
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
      {
        while slot.owned.load(Ordering::Relaxed) {
          hint::spin_loop();
        }
      }
      let mut lease = CacheLease { slot };
      f(&mut *lease);
    }
  }
}

/// Exclusive access to one slot's cache. Dropping it releases the slot.
pub(crate) struct CacheLease<'a> {
  slot: &'a CacheSlot,
}

impl Deref for CacheLease<'_> {
  type Target = PageCache;

  fn deref(&self) -> &PageCache {
    // SAFETY: the lease holds the slot's ownership flag.
    unsafe { &*self.slot.cache.get() }
  }
}

impl DerefMut for CacheLease<'_> {
  fn deref_mut(&mut self) -> &mut PageCache {
    // SAFETY: the lease holds the slot's ownership flag.
    unsafe { &mut *self.slot.cache.get() }
  }
}

impl Drop for CacheLease<'_> {
  fn drop(&mut self) {
    self.slot.owned.store(false, Ordering::Release);
  }
}

// =============================================================================
// CacheHandle
// =============================================================================

/// Exclusive use of one per-core cache of a [`Heap`].
///
/// Obtained from [`Heap::cache`]. While a handle is alive no other thread
/// uses its cache; [`try_alloc`](Self::try_alloc) never takes the heap lock.
/// Pages from a handle are returned with [`Heap::free_pages`] like any other.
pub struct CacheHandle<'h, M: MemoryProvider = OsMemory> {
  heap: &'h Heap<M>,
  lease: CacheLease<'h>,
}

impl<'h, M: MemoryProvider> CacheHandle<'h, M> {
  pub(crate) fn new(heap: &'h Heap<M>, lease: CacheLease<'h>) -> Self {
    Self { heap, lease }
  }

  /// Serves `npages` from the cache. `Ok(None)` is a miss: the request is
  /// above [`CACHE_THRESHOLD`] or the cache has no such run.
  ///
  /// Fails only if scavenged pages could not be made resident again.
  pub fn try_alloc(&mut self, npages: usize) -> Result<Option<NonNull<u8>>> {
    assert!(npages > 0, "try_alloc: zero pages requested");
    if npages > CACHE_THRESHOLD {
      return Ok(None);
    }
    let Some(taken) = self.lease.take(npages) else {
      return Ok(None);
    };
    if taken.scav != 0
      && let Err(err) = self.heap.recommit(taken.page, taken.npages)
    {
      self.lease.put_back(taken);
      return Err(err);
    }
    Ok(Some(self.heap.page_ptr(taken.page)))
  }

  /// Fetches a fresh block under the heap lock if the cache is empty.
  /// Returns whether the cache now has pages; `false` means the heap has no
  /// free page left without growing.
  pub fn refill(&mut self) -> bool {
    if self.lease.is_empty() {
      self.heap.refill_cache(&mut self.lease);
    }
    !self.lease.is_empty()
  }

  /// Cache first, refilling once on a miss, then [`Heap::alloc_pages`].
  pub fn alloc(&mut self, npages: usize) -> Result<NonNull<u8>> {
    if let Some(ptr) = self.try_alloc(npages)? {
      return Ok(ptr);
    }
    if npages <= CACHE_THRESHOLD
      && self.lease.is_empty()
      && self.refill()
      && let Some(ptr) = self.try_alloc(npages)?
    {
      return Ok(ptr);
    }
    self.heap.alloc_pages(npages)
  }

  /// Returns every cached page to the heap.
  pub fn flush(&mut self) {
    self.heap.flush_cache(&mut self.lease);
  }

  /// Pages currently held by this cache.
  pub fn free_pages(&self) -> usize {
    self.lease.free_pages()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn take_is_lowest_fit() {
    let mut cache = PageCache::new(128, 0b1111_0110, 0b1000_0010);
    let t = cache.take(3).unwrap();
    assert_eq!((t.page, t.npages, t.scav), (132, 3, 0));
    assert_eq!(cache.take(3), None);
    let t = cache.take(2).unwrap();
    assert_eq!((t.page, t.scav), (129, 0b10));
    assert_eq!(cache.take(1).map(|t| t.page), Some(135));
    assert!(cache.is_empty());
  }

  #[test]
  fn put_back_restores_cache() {
    let mut cache = PageCache::new(0, !0, 0xF0);
    let before = cache;
    let t = cache.take(8).unwrap();
    assert_eq!(t.scav, 0xF0);
    cache.put_back(t);
    assert_eq!(cache, before);
  }

  #[test]
  fn whole_window_can_be_taken() {
    let mut cache = PageCache::new(64, !0, !0);
    let t = cache.take(CACHE_PAGES).unwrap();
    assert_eq!((t.page, t.scav), (64, !0));
    assert!(cache.is_empty());
  }

  #[test]
  fn slot_is_exclusive_while_leased() {
    let slots = CacheSlots::new(2);
    assert_eq!(slots.len(), 2);
    let a = slots.try_acquire(0).unwrap();
    assert!(slots.try_acquire(2).is_none());
    let b = slots.try_acquire_any(0).unwrap();
    assert!(slots.try_acquire_any(0).is_none());
    drop(a);
    assert!(slots.try_acquire(0).is_some());
    drop(b);
  }

  #[test]
  fn leases_hand_off_cache_contents() {
    let slots = Arc::new(CacheSlots::new(1));
    {
      let mut lease = slots.acquire(0);
      *lease = PageCache::new(0, 0b1111, 0);
    }
    let taken: Vec<usize> = (0..4)
      .map(|_| {
        let slots = Arc::clone(&slots);
        thread::spawn(move || slots.acquire(0).take(1).map(|t| t.page))
      })
      .map(|h| h.join().unwrap().unwrap())
      .collect();
    let mut taken = taken;
    taken.sort_unstable();
    assert_eq!(taken, vec![0, 1, 2, 3]);
    assert!(slots.acquire(0).is_empty());
  }
}
