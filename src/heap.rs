//! The public page heap.
//!
//! All mutable allocator state sits behind one `parking_lot::Mutex`. Cache
//! handles and the telemetry counters are the only paths that avoid it.

use core::ptr::NonNull;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::page_alloc::{PageAlloc, Published};
use crate::page_cache::{CacheHandle, CacheSlots, PageCache};
use crate::platform::{MemoryProvider, OsMemory, cpu_id};
use crate::scavenger::{ScavengerHandle, Scavenger, Signal};
use crate::stats::HeapStats;
use crate::{ARENA_PAGES, ARENA_SIZE, CHUNK_PAGES, CHUNKS_PER_ARENA, PAGE_SIZE, align_up};

const COMMIT_BACKOFF: Duration = Duration::from_micros(50);

/// A page heap over one contiguous reservation of address space.
///
/// Arenas of [`ARENA_SIZE`] bytes are committed from the bottom of the
/// reservation as demand grows and are never returned; free pages inside them
/// are handed back to the OS by the scavenger instead.
pub struct Heap<M: MemoryProvider = OsMemory> {
  mem: M,
  config: Config,
  /// Raw reservation as returned by the provider.
  raw: (usize, usize),
  /// Arena-aligned start of the usable range.
  base: usize,
  pages: Mutex<PageAlloc>,
  published: Arc<Published>,
  caches: CacheSlots,
  signal: Signal,
}

impl Heap<OsMemory> {
  /// Reserves address space from the OS.
  pub fn new(config: Config) -> Result<Self> {
    Self::with_provider(config, OsMemory)
  }
}

impl<M: MemoryProvider> Heap<M> {
  pub fn with_provider(config: Config, mem: M) -> Result<Self> {
    config.validate()?;
    let size = config.reservation + ARENA_SIZE;
    let raw = mem
      .reserve(size)
      .map_err(|source| Error::Reserve { size, source })?;
    let base = align_up(raw, ARENA_SIZE);

    let arenas = config.reservation / ARENA_SIZE;
    let published = Arc::new(Published::new(arenas * CHUNKS_PER_ARENA));
    debug!(
      "heap: reserved {} bytes at {base:#x} for {arenas} arenas",
      config.reservation
    );
    Ok(Self {
      pages: Mutex::new(PageAlloc::new(arenas, Arc::clone(&published))),
      published,
      caches: CacheSlots::new(config.cache_slots),
      signal: Signal::default(),
      raw: (raw, size),
      base,
      mem,
      config,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn memory(&self) -> &M {
    &self.mem
  }

  pub fn stats(&self) -> HeapStats {
    self.published.stats.snapshot()
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates `npages` contiguous pages at the lowest free address,
  /// growing the heap if no free run is large enough.
  ///
  /// Always takes the heap lock. Callers that want small requests served
  /// without it hold a [`CacheHandle`] from [`cache`](Self::cache).
  ///
  /// # Panics
  ///
  /// If `npages` is zero.
  pub fn alloc_pages(&self, npages: usize) -> Result<NonNull<u8>> {
    assert!(npages > 0, "alloc_pages: zero pages requested");
    let (page, scav) = {
      let mut pages = self.pages.lock();
      self.alloc_locked(&mut pages, npages)?
    };

    if scav > 0
      && let Err(err) = self.recommit(page, npages)
    {
      self.pages.lock().free_scavenged(page, npages);
      return Err(err);
    }
    Ok(self.page_ptr(page))
  }

  /// Returns pages obtained from [`alloc_pages`](Self::alloc_pages) or a
  /// [`CacheHandle`].
  ///
  /// # Panics
  ///
  /// If `npages` is zero or `ptr` is not a page of this heap.
  pub fn free_pages(&self, ptr: NonNull<u8>, npages: usize) {
    assert!(npages > 0, "free_pages: zero pages");
    let addr = ptr.as_ptr() as usize;
    assert!(addr % PAGE_SIZE == 0, "free_pages: {addr:#x} is not page aligned");
    assert!(
      addr >= self.base && addr - self.base < self.config.reservation,
      "free_pages: {addr:#x} is not part of this heap"
    );
    let page = (addr - self.base) / PAGE_SIZE;
    self.pages.lock().free(page, npages);
    self.signal.wake();
  }

  /// Claims a per-core cache for the calling thread, waiting if every cache
  /// is in use.
  pub fn cache(&self) -> CacheHandle<'_, M> {
    CacheHandle::new(self, self.caches.acquire(cpu_id()))
  }

  /// First fit, then growth. When the reservation is full, pages parked in
  /// idle caches are taken back before giving up.
  fn alloc_locked(&self, pages: &mut PageAlloc, npages: usize) -> Result<(usize, usize)> {
    if let Some(found) = pages.alloc(npages) {
      return Ok(found);
    }

    let needed = npages.div_ceil(ARENA_PAGES);
    let mapped = pages.mapped_arenas();
    if mapped + needed > pages.max_arenas() {
      if self.reclaim_idle_caches(pages) > 0
        && let Some(found) = pages.alloc(npages)
      {
        return Ok(found);
      }
      error!(
        "heap: cannot grow by {needed} arenas for {npages} pages, {mapped} of {} in use",
        pages.max_arenas()
      );
      return Err(Error::AddressSpaceExhausted {
        npages,
        reserved: self.config.reservation,
      });
    }

    self.grow(pages, needed, npages)?;
    let Some(found) = pages.alloc(npages) else {
      panic!("allocation of {npages} pages failed right after growth");
    };
    Ok(found)
  }

  /// Flushes every cache nobody holds right now. Returns the pages won back.
  fn reclaim_idle_caches(&self, pages: &mut PageAlloc) -> usize {
    let mut reclaimed = 0;
    for idx in 0..self.caches.len() {
      // Never wait here: a cache owner may be blocked on the heap lock.
      if let Some(mut lease) = self.caches.try_acquire(idx) {
        reclaimed += lease.free_pages();
        pages.flush_cache(&mut lease);
      }
    }
    if reclaimed > 0 {
      debug!("heap: reclaimed {reclaimed} pages from idle caches");
    }
    reclaimed
  }

  /// Commits `needed` new arenas and adds them to the heap. A partial
  /// growth revokes access to the arenas it did commit.
  fn grow(&self, pages: &mut PageAlloc, needed: usize, npages: usize) -> Result<()> {
    let first = pages.mapped_arenas();
    debug_assert!(first + needed <= pages.max_arenas());

    for k in 0..needed {
      let addr = self.base + (first + k) * ARENA_SIZE;
      if let Err(err) = self.commit_with_retry(addr, ARENA_SIZE, npages) {
        if k > 0 {
          let start = self.base + first * ARENA_SIZE;
          if let Err(err) = self.mem.protect_none(start, k * ARENA_SIZE) {
            warn!("heap: failed to revoke access after partial growth: {err}");
          }
        }
        return Err(err);
      }
    }
    for arena in first..first + needed {
      pages.grow(arena);
    }
    self.published.stats.grown(needed * ARENA_SIZE);
    debug!(
      "heap: grew by {needed} arenas at {:#x} for {npages} pages",
      self.base + first * ARENA_SIZE
    );
    Ok(())
  }

  fn commit_with_retry(&self, addr: usize, len: usize, npages: usize) -> Result<()> {
    let mut backoff = COMMIT_BACKOFF;
    let mut attempt = 0;
    loop {
      match self.mem.commit(addr, len) {
        Ok(()) => return Ok(()),
        Err(err) if attempt < self.config.commit_retries => {
          attempt += 1;
          warn!(
            "heap: commit at {addr:#x} refused ({err}), retry {attempt}/{} in {backoff:?}",
            self.config.commit_retries
          );
          thread::sleep(backoff);
          backoff *= 2;
        }
        Err(source) => {
          error!("heap: commit of {len} bytes at {addr:#x} refused, giving up: {source}");
          return Err(Error::OutOfMemory { npages, source });
        }
      }
    }
  }

  /// Makes scavenged pages resident again before they are handed out.
  pub(crate) fn recommit(&self, page: usize, npages: usize) -> Result<()> {
    self.commit_with_retry(self.page_addr(page), npages * PAGE_SIZE, npages)
  }

  // ===========================================================================
  // Caches
  // ===========================================================================

  pub(crate) fn refill_cache(&self, cache: &mut PageCache) {
    debug_assert!(cache.is_empty());
    *cache = self.pages.lock().alloc_to_cache();
  }

  pub(crate) fn flush_cache(&self, cache: &mut PageCache) {
    if cache.is_empty() {
      return;
    }
    self.pages.lock().flush_cache(cache);
    self.signal.wake();
  }

  /// Returns the pages held by every per-core cache, waiting for caches
  /// that are in use.
  pub fn flush_caches(&self) {
    self.caches.for_each(|cache| self.flush_cache(cache));
  }

  // ===========================================================================
  // Scavenging
  // ===========================================================================

  /// Releases up to about `bytes` of free memory to the OS on the calling
  /// thread, highest addresses first. Returns the bytes released.
  pub fn scavenge(&self, bytes: usize) -> usize {
    let end = self.pages.lock().page_limit() / CHUNK_PAGES;
    let mut scavenger = Scavenger::starting_at(end);
    let mut released = 0;
    while released < bytes {
      let max = (bytes - released).min(self.config.scavenge_quantum);
      match scavenger.scavenge_one(self, max) {
        Some(n) => released += n,
        None => break,
      }
    }
    released
  }

  /// Starts the background scavenger. Only one may run per heap.
  pub fn spawn_scavenger(self: &Arc<Self>) -> Result<ScavengerHandle<M>>
  where
    M: 'static,
  {
    ScavengerHandle::spawn(self)
  }

  // ===========================================================================
  // Internals
  // ===========================================================================

  pub(crate) fn lock(&self) -> MutexGuard<'_, PageAlloc> {
    self.pages.lock()
  }

  pub(crate) fn published(&self) -> &Published {
    &self.published
  }

  pub(crate) fn signal(&self) -> &Signal {
    &self.signal
  }

  #[inline]
  pub(crate) fn page_addr(&self, page: usize) -> usize {
    self.base + page * PAGE_SIZE
  }

  #[inline]
  pub(crate) fn page_ptr(&self, page: usize) -> NonNull<u8> {
    // SAFETY: the reservation never starts at address zero.
    unsafe { NonNull::new_unchecked(self.page_addr(page) as *mut u8) }
  }
}

impl<M: MemoryProvider> Drop for Heap<M> {
  fn drop(&mut self) {
    let (addr, size) = self.raw;
    self.mem.release(addr, size);
  }
}
