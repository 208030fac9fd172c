//! Returns free, resident pages to the OS.
//!
//! Scanning walks chunks from high to low addresses using a per-chunk count
//! of scavengable pages published by the page allocator, without the heap
//! lock. A candidate is only trusted after the lock re-checks it: the run is
//! then claimed as allocated, released with the lock dropped, and freed
//! again as scavenged.
//!
//! The background thread paces itself with a PI controller so that its work
//! stays near a fixed fraction of one CPU.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::platform::{MemoryProvider, OsMemory};

// =============================================================================
// ScavengeIndex
// =============================================================================

/// Lock-free view of where scavengable pages are.
pub(crate) struct ScavengeIndex {
  /// Free, unscavenged pages per chunk. Stale between updates.
  counts: Box<[AtomicU16]>,
  /// One past the highest chunk freed into since the scavenger last looked.
  free_hwm: AtomicUsize,
}

impl ScavengeIndex {
  pub fn new(max_chunks: usize) -> Self {
    Self {
      counts: (0..max_chunks).map(|_| AtomicU16::new(0)).collect(),
      free_hwm: AtomicUsize::new(0),
    }
  }

  pub fn set(&self, ci: usize, pages: usize) {
    self.counts[ci].store(pages as u16, Ordering::Relaxed);
  }

  pub fn get(&self, ci: usize) -> usize {
    self.counts[ci].load(Ordering::Relaxed) as usize
  }

  // SeqCst pairs with the parked flag in `Signal`.
  pub fn note_free(&self, ci: usize) {
    self.free_hwm.fetch_max(ci + 1, Ordering::SeqCst);
  }

  pub fn take_high_water(&self) -> usize {
    self.free_hwm.swap(0, Ordering::SeqCst)
  }

  pub fn peek_high_water(&self) -> usize {
    self.free_hwm.load(Ordering::SeqCst)
  }

  /// Highest chunk below `end` with scavengable pages.
  pub fn find_below(&self, end: usize) -> Option<usize> {
    (0..end.min(self.counts.len())).rev().find(|&ci| self.get(ci) > 0)
  }
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScavengeState {
  Idle,
  Scanning,
  CandidateFound(usize),
  Verifying,
  Releasing { page: usize, npages: usize },
  Exhausted,
}

/// One scavenging cursor. Chunks at or above `search` are considered done
/// until a free above it pulls `search` back up.
pub(crate) struct Scavenger {
  state: ScavengeState,
  search: usize,
  track_frees: bool,
}

impl Scavenger {
  /// A cursor driven by frees, as the background thread uses it.
  pub fn new() -> Self {
    Self {
      state: ScavengeState::Idle,
      search: 0,
      track_frees: true,
    }
  }

  /// A one-shot cursor scanning down from chunk `end`.
  pub fn starting_at(end: usize) -> Self {
    Self {
      state: ScavengeState::Idle,
      search: end,
      track_frees: false,
    }
  }

  #[cfg(test)]
  pub fn state(&self) -> ScavengeState {
    self.state
  }

  /// Finds the next candidate chunk without the heap lock.
  pub fn scan<M: MemoryProvider>(&mut self, heap: &Heap<M>) -> Option<usize> {
    self.state = ScavengeState::Scanning;
    let index = &heap.published().index;
    if self.track_frees {
      self.search = self.search.max(index.take_high_water());
    }
    match index.find_below(self.search) {
      Some(ci) => {
        self.state = ScavengeState::CandidateFound(ci);
        Some(ci)
      }
      None => {
        self.state = ScavengeState::Exhausted;
        None
      }
    }
  }

  /// Verifies chunk `ci` under the lock and releases at most `max_pages` of
  /// it. Returns the bytes released.
  pub fn release<M: MemoryProvider>(
    &mut self,
    heap: &Heap<M>,
    ci: usize,
    max_pages: usize,
  ) -> usize {
    self.state = ScavengeState::Verifying;
    let reserved = heap.lock().reserve_scavenge(ci, max_pages);
    let Some((page, npages)) = reserved else {
      self.search = ci;
      self.state = ScavengeState::Idle;
      return 0;
    };

    self.state = ScavengeState::Releasing { page, npages };
    let (addr, len) = (heap.page_addr(page), npages * PAGE_SIZE);
    let released = match heap.memory().decommit(addr, len) {
      Ok(()) => {
        trace!("scavenger: released {npages} pages at {addr:#x}");
        true
      }
      Err(err) => {
        warn!("scavenger: decommit of {len} bytes at {addr:#x} failed: {err}");
        heap.published().stats.decommit_failed();
        false
      }
    };
    heap.lock().complete_scavenge(page, npages, released);

    // A failed chunk is skipped until a free above it.
    self.search = if released { ci + 1 } else { ci };
    self.state = ScavengeState::Idle;
    if released { len } else { 0 }
  }

  /// Advances through one full cycle. `None` means nothing is left to
  /// release; `Some(0)` that the candidate was stale or could not be
  /// released.
  pub fn scavenge_one<M: MemoryProvider>(
    &mut self,
    heap: &Heap<M>,
    max_bytes: usize,
  ) -> Option<usize> {
    let ci = self.scan(heap)?;
    Some(self.release(heap, ci, (max_bytes / PAGE_SIZE).max(1)))
  }
}

// =============================================================================
// Pacing
// =============================================================================

/// Proportional-integral controller with anti-windup and clamped output.
#[derive(Clone, Debug)]
pub(crate) struct PiController {
  kp: f64,
  ti: f64,
  tt: f64,
  min: f64,
  max: f64,
  err_integral: f64,
}

impl PiController {
  pub const fn new(kp: f64, ti: f64, tt: f64, min: f64, max: f64) -> Self {
    Self {
      kp,
      ti,
      tt,
      min,
      max,
      err_integral: 0.0,
    }
  }

  /// Output for `input` against `setpoint` over `period` nanoseconds. `None`
  /// if the controller hit a non-finite value and reset itself.
  pub fn next(&mut self, input: f64, setpoint: f64, period: f64) -> Option<f64> {
    let raw = self.kp * (setpoint - input) + self.err_integral;
    if !raw.is_finite() {
      self.reset();
      return None;
    }
    let output = raw.clamp(self.min, self.max);

    if self.ti != 0.0 && self.tt != 0.0 {
      self.err_integral +=
        (self.kp * period / self.ti) * (setpoint - input) + (period / self.tt) * (output - raw);
      if !self.err_integral.is_finite() {
        self.reset();
        return None;
      }
    }
    Some(output)
  }

  pub fn reset(&mut self) {
    self.err_integral = 0.0;
  }
}

const STARTING_SLEEP_RATIO: f64 = 0.001;
const MIN_WORK: Duration = Duration::from_millis(1);
const MAX_SLEEP: Duration = Duration::from_secs(1);
const COOLDOWN: Duration = Duration::from_secs(5);

/// Turns measured work into sleep time. The controller's output is the
/// ratio of work time to sleep time.
#[derive(Clone, Debug)]
pub(crate) struct Pacer {
  controller: PiController,
  sleep_ratio: f64,
  target: f64,
  cooldown: Duration,
  utilization: f64,
}

impl Pacer {
  /// `target` is the wanted fraction of one CPU, in `(0, 1]`.
  pub fn new(target: f64) -> Self {
    Self {
      controller: PiController::new(0.3375, 3.2e6, 1e9, 0.001, 1000.0),
      sleep_ratio: STARTING_SLEEP_RATIO,
      target,
      cooldown: Duration::ZERO,
      utilization: 0.0,
    }
  }

  #[cfg(test)]
  pub fn sleep_ratio(&self) -> f64 {
    self.sleep_ratio
  }

  pub fn utilization(&self) -> f64 {
    self.utilization
  }

  pub fn sleep_for(&self, worked: Duration) -> Duration {
    let worked = worked.max(MIN_WORK).as_secs_f64();
    Duration::from_secs_f64((worked / self.sleep_ratio).min(MAX_SLEEP.as_secs_f64()))
  }

  /// Feeds one work/sleep period back into the controller.
  pub fn observe(&mut self, worked: Duration, slept: Duration) {
    let worked = worked.max(MIN_WORK);
    let period = worked + slept;
    self.utilization = worked.as_secs_f64() / period.as_secs_f64();

    if !self.cooldown.is_zero() {
      self.cooldown = self.cooldown.saturating_sub(period);
      return;
    }
    let period_ns = period.as_nanos() as f64;
    match self.controller.next(self.utilization, self.target, period_ns) {
      Some(ratio) => self.sleep_ratio = ratio,
      None => {
        debug!("scavenger: pacing controller reset");
        self.sleep_ratio = STARTING_SLEEP_RATIO;
        self.cooldown = COOLDOWN;
      }
    }
    trace!(
      "scavenger: utilization {:.4}, sleep ratio {:.4}",
      self.utilization, self.sleep_ratio
    );
  }
}

// =============================================================================
// Background thread
// =============================================================================

const PARK_TIMEOUT: Duration = Duration::from_secs(1);

/// Wakes the background scavenger when frees give it new work.
#[derive(Default)]
pub(crate) struct Signal {
  parked: AtomicBool,
  stop: AtomicBool,
  running: AtomicBool,
  lock: Mutex<()>,
  cond: Condvar,
}

impl Signal {
  pub fn wake(&self) {
    if self.parked.load(Ordering::SeqCst) {
      let _guard = self.lock.lock();
      self.cond.notify_all();
    }
  }

  fn stopping(&self) -> bool {
    self.stop.load(Ordering::Acquire)
  }

  fn request_stop(&self) {
    self.stop.store(true, Ordering::Release);
    let _guard = self.lock.lock();
    self.cond.notify_all();
  }

  /// Blocks until woken, unless `has_work` already holds once parked is
  /// visible to freeing threads.
  fn park(&self, has_work: impl Fn() -> bool) {
    let mut guard = self.lock.lock();
    self.parked.store(true, Ordering::SeqCst);
    if !self.stopping() && !has_work() {
      self.cond.wait_for(&mut guard, PARK_TIMEOUT);
    }
    self.parked.store(false, Ordering::SeqCst);
  }

  /// Sleeps for `duration` or until stopped. Returns the time slept.
  fn sleep(&self, duration: Duration) -> Duration {
    let start = Instant::now();
    let mut guard = self.lock.lock();
    if !self.stopping() {
      self.cond.wait_for(&mut guard, duration);
    }
    start.elapsed()
  }
}

fn has_work<M: MemoryProvider>(heap: &Heap<M>) -> bool {
  let published = heap.published();
  published.stats.unscavenged_bytes() > heap.config().retained_goal
    && published.index.peek_high_water() > 0
}

fn run<M: MemoryProvider>(heap: &Heap<M>) {
  let signal = heap.signal();
  let quantum = heap.config().scavenge_quantum;
  let mut scavenger = Scavenger::new();
  let mut pacer = Pacer::new(heap.config().scavenge_percent / 100.0);

  while !signal.stopping() {
    let start = Instant::now();
    let mut exhausted = false;
    let mut released = 0;
    while start.elapsed() < MIN_WORK && !signal.stopping() {
      if heap.published().stats.unscavenged_bytes() <= heap.config().retained_goal {
        exhausted = true;
        break;
      }
      match scavenger.scavenge_one(heap, quantum) {
        Some(bytes) => released += bytes,
        None => {
          exhausted = true;
          break;
        }
      }
    }
    let worked = start.elapsed();
    if released > 0 {
      trace!("scavenger: released {released} bytes in {worked:?}");
    }

    if exhausted {
      signal.park(|| has_work(heap));
      continue;
    }
    let slept = signal.sleep(pacer.sleep_for(worked));
    pacer.observe(worked, slept);
    heap.published().stats.set_utilization(pacer.utilization());
  }
}

/// Owns the background scavenger thread of a heap. Dropping the handle stops
/// the thread and waits for it.
pub struct ScavengerHandle<M: MemoryProvider + 'static = OsMemory> {
  heap: Arc<Heap<M>>,
  thread: Option<JoinHandle<()>>,
}

impl<M: MemoryProvider + 'static> ScavengerHandle<M> {
  pub(crate) fn spawn(heap: &Arc<Heap<M>>) -> Result<Self> {
    let signal = heap.signal();
    if signal.running.swap(true, Ordering::AcqRel) {
      return Err(Error::ScavengerRunning);
    }
    signal.stop.store(false, Ordering::Release);

    let worker = Arc::clone(heap);
    let spawned = thread::Builder::new()
      .name("pagina-scavenger".into())
      .spawn(move || run(&*worker));
    match spawned {
      Ok(thread) => {
        debug!("scavenger: started");
        Ok(Self {
          heap: Arc::clone(heap),
          thread: Some(thread),
        })
      }
      Err(err) => {
        signal.running.store(false, Ordering::Release);
        Err(Error::Spawn(err))
      }
    }
  }

  /// Stops the thread and waits for it to exit.
  pub fn stop(mut self) {
    self.shutdown();
  }

  fn shutdown(&mut self) {
    let Some(thread) = self.thread.take() else {
      return;
    };
    let signal = self.heap.signal();
    signal.request_stop();
    if thread.join().is_err() {
      warn!("scavenger: thread panicked");
    }
    signal.running.store(false, Ordering::Release);
    debug!("scavenger: stopped");
  }
}

impl<M: MemoryProvider + 'static> Drop for ScavengerHandle<M> {
  fn drop(&mut self) {
    self.shutdown();
  }
}
