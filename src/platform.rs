//! Platform collaborators: virtual memory and the execution-context id.

use std::io;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{ARENA_SIZE, align_up};

// =============================================================================
// Virtual memory
// =============================================================================

/// Virtual memory operations the heap relies on. Addresses are plain
/// integers; the heap never dereferences them itself.
pub trait MemoryProvider: Send + Sync {
  /// Reserves `size` bytes of address space with no access.
  fn reserve(&self, size: usize) -> io::Result<usize>;
  /// Makes `[addr, addr + size)` readable and writable.
  fn commit(&self, addr: usize, size: usize) -> io::Result<()>;
  /// Returns the physical memory behind the range to the OS. The range stays
  /// committed: it reads as zero and is repopulated on touch.
  fn decommit(&self, addr: usize, size: usize) -> io::Result<()>;
  /// Revokes all access to the range.
  fn protect_none(&self, addr: usize, size: usize) -> io::Result<()>;
  /// Gives back a whole reservation.
  fn release(&self, addr: usize, size: usize);
}

/// The host OS via mmap, mprotect and madvise.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsMemory;

impl MemoryProvider for OsMemory {
  fn reserve(&self, size: usize) -> io::Result<usize> {
    // SAFETY: a fresh anonymous mapping at an address of the kernel's choosing.
    let ptr = unsafe {
      libc::mmap(
        null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
      )
    };
    if ptr == libc::MAP_FAILED {
      return Err(io::Error::last_os_error());
    }
    Ok(ptr as usize)
  }

  fn commit(&self, addr: usize, size: usize) -> io::Result<()> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    // SAFETY: the heap only passes ranges inside its own reservation.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot) };
    if rc != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  #[cfg(feature = "release-mem")]
  fn decommit(&self, addr: usize, size: usize) -> io::Result<()> {
    // SAFETY: the range is free pages of this heap; nothing reads them until
    // they are allocated again.
    let rc = unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTNEED) };
    if rc != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  #[cfg(not(feature = "release-mem"))]
  fn decommit(&self, _addr: usize, _size: usize) -> io::Result<()> {
    Ok(())
  }

  fn protect_none(&self, addr: usize, size: usize) -> io::Result<()> {
    // SAFETY: the range was never handed out to a caller.
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, size, libc::PROT_NONE) };
    if rc != 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(())
  }

  fn release(&self, addr: usize, size: usize) {
    // SAFETY: the whole reservation, unmapped once when its heap is dropped.
    unsafe { libc::munmap(addr as *mut libc::c_void, size) };
  }
}

/// Address-only provider: hands out disjoint, never-mapped ranges and
/// records what the heap asked of it. Failures can be injected.
#[derive(Debug)]
pub struct SimMemory {
  next: AtomicUsize,
  failing_commits: AtomicUsize,
  failing_decommits: AtomicBool,
  commit_limit: AtomicUsize,
  committed: AtomicUsize,
  protected: AtomicUsize,
  decommitted: Mutex<Vec<(usize, usize)>>,
}

/// First address handed out by [`SimMemory`]. Far from anything real.
const SIM_BASE: usize = 1 << 44;

impl Default for SimMemory {
  fn default() -> Self {
    Self::new()
  }
}

impl SimMemory {
  pub fn new() -> Self {
    Self {
      next: AtomicUsize::new(SIM_BASE),
      failing_commits: AtomicUsize::new(0),
      failing_decommits: AtomicBool::new(false),
      commit_limit: AtomicUsize::new(usize::MAX),
      committed: AtomicUsize::new(0),
      protected: AtomicUsize::new(0),
      decommitted: Mutex::new(Vec::new()),
    }
  }

  /// Refuses the next `n` commits.
  pub fn fail_commits(&self, n: usize) {
    self.failing_commits.store(n, Ordering::Relaxed);
  }

  /// Refuses any commit that would take the committed total past `bytes`.
  pub fn limit_commits(&self, bytes: usize) {
    self.commit_limit.store(bytes, Ordering::Relaxed);
  }

  pub fn fail_decommits(&self, fail: bool) {
    self.failing_decommits.store(fail, Ordering::Relaxed);
  }

  pub fn committed_bytes(&self) -> usize {
    self.committed.load(Ordering::Relaxed)
  }

  pub fn protected_bytes(&self) -> usize {
    self.protected.load(Ordering::Relaxed)
  }

  /// Every successfully decommitted `(addr, size)` range, in order.
  pub fn decommitted(&self) -> Vec<(usize, usize)> {
    self.decommitted.lock().clone()
  }
}

impl MemoryProvider for SimMemory {
  fn reserve(&self, size: usize) -> io::Result<usize> {
    let span = align_up(size, ARENA_SIZE) + ARENA_SIZE;
    Ok(self.next.fetch_add(span, Ordering::Relaxed))
  }

  fn commit(&self, _addr: usize, size: usize) -> io::Result<()> {
    let refused = self
      .failing_commits
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
      .is_ok();
    if refused {
      return Err(io::Error::from(io::ErrorKind::OutOfMemory));
    }
    let limit = self.commit_limit.load(Ordering::Relaxed);
    self
      .committed
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
        total.checked_add(size).filter(|&n| n <= limit)
      })
      .map_err(|_| io::Error::from(io::ErrorKind::OutOfMemory))?;
    Ok(())
  }

  fn decommit(&self, addr: usize, size: usize) -> io::Result<()> {
    if self.failing_decommits.load(Ordering::Relaxed) {
      return Err(io::Error::from(io::ErrorKind::PermissionDenied));
    }
    self.decommitted.lock().push((addr, size));
    Ok(())
  }

  fn protect_none(&self, _addr: usize, size: usize) -> io::Result<()> {
    self.protected.fetch_add(size, Ordering::Relaxed);
    Ok(())
  }

  fn release(&self, _addr: usize, _size: usize) {}
}

// =============================================================================
// Execution context
// =============================================================================

// Each thread gets a different ID
#[cfg_attr(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"), allow(dead_code))]
fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}

/// Which per-core cache the caller should use. Approximate: the caller may
/// migrate right after, so nothing may depend on it being stable.
// Only supported in the latest x86 CPUs. Seems to be the fastest way to access CPU ID
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
pub fn cpu_id() -> usize {
  let cpu: u64;
  // SAFETY: rdpid only writes the output register.
  unsafe {
    // nomem - Doesn't read/write memory
    // nostack - Doesn't touch the stack pointer
    // preserves_flags - Doesn't modify CPU flags (EFLAGS/RFLAGS)
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

/// Which per-core cache the caller should use. Approximate: the caller may
/// migrate right after, so nothing may depend on it being stable.
#[cfg(all(target_os = "linux", not(all(target_arch = "x86_64", feature = "rdpid"))))]
pub fn cpu_id() -> usize {
  // SAFETY: no arguments, no memory touched.
  let cpu = unsafe { libc::sched_getcpu() };
  if cpu < 0 {
    return thread_id_u32() as usize;
  }
  cpu as usize
}

/// Which per-core cache the caller should use. Without a cheap CPU number
/// the thread id stands in for it.
#[cfg(not(target_os = "linux"))]
pub fn cpu_id() -> usize {
  thread_id_u32() as usize
}
