use std::io;

/// Recoverable failures surfaced by the heap.
///
/// Precondition violations (zero-length requests, misaligned frees) and
/// corrupted summaries are not represented here: they panic.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("failed to reserve {size} bytes of address space")]
  Reserve {
    size: usize,
    #[source]
    source: io::Error,
  },

  #[error("out of memory: platform refused to commit memory for {npages} pages")]
  OutOfMemory {
    npages: usize,
    #[source]
    source: io::Error,
  },

  #[error("address space exhausted: {npages} pages do not fit in the {reserved} byte reservation")]
  AddressSpaceExhausted { npages: usize, reserved: usize },

  #[error("invalid configuration: {0}")]
  InvalidConfig(&'static str),

  #[error("a background scavenger is already running for this heap")]
  ScavengerRunning,

  #[error("failed to spawn the scavenger thread")]
  Spawn(#[source] io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
