//! Arena directory: sparse map from arena index to the chunk bitmaps it owns.
//!
//! Slots exist for every arena the reservation can hold, but chunk metadata
//! is only allocated when an arena joins the heap. Arenas never leave.

use crate::CHUNKS_PER_ARENA;
use crate::bitmap::ChunkBitmap;

struct ArenaChunks {
  chunks: [ChunkBitmap; CHUNKS_PER_ARENA],
}

pub struct ArenaDirectory {
  arenas: Vec<Option<Box<ArenaChunks>>>,
  mapped: usize,
}

impl ArenaDirectory {
  pub fn new(max_arenas: usize) -> Self {
    Self {
      arenas: (0..max_arenas).map(|_| None).collect(),
      mapped: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.arenas.len()
  }

  pub fn mapped(&self) -> usize {
    self.mapped
  }

  /// Creates metadata for `arena`. Its pages start free and scavenged.
  pub fn insert(&mut self, arena: usize) {
    let slot = &mut self.arenas[arena];
    assert!(slot.is_none(), "arena {arena} inserted twice");
    *slot = Some(Box::new(ArenaChunks {
      chunks: core::array::from_fn(|_| ChunkBitmap::fresh()),
    }));
    self.mapped += 1;
  }

  #[inline]
  pub fn contains_chunk(&self, ci: usize) -> bool {
    matches!(self.arenas.get(ci / CHUNKS_PER_ARENA), Some(Some(_)))
  }

  #[inline]
  pub fn chunk(&self, ci: usize) -> &ChunkBitmap {
    match self.arenas.get(ci / CHUNKS_PER_ARENA) {
      Some(Some(arena)) => &arena.chunks[ci % CHUNKS_PER_ARENA],
      _ => panic!("chunk {ci} is not part of the heap"),
    }
  }

  #[inline]
  pub fn chunk_mut(&mut self, ci: usize) -> &mut ChunkBitmap {
    match self.arenas.get_mut(ci / CHUNKS_PER_ARENA) {
      Some(Some(arena)) => &mut arena.chunks[ci % CHUNKS_PER_ARENA],
      _ => panic!("chunk {ci} is not part of the heap"),
    }
  }
}
