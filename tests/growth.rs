use std::ptr::NonNull;

use pagina::{ARENA_PAGES, ARENA_SIZE, Config, Error, Heap, PAGE_SIZE, SimMemory};

fn sim_heap(arenas: usize) -> Heap<SimMemory> {
  let config = Config::default()
    .with_reservation(arenas * ARENA_SIZE)
    .with_cache_slots(2);
  Heap::with_provider(config, SimMemory::new()).unwrap()
}

fn offset(base: NonNull<u8>, ptr: NonNull<u8>) -> usize {
  (ptr.as_ptr() as usize - base.as_ptr() as usize) / PAGE_SIZE
}

#[test]
fn first_fit_reuses_a_freed_low_region() {
  let heap = sim_heap(1);
  let a = heap.alloc_pages(10).unwrap();
  let b = heap.alloc_pages(5).unwrap();
  assert_eq!(offset(a, b), 10);
  heap.free_pages(a, 10);
  let c = heap.alloc_pages(3).unwrap();
  assert_eq!(offset(a, c), 0);

  // The next fit above the reused pages is still below `b`.
  let d = heap.alloc_pages(7).unwrap();
  assert_eq!(offset(a, d), 3);
  let e = heap.alloc_pages(1).unwrap();
  assert_eq!(offset(a, e), 15);
}

#[test]
fn idle_cache_pages_do_not_exhaust_the_heap() {
  let config = Config::default()
    .with_reservation(ARENA_SIZE)
    .with_cache_slots(1);
  let heap = Heap::with_provider(config, SimMemory::new()).unwrap();
  let mut cache = heap.cache();
  let a = cache.alloc(1).unwrap();
  let b = cache.alloc(1).unwrap();
  drop(cache);
  heap.free_pages(a, 1);

  let big = heap.alloc_pages(ARENA_PAGES - 2).unwrap();
  assert_eq!(offset(a, big), 2);
  assert_eq!(offset(a, b), 1);
  assert!(matches!(
    heap.alloc_pages(2),
    Err(Error::AddressSpaceExhausted { npages: 2, .. })
  ));
  assert_eq!(heap.alloc_pages(1).unwrap(), a);
}

#[test]
fn allocations_span_arena_boundaries() {
  let heap = sim_heap(4);
  let a = heap.alloc_pages(ARENA_PAGES - 100).unwrap();
  let b = heap.alloc_pages(300).unwrap();
  assert_eq!(offset(a, b), ARENA_PAGES - 100);
  let stats = heap.stats();
  assert_eq!(stats.mapped_bytes, 2 * ARENA_SIZE);
  assert_eq!(stats.growths, 2);

  let c = heap.alloc_pages(2 * ARENA_PAGES).unwrap();
  assert_eq!(offset(a, c), ARENA_PAGES + 200);
  assert_eq!(heap.stats().mapped_bytes, 4 * ARENA_SIZE);
}

#[test]
fn freed_low_pages_are_reused_before_growth() {
  let heap = sim_heap(2);
  let a = heap.alloc_pages(ARENA_PAGES / 2).unwrap();
  let b = heap.alloc_pages(ARENA_PAGES / 2).unwrap();
  heap.free_pages(a, ARENA_PAGES / 2);
  let c = heap.alloc_pages(ARENA_PAGES / 4).unwrap();
  assert_eq!(c, a);
  assert_eq!(heap.stats().growths, 1);
  heap.free_pages(b, ARENA_PAGES / 2);
  heap.free_pages(c, ARENA_PAGES / 4);
}

#[test]
fn exhaustion_is_recoverable() {
  let heap = sim_heap(2);
  let a = heap.alloc_pages(ARENA_PAGES).unwrap();
  let b = heap.alloc_pages(ARENA_PAGES).unwrap();
  match heap.alloc_pages(1) {
    Err(Error::AddressSpaceExhausted { npages: 1, reserved }) => {
      assert_eq!(reserved, 2 * ARENA_SIZE)
    }
    other => panic!("expected exhaustion, got {other:?}"),
  }
  assert!(matches!(
    heap.alloc_pages(3 * ARENA_PAGES),
    Err(Error::AddressSpaceExhausted { .. })
  ));

  heap.free_pages(b, ARENA_PAGES);
  assert_eq!(heap.alloc_pages(ARENA_PAGES).unwrap(), b);
  heap.free_pages(a, ARENA_PAGES);
}

#[test]
fn out_of_memory_after_bounded_retries() {
  let config = Config::default()
    .with_reservation(ARENA_SIZE)
    .with_commit_retries(1);
  let heap = Heap::with_provider(config, SimMemory::new()).unwrap();
  heap.memory().fail_commits(2);

  let err = heap.alloc_pages(40).unwrap_err();
  assert!(matches!(err, Error::OutOfMemory { npages: 40, .. }));
  assert!(std::error::Error::source(&err).is_some());
  assert_eq!(heap.stats().growths, 0);
}

#[test]
fn invalid_config_is_rejected() {
  let config = Config::default().with_reservation(ARENA_SIZE / 2);
  assert!(matches!(
    Heap::with_provider(config, SimMemory::new()),
    Err(Error::InvalidConfig(_))
  ));
}

#[test]
fn os_backed_pages_are_usable() {
  let config = Config::default()
    .with_reservation(2 * ARENA_SIZE)
    .with_cache_slots(1);
  let heap = Heap::new(config).unwrap();

  let p = heap.alloc_pages(4).unwrap();
  // SAFETY: four committed pages owned by this test until freed.
  let bytes = unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), 4 * PAGE_SIZE) };
  bytes.fill(0xAB);
  assert!(bytes.iter().all(|&b| b == 0xAB));
  heap.free_pages(p, 4);

  assert!(heap.scavenge(usize::MAX) > 0);
  let q = heap.alloc_pages(4).unwrap();
  // SAFETY: as above; scavenged pages are committed again on allocation.
  unsafe { q.as_ptr().write_bytes(0xCD, 4 * PAGE_SIZE) };
  heap.free_pages(q, 4);
}
