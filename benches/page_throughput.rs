use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pagina::{ARENA_SIZE, CACHE_THRESHOLD, Config, Heap, SimMemory};
use std::hint::black_box;

const OPS: u64 = 10_000;

fn heap() -> Heap<SimMemory> {
  let config = Config::default()
    .with_reservation(64 * ARENA_SIZE)
    .with_cache_slots(1);
  Heap::with_provider(config, SimMemory::new()).expect("heap")
}

/// alloc/free pairs through `Heap::alloc_pages`.
fn heap_alloc_free(heap: &Heap<SimMemory>, npages: usize) {
  for _ in 0..OPS {
    let ptr = heap.alloc_pages(npages).expect("alloc");
    black_box(ptr);
    heap.free_pages(ptr, npages);
  }
}

/// Allocations served by a held cache handle, refilled on a miss.
fn cached_alloc(heap: &Heap<SimMemory>, npages: usize) {
  let mut cache = heap.cache();
  let mut live = Vec::with_capacity(OPS as usize);
  for _ in 0..OPS {
    let ptr = match cache.try_alloc(npages).expect("alloc") {
      Some(ptr) => ptr,
      None => cache.alloc(npages).expect("alloc"),
    };
    live.push(black_box(ptr));
  }
  cache.flush();
  drop(cache);
  for ptr in live {
    heap.free_pages(ptr, npages);
  }
}

fn benchmark_page_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("page_throughput");
  let heap = heap();

  for npages in [1, 4, CACHE_THRESHOLD, 64] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("alloc_free", npages), &npages, |b, &npages| {
      b.iter(|| heap_alloc_free(&heap, npages))
    });

    if npages <= CACHE_THRESHOLD {
      group.bench_with_input(BenchmarkId::new("cached", npages), &npages, |b, &npages| {
        b.iter(|| cached_alloc(&heap, npages))
      });
    }
  }

  group.finish();
}

fn benchmark_cpu_id(c: &mut Criterion) {
  let mut group = c.benchmark_group("cpu_id");
  group.throughput(Throughput::Elements(1));
  group.bench_function("cpu_id", |b| b.iter(|| black_box(pagina::platform::cpu_id())));
  group.finish();
}

criterion_group!(benches, benchmark_page_throughput, benchmark_cpu_id);
criterion_main!(benches);
