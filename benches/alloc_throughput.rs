use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pageheap::{ArenaId, PageHeap};
use std::hint::black_box;

const OPS: u64 = 10_000;

/// pageheap allocate/free round-trip throughput.
fn alloc_free(heap: &PageHeap, pages: usize) {
  for _ in 0..OPS {
    let id = heap
      .allocate_pages(ArenaId(0), pages, false, 0)
      .expect("allocation");
    black_box(id);
    heap.free_pages(id);
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");

  for pages in [1, 2, 4, 8, 16, 64, 256] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("pageheap", pages), &pages, |b, &pages| {
      let heap = PageHeap::new();
      b.iter(|| alloc_free(&heap, pages))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
