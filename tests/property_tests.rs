//! Property-based tests for the page heap.
//!
//! Random alloc/free interleavings must keep the address index, the filter
//! bitmap, and the live extent set mutually consistent.

use pageheap::{ArenaId, Extent, ExtentId, PAGE_SIZE, PageHeap};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
  /// Allocate this many pages (1..=64).
  Alloc(usize),
  /// Free the live extent at this position (modulo the live count).
  Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    (1usize..=64).prop_map(Op::Alloc),
    (0usize..1024).prop_map(Op::Free),
  ]
}

fn assert_disjoint(live: &[(ExtentId, Extent)]) {
  for (i, (_, a)) in live.iter().enumerate() {
    for (_, b) in &live[i + 1..] {
      assert!(
        a.end() <= b.address || b.end() <= a.address,
        "live extents overlap: {a:?} vs {b:?}"
      );
    }
  }
}

proptest! {
  /// No interleaving of allocations and frees may ever produce overlapping
  /// live extents, desynchronize the filter bitmap from its heaps, or leave
  /// the address index disagreeing with the live set.
  #[test]
  fn random_workload_preserves_invariants(ops in prop::collection::vec(op(), 1..120)) {
    let heap = PageHeap::new();
    let mut live: Vec<(ExtentId, Extent)> = Vec::new();

    for op in ops {
      match op {
        Op::Alloc(pages) => {
          let id = heap
            .allocate_pages(ArenaId(1), pages, false, 0)
            .expect("unbounded heap never reports exhaustion");
          let extent = heap.extent(id);
          prop_assert_eq!(extent.address % PAGE_SIZE, 0);
          prop_assert_eq!(extent.size, pages * PAGE_SIZE);
          live.push((id, extent));
        }
        Op::Free(pick) => {
          if live.is_empty() {
            continue;
          }
          let (id, extent) = live.swap_remove(pick % live.len());
          heap.free_pages(id);
          prop_assert_eq!(heap.lookup(extent.address), None);
        }
      }
      heap.verify();
      assert_disjoint(&live);
    }

    prop_assert_eq!(heap.stats().live_extents, live.len() as u64);
    for (id, extent) in &live {
      prop_assert_eq!(heap.lookup(extent.address), Some(*id));
    }

    for (id, _) in live {
      heap.free_pages(id);
    }
    let stats = heap.stats();
    prop_assert_eq!(stats.pages_reserved, 0);
    prop_assert_eq!(stats.live_extents, 0);
    heap.verify();
  }

  /// Freeing and reallocating the same shape of request converges on the
  /// same addresses: first-fit reuse means no unbounded address growth.
  #[test]
  fn reallocation_reuses_freed_space(pages in 1usize..=64, rounds in 1usize..8) {
    let heap = PageHeap::new();
    let (first, extent) = {
      let id = heap.allocate_pages(ArenaId(0), pages, false, 0).expect("allocation");
      (id, heap.extent(id))
    };
    heap.free_pages(first);

    for _ in 0..rounds {
      let id = heap.allocate_pages(ArenaId(0), pages, false, 0).expect("allocation");
      prop_assert_eq!(heap.extent(id).address, extent.address);
      heap.free_pages(id);
    }
    prop_assert_eq!(heap.stats().huge_pages, 1);
  }
}
