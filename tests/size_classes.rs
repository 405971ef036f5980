use pageheap::{NO_CLASS, PAGES_PER_HUGE_PAGE, allocation_class, free_space_class};

/// Largest page count of each allocation class, in class order: exact buckets
/// up to 8 pages, then 4 widening steps per doubling.
const LADDER: [usize; 24] = [
  1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 32, 40, 48, 56, 64, 80, 96, 112, 128,
];

#[test]
fn ladder_boundaries_match() {
  for (class, &bound) in LADDER.iter().enumerate() {
    assert_eq!(
      allocation_class(bound) as usize,
      class,
      "page count {bound} should close class {class}"
    );
    assert_eq!(
      allocation_class(bound + 1) as usize,
      class + 1,
      "page count {} should open class {}",
      bound + 1,
      class + 1
    );
  }
}

#[test]
fn zero_maps_to_sentinel() {
  assert_eq!(allocation_class(0), NO_CLASS);
  assert_eq!(free_space_class(0), NO_CLASS);
}

#[test]
fn allocation_class_is_monotone() {
  let mut last = allocation_class(1);
  for pages in 2..=4 * PAGES_PER_HUGE_PAGE {
    let class = allocation_class(pages);
    assert!(
      class >= last,
      "class regressed from {last} to {class} at {pages} pages"
    );
    last = class;
  }
}

#[test]
fn free_space_class_is_one_below_next_allocation_class() {
  for run in 1..=4 * PAGES_PER_HUGE_PAGE {
    assert_eq!(free_space_class(run), allocation_class(run + 1) - 1);
  }
}

/// The soundness anchor of the whole index: any request whose allocation
/// class is at most a run's free-space class must fit in that run.
#[test]
fn free_space_class_never_overpromises() {
  for run in 1..=PAGES_PER_HUGE_PAGE {
    let guaranteed = free_space_class(run);
    for request in 1..=PAGES_PER_HUGE_PAGE {
      if allocation_class(request) <= guaranteed {
        assert!(
          request <= run,
          "class {guaranteed} run of {run} pages cannot hold {request} pages"
        );
      }
    }
  }
}

#[test]
fn exact_classes_cover_small_counts() {
  for pages in 1..=8 {
    assert_eq!(allocation_class(pages) as usize, pages - 1);
  }
}
