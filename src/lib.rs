//! Page-run allocator for a garbage-collected runtime.
//!
//! Carves fixed-size pages out of 2 MiB huge pages and hands contiguous runs
//! to higher-level arenas. Free space is indexed by a segregated table of
//! descriptor heaps keyed by an approximate logarithmic size class, mirrored
//! by a 64-bit filter bitmap so "find a region big enough" is a single
//! bit-scan rather than a search.

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Granularity of a single allocatable page.
pub const PAGE_SIZE: usize = 1 << 12; // 4KB

/// Size of the huge pages the allocator carves runs out of.
pub const HUGE_PAGE_SIZE: usize = 1 << 21; // 2MB

/// Pages per huge page.
pub const PAGES_PER_HUGE_PAGE: usize = HUGE_PAGE_SIZE / PAGE_SIZE;

/// Words in a huge page's occupancy bitmap.
const OCCUPANCY_WORDS: usize = PAGES_PER_HUGE_PAGE / 64;

/// Width of the free-space class table and its filter bitmap.
pub const NUM_FREE_CLASSES: usize = 64;

/// Class returned for inputs with no representable bucket (page count 0).
pub const NO_CLASS: u8 = 255;

/// Number of exact one-page-per-bucket classes before buckets widen.
const CLASSES_LINEAR: usize = 8;

/// Largest page count whose class still fits the 64-entry filter.
const MAX_CLASSED_PAGES: usize = 1 << 17;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(HUGE_PAGE_SIZE.is_power_of_two());
const _: () = assert!(PAGES_PER_HUGE_PAGE % 64 == 0);
const _: () = assert!((allocation_class(PAGES_PER_HUGE_PAGE) as usize) < NUM_FREE_CLASSES);
const _: () = assert!((free_space_class(PAGES_PER_HUGE_PAGE) as usize) < NUM_FREE_CLASSES);
const _: () = assert!(allocation_class(MAX_CLASSED_PAGES) as usize == NUM_FREE_CLASSES - 1);

// =============================================================================
// Size Classes
// =============================================================================

/// Bucket a request's page count into its allocation class.
///
/// Counts 1..=8 get one bucket each. Above that, each doubling is split into
/// 4 sub-buckets, giving the boundary ladder 1,2,...,8,10,12,14,16,20,24,...
/// A request is satisfiable by any free run whose free-space class is at
/// least this class.
#[inline]
pub const fn allocation_class(page_count: usize) -> u8 {
  if page_count == 0 {
    return NO_CLASS;
  }
  assert!(page_count <= MAX_CLASSED_PAGES);
  if page_count <= CLASSES_LINEAR {
    return (page_count - 1) as u8;
  }
  let n = page_count - 1;
  let log2 = (usize::BITS - 1 - n.leading_zeros()) as usize;
  let shift = log2 - 2;
  (4 * shift + (n >> shift)) as u8
}

/// Bucket a free run's length into the largest allocation class it is
/// guaranteed to satisfy.
///
/// One below `allocation_class(len + 1)`: a run must be strictly larger than
/// a class's ladder entry to be usable at that class without re-deriving
/// exact thresholds. A set filter bit at class `i` therefore always means
/// "some descriptor satisfies class <= i".
#[inline]
pub const fn free_space_class(free_run_len: usize) -> u8 {
  if free_run_len == 0 {
    return NO_CLASS;
  }
  allocation_class(free_run_len + 1) - 1
}

// =============================================================================
// Errors
// =============================================================================

/// Allocation failure taxonomy. Both variants are propagated to the caller,
/// never retried internally; triggering a collection or growing the heap is
/// a caller policy decision.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  /// The huge-page source has no more address space (or hit its budget).
  #[error("huge page source exhausted")]
  AddressSpaceExhausted,
  /// The metadata pool cannot produce another extent record.
  #[error("extent metadata pool exhausted")]
  MetadataExhausted,
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Let the kernel reclaim the physical memory behind a fully free huge page.
/// The mapping stays valid and reads back as zero pages on reuse.
#[cfg(feature = "release-mem")]
unsafe fn os_release(ptr: *mut u8, size: usize) {
  unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) };
}

// =============================================================================
// Handles
// =============================================================================

/// Handle to a huge-page descriptor record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId(u32);

impl DescriptorId {
  #[inline]
  fn index(self) -> usize {
    self.0 as usize
  }
}

/// Handle to a live extent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentId(u32);

impl ExtentId {
  #[inline]
  fn index(self) -> usize {
    self.0 as usize
  }
}

/// Opaque identity of the arena an extent was allocated for. The allocator
/// stores it and hands it back; it never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaId(pub u32);

// =============================================================================
// Extent Records
// =============================================================================

/// One allocated, contiguous run of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
  /// Page-aligned start address.
  pub address: usize,
  /// Run length in bytes, a multiple of `PAGE_SIZE`.
  pub size: usize,
  /// Arena the run was allocated for.
  pub arena: ArenaId,
  /// Descriptor of the huge page backing this run.
  pub descriptor: DescriptorId,
  /// Whether the run's interior is subdivided as a small-object slab.
  pub is_slab: bool,
  /// Slab size class; opaque metadata stored for the owner.
  pub size_class: u8,
}

impl Extent {
  /// One past the last byte of the run.
  #[inline]
  pub fn end(&self) -> usize {
    self.address + self.size
  }
}

/// Fixed-size record pool standing in for the runtime's base metadata
/// allocator. Freed records are recycled through a free list.
struct ExtentPool {
  slots: Mutex<ExtentSlots>,
}

struct ExtentSlots {
  records: Vec<Option<Extent>>,
  free: Vec<u32>,
  cap: Option<usize>,
}

impl ExtentPool {
  fn new(cap: Option<usize>) -> Self {
    Self {
      slots: Mutex::new(ExtentSlots {
        records: Vec::new(),
        free: Vec::new(),
        cap,
      }),
    }
  }

  /// Reserve an empty record slot. Returns `None` when the pool is capped
  /// out, which surfaces as metadata exhaustion.
  fn reserve_record(&self) -> Option<ExtentId> {
    let mut slots = self.slots.lock();
    if let Some(slot) = slots.free.pop() {
      return Some(ExtentId(slot));
    }
    if let Some(cap) = slots.cap
      && slots.records.len() >= cap
    {
      return None;
    }
    let slot = slots.records.len() as u32;
    slots.records.push(None);
    Some(ExtentId(slot))
  }

  fn commit(&self, id: ExtentId, extent: Extent) {
    let mut slots = self.slots.lock();
    debug_assert!(slots.records[id.index()].is_none());
    slots.records[id.index()] = Some(extent);
  }

  /// Give back a reserved-but-unpopulated slot after a failed allocation.
  fn abandon(&self, id: ExtentId) {
    let mut slots = self.slots.lock();
    debug_assert!(slots.records[id.index()].is_none());
    slots.free.push(id.0);
  }

  fn get(&self, id: ExtentId) -> Extent {
    let slots = self.slots.lock();
    slots.records[id.index()].expect("stale extent id")
  }

  fn release_record(&self, id: ExtentId) {
    let mut slots = self.slots.lock();
    let taken = slots.records[id.index()].take();
    assert!(taken.is_some(), "extent record freed twice");
    slots.free.push(id.0);
  }
}

// =============================================================================
// Address Index
// =============================================================================

/// Maps an extent's start address back to its record, for lookups from
/// unrelated threads (write barriers, conservative scans). Mutations happen
/// outside the central mutex; a reader racing a removal may see either state.
struct AddressIndex {
  map: RwLock<HashMap<usize, ExtentId>>,
}

impl AddressIndex {
  fn new() -> Self {
    Self {
      map: RwLock::new(HashMap::new()),
    }
  }

  fn publish(&self, address: usize, id: ExtentId) {
    let stale = self.map.write().insert(address, id);
    debug_assert!(stale.is_none(), "address {address:#x} published twice");
  }

  fn remove(&self, address: usize) {
    let removed = self.map.write().remove(&address);
    debug_assert!(removed.is_some(), "address {address:#x} was not published");
  }

  fn lookup(&self, address: usize) -> Option<ExtentId> {
    self.map.read().get(&address).copied()
  }
}

// =============================================================================
// Huge-Page Descriptor
// =============================================================================

/// Where a descriptor currently lives in the free-space index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
  /// Fresh from the source, not yet indexed. Transient inside an operation.
  Unregistered,
  /// Linked into the heap for this free-space class.
  InHeap(u8),
  /// No reservable pages left; absent from every heap.
  Full,
}

/// Per-huge-page occupancy bookkeeping. `longest_free_run` must be exact
/// after every reserve and release; the free-space index classifies
/// descriptors from it.
struct HugePage {
  base: usize,
  occupancy: [u64; OCCUPANCY_WORDS],
  longest_free_run: u32,
  free_pages: u32,
  state: Residency,
  prev: Option<DescriptorId>,
  next: Option<DescriptorId>,
}

impl HugePage {
  fn new(base: usize) -> Self {
    debug_assert!(base % HUGE_PAGE_SIZE == 0);
    Self {
      base,
      occupancy: [0; OCCUPANCY_WORDS],
      longest_free_run: PAGES_PER_HUGE_PAGE as u32,
      free_pages: PAGES_PER_HUGE_PAGE as u32,
      state: Residency::Unregistered,
      prev: None,
      next: None,
    }
  }

  #[inline]
  fn full(&self) -> bool {
    self.free_pages == 0
  }

  #[inline]
  fn is_free(&self, page: usize) -> bool {
    self.occupancy[page / 64] & (1u64 << (page % 64)) == 0
  }

  /// Reserve the lowest run of `count` free pages and return its page
  /// offset. The caller checked `count <= longest_free_run`.
  fn reserve(&mut self, count: usize) -> usize {
    assert!(
      count >= 1 && count <= self.longest_free_run as usize,
      "reserve of {count} pages exceeds longest free run {}",
      self.longest_free_run
    );
    let offset = self
      .first_fit(count)
      .expect("longest_free_run admitted the request");
    for page in offset..offset + count {
      debug_assert!(self.is_free(page));
      self.occupancy[page / 64] |= 1u64 << (page % 64);
    }
    self.free_pages -= count as u32;
    self.longest_free_run = self.compute_longest_free_run() as u32;
    offset
  }

  /// Return `count` pages starting at `offset`. Freeing a page that is not
  /// reserved means the caller's extent bookkeeping is corrupt.
  fn release(&mut self, offset: usize, count: usize) {
    debug_assert!(count >= 1 && offset + count <= PAGES_PER_HUGE_PAGE);
    for page in offset..offset + count {
      assert!(!self.is_free(page), "page {page} released twice");
      self.occupancy[page / 64] &= !(1u64 << (page % 64));
    }
    self.free_pages += count as u32;
    self.longest_free_run = self.compute_longest_free_run() as u32;
  }

  /// First-fit scan for `count` contiguous free pages.
  fn first_fit(&self, count: usize) -> Option<usize> {
    let mut run_start = 0;
    let mut run_len = 0;
    let mut page = 0;
    while page < PAGES_PER_HUGE_PAGE {
      // Skip fully reserved words when no run is being extended.
      if run_len == 0 && page % 64 == 0 && self.occupancy[page / 64] == u64::MAX {
        page += 64;
        continue;
      }
      if self.is_free(page) {
        if run_len == 0 {
          run_start = page;
        }
        run_len += 1;
        if run_len == count {
          return Some(run_start);
        }
      } else {
        run_len = 0;
      }
      page += 1;
    }
    None
  }

  fn compute_longest_free_run(&self) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for &word in &self.occupancy {
      if word == 0 {
        run += 64;
        continue;
      }
      if word == u64::MAX {
        longest = longest.max(run);
        run = 0;
        continue;
      }
      for bit in 0..64 {
        if word & (1u64 << bit) == 0 {
          run += 1;
        } else {
          longest = longest.max(run);
          run = 0;
        }
      }
    }
    longest.max(run)
  }

  fn count_free_pages(&self) -> usize {
    self
      .occupancy
      .iter()
      .map(|word| word.count_zeros() as usize)
      .sum()
  }
}

// =============================================================================
// Huge-Page Source
// =============================================================================

struct MmapRegion {
  raw: usize,
  len: usize,
}

/// Supplies whole, untouched huge pages on demand, mmap-backed. Mappings are
/// over-allocated by one huge page so the usable base can be aligned up.
struct HugePageSource {
  regions: Vec<MmapRegion>,
  max_huge_pages: Option<usize>,
}

impl HugePageSource {
  fn new(max_huge_pages: Option<usize>) -> Self {
    Self {
      regions: Vec::new(),
      max_huge_pages,
    }
  }

  /// Map one fresh huge page and return its aligned base, or `None` when the
  /// budget or the address space is exhausted.
  fn obtain_fresh(&mut self) -> Option<usize> {
    if let Some(cap) = self.max_huge_pages
      && self.regions.len() >= cap
    {
      debug!("huge page budget of {cap} exhausted");
      return None;
    }
    let len = HUGE_PAGE_SIZE + HUGE_PAGE_SIZE;
    let raw = unsafe { os_mmap(len) };
    if raw.is_null() {
      warn!("huge page mmap of {len} bytes failed");
      return None;
    }
    let base = align_up(raw as usize, HUGE_PAGE_SIZE);
    self.regions.push(MmapRegion {
      raw: raw as usize,
      len,
    });
    debug!("mapped huge page at {base:#x}");
    Some(base)
  }
}

impl Drop for HugePageSource {
  fn drop(&mut self) {
    for region in &self.regions {
      unsafe { os_munmap(region.raw as *mut u8, region.len) };
    }
  }
}

// =============================================================================
// Free-Space Index
// =============================================================================

/// Everything the central mutex guards: the descriptor table, the segregated
/// heaps with their filter bitmap, and the huge-page source. Descriptor
/// reservation state is only ever mutated through this struct, so holding
/// `&mut Central` is the lock-discipline proof.
struct Central {
  descriptors: Vec<HugePage>,
  heads: [Option<DescriptorId>; NUM_FREE_CLASSES],
  bitmap: u64,
  source: HugePageSource,
}

impl Central {
  fn new(source: HugePageSource) -> Self {
    Self {
      descriptors: Vec::new(),
      heads: [None; NUM_FREE_CLASSES],
      bitmap: 0,
      source,
    }
  }

  /// Pop a descriptor from the smallest class that can satisfy
  /// `required_class`, or `None` if no registered descriptor qualifies.
  fn take_sufficient(&mut self, required_class: u8) -> Option<DescriptorId> {
    debug_assert!((required_class as usize) < NUM_FREE_CLASSES);
    let hits = self.bitmap & (u64::MAX << required_class);
    if hits == 0 {
      return None;
    }
    let class = hits.trailing_zeros() as usize;
    let id = self.heads[class].expect("filter bit set for empty heap");
    self.unlink(id);
    Some(id)
  }

  /// Link a descriptor at the head of its class heap and set the bit.
  fn push(&mut self, class: u8, id: DescriptorId) {
    let old_head = self.heads[class as usize];
    {
      let hp = &mut self.descriptors[id.index()];
      debug_assert!(hp.state == Residency::Unregistered);
      hp.prev = None;
      hp.next = old_head;
      hp.state = Residency::InHeap(class);
    }
    if let Some(head) = old_head {
      self.descriptors[head.index()].prev = Some(id);
    }
    self.heads[class as usize] = Some(id);
    self.bitmap |= 1u64 << class;
  }

  /// Unlink a registered descriptor from its heap, clearing the class bit if
  /// the heap empties.
  fn unlink(&mut self, id: DescriptorId) {
    let (class, prev, next) = {
      let hp = &self.descriptors[id.index()];
      let Residency::InHeap(class) = hp.state else {
        panic!("descriptor {id:?} is not registered in any heap");
      };
      (class, hp.prev, hp.next)
    };
    match prev {
      Some(p) => self.descriptors[p.index()].next = next,
      None => self.heads[class as usize] = next,
    }
    if let Some(n) = next {
      self.descriptors[n.index()].prev = prev;
    }
    if self.heads[class as usize].is_none() {
      self.bitmap &= !(1u64 << class);
    }
    let hp = &mut self.descriptors[id.index()];
    hp.prev = None;
    hp.next = None;
    hp.state = Residency::Unregistered;
  }

  /// Re-index an unregistered descriptor after a reserve or release: back
  /// into the heap matching its free space, or parked as full.
  fn requeue(&mut self, id: DescriptorId) {
    let hp = &self.descriptors[id.index()];
    debug_assert!(hp.state == Residency::Unregistered);
    if hp.full() {
      self.descriptors[id.index()].state = Residency::Full;
    } else {
      let class = free_space_class(hp.longest_free_run as usize);
      self.push(class, id);
    }
  }

  /// Ask the source for an entirely free huge page and record it.
  fn obtain_fresh(&mut self) -> Option<DescriptorId> {
    let base = self.source.obtain_fresh()?;
    let id = DescriptorId(self.descriptors.len() as u32);
    self.descriptors.push(HugePage::new(base));
    Some(id)
  }

  /// Audit every index invariant. Panics on the first violation.
  fn verify(&self) {
    for class in 0..NUM_FREE_CLASSES {
      let bit_set = self.bitmap & (1u64 << class) != 0;
      assert_eq!(
        bit_set,
        self.heads[class].is_some(),
        "filter bit {class} disagrees with heap occupancy"
      );
      let mut prev = None;
      let mut cursor = self.heads[class];
      while let Some(id) = cursor {
        let hp = &self.descriptors[id.index()];
        assert_eq!(hp.state, Residency::InHeap(class as u8));
        assert_eq!(hp.prev, prev);
        assert!(!hp.full());
        assert_eq!(free_space_class(hp.longest_free_run as usize) as usize, class);
        prev = cursor;
        cursor = hp.next;
      }
    }
    for hp in &self.descriptors {
      assert!(hp.state != Residency::Unregistered);
      assert_eq!(hp.free_pages as usize, hp.count_free_pages());
      assert_eq!(hp.longest_free_run as usize, hp.compute_longest_free_run());
      if hp.state == Residency::Full {
        assert!(hp.full());
      }
    }
  }
}

// =============================================================================
// Counters
// =============================================================================

#[derive(Default)]
struct Counters {
  huge_pages: AtomicU64,
  pages_reserved: AtomicU64,
  live_extents: AtomicU64,
  total_allocations: AtomicU64,
  total_frees: AtomicU64,
}

/// Point-in-time snapshot of the heap's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
  /// Huge pages obtained from the source so far.
  pub huge_pages: u64,
  /// Pages currently reserved by live extents.
  pub pages_reserved: u64,
  /// Extent records currently live.
  pub live_extents: u64,
  pub total_allocations: u64,
  pub total_frees: u64,
}

// =============================================================================
// Page Heap
// =============================================================================

/// Construction-time knobs. The defaults are unbounded; tests cap both to
/// make exhaustion deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
  /// Budget of huge pages obtainable from the source.
  pub max_huge_pages: Option<usize>,
  /// Capacity of the extent record pool.
  pub max_extents: Option<usize>,
}

/// The page-granularity allocator. One mutex serializes index mutations;
/// extent-record traffic and the address index stay outside it. Shard by
/// instantiating one heap per arena shard; instances share nothing.
pub struct PageHeap {
  central: Mutex<Central>,
  extents: ExtentPool,
  index: AddressIndex,
  counters: Counters,
}

impl PageHeap {
  pub fn new() -> Self {
    Self::with_config(Config::default())
  }

  pub fn with_config(config: Config) -> Self {
    Self {
      central: Mutex::new(Central::new(HugePageSource::new(config.max_huge_pages))),
      extents: ExtentPool::new(config.max_extents),
      index: AddressIndex::new(),
      counters: Counters::default(),
    }
  }

  /// Allocate a contiguous run of `page_count` pages for `arena`.
  ///
  /// Picks the descriptor with the smallest sufficient free-space class via
  /// the filter bitmap, falling back to a fresh huge page. The returned
  /// extent is published in the address index before the id is handed back.
  pub fn allocate_pages(
    &self,
    arena: ArenaId,
    page_count: usize,
    is_slab: bool,
    size_class: u8,
  ) -> Result<ExtentId, AllocError> {
    assert!(
      page_count >= 1 && page_count <= PAGES_PER_HUGE_PAGE,
      "page count {page_count} outside 1..={PAGES_PER_HUGE_PAGE}"
    );

    // Record first: no step taken after the lock may fail.
    let id = self
      .extents
      .reserve_record()
      .ok_or(AllocError::MetadataExhausted)?;

    let required_class = allocation_class(page_count);
    let (base, offset, descriptor, fresh) = {
      let mut central = self.central.lock();
      let (descriptor, fresh) = match central.take_sufficient(required_class) {
        Some(found) => (found, false),
        None => match central.obtain_fresh() {
          Some(obtained) => (obtained, true),
          None => {
            drop(central);
            self.extents.abandon(id);
            return Err(AllocError::AddressSpaceExhausted);
          }
        },
      };
      let offset = central.descriptors[descriptor.index()].reserve(page_count);
      central.requeue(descriptor);
      let base = central.descriptors[descriptor.index()].base;
      (base, offset, descriptor, fresh)
    };

    if fresh {
      self.counters.huge_pages.fetch_add(1, Ordering::Relaxed);
    }
    self
      .counters
      .pages_reserved
      .fetch_add(page_count as u64, Ordering::Relaxed);
    self.counters.live_extents.fetch_add(1, Ordering::Relaxed);
    self
      .counters
      .total_allocations
      .fetch_add(1, Ordering::Relaxed);

    let extent = Extent {
      address: base + offset * PAGE_SIZE,
      size: page_count * PAGE_SIZE,
      arena,
      descriptor,
      is_slab,
      size_class,
    };
    self.extents.commit(id, extent);
    // Published outside the lock: nothing can reach this address until the
    // id is returned.
    self.index.publish(extent.address, id);
    Ok(id)
  }

  /// Free a previously allocated extent and recycle its record.
  ///
  /// The address-index removal happens before the mutex is taken: a
  /// concurrent lookup may already miss while the pages are not yet
  /// reusable.
  pub fn free_pages(&self, id: ExtentId) {
    let extent = self.extents.get(id);
    assert!(extent.address % PAGE_SIZE == 0, "misaligned extent address");
    assert!(
      extent.size >= PAGE_SIZE && extent.size % PAGE_SIZE == 0,
      "extent size is not a positive page multiple"
    );

    self.index.remove(extent.address);

    let page_count = extent.size / PAGE_SIZE;
    {
      let mut central = self.central.lock();
      let hp_base = central.descriptors[extent.descriptor.index()].base;
      assert_eq!(
        hp_base,
        extent.address & !(HUGE_PAGE_SIZE - 1),
        "extent address does not fall inside its descriptor"
      );
      let offset = (extent.address - hp_base) / PAGE_SIZE;

      if matches!(
        central.descriptors[extent.descriptor.index()].state,
        Residency::InHeap(_)
      ) {
        central.unlink(extent.descriptor);
      } else {
        central.descriptors[extent.descriptor.index()].state = Residency::Unregistered;
      }
      central.descriptors[extent.descriptor.index()].release(offset, page_count);
      central.requeue(extent.descriptor);

      #[cfg(feature = "release-mem")]
      if central.descriptors[extent.descriptor.index()].free_pages as usize
        == PAGES_PER_HUGE_PAGE
      {
        unsafe { os_release(hp_base as *mut u8, HUGE_PAGE_SIZE) };
      }
    }

    self
      .counters
      .pages_reserved
      .fetch_sub(page_count as u64, Ordering::Relaxed);
    self.counters.live_extents.fetch_sub(1, Ordering::Relaxed);
    self.counters.total_frees.fetch_add(1, Ordering::Relaxed);

    self.extents.release_record(id);
  }

  /// Copy of the record behind a live extent id.
  pub fn extent(&self, id: ExtentId) -> Extent {
    self.extents.get(id)
  }

  /// Resolve a run's start address back to its extent, if still live.
  pub fn lookup(&self, address: usize) -> Option<ExtentId> {
    self.index.lookup(address)
  }

  pub fn stats(&self) -> Stats {
    Stats {
      huge_pages: self.counters.huge_pages.load(Ordering::Relaxed),
      pages_reserved: self.counters.pages_reserved.load(Ordering::Relaxed),
      live_extents: self.counters.live_extents.load(Ordering::Relaxed),
      total_allocations: self.counters.total_allocations.load(Ordering::Relaxed),
      total_frees: self.counters.total_frees.load(Ordering::Relaxed),
    }
  }

  /// Audit the free-space index: filter bits against heap occupancy, heap
  /// membership against residency state, cached occupancy against the
  /// bitmaps. Intended for tests and debugging.
  pub fn verify(&self) {
    self.central.lock().verify();
  }
}

impl Default for PageHeap {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
