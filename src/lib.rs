#![allow(clippy::missing_safety_doc)]

//! pyrope: a concurrent malloc-style heap allocator.
//!
//! Arenas carve 1 MiB chunks into page runs; runs back either one large
//! allocation or a row of equal-sized small regions. Freed pages accumulate
//! as dirty and are purged back to the OS past a high-water mark; emptied
//! chunks recycle through a bounded cache. Allocations above the largest
//! run class span whole chunks and are tracked separately.

use core::cell::{Cell, UnsafeCell};
use core::mem::size_of;
use core::ptr::{self, null_mut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

mod arena;
mod base;
mod chunk;
mod huge;
mod mutex;
mod pages;
mod rb;
mod rtree;

use arena::{
  Arena, ArenaTreeTrait, CHUNK_HEADER_NPAGES, MAP_ALLOCATED, MAP_DECOMMITTED, MAP_DIRTY,
  MAP_LARGE, MAP_MADVISED, MAP_ZEROED, Run, arena_init, chunk_base, chunk_offset, ffs,
  pow2_ceil, quantum_ceiling,
};
pub(crate) use arena::ARENA_MAXCLASS;
use base::BaseState;
use chunk::{ExtentAdTrait, ExtentSzadTrait};
use huge::HugeStats;
use mutex::Mutex;
use pages::{alignment_ceiling, page_ceiling};
use rb::RbTree;
use rtree::RadixTree;

// =============================================================================
// Constants
// =============================================================================

pub(crate) const PAGE_2POW: usize = 12;
pub(crate) const PAGE_SIZE: usize = 1 << PAGE_2POW; // 4 KiB
pub(crate) const PAGE_MASK: usize = PAGE_SIZE - 1;

pub(crate) const CHUNK_2POW: usize = 20;
pub(crate) const CHUNKSIZE: usize = 1 << CHUNK_2POW; // 1 MiB
pub(crate) const CHUNK_MASK: usize = CHUNKSIZE - 1;
pub(crate) const CHUNK_NPAGES: usize = CHUNKSIZE >> PAGE_2POW; // 256

/// Spacing granularity of mid-sized small allocations.
pub(crate) const QUANTUM_2POW: usize = 4;
pub(crate) const QUANTUM: usize = 1 << QUANTUM_2POW; // 16

/// Smallest size class: one word.
pub(crate) const TINY_MIN_2POW: usize = if size_of::<usize>() == 8 { 3 } else { 2 };

pub(crate) const SMALL_MAX_2POW: usize = 9;
/// Largest quantum-spaced class.
pub(crate) const SMALL_MAX: usize = 1 << SMALL_MAX_2POW; // 512
pub(crate) const SMALL_MIN: usize = (QUANTUM >> 1) + 1;

/// Tiny bins: powers of two below the quantum.
pub(crate) const NTBINS: usize = QUANTUM_2POW - TINY_MIN_2POW;
/// Quantum-spaced bins.
pub(crate) const NQBINS: usize = SMALL_MAX >> QUANTUM_2POW;
/// Power-of-two sub-page bins.
pub(crate) const NSBINS: usize = PAGE_2POW - SMALL_MAX_2POW - 1;
pub(crate) const NBINS: usize = NTBINS + NQBINS + NSBINS;

/// Largest small class; anything bigger gets a dedicated run.
pub(crate) const BIN_MAXCLASS: usize = PAGE_SIZE >> 1;

/// Default cap on dirty pages per arena, in pages.
pub(crate) const DIRTY_MAX_DEFAULT: usize = 1 << 8;

pub(crate) const CACHELINE: usize = 64;

/// Fixed-point run-header overhead bound: reg0_offset/run_size must not
/// exceed RUN_MAX_OVRHD/2^RUN_BFP unless the relaxed bound applies.
pub(crate) const RUN_BFP: usize = 12;
pub(crate) const RUN_MAX_OVRHD: usize = 0x3d;
pub(crate) const RUN_MAX_OVRHD_RELAX: usize = 0x1800;

/// Recycle cache cap: 128 chunks.
pub(crate) const CHUNK_RECYCLE_LIMIT: usize = 128;
pub(crate) const RECYCLE_LIMIT: usize = CHUNK_RECYCLE_LIMIT * CHUNKSIZE;

/// Fresh-allocation fill (debug builds) and freed-region poison.
pub(crate) const ALLOC_JUNK: u8 = 0xe4;
pub(crate) const ALLOC_POISON: u8 = 0xe5;

const _: () = assert!(QUANTUM >= size_of::<*mut u8>());
const _: () = assert!(QUANTUM <= PAGE_SIZE);
const _: () = assert!(CHUNKSIZE >= PAGE_SIZE);
const _: () = assert!(QUANTUM * 4 <= CHUNKSIZE);
const _: () = assert!(SMALL_MAX < BIN_MAXCLASS);

pub(crate) const fn chunk_ceiling(s: usize) -> usize {
  s.wrapping_add(CHUNK_MASK) & !CHUNK_MASK
}

/// Write a diagnostic straight to stderr and abort. For states the
/// allocator cannot continue from; bypasses the log facade because a
/// logger may allocate.
pub(crate) fn die(msg: &str) -> ! {
  unsafe {
    libc::write(2, msg.as_ptr().cast(), msg.len());
  }
  std::process::abort();
}

fn set_errno(value: i32) {
  cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
      unsafe { *libc::__errno_location() = value };
    } else if #[cfg(any(target_os = "macos", target_os = "freebsd"))] {
      unsafe { *libc::__error() = value };
    } else {
      let _ = value;
    }
  }
}

// =============================================================================
// Heap
// =============================================================================

pub type ArenaId = u64;

/// All process-wide allocator state. The public free functions delegate to
/// one static instance; tests can run private instances side by side.
pub struct Heap {
  init_lock: Mutex,
  initialized: AtomicBool,

  // Runtime options.
  opt_dirty_max: AtomicUsize,
  opt_junk_flag: AtomicBool,
  opt_zero_flag: AtomicBool,

  // Arenas, ordered by id.
  arenas_lock: Mutex,
  arenas: UnsafeCell<RbTree<ArenaTreeTrait>>,
  narenas: AtomicU64,
  main_arena: AtomicPtr<Arena>,

  // Chunk recycle cache.
  pub(crate) chunks_mtx: Mutex,
  pub(crate) chunks_szad: UnsafeCell<RbTree<ExtentSzadTrait>>,
  pub(crate) chunks_ad: UnsafeCell<RbTree<ExtentAdTrait>>,
  pub(crate) recycled_size: AtomicUsize,

  // Huge allocations.
  pub(crate) huge_mtx: Mutex,
  pub(crate) huge: UnsafeCell<RbTree<ExtentAdTrait>>,
  pub(crate) huge_stats: UnsafeCell<HugeStats>,

  // Metadata allocator.
  pub(crate) base_mtx: Mutex,
  pub(crate) base: UnsafeCell<BaseState>,

  // Chunk ownership index.
  pub(crate) rtree: RadixTree,
}

unsafe impl Sync for Heap {}
unsafe impl Send for Heap {}

static HEAP: Heap = Heap::new();

thread_local! {
  static THREAD_ARENA: Cell<*mut Arena> = const { Cell::new(null_mut()) };
}

impl Heap {
  pub const fn new() -> Self {
    Self {
      init_lock: Mutex::new(),
      initialized: AtomicBool::new(false),
      opt_dirty_max: AtomicUsize::new(DIRTY_MAX_DEFAULT),
      opt_junk_flag: AtomicBool::new(cfg!(debug_assertions)),
      opt_zero_flag: AtomicBool::new(false),
      arenas_lock: Mutex::new(),
      arenas: UnsafeCell::new(RbTree::new()),
      narenas: AtomicU64::new(0),
      main_arena: AtomicPtr::new(null_mut()),
      chunks_mtx: Mutex::new(),
      chunks_szad: UnsafeCell::new(RbTree::new()),
      chunks_ad: UnsafeCell::new(RbTree::new()),
      recycled_size: AtomicUsize::new(0),
      huge_mtx: Mutex::new(),
      huge: UnsafeCell::new(RbTree::new()),
      huge_stats: UnsafeCell::new(HugeStats::new()),
      base_mtx: Mutex::new(),
      base: UnsafeCell::new(BaseState::new()),
      rtree: RadixTree::new(),
    }
  }

  #[inline]
  pub(crate) fn opt_junk(&self) -> bool {
    self.opt_junk_flag.load(Ordering::Relaxed)
  }

  #[inline]
  pub(crate) fn opt_zero(&self) -> bool {
    self.opt_zero_flag.load(Ordering::Relaxed)
  }

  // ===========================================================================
  // Initialization
  // ===========================================================================

  /// Returns true on failure, so callers can bail with ENOMEM.
  #[inline]
  fn ensure_init(&self) -> bool {
    if self.initialized.load(Ordering::Acquire) {
      return false;
    }
    self.init_hard()
  }

  #[cold]
  fn init_hard(&self) -> bool {
    self.init_lock.lock();
    if self.initialized.load(Ordering::Relaxed) {
      self.init_lock.unlock();
      return false;
    }

    let kernel_page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    if PAGE_SIZE % kernel_page != 0 {
      die("pyrope: compile-time page size does not divide the kernel page size\n");
    }

    self.parse_options();

    // The first arena is the shared fallback for every unbound thread.
    let arena = unsafe { self.arenas_extend() };
    if arena.is_null() {
      self.init_lock.unlock();
      return true;
    }
    // arenas_extend configures arenas for thread-local use; the main arena
    // keeps the full dirty budget.
    unsafe { (*arena).max_dirty = self.opt_dirty_max.load(Ordering::Relaxed) };
    self.main_arena.store(arena, Ordering::Release);

    if ptr::eq(self, &HEAP) {
      unsafe {
        libc::pthread_atfork(
          Some(prefork_hook),
          Some(postfork_parent_hook),
          Some(postfork_child_hook),
        );
      }
    }

    self.initialized.store(true, Ordering::Release);
    self.init_lock.unlock();
    false
  }

  fn parse_options(&self) {
    let opts = unsafe { libc::getenv(c"PYROPE_OPTIONS".as_ptr()) };
    if opts.is_null() {
      return;
    }
    let opts = unsafe { core::ffi::CStr::from_ptr(opts) };
    self.apply_options(opts.to_bytes());
  }

  /// Single-character option tokens with optional decimal repeat counts.
  fn apply_options(&self, opts: &[u8]) {
    let mut i = 0;
    while i < opts.len() {
      let mut nreps: usize = 0;
      let mut nseen = false;
      while i < opts.len() && opts[i].is_ascii_digit() {
        nreps = nreps.saturating_mul(10).saturating_add((opts[i] - b'0') as usize);
        nseen = true;
        i += 1;
      }
      if i >= opts.len() {
        break;
      }
      // A repeat count past the word width has settled either way.
      let nreps = if nseen { nreps.min(usize::BITS as usize) } else { 1 };

      let token = opts[i];
      for _ in 0..nreps {
        match token {
          b'f' => {
            let v = self.opt_dirty_max.load(Ordering::Relaxed);
            self.opt_dirty_max.store(v >> 1, Ordering::Relaxed);
          }
          b'F' => {
            let v = self.opt_dirty_max.load(Ordering::Relaxed);
            let next = if v == 0 {
              1
            } else if v << 1 != 0 {
              v << 1
            } else {
              v
            };
            self.opt_dirty_max.store(next, Ordering::Relaxed);
          }
          b'j' if cfg!(debug_assertions) => {
            self.opt_junk_flag.store(false, Ordering::Relaxed);
          }
          b'J' if cfg!(debug_assertions) => {
            self.opt_junk_flag.store(true, Ordering::Relaxed);
          }
          b'z' if cfg!(debug_assertions) => {
            self.opt_zero_flag.store(false, Ordering::Relaxed);
          }
          b'Z' if cfg!(debug_assertions) => {
            self.opt_zero_flag.store(true, Ordering::Relaxed);
          }
          _ => {
            log::warn!(
              "pyrope: unsupported character in malloc options: {:?}",
              token as char
            );
            break;
          }
        }
      }
      i += 1;
    }
  }

  // ===========================================================================
  // Arena management
  // ===========================================================================

  /// Create a new arena. On metadata exhaustion, fall back to the main
  /// arena rather than propagate failure into the allocation fast path.
  unsafe fn arenas_extend(&self) -> *mut Arena {
    let arena = unsafe { self.base_alloc(size_of::<Arena>()) } as *mut Arena;
    if arena.is_null() {
      log::warn!("pyrope: error initializing arena; using the main arena");
      return self.main_arena.load(Ordering::Acquire);
    }
    unsafe {
      // Thread-local arenas keep a tighter dirty budget than the main one.
      arena_init(
        arena,
        self,
        0,
        self.opt_dirty_max.load(Ordering::Relaxed) >> 3,
      );

      self.arenas_lock.lock();
      (*arena).id = self.narenas.fetch_add(1, Ordering::Relaxed);
      (*self.arenas.get()).insert(arena);
      self.arenas_lock.unlock();
    }
    arena
  }

  /// The arena this thread allocates from: its bound arena when one was
  /// requested (and belongs to this heap), else the main arena. Never
  /// writes the binding.
  fn choose_arena(&self) -> *mut Arena {
    let bound = THREAD_ARENA.with(|slot| slot.get());
    if !bound.is_null() && unsafe { (*bound).heap } == self as *const Heap {
      return bound;
    }
    self.main_arena.load(Ordering::Acquire)
  }

  fn arena_by_id(&self, id: ArenaId) -> *mut Arena {
    self.arenas_lock.lock();
    let arena = unsafe { (*self.arenas.get()).search_with(|node| id.cmp(&(*node).id)) };
    self.arenas_lock.unlock();
    arena
  }

  /// Bind this thread to a fresh private arena, or back to the main arena.
  pub fn thread_local_arena(&self, enabled: bool) {
    if self.ensure_init() {
      return;
    }
    let arena = if enabled {
      unsafe { self.arenas_extend() }
    } else {
      self.main_arena.load(Ordering::Acquire)
    };
    THREAD_ARENA.with(|slot| slot.set(arena));
  }

  pub fn arena_create(&self) -> ArenaId {
    if self.ensure_init() {
      return 0;
    }
    let arena = unsafe { self.arenas_extend() };
    if arena.is_null() { 0 } else { unsafe { (*arena).id } }
  }

  /// Unlink an arena. Its chunks leak until the last allocation in them is
  /// freed; the arena header itself is never reclaimed.
  pub fn arena_dispose(&self, id: ArenaId) {
    let arena = self.arena_by_id(id);
    if arena.is_null() {
      return;
    }
    self.arenas_lock.lock();
    unsafe { (*self.arenas.get()).remove(arena) };
    self.arenas_lock.unlock();
  }

  // ===========================================================================
  // Internal allocation dispatch
  // ===========================================================================

  unsafe fn imalloc(&self, size: usize, zero: bool, arena: *mut Arena) -> *mut u8 {
    debug_assert!(size != 0);
    if size <= ARENA_MAXCLASS {
      let arena = if arena.is_null() { self.choose_arena() } else { arena };
      unsafe { arena::arena_malloc(arena, size, zero) }
    } else {
      unsafe { self.huge_malloc(size, zero) }
    }
  }

  unsafe fn ipalloc(&self, alignment: usize, size: usize, arena: *mut Arena) -> *mut u8 {
    // Round size up to a multiple of the alignment, so a small size
    // class's natural alignment can satisfy the request.
    let ceil_size = alignment_ceiling(size, alignment);
    if ceil_size < size {
      return null_mut();
    }

    let ret;
    if ceil_size <= PAGE_SIZE || (alignment <= PAGE_SIZE && ceil_size <= ARENA_MAXCLASS) {
      let arena = if arena.is_null() { self.choose_arena() } else { arena };
      ret = unsafe { arena::arena_malloc(arena, ceil_size, false) };
    } else {
      // Sub-page alignment is settled; work in whole pages from here on.
      let alignment = page_ceiling(alignment);
      let ceil_size = page_ceiling(size);
      if ceil_size < size || ceil_size.wrapping_add(alignment) < ceil_size {
        return null_mut();
      }

      // Size of the over-sized run that guarantees an aligned sub-run.
      let run_size = if ceil_size >= alignment {
        ceil_size + alignment - PAGE_SIZE
      } else {
        (alignment << 1).wrapping_sub(PAGE_SIZE)
      };

      if run_size <= ARENA_MAXCLASS {
        let arena = if arena.is_null() { self.choose_arena() } else { arena };
        ret = unsafe { arena::arena_palloc(arena, alignment, ceil_size, run_size) };
      } else if alignment <= CHUNKSIZE {
        ret = unsafe { self.huge_malloc(ceil_size, false) };
      } else {
        ret = unsafe { self.huge_palloc(ceil_size, alignment, false) };
      }
    }

    debug_assert_eq!(ret as usize & (alignment - 1), 0);
    ret
  }

  unsafe fn iralloc(&self, ptr: *mut u8, size: usize, arena: *mut Arena) -> *mut u8 {
    debug_assert!(!ptr.is_null());
    debug_assert!(size != 0);

    let oldsize = unsafe { self.isalloc(ptr) };
    if size <= ARENA_MAXCLASS {
      unsafe { self.arena_ralloc(ptr, size, oldsize, arena) }
    } else {
      unsafe { self.huge_ralloc(ptr, size, oldsize) }
    }
  }

  pub(crate) unsafe fn idalloc(&self, ptr: *mut u8) {
    debug_assert!(!ptr.is_null());
    let offset = chunk_offset(ptr);
    if offset != 0 {
      unsafe { arena::arena_dalloc(ptr, offset) };
    } else {
      unsafe { self.huge_dalloc(ptr) };
    }
  }

  /// Try to resize a large allocation in place. Returns false when the
  /// resize happened in place.
  unsafe fn arena_ralloc_large(&self, ptr: *mut u8, size: usize, oldsize: usize) -> bool {
    unsafe {
      let psize = page_ceiling(size);
      if psize == oldsize {
        // Same page class.
        if size < oldsize {
          ptr::write_bytes(ptr.add(size), ALLOC_POISON, oldsize - size);
        }
        false
      } else {
        let chunk = chunk_base(ptr);
        let arena = (*chunk).arena;
        #[cfg(debug_assertions)]
        debug_assert_eq!((*arena).magic, arena::ARENA_MAGIC);

        if psize < oldsize {
          // Fill before shrinking so no thread observes stale bytes in
          // the surrendered tail.
          ptr::write_bytes(ptr.add(size), ALLOC_POISON, oldsize - size);
          arena::arena_ralloc_shrink_large(arena, chunk, ptr, psize, oldsize);
          false
        } else {
          let failed = arena::arena_ralloc_grow_large(arena, chunk, ptr, psize, oldsize);
          if !failed && self.opt_zero() {
            ptr::write_bytes(ptr.add(oldsize), 0, size - oldsize);
          }
          failed
        }
      }
    }
  }

  unsafe fn arena_ralloc(
    &self,
    ptr: *mut u8,
    size: usize,
    oldsize: usize,
    arena: *mut Arena,
  ) -> *mut u8 {
    unsafe {
      // Stay in place when the size class does not change.
      let in_place = if size < SMALL_MIN {
        oldsize < SMALL_MIN
          && ffs(pow2_ceil(size) >> (TINY_MIN_2POW + 1))
            == ffs(pow2_ceil(oldsize) >> (TINY_MIN_2POW + 1))
      } else if size <= SMALL_MAX {
        oldsize >= SMALL_MIN
          && oldsize <= SMALL_MAX
          && quantum_ceiling(size) >> QUANTUM_2POW == quantum_ceiling(oldsize) >> QUANTUM_2POW
      } else if size <= BIN_MAXCLASS {
        oldsize > SMALL_MAX && oldsize <= BIN_MAXCLASS && pow2_ceil(size) == pow2_ceil(oldsize)
      } else if oldsize > BIN_MAXCLASS && oldsize <= ARENA_MAXCLASS {
        debug_assert!(size > BIN_MAXCLASS);
        if !self.arena_ralloc_large(ptr, size, oldsize) {
          return ptr;
        }
        false
      } else {
        false
      };

      if in_place {
        if size < oldsize {
          ptr::write_bytes(ptr.add(size), ALLOC_POISON, oldsize - size);
        } else if self.opt_zero() && size > oldsize {
          ptr::write_bytes(ptr.add(oldsize), 0, size - oldsize);
        }
        return ptr;
      }

      // The size classes differ; allocate, copy, free.
      let arena = if arena.is_null() { self.choose_arena() } else { arena };
      let ret = arena::arena_malloc(arena, size, false);
      if ret.is_null() {
        return null_mut();
      }
      let copysize = if size < oldsize { size } else { oldsize };
      ptr::copy_nonoverlapping(ptr, ret, copysize);
      self.idalloc(ptr);
      ret
    }
  }

  /// Size of a live allocation belonging to this heap.
  unsafe fn isalloc(&self, ptr: *mut u8) -> usize {
    let chunk = chunk_base(ptr);
    if chunk as *mut u8 != ptr {
      unsafe { arena::arena_salloc(ptr) }
    } else {
      self.huge_mtx.lock();
      let node = unsafe { self.huge_find_exact(ptr) };
      debug_assert!(!node.is_null());
      let size = if node.is_null() { 0 } else { unsafe { (*node).size } };
      self.huge_mtx.unlock();
      size
    }
  }

  /// Size of an allocation with full validation; 0 for foreign pointers.
  unsafe fn isalloc_validate(&self, ptr: *const u8) -> usize {
    if !self.initialized.load(Ordering::Acquire) {
      return 0;
    }
    let chunk = chunk_base(ptr);
    if chunk.is_null() {
      return 0;
    }
    if unsafe { self.rtree.get(self, chunk as *mut u8) }.is_null() {
      return 0;
    }
    if chunk as *const u8 != ptr {
      unsafe { arena::arena_salloc(ptr) }
    } else {
      self.huge_mtx.lock();
      let node = unsafe { self.huge_find_exact(ptr as *mut u8) };
      let size = if node.is_null() { 0 } else { unsafe { (*node).size } };
      self.huge_mtx.unlock();
      size
    }
  }

  // ===========================================================================
  // malloc family
  // ===========================================================================

  pub unsafe fn malloc(&self, size: usize) -> *mut u8 {
    if self.ensure_init() {
      set_errno(libc::ENOMEM);
      return null_mut();
    }
    let size = if size == 0 { 1 } else { size };
    let ret = unsafe { self.imalloc(size, false, null_mut()) };
    if ret.is_null() {
      set_errno(libc::ENOMEM);
    }
    ret
  }

  pub unsafe fn calloc(&self, num: usize, size: usize) -> *mut u8 {
    if self.ensure_init() {
      set_errno(libc::ENOMEM);
      return null_mut();
    }
    let Some(num_size) = num.checked_mul(size) else {
      set_errno(libc::ENOMEM);
      return null_mut();
    };
    let num_size = if num_size == 0 { 1 } else { num_size };
    let ret = unsafe { self.imalloc(num_size, true, null_mut()) };
    if ret.is_null() {
      set_errno(libc::ENOMEM);
    }
    ret
  }

  pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
    let size = if size == 0 { 1 } else { size };

    let ret = if !ptr.is_null() {
      debug_assert!(self.initialized.load(Ordering::Relaxed));
      unsafe { self.iralloc(ptr, size, null_mut()) }
    } else if self.ensure_init() {
      null_mut()
    } else {
      unsafe { self.imalloc(size, false, null_mut()) }
    };

    if ret.is_null() {
      set_errno(libc::ENOMEM);
    }
    ret
  }

  pub unsafe fn free(&self, ptr: *mut u8) {
    let offset = chunk_offset(ptr);
    if offset != 0 {
      unsafe { arena::arena_dalloc(ptr, offset) };
    } else if !ptr.is_null() {
      unsafe { self.huge_dalloc(ptr) };
    }
  }

  pub unsafe fn memalign(&self, alignment: usize, size: usize) -> *mut u8 {
    if !alignment.is_power_of_two() {
      return null_mut();
    }
    if self.ensure_init() {
      return null_mut();
    }
    let size = if size == 0 { 1 } else { size };
    let alignment = alignment.max(size_of::<*mut u8>());
    unsafe { self.ipalloc(alignment, size, null_mut()) }
  }

  pub unsafe fn posix_memalign(&self, alignment: usize, size: usize) -> Result<*mut u8, i32> {
    // Alignment must be a power of two and a multiple of the word size.
    if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
      return Err(libc::EINVAL);
    }
    let ret = unsafe { self.memalign(alignment, size) };
    if ret.is_null() {
      return Err(libc::ENOMEM);
    }
    Ok(ret)
  }

  pub unsafe fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut u8 {
    if alignment == 0 || size % alignment != 0 {
      return null_mut();
    }
    unsafe { self.memalign(alignment, size) }
  }

  pub unsafe fn valloc(&self, size: usize) -> *mut u8 {
    unsafe { self.memalign(PAGE_SIZE, size) }
  }

  /// Allocator-visible size of `ptr`; 0 when the pointer is not ours.
  pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
    unsafe { self.isalloc_validate(ptr) }
  }

  // ===========================================================================
  // Introspection
  // ===========================================================================

  pub fn stats(&self) -> Stats {
    let mut stats = Stats {
      opt_junk: self.opt_junk(),
      opt_zero: self.opt_zero(),
      narenas: self.narenas.load(Ordering::Relaxed) as usize,
      quantum: QUANTUM,
      small_max: SMALL_MAX,
      large_max: ARENA_MAXCLASS,
      chunksize: CHUNKSIZE,
      page_size: PAGE_SIZE,
      dirty_max: self.opt_dirty_max.load(Ordering::Relaxed),
      mapped: 0,
      allocated: 0,
      waste: 0,
      page_cache: 0,
      bookkeeping: 0,
      bin_unused: 0,
    };

    let mut non_arena_mapped = 0;

    self.huge_mtx.lock();
    unsafe {
      let huge_stats = &*self.huge_stats.get();
      non_arena_mapped += huge_stats.mapped;
      stats.allocated += huge_stats.allocated;
      debug_assert!(huge_stats.mapped >= huge_stats.allocated);
    }
    self.huge_mtx.unlock();

    self.base_mtx.lock();
    unsafe {
      let b = &*self.base.get();
      non_arena_mapped += b.mapped;
      stats.bookkeeping += b.committed;
      debug_assert!(b.mapped >= b.committed);
    }
    self.base_mtx.unlock();

    self.arenas_lock.lock();
    unsafe {
      for a in (*self.arenas.get()).iter() {
        let snap = arena::arena_snapshot(a);
        debug_assert!(snap.mapped >= snap.committed_bytes);

        stats.mapped += snap.mapped;
        stats.allocated += snap.allocated;
        stats.page_cache += snap.dirty_bytes;
        // Waste is committed memory not otherwise accounted for.
        stats.waste += snap
          .committed_bytes
          .saturating_sub(snap.allocated)
          .saturating_sub(snap.dirty_bytes)
          .saturating_sub(snap.bin_unused)
          .saturating_sub(snap.headers);
        stats.bin_unused += snap.bin_unused;
        stats.bookkeeping += snap.headers;
      }
    }
    self.arenas_lock.unlock();

    // Chunk headers are bookkeeping, not waste.
    let chunk_header_size = ((stats.mapped / stats.chunksize) * CHUNK_HEADER_NPAGES) << PAGE_2POW;
    stats.mapped += non_arena_mapped;
    stats.bookkeeping += chunk_header_size;
    stats.waste = stats.waste.saturating_sub(chunk_header_size);

    stats
  }

  /// Classify an arbitrary pointer.
  pub unsafe fn ptr_info(&self, ptr: *const u8) -> PtrInfo {
    const UNKNOWN: PtrInfo = PtrInfo {
      tag: PtrInfoTag::Unknown,
      addr: null_mut(),
      size: 0,
    };

    if !self.initialized.load(Ordering::Acquire) {
      return UNKNOWN;
    }

    let chunk = chunk_base(ptr);
    // Null, or within one chunk's size of null.
    if chunk.is_null() {
      return UNKNOWN;
    }

    // Huge allocations first: their second and later chunks are not in the
    // radix tree.
    self.huge_mtx.lock();
    let node = unsafe { self.huge_find_containing(ptr as *mut u8) };
    if !node.is_null() {
      let info = unsafe {
        PtrInfo {
          tag: PtrInfoTag::LiveHuge,
          addr: (*node).addr,
          size: (*node).size,
        }
      };
      self.huge_mtx.unlock();
      return info;
    }
    self.huge_mtx.unlock();

    if unsafe { self.rtree.get(self, chunk as *mut u8) }.is_null() {
      return UNKNOWN;
    }

    unsafe {
      #[cfg(debug_assertions)]
      debug_assert_eq!((*(*chunk).arena).magic, arena::ARENA_MAGIC);

      let mut pageind = chunk_offset(ptr) >> PAGE_2POW;
      if pageind < CHUNK_HEADER_NPAGES {
        // Within the chunk header.
        return UNKNOWN;
      }

      let mut mapbits = (*chunk).map[pageind].bits;

      if mapbits & MAP_ALLOCATED == 0 {
        let tag = if mapbits & MAP_DIRTY != 0 {
          PtrInfoTag::FreedPageDirty
        } else if mapbits & MAP_DECOMMITTED != 0 {
          PtrInfoTag::FreedPageDecommitted
        } else if mapbits & MAP_MADVISED != 0 {
          PtrInfoTag::FreedPageMadvised
        } else if mapbits & MAP_ZEROED != 0 {
          PtrInfoTag::FreedPageZeroed
        } else {
          // Interior page of a clean free run; no flag survives.
          return UNKNOWN;
        };
        return PtrInfo {
          tag,
          addr: (ptr as usize & !PAGE_MASK) as *mut u8,
          size: PAGE_SIZE,
        };
      }

      if mapbits & MAP_LARGE != 0 {
        // Only the first page of a large run records the size; scan back
        // for interior pointers.
        let size = loop {
          let size = mapbits & !PAGE_MASK;
          if size != 0 {
            break size;
          }
          if pageind <= CHUNK_HEADER_NPAGES {
            return UNKNOWN;
          }
          pageind -= 1;
          mapbits = (*chunk).map[pageind].bits;
          if mapbits & MAP_LARGE == 0 {
            return UNKNOWN;
          }
        };
        return PtrInfo {
          tag: PtrInfoTag::LiveLarge,
          addr: (chunk as *mut u8).add(pageind << PAGE_2POW),
          size,
        };
      }

      // Small allocation.
      let run = (mapbits & !PAGE_MASK) as *mut Run;
      let bin = (*run).bin;
      let size = (*bin).reg_size;

      let reg0_addr = run as usize + (*bin).reg0_offset as usize;
      if (ptr as usize) < reg0_addr {
        // In the run header.
        return UNKNOWN;
      }

      let regind = (ptr as usize - reg0_addr) / size;
      let addr = (reg0_addr + regind * size) as *mut u8;
      let tag = if arena::run_region_is_free(run, regind) {
        PtrInfoTag::FreedSmall
      } else {
        PtrInfoTag::LiveSmall
      };
      PtrInfo { tag, addr, size }
    }
  }

  /// Purge every arena's dirty pages.
  pub fn free_dirty_pages(&self) {
    if self.ensure_init() {
      return;
    }
    self.arenas_lock.lock();
    unsafe {
      for a in (*self.arenas.get()).iter() {
        (*a).lock.lock();
        arena::arena_purge(a, true);
        (*a).lock.unlock();
      }
    }
    self.arenas_lock.unlock();
  }

  /// On lazy-madvise platforms, decommit-then-recommit madvised pages so
  /// RSS reflects reality. Elsewhere this is a no-op.
  pub fn purge_freed_pages(&self) {
    if self.ensure_init() {
      return;
    }
    self.arenas_lock.lock();
    unsafe {
      for a in (*self.arenas.get()).iter() {
        arena::arena_hard_purge(a);
      }
    }
    self.arenas_lock.unlock();
  }

  // ===========================================================================
  // Per-arena entry points
  // ===========================================================================

  pub unsafe fn arena_malloc(&self, id: ArenaId, size: usize) -> *mut u8 {
    if self.ensure_init() {
      set_errno(libc::ENOMEM);
      return null_mut();
    }
    let arena = self.arena_by_id(id);
    if arena.is_null() {
      set_errno(libc::ENOMEM);
      return null_mut();
    }
    let size = if size == 0 { 1 } else { size };
    let ret = unsafe { self.imalloc(size, false, arena) };
    if ret.is_null() {
      set_errno(libc::ENOMEM);
    }
    ret
  }

  pub unsafe fn arena_calloc(&self, id: ArenaId, num: usize, size: usize) -> *mut u8 {
    if self.ensure_init() {
      set_errno(libc::ENOMEM);
      return null_mut();
    }
    let arena = self.arena_by_id(id);
    let Some(num_size) = num.checked_mul(size) else {
      set_errno(libc::ENOMEM);
      return null_mut();
    };
    if arena.is_null() {
      set_errno(libc::ENOMEM);
      return null_mut();
    }
    let num_size = if num_size == 0 { 1 } else { num_size };
    let ret = unsafe { self.imalloc(num_size, true, arena) };
    if ret.is_null() {
      set_errno(libc::ENOMEM);
    }
    ret
  }

  pub unsafe fn arena_realloc(&self, id: ArenaId, ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
      return unsafe { self.arena_malloc(id, size) };
    }
    let arena = self.arena_by_id(id);
    if arena.is_null() {
      set_errno(libc::ENOMEM);
      return null_mut();
    }
    let size = if size == 0 { 1 } else { size };
    let ret = unsafe { self.iralloc(ptr, size, arena) };
    if ret.is_null() {
      set_errno(libc::ENOMEM);
    }
    ret
  }

  pub unsafe fn arena_free(&self, _id: ArenaId, ptr: *mut u8) {
    unsafe { self.free(ptr) };
  }

  pub unsafe fn arena_memalign(&self, id: ArenaId, alignment: usize, size: usize) -> *mut u8 {
    if !alignment.is_power_of_two() {
      return null_mut();
    }
    if self.ensure_init() {
      return null_mut();
    }
    let arena = self.arena_by_id(id);
    if arena.is_null() {
      return null_mut();
    }
    let size = if size == 0 { 1 } else { size };
    let alignment = alignment.max(size_of::<*mut u8>());
    unsafe { self.ipalloc(alignment, size, arena) }
  }

  // ===========================================================================
  // Fork protocol
  // ===========================================================================

  fn prefork(&self) {
    // Acquire every lock, in a fixed order.
    self.arenas_lock.lock();
    unsafe {
      for a in (*self.arenas.get()).iter() {
        (*a).lock.lock();
      }
    }
    self.base_mtx.lock();
    self.huge_mtx.lock();
  }

  fn postfork_parent(&self) {
    self.huge_mtx.unlock();
    self.base_mtx.unlock();
    unsafe {
      for a in (*self.arenas.get()).iter() {
        (*a).lock.unlock();
      }
    }
    self.arenas_lock.unlock();
  }

  fn postfork_child(&self) {
    self.huge_mtx.reinit();
    self.base_mtx.reinit();
    unsafe {
      for a in (*self.arenas.get()).iter() {
        (*a).lock.reinit();
      }
    }
    self.arenas_lock.reinit();
  }
}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}

unsafe extern "C" fn prefork_hook() {
  HEAP.prefork();
}

unsafe extern "C" fn postfork_parent_hook() {
  HEAP.postfork_parent();
}

unsafe extern "C" fn postfork_child_hook() {
  HEAP.postfork_child();
}

// =============================================================================
// Introspection types
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  pub mapped: usize,
  pub allocated: usize,
  /// Committed memory that is neither allocated, dirty, nor counted
  /// elsewhere.
  pub waste: usize,
  /// Dirty pages awaiting purge.
  pub page_cache: usize,
  pub bookkeeping: usize,
  /// Free region bytes inside non-full small runs.
  pub bin_unused: usize,
  pub opt_junk: bool,
  pub opt_zero: bool,
  pub narenas: usize,
  pub quantum: usize,
  pub small_max: usize,
  pub large_max: usize,
  pub chunksize: usize,
  pub page_size: usize,
  pub dirty_max: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtrInfoTag {
  LiveSmall,
  LiveLarge,
  LiveHuge,
  FreedSmall,
  FreedPageDirty,
  FreedPageDecommitted,
  FreedPageMadvised,
  FreedPageZeroed,
  Unknown,
}

#[derive(Clone, Copy, Debug)]
pub struct PtrInfo {
  pub tag: PtrInfoTag,
  /// Base address of the allocation (or page, for freed-page tags).
  pub addr: *mut u8,
  pub size: usize,
}

/// The size `malloc(size)` would round up to; equals
/// `usable_size(malloc(size))` without allocating.
pub fn good_size(size: usize) -> usize {
  if size < SMALL_MIN {
    let p = pow2_ceil(size);
    if p < (1 << TINY_MIN_2POW) {
      1 << TINY_MIN_2POW
    } else {
      p
    }
  } else if size <= SMALL_MAX {
    quantum_ceiling(size)
  } else if size <= BIN_MAXCLASS {
    pow2_ceil(size)
  } else {
    // Large and huge both round to whole pages: huge accounting is in
    // page-ceiled units precisely so this stays equal to
    // usable_size(malloc(size)).
    page_ceiling(size)
  }
}

// =============================================================================
// Process-wide entry points
// =============================================================================

pub unsafe fn malloc(size: usize) -> *mut u8 {
  unsafe { HEAP.malloc(size) }
}

pub unsafe fn calloc(num: usize, size: usize) -> *mut u8 {
  unsafe { HEAP.calloc(num, size) }
}

pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { HEAP.realloc(ptr, size) }
}

pub unsafe fn free(ptr: *mut u8) {
  unsafe { HEAP.free(ptr) }
}

pub unsafe fn memalign(alignment: usize, size: usize) -> *mut u8 {
  unsafe { HEAP.memalign(alignment, size) }
}

pub unsafe fn posix_memalign(alignment: usize, size: usize) -> Result<*mut u8, i32> {
  unsafe { HEAP.posix_memalign(alignment, size) }
}

pub unsafe fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  unsafe { HEAP.aligned_alloc(alignment, size) }
}

pub unsafe fn valloc(size: usize) -> *mut u8 {
  unsafe { HEAP.valloc(size) }
}

pub unsafe fn malloc_usable_size(ptr: *const u8) -> usize {
  unsafe { HEAP.usable_size(ptr) }
}

pub fn malloc_good_size(size: usize) -> usize {
  good_size(size)
}

pub fn stats() -> Stats {
  HEAP.stats()
}

pub unsafe fn ptr_info(ptr: *const u8) -> PtrInfo {
  unsafe { HEAP.ptr_info(ptr) }
}

pub fn free_dirty_pages() {
  HEAP.free_dirty_pages()
}

pub fn purge_freed_pages() {
  HEAP.purge_freed_pages()
}

pub fn thread_local_arena(enabled: bool) {
  HEAP.thread_local_arena(enabled)
}

pub fn arena_create() -> ArenaId {
  HEAP.arena_create()
}

pub fn arena_dispose(id: ArenaId) {
  HEAP.arena_dispose(id)
}

pub unsafe fn arena_malloc(id: ArenaId, size: usize) -> *mut u8 {
  unsafe { HEAP.arena_malloc(id, size) }
}

pub unsafe fn arena_calloc(id: ArenaId, num: usize, size: usize) -> *mut u8 {
  unsafe { HEAP.arena_calloc(id, num, size) }
}

pub unsafe fn arena_realloc(id: ArenaId, ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { HEAP.arena_realloc(id, ptr, size) }
}

pub unsafe fn arena_free(id: ArenaId, ptr: *mut u8) {
  unsafe { HEAP.arena_free(id, ptr) }
}

pub unsafe fn arena_memalign(id: ArenaId, alignment: usize, size: usize) -> *mut u8 {
  unsafe { HEAP.arena_memalign(id, alignment, size) }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl core::alloc::GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
    let size = layout.size().max(1);
    if layout.align() <= size_of::<*mut u8>() {
      unsafe { HEAP.malloc(size) }
    } else {
      unsafe { HEAP.memalign(layout.align(), size) }
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
    unsafe { HEAP.free(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: core::alloc::Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= size_of::<*mut u8>() {
      return unsafe { HEAP.realloc(ptr, new_size.max(1)) };
    }
    // Over-aligned: realloc cannot preserve the alignment, so move by hand.
    unsafe {
      let new_ptr = HEAP.memalign(layout.align(), new_size.max(1));
      if !new_ptr.is_null() {
        let copysize = layout.size().min(new_size);
        ptr::copy_nonoverlapping(ptr, new_ptr, copysize);
        HEAP.free(ptr);
      }
      new_ptr
    }
  }

  unsafe fn alloc_zeroed(&self, layout: core::alloc::Layout) -> *mut u8 {
    let size = layout.size().max(1);
    if layout.align() <= size_of::<*mut u8>() {
      unsafe { HEAP.calloc(1, size) }
    } else {
      unsafe {
        let ptr = HEAP.memalign(layout.align(), size);
        if !ptr.is_null() {
          ptr::write_bytes(ptr, 0, size);
        }
        ptr
      }
    }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use core::ffi::{c_int, c_void};

  use super::HEAP;

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    unsafe { HEAP.malloc(size).cast() }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    unsafe { HEAP.calloc(nmemb, size).cast() }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    unsafe { HEAP.realloc(ptr.cast(), size).cast() }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut c_void) {
    unsafe { HEAP.free(ptr.cast()) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    unsafe { HEAP.memalign(alignment, size).cast() }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
  ) -> c_int {
    match unsafe { HEAP.posix_memalign(alignment, size) } {
      Ok(ptr) => {
        unsafe { *memptr = ptr.cast() };
        0
      }
      Err(err) => err,
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    unsafe { HEAP.aligned_alloc(alignment, size).cast() }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    unsafe { HEAP.valloc(size).cast() }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
      return 0;
    }
    unsafe { HEAP.usable_size(ptr.cast()) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_good_size(size: usize) -> usize {
    super::good_size(size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn pyrope_free_dirty_pages() {
    HEAP.free_dirty_pages();
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn pyrope_purge_freed_pages() {
    HEAP.purge_freed_pages();
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn pyrope_thread_local_arena(enabled: bool) {
    HEAP.thread_local_arena(enabled);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn option_tokens_adjust_dirty_max() {
    let heap = Heap::new();
    assert_eq!(heap.opt_dirty_max.load(Ordering::Relaxed), DIRTY_MAX_DEFAULT);
    heap.apply_options(b"F");
    assert_eq!(
      heap.opt_dirty_max.load(Ordering::Relaxed),
      DIRTY_MAX_DEFAULT << 1
    );
    heap.apply_options(b"ff");
    assert_eq!(
      heap.opt_dirty_max.load(Ordering::Relaxed),
      DIRTY_MAX_DEFAULT >> 1
    );
  }

  #[test]
  fn option_repeat_counts() {
    let heap = Heap::new();
    heap.apply_options(b"3F");
    assert_eq!(
      heap.opt_dirty_max.load(Ordering::Relaxed),
      DIRTY_MAX_DEFAULT << 3
    );
  }

  #[test]
  fn option_f_saturates_at_zero_and_recovers() {
    let heap = Heap::new();
    heap.apply_options(b"64f");
    assert_eq!(heap.opt_dirty_max.load(Ordering::Relaxed), 0);
    heap.apply_options(b"F");
    assert_eq!(heap.opt_dirty_max.load(Ordering::Relaxed), 1);
  }

  #[test]
  fn unknown_options_are_ignored() {
    let heap = Heap::new();
    heap.apply_options(b"q7xF");
    assert_eq!(
      heap.opt_dirty_max.load(Ordering::Relaxed),
      DIRTY_MAX_DEFAULT << 1
    );
  }

  #[test]
  fn good_size_classes() {
    assert_eq!(good_size(0), 1 << TINY_MIN_2POW);
    assert_eq!(good_size(1), 1 << TINY_MIN_2POW);
    assert_eq!(good_size(9), 16);
    assert_eq!(good_size(17), 32);
    assert_eq!(good_size(500), 512);
    assert_eq!(good_size(513), 1024);
    assert_eq!(good_size(1025), 2048);
    assert_eq!(good_size(2049), 4096);
    assert_eq!(good_size(5000), 8192);
    assert_eq!(good_size(ARENA_MAXCLASS + 1), page_ceiling(ARENA_MAXCLASS + 1));
  }

  #[test]
  fn good_size_is_idempotent() {
    for size in [0, 1, 7, 9, 100, 1000, 3000, 70000, 3 << 20] {
      assert_eq!(good_size(good_size(size)), good_size(size));
    }
  }
}
