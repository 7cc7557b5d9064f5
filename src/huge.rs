//! Huge allocations.
//!
//! Anything above `arena_maxclass` bypasses the arenas: the request is
//! rounded to a chunk multiple, contiguous chunks are reserved, and an
//! extent node in an address-ordered tree records the allocation. The
//! node's `size` is the page-ceiled request, not the chunk-ceiled mapping;
//! untouched tail pages never gain physical backing.

use core::cmp::Ordering;
use core::ptr::null_mut;

use crate::chunk::{ChunkType, ExtentNode};
use crate::pages::page_ceiling;
use crate::{ALLOC_JUNK, ALLOC_POISON, CHUNKSIZE, Heap, chunk_ceiling, die};

#[derive(Default)]
pub(crate) struct HugeStats {
  pub(crate) nmalloc: u64,
  pub(crate) ndalloc: u64,
  pub(crate) allocated: usize,
  pub(crate) mapped: usize,
}

impl HugeStats {
  pub(crate) const fn new() -> Self {
    Self {
      nmalloc: 0,
      ndalloc: 0,
      allocated: 0,
      mapped: 0,
    }
  }
}

impl Heap {
  pub(crate) unsafe fn huge_malloc(&self, size: usize, zero: bool) -> *mut u8 {
    unsafe { self.huge_palloc(size, CHUNKSIZE, zero) }
  }

  pub(crate) unsafe fn huge_palloc(&self, size: usize, alignment: usize, zero: bool) -> *mut u8 {
    let csize = chunk_ceiling(size);
    if csize == 0 {
      // size was large enough to wrap.
      return null_mut();
    }

    let node = unsafe { self.base_node_alloc() };
    if node.is_null() {
      return null_mut();
    }

    let (ret, zeroed) = unsafe { self.chunk_alloc(csize, alignment, false) };
    if ret.is_null() {
      unsafe { self.base_node_dealloc(node) };
      return null_mut();
    }
    if zero {
      unsafe { self.chunk_ensure_zero(ret, csize, zeroed) };
    }

    let psize = page_ceiling(size);
    unsafe {
      (*node).addr = ret;
      (*node).size = psize;
      (*node).chunk_type = ChunkType::Huge;
    }

    self.huge_mtx.lock();
    unsafe {
      (*self.huge.get()).insert(node);
      let stats = &mut *self.huge_stats.get();
      stats.nmalloc += 1;
      // The mapping is csize bytes but only psize count as allocated:
      // the tail past psize is either decommitted below or never touched,
      // so it never consumes physical pages.
      stats.allocated += psize;
      stats.mapped += csize;
    }
    self.huge_mtx.unlock();

    #[cfg(feature = "decommit")]
    if csize > psize {
      unsafe { crate::pages::pages_decommit(ret.add(psize), csize - psize) };
    }

    if !zero {
      let fill = if cfg!(feature = "decommit") { psize } else { csize };
      unsafe {
        if self.opt_junk() {
          core::ptr::write_bytes(ret, ALLOC_JUNK, fill);
        } else if self.opt_zero() {
          core::ptr::write_bytes(ret, 0, fill);
        }
      }
    }

    ret
  }

  pub(crate) unsafe fn huge_ralloc(&self, ptr: *mut u8, size: usize, oldsize: usize) -> *mut u8 {
    // Avoid moving the allocation if the chunk footprint is unchanged.
    if oldsize > crate::ARENA_MAXCLASS && chunk_ceiling(size) == chunk_ceiling(oldsize) {
      let psize = page_ceiling(size);
      unsafe {
        if size < oldsize {
          core::ptr::write_bytes(ptr.add(size), ALLOC_POISON, oldsize - size);
        }
        #[cfg(feature = "decommit")]
        if psize < oldsize {
          crate::pages::pages_decommit(ptr.add(psize), oldsize - psize);
          self.huge_mtx.lock();
          let node = self.huge_find_exact(ptr);
          debug_assert!(!node.is_null() && (*node).size == oldsize);
          let stats = &mut *self.huge_stats.get();
          stats.allocated -= oldsize - psize;
          (*node).size = psize;
          self.huge_mtx.unlock();
        } else if psize > oldsize {
          crate::pages::pages_commit(ptr.add(oldsize), psize - oldsize);
        }
        // Even without commit work the recorded size must grow, so a
        // later usable_size is never below what realloc granted.
        if psize > oldsize {
          self.huge_mtx.lock();
          let node = self.huge_find_exact(ptr);
          debug_assert!(!node.is_null() && (*node).size == oldsize);
          let stats = &mut *self.huge_stats.get();
          stats.allocated += psize - oldsize;
          (*node).size = psize;
          self.huge_mtx.unlock();
        }
        if self.opt_zero() && size > oldsize {
          core::ptr::write_bytes(ptr.add(oldsize), 0, size - oldsize);
        }
      }
      return ptr;
    }

    // Different chunk footprint: allocate, copy, free.
    let ret = unsafe { self.huge_malloc(size, false) };
    if ret.is_null() {
      return null_mut();
    }
    let copysize = if size < oldsize { size } else { oldsize };
    unsafe {
      core::ptr::copy_nonoverlapping(ptr, ret, copysize);
      self.idalloc(ptr);
    }
    ret
  }

  pub(crate) unsafe fn huge_dalloc(&self, ptr: *mut u8) {
    self.huge_mtx.lock();
    let node = unsafe { self.huge_find_exact(ptr) };
    if node.is_null() {
      self.huge_mtx.unlock();
      die("pyrope: invalid huge free\n");
    }
    unsafe {
      debug_assert!((*node).addr == ptr);
      (*self.huge.get()).remove(node);

      let stats = &mut *self.huge_stats.get();
      stats.ndalloc += 1;
      stats.allocated -= (*node).size;
      stats.mapped -= chunk_ceiling((*node).size);
    }
    self.huge_mtx.unlock();

    unsafe {
      let size = chunk_ceiling((*node).size);
      self.chunk_dealloc((*node).addr, size, ChunkType::Huge);
      self.base_node_dealloc(node);
    }
  }

  /// Exact-address lookup in the huge tree. Caller holds `huge_mtx`.
  pub(crate) unsafe fn huge_find_exact(&self, ptr: *mut u8) -> *mut ExtentNode {
    let key = ExtentNode::key(ptr, 0);
    unsafe { (*self.huge.get()).search(&key) }
  }

  /// Containing-range lookup: finds the huge allocation whose span covers
  /// `ptr`, if any. Caller holds `huge_mtx`.
  pub(crate) unsafe fn huge_find_containing(&self, ptr: *mut u8) -> *mut ExtentNode {
    let addr = ptr as usize;
    unsafe {
      (*self.huge.get()).search_with(|node| {
        let base = (*node).addr as usize;
        let csize = chunk_ceiling((*node).size);
        if addr < base {
          Ordering::Less
        } else if addr >= base + csize {
          Ordering::Greater
        } else {
          Ordering::Equal
        }
      })
    }
  }
}
