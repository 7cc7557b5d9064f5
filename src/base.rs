//! Base allocator backing internal metadata.
//!
//! A bump pointer over chunks obtained with `is_base = true`, so metadata
//! allocation never re-enters the recycle cache it is a dependency of.
//! Memory is never released. Extent-node cells are recycled through a
//! freelist threaded through the nodes' first word.

use core::mem::size_of;
use core::ptr::null_mut;

use crate::chunk::ExtentNode;
use crate::pages::{page_ceiling, pages_commit, pages_decommit};
use crate::{CACHELINE, CHUNKSIZE, Heap, chunk_ceiling};

pub(crate) struct BaseState {
  /// Start of the current metadata chunk.
  pages: *mut u8,
  /// Bump pointer.
  next: *mut u8,
  /// End of the current metadata chunk.
  past: *mut u8,
  /// First page not yet committed for metadata use.
  next_decommitted: *mut u8,
  /// Freelist of extent-node cells; the next link lives in the cell itself.
  nodes: *mut ExtentNode,
  pub(crate) mapped: usize,
  pub(crate) committed: usize,
}

impl BaseState {
  pub(crate) const fn new() -> Self {
    Self {
      pages: null_mut(),
      next: null_mut(),
      past: null_mut(),
      next_decommitted: null_mut(),
      nodes: null_mut(),
      mapped: 0,
      committed: 0,
    }
  }
}

const fn cacheline_ceiling(s: usize) -> usize {
  (s + (CACHELINE - 1)) & !(CACHELINE - 1)
}

impl Heap {
  /// Replace the current metadata chunk with a fresh one large enough for
  /// `minsize`. Called with `base_mtx` held.
  unsafe fn base_pages_alloc(&self, minsize: usize) -> bool {
    debug_assert!(minsize != 0);
    let csize = chunk_ceiling(minsize);
    let (pages, _zeroed) = unsafe { self.chunk_alloc(csize, CHUNKSIZE, true) };
    if pages.is_null() {
      return false;
    }

    let b = unsafe { &mut *self.base.get() };
    b.pages = pages;
    b.next = pages;
    b.past = unsafe { pages.add(csize) };
    // Leave enough committed for minsize so it isn't immediately
    // recommitted.
    let pminsize = page_ceiling(minsize);
    b.next_decommitted = unsafe { pages.add(pminsize) };
    if cfg!(feature = "decommit") && pminsize < csize {
      unsafe { pages_decommit(b.next_decommitted, csize - pminsize) };
    }
    b.mapped += csize;
    b.committed += pminsize;
    true
  }

  pub(crate) unsafe fn base_alloc(&self, size: usize) -> *mut u8 {
    let csize = cacheline_ceiling(size);

    self.base_mtx.lock();
    let b = unsafe { &mut *self.base.get() };
    if b.next as usize + csize > b.past as usize {
      if !unsafe { self.base_pages_alloc(csize) } {
        self.base_mtx.unlock();
        return null_mut();
      }
    }
    let b = unsafe { &mut *self.base.get() };
    let ret = b.next;
    b.next = unsafe { b.next.add(csize) };
    // Advance the commit watermark past the new allocation.
    if b.next as usize > b.next_decommitted as usize {
      let pnext = page_ceiling(b.next as usize) as *mut u8;
      let delta = pnext as usize - b.next_decommitted as usize;
      if cfg!(feature = "decommit") {
        unsafe { pages_commit(b.next_decommitted, delta) };
      }
      b.next_decommitted = pnext;
      b.committed += delta;
    }
    self.base_mtx.unlock();

    ret
  }

  pub(crate) unsafe fn base_calloc(&self, number: usize, size: usize) -> *mut u8 {
    let total = number * size;
    let ret = unsafe { self.base_alloc(total) };
    if !ret.is_null() {
      unsafe { core::ptr::write_bytes(ret, 0, total) };
    }
    ret
  }

  pub(crate) unsafe fn base_node_alloc(&self) -> *mut ExtentNode {
    self.base_mtx.lock();
    let b = unsafe { &mut *self.base.get() };
    if !b.nodes.is_null() {
      let ret = b.nodes;
      b.nodes = unsafe { *(ret as *mut *mut ExtentNode) };
      self.base_mtx.unlock();
      ret
    } else {
      self.base_mtx.unlock();
      unsafe { self.base_alloc(size_of::<ExtentNode>()) as *mut ExtentNode }
    }
  }

  pub(crate) unsafe fn base_node_dealloc(&self, node: *mut ExtentNode) {
    self.base_mtx.lock();
    let b = unsafe { &mut *self.base.get() };
    unsafe { *(node as *mut *mut ExtentNode) = b.nodes };
    b.nodes = node;
    self.base_mtx.unlock();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bump_allocations_are_disjoint_and_aligned() {
    let heap = Box::leak(Box::new(Heap::new()));
    unsafe {
      let a = heap.base_alloc(40);
      let b = heap.base_alloc(100);
      assert!(!a.is_null() && !b.is_null());
      assert_eq!(a as usize % CACHELINE, 0);
      assert_eq!(b as usize % CACHELINE, 0);
      assert!(b as usize >= a as usize + 40);
      a.write_bytes(0x11, 40);
      b.write_bytes(0x22, 100);
      assert_eq!(*a, 0x11);
      assert_eq!(*b, 0x22);
    }
  }

  #[test]
  fn node_freelist_recycles() {
    let heap = Box::leak(Box::new(Heap::new()));
    unsafe {
      let n1 = heap.base_node_alloc();
      assert!(!n1.is_null());
      heap.base_node_dealloc(n1);
      let n2 = heap.base_node_alloc();
      assert_eq!(n1, n2);
    }
  }
}
