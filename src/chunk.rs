//! Chunk allocation and recycling.
//!
//! Chunks are chunk-aligned spans of address space obtained from the page
//! layer. Released chunks enter a bounded recycle cache: two red-black
//! trees over the same extent-node set, one ordered by (size, addr) for
//! first-best-fit retrieval, one by address for coalescing.

use core::cmp::Ordering;
use core::ptr::null_mut;
use core::sync::atomic::Ordering as AtomicOrdering;

use crate::pages::{
  alignment_addr2offset, alignment_ceiling, pages_map, pages_purge, pages_trim, pages_unmap,
};
use crate::rb::{RbNode, RbTrait};
use crate::{CHUNK_MASK, CHUNKSIZE, Heap, PAGE_SIZE, RECYCLE_LIMIT};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChunkType {
  /// Provenance lost (e.g. a registration failure unwinding).
  Unknown,
  /// Guaranteed zero on next use.
  Zeroed,
  /// Backed an arena chunk.
  Arena,
  /// Backed a huge allocation.
  Huge,
  /// Coalesced from chunks of differing provenance.
  Recycled,
}

/// Tracks one span of recycled address space, or one huge allocation.
/// A node can sit in the size/address and address trees simultaneously.
#[repr(C)]
pub(crate) struct ExtentNode {
  link_szad: RbNode<ExtentNode>,
  link_ad: RbNode<ExtentNode>,
  pub(crate) addr: *mut u8,
  pub(crate) size: usize,
  pub(crate) chunk_type: ChunkType,
}

impl ExtentNode {
  /// Stack-allocated search key; only `addr`/`size` are meaningful.
  pub(crate) fn key(addr: *mut u8, size: usize) -> Self {
    Self {
      link_szad: RbNode::new(),
      link_ad: RbNode::new(),
      addr,
      size,
      chunk_type: ChunkType::Unknown,
    }
  }
}

pub(crate) struct ExtentSzadTrait;

unsafe impl RbTrait for ExtentSzadTrait {
  type T = ExtentNode;

  unsafe fn node(x: *mut ExtentNode) -> *mut RbNode<ExtentNode> {
    unsafe { &raw mut (*x).link_szad }
  }

  unsafe fn cmp(a: *const ExtentNode, b: *const ExtentNode) -> Ordering {
    unsafe {
      (*a)
        .size
        .cmp(&(*b).size)
        .then(((*a).addr as usize).cmp(&((*b).addr as usize)))
    }
  }
}

pub(crate) struct ExtentAdTrait;

unsafe impl RbTrait for ExtentAdTrait {
  type T = ExtentNode;

  unsafe fn node(x: *mut ExtentNode) -> *mut RbNode<ExtentNode> {
    unsafe { &raw mut (*x).link_ad }
  }

  unsafe fn cmp(a: *const ExtentNode, b: *const ExtentNode) -> Ordering {
    unsafe { ((*a).addr as usize).cmp(&((*b).addr as usize)) }
  }
}

/// Aligned reservation straight from the OS. Optimistically maps exactly
/// `size` and falls back to over-allocate-and-trim on an alignment miss.
unsafe fn chunk_alloc_mmap(size: usize, alignment: usize) -> *mut u8 {
  let ret = unsafe { pages_map(null_mut(), size) };
  if ret.is_null() {
    return null_mut();
  }
  if alignment_addr2offset(ret, alignment) != 0 {
    unsafe { pages_unmap(ret, size) };
    return unsafe { chunk_alloc_mmap_slow(size, alignment) };
  }
  ret
}

unsafe fn chunk_alloc_mmap_slow(size: usize, alignment: usize) -> *mut u8 {
  let Some(alloc_size) = size.checked_add(alignment - PAGE_SIZE) else {
    return null_mut();
  };
  let pages = unsafe { pages_map(null_mut(), alloc_size) };
  if pages.is_null() {
    return null_mut();
  }
  let leadsize = alignment_ceiling(pages as usize, alignment) - pages as usize;
  unsafe { pages_trim(pages, alloc_size, leadsize, size) }
}

impl Heap {
  /// Best-fit retrieval from the recycle cache, with slack for alignment.
  /// Returns (addr, zeroed) or null on miss. Base requests must not enter:
  /// the cache can call back into the base allocator for nodes.
  unsafe fn chunk_recycle(
    &self,
    size: usize,
    alignment: usize,
    is_base: bool,
  ) -> (*mut u8, bool) {
    if is_base {
      return (null_mut(), false);
    }

    let Some(alloc_size) = size.checked_add(alignment - CHUNKSIZE) else {
      return (null_mut(), false);
    };
    let key = ExtentNode::key(null_mut(), alloc_size);

    self.chunks_mtx.lock();
    let mut node = unsafe { (*self.chunks_szad.get()).search_or_next(&key) };
    if node.is_null() {
      self.chunks_mtx.unlock();
      return (null_mut(), false);
    }

    unsafe {
      let leadsize = alignment_ceiling((*node).addr as usize, alignment) - (*node).addr as usize;
      debug_assert!((*node).size >= leadsize + size);
      let trailsize = (*node).size - leadsize - size;
      let ret = (*node).addr.add(leadsize);
      let chunk_type = (*node).chunk_type;
      #[allow(unused_mut)]
      let mut zeroed = chunk_type == ChunkType::Zeroed;

      (*self.chunks_szad.get()).remove(node);
      (*self.chunks_ad.get()).remove(node);
      if leadsize != 0 {
        // Reinsert the leading space as a smaller chunk.
        (*node).size = leadsize;
        (*self.chunks_szad.get()).insert(node);
        (*self.chunks_ad.get()).insert(node);
        node = null_mut();
      }
      if trailsize != 0 {
        if node.is_null() {
          // An extra node is needed, but allocating one can recurse
          // into chunk allocation; drop the lock first.
          self.chunks_mtx.unlock();
          node = self.base_node_alloc();
          if node.is_null() {
            self.chunk_dealloc(ret, size, chunk_type);
            return (null_mut(), false);
          }
          self.chunks_mtx.lock();
        }
        (*node).addr = ret.add(size);
        (*node).size = trailsize;
        (*node).chunk_type = chunk_type;
        (*self.chunks_szad.get()).insert(node);
        (*self.chunks_ad.get()).insert(node);
        node = null_mut();
      }

      self
        .recycled_size
        .fetch_sub(size, AtomicOrdering::Relaxed);
      self.chunks_mtx.unlock();

      if !node.is_null() {
        self.base_node_dealloc(node);
      }
      #[cfg(feature = "decommit")]
      {
        // The cache decommits on insert, so back the range again; commit
        // guarantees zeroes.
        crate::pages::pages_commit(ret, size);
        zeroed = true;
      }
      (ret, zeroed)
    }
  }

  /// Acquire `size` bytes aligned to `alignment` (both chunk multiples).
  /// Returns (addr, zeroed). Non-base chunks are registered in the radix
  /// tree; a registration failure fails the allocation.
  pub(crate) unsafe fn chunk_alloc(
    &self,
    size: usize,
    alignment: usize,
    is_base: bool,
  ) -> (*mut u8, bool) {
    debug_assert!(size != 0 && size & CHUNK_MASK == 0);
    debug_assert!(alignment != 0 && alignment & CHUNK_MASK == 0);

    let (mut ret, mut zeroed) = unsafe { self.chunk_recycle(size, alignment, is_base) };
    if ret.is_null() {
      ret = unsafe { chunk_alloc_mmap(size, alignment) };
      zeroed = true;
    }

    if !ret.is_null() && !is_base {
      if !unsafe { self.rtree.set(self, ret, ret) } {
        unsafe { self.chunk_dealloc(ret, size, ChunkType::Unknown) };
        return (null_mut(), false);
      }
    }

    debug_assert!(ret as usize & CHUNK_MASK == 0);
    (ret, zeroed)
  }

  pub(crate) unsafe fn chunk_ensure_zero(&self, ptr: *mut u8, size: usize, zeroed: bool) {
    if !zeroed {
      unsafe { core::ptr::write_bytes(ptr, 0, size) };
    }
  }

  /// Insert a released span into the recycle cache, coalescing with
  /// address-adjacent spans. If no extent node can be obtained the span is
  /// leaked: its pages are already purged, so only address space is lost.
  unsafe fn chunk_record(&self, chunk: *mut u8, size: usize, chunk_type: ChunkType) {
    let mut chunk_type = chunk_type;
    if chunk_type != ChunkType::Zeroed {
      if unsafe { pages_purge(chunk, size, chunk_type == ChunkType::Huge) } {
        chunk_type = ChunkType::Zeroed;
      }
    }

    // Get a node before taking chunks_mtx: allocating one may itself grab
    // a fresh base chunk.
    let mut xnode = unsafe { self.base_node_alloc() };
    let mut xprev: *mut ExtentNode = null_mut();

    self.chunks_mtx.lock();
    unsafe {
      let key = ExtentNode::key(chunk.add(size), 0);
      let mut node = (*self.chunks_ad.get()).search_or_next(&key);

      let recorded;
      if !node.is_null() && (*node).addr == key.addr {
        // Coalesce forward. The address-tree position is unchanged; only
        // the size tree needs a re-insert.
        (*self.chunks_szad.get()).remove(node);
        (*node).addr = chunk;
        (*node).size += size;
        if (*node).chunk_type != chunk_type {
          (*node).chunk_type = ChunkType::Recycled;
        }
        (*self.chunks_szad.get()).insert(node);
        recorded = true;
      } else if xnode.is_null() {
        // Exceedingly unlikely metadata exhaustion; leak the range.
        recorded = false;
      } else {
        node = xnode;
        xnode = null_mut();
        (*node).addr = chunk;
        (*node).size = size;
        (*node).chunk_type = chunk_type;
        (*self.chunks_ad.get()).insert(node);
        (*self.chunks_szad.get()).insert(node);
        recorded = true;
      }

      if recorded {
        // Coalesce backward.
        let prev = (*self.chunks_ad.get()).prev(node);
        if !prev.is_null() && (*prev).addr.add((*prev).size) == chunk {
          (*self.chunks_szad.get()).remove(prev);
          (*self.chunks_ad.get()).remove(prev);

          (*self.chunks_szad.get()).remove(node);
          (*node).addr = (*prev).addr;
          (*node).size += (*prev).size;
          if (*node).chunk_type != (*prev).chunk_type {
            (*node).chunk_type = ChunkType::Recycled;
          }
          (*self.chunks_szad.get()).insert(node);

          xprev = prev;
        }

        self.recycled_size.fetch_add(size, AtomicOrdering::Relaxed);
      }
    }
    self.chunks_mtx.unlock();

    // Release spare nodes only after dropping chunks_mtx.
    unsafe {
      if !xnode.is_null() {
        self.base_node_dealloc(xnode);
      }
      if !xprev.is_null() {
        self.base_node_dealloc(xprev);
      }
    }
  }

  pub(crate) unsafe fn chunk_dealloc(&self, chunk: *mut u8, size: usize, chunk_type: ChunkType) {
    debug_assert!(!chunk.is_null() && chunk as usize & CHUNK_MASK == 0);
    debug_assert!(size != 0 && size & CHUNK_MASK == 0);

    unsafe { self.rtree.unset(self, chunk) };

    let recycled_so_far = self.recycled_size.load(AtomicOrdering::Acquire);
    if recycled_so_far < RECYCLE_LIMIT {
      let recycle_remaining = RECYCLE_LIMIT - recycled_so_far;
      let to_recycle = if size > recycle_remaining {
        // Drop the pages that would overflow the recycle limit.
        unsafe { pages_trim(chunk, size, 0, recycle_remaining) };
        recycle_remaining
      } else {
        size
      };
      unsafe { self.chunk_record(chunk, to_recycle, chunk_type) };
      return;
    }

    unsafe { pages_unmap(chunk, size) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn recycle_returns_released_chunk() {
    let heap = Box::leak(Box::new(Heap::new()));
    unsafe {
      let (a, _) = heap.chunk_alloc(CHUNKSIZE, CHUNKSIZE, false);
      assert!(!a.is_null());
      assert_eq!(a as usize & CHUNK_MASK, 0);
      heap.chunk_dealloc(a, CHUNKSIZE, ChunkType::Arena);
      let (b, _) = heap.chunk_alloc(CHUNKSIZE, CHUNKSIZE, false);
      assert_eq!(a, b);
      heap.chunk_dealloc(b, CHUNKSIZE, ChunkType::Arena);
    }
  }

  #[test]
  fn adjacent_spans_coalesce() {
    let heap = Box::leak(Box::new(Heap::new()));
    unsafe {
      let (a, _) = heap.chunk_alloc(2 * CHUNKSIZE, CHUNKSIZE, false);
      assert!(!a.is_null());
      // Free the two halves separately; the cache must merge them so a
      // two-chunk request hits.
      heap.chunk_dealloc(a, CHUNKSIZE, ChunkType::Huge);
      heap.chunk_dealloc(a.add(CHUNKSIZE), CHUNKSIZE, ChunkType::Huge);
      let (b, _) = heap.chunk_alloc(2 * CHUNKSIZE, CHUNKSIZE, false);
      assert_eq!(b, a);
      heap.chunk_dealloc(b, 2 * CHUNKSIZE, ChunkType::Huge);
    }
  }

  #[test]
  fn zeroed_flag_is_trustworthy() {
    let heap = Box::leak(Box::new(Heap::new()));
    unsafe {
      let (a, zeroed) = heap.chunk_alloc(CHUNKSIZE, CHUNKSIZE, false);
      assert!(!a.is_null());
      if zeroed {
        for i in (0..CHUNKSIZE).step_by(PAGE_SIZE) {
          assert_eq!(*a.add(i), 0);
        }
      }
      a.write_bytes(0x3c, CHUNKSIZE);
      heap.chunk_dealloc(a, CHUNKSIZE, ChunkType::Arena);
      let (b, zeroed) = heap.chunk_alloc(CHUNKSIZE, CHUNKSIZE, false);
      if zeroed {
        for i in (0..CHUNKSIZE).step_by(PAGE_SIZE) {
          assert_eq!(*b.add(i), 0, "recycled chunk claimed zeroed but was not");
        }
      }
      heap.chunk_dealloc(b, CHUNKSIZE, ChunkType::Arena);
    }
  }
}
