//! Address radix tree.
//!
//! Fixed-depth trie over the chunk-aligned portion of an address, used to
//! answer "does the allocator own this chunk" without touching the chunk
//! itself. Writers serialize on an internal lock; readers are lock-free.
//! Slots only ever transition null -> value, so child pointers are
//! published with release stores and read with acquire loads. Node arrays
//! come from the base allocator and are never freed.

use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::mutex::Mutex;
use crate::{CHUNK_2POW, Heap};

const PTR_BITS: usize = usize::BITS as usize;
const PTR_2POW: usize = size_of::<usize>().trailing_zeros() as usize;

/// Significant key bits: everything above the chunk offset.
const BITS: usize = PTR_BITS - CHUNK_2POW;

// Cacheline-sized nodes on 64-bit keeps the per-level fan-out small but the
// tree is only walked on foreign-pointer validation; 32-bit uses larger
// nodes so the whole tree is two levels.
#[cfg(target_pointer_width = "64")]
const NODE_SIZE_2POW: usize = 6;
#[cfg(target_pointer_width = "32")]
const NODE_SIZE_2POW: usize = 14;

const BITS_PER_LEVEL: usize = NODE_SIZE_2POW - PTR_2POW;
const BITS_AT_LEVEL1: usize = if BITS % BITS_PER_LEVEL != 0 {
  BITS % BITS_PER_LEVEL
} else {
  BITS_PER_LEVEL
};
const HEIGHT: usize = (BITS + BITS_PER_LEVEL - 1) / BITS_PER_LEVEL;

const _: () = assert!(BITS_AT_LEVEL1 + (HEIGHT - 1) * BITS_PER_LEVEL == BITS);

pub(crate) struct RadixTree {
  lock: Mutex,
  root: AtomicPtr<AtomicPtr<u8>>,
}

impl RadixTree {
  pub(crate) const fn new() -> Self {
    Self {
      lock: Mutex::new(),
      root: AtomicPtr::new(null_mut()),
    }
  }

  #[inline]
  fn level_bits(level: usize) -> usize {
    if level == 0 { BITS_AT_LEVEL1 } else { BITS_PER_LEVEL }
  }

  unsafe fn get_slot(&self, heap: &Heap, key: *mut u8, create: bool) -> *mut AtomicPtr<u8> {
    let key = key as usize;
    let mut node = self.root.load(Ordering::Acquire);
    if node.is_null() {
      if !create {
        return null_mut();
      }
      // First write; the caller holds the tree lock.
      node = unsafe { heap.base_calloc(1 << BITS_AT_LEVEL1, size_of::<*mut u8>()) }.cast();
      if node.is_null() {
        return null_mut();
      }
      self.root.store(node, Ordering::Release);
    }

    let mut lshift = 0;
    for i in 0..HEIGHT - 1 {
      let bits = Self::level_bits(i);
      let subkey = (key << lshift) >> (PTR_BITS - bits);
      lshift += bits;
      unsafe {
        let slot = node.add(subkey);
        let mut child = (*slot).load(Ordering::Acquire) as *mut AtomicPtr<u8>;
        if child.is_null() && create {
          child = heap
            .base_calloc(1 << BITS_PER_LEVEL, size_of::<*mut u8>())
            .cast();
          if !child.is_null() {
            (*slot).store(child.cast(), Ordering::Release);
          }
        }
        if child.is_null() {
          return null_mut();
        }
        node = child;
      }
    }

    let bits = Self::level_bits(HEIGHT - 1);
    let subkey = (key << lshift) >> (PTR_BITS - bits);
    unsafe { node.add(subkey) }
  }

  /// Lock-free lookup of the value registered for the chunk containing
  /// `key`. Null means the allocator does not own the chunk.
  pub(crate) unsafe fn get(&self, heap: &Heap, key: *mut u8) -> *mut u8 {
    let slot = unsafe { self.get_slot(heap, key, false) };
    if slot.is_null() {
      return null_mut();
    }
    unsafe { (*slot).load(Ordering::Acquire) }
  }

  /// Returns whether the value could be stored (node allocation can fail).
  pub(crate) unsafe fn set(&self, heap: &Heap, key: *mut u8, value: *mut u8) -> bool {
    self.lock.lock();
    let slot = unsafe { self.get_slot(heap, key, true) };
    if !slot.is_null() {
      unsafe { (*slot).store(value, Ordering::Release) };
    }
    self.lock.unlock();
    !slot.is_null()
  }

  pub(crate) unsafe fn unset(&self, heap: &Heap, key: *mut u8) -> bool {
    unsafe { self.set(heap, key, null_mut()) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn set_get_unset() {
    let heap = Box::leak(Box::new(Heap::new()));
    let tree = RadixTree::new();
    let a = (7usize << CHUNK_2POW) as *mut u8;
    let b = (9usize << CHUNK_2POW) as *mut u8;
    unsafe {
      assert!(tree.get(heap, a).is_null());
      assert!(tree.set(heap, a, a));
      assert_eq!(tree.get(heap, a), a);
      assert!(tree.get(heap, b).is_null());
      assert!(tree.set(heap, b, b));
      assert_eq!(tree.get(heap, b), b);
      assert!(tree.unset(heap, a));
      assert!(tree.get(heap, a).is_null());
      assert_eq!(tree.get(heap, b), b);
    }
  }

  #[test]
  fn distinguishes_high_address_bits() {
    let heap = Box::leak(Box::new(Heap::new()));
    let tree = RadixTree::new();
    // Keys that collide in the low levels but differ high up.
    let a = (1usize << 40) as *mut u8;
    let b = ((1usize << 40) | (1usize << CHUNK_2POW)) as *mut u8;
    unsafe {
      assert!(tree.set(heap, a, a));
      assert_eq!(tree.get(heap, a), a);
      assert!(tree.get(heap, b).is_null());
    }
  }
}
