//! Intrusive red-black tree.
//!
//! Nodes live inside allocator metadata (page-map entries, chunk headers,
//! extent nodes, arenas), so the tree never allocates. A `Trait` impl names
//! the embedded link field and the ordering; the same node type can sit in
//! two trees at once through two link fields and two traits.
//!
//! Search-style operations take a key node: a stack value of the item type
//! with only the compared fields initialized. The comparator receives the
//! key as its first argument.

use core::cmp::Ordering;
use core::marker::PhantomData;
use core::ptr::null_mut;

#[repr(C)]
pub(crate) struct RbNode<T> {
  left: *mut T,
  right: *mut T,
  parent: *mut T,
  red: bool,
}

impl<T> RbNode<T> {
  pub(crate) const fn new() -> Self {
    Self {
      left: null_mut(),
      right: null_mut(),
      parent: null_mut(),
      red: false,
    }
  }
}

/// Access to the embedded link plus the tree order.
///
/// # Safety
///
/// `node` must return a stable pointer to a link field inside `*x`, and
/// `cmp` must implement a strict total order over the items in the tree.
pub(crate) unsafe trait RbTrait {
  type T;
  unsafe fn node(x: *mut Self::T) -> *mut RbNode<Self::T>;
  unsafe fn cmp(a: *const Self::T, b: *const Self::T) -> Ordering;
}

pub(crate) struct RbTree<L: RbTrait> {
  root: *mut L::T,
  _marker: PhantomData<L>,
}

impl<L: RbTrait> RbTree<L> {
  pub(crate) const fn new() -> Self {
    Self {
      root: null_mut(),
      _marker: PhantomData,
    }
  }

  #[inline]
  unsafe fn left(x: *mut L::T) -> *mut L::T {
    unsafe { (*L::node(x)).left }
  }

  #[inline]
  unsafe fn right(x: *mut L::T) -> *mut L::T {
    unsafe { (*L::node(x)).right }
  }

  #[inline]
  unsafe fn parent(x: *mut L::T) -> *mut L::T {
    unsafe { (*L::node(x)).parent }
  }

  #[inline]
  unsafe fn set_left(x: *mut L::T, v: *mut L::T) {
    unsafe { (*L::node(x)).left = v }
  }

  #[inline]
  unsafe fn set_right(x: *mut L::T, v: *mut L::T) {
    unsafe { (*L::node(x)).right = v }
  }

  #[inline]
  unsafe fn set_parent(x: *mut L::T, v: *mut L::T) {
    unsafe { (*L::node(x)).parent = v }
  }

  /// Null nodes count as black.
  #[inline]
  unsafe fn is_red(x: *mut L::T) -> bool {
    !x.is_null() && unsafe { (*L::node(x)).red }
  }

  #[inline]
  unsafe fn set_red(x: *mut L::T, red: bool) {
    unsafe { (*L::node(x)).red = red }
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.root.is_null()
  }

  unsafe fn minimum(mut x: *mut L::T) -> *mut L::T {
    unsafe {
      while !Self::left(x).is_null() {
        x = Self::left(x);
      }
    }
    x
  }

  unsafe fn maximum(mut x: *mut L::T) -> *mut L::T {
    unsafe {
      while !Self::right(x).is_null() {
        x = Self::right(x);
      }
    }
    x
  }

  pub(crate) unsafe fn first(&self) -> *mut L::T {
    if self.root.is_null() {
      null_mut()
    } else {
      unsafe { Self::minimum(self.root) }
    }
  }

  pub(crate) unsafe fn last(&self) -> *mut L::T {
    if self.root.is_null() {
      null_mut()
    } else {
      unsafe { Self::maximum(self.root) }
    }
  }

  /// In-order successor of a node currently in the tree.
  pub(crate) unsafe fn next(&self, x: *mut L::T) -> *mut L::T {
    unsafe {
      if !Self::right(x).is_null() {
        return Self::minimum(Self::right(x));
      }
      let mut x = x;
      let mut p = Self::parent(x);
      while !p.is_null() && x == Self::right(p) {
        x = p;
        p = Self::parent(x);
      }
      p
    }
  }

  /// In-order predecessor of a node currently in the tree.
  pub(crate) unsafe fn prev(&self, x: *mut L::T) -> *mut L::T {
    unsafe {
      if !Self::left(x).is_null() {
        return Self::maximum(Self::left(x));
      }
      let mut x = x;
      let mut p = Self::parent(x);
      while !p.is_null() && x == Self::left(p) {
        x = p;
        p = Self::parent(x);
      }
      p
    }
  }

  /// Exact match for `key`, or null.
  pub(crate) unsafe fn search(&self, key: *const L::T) -> *mut L::T {
    let mut cur = self.root;
    unsafe {
      while !cur.is_null() {
        match L::cmp(key, cur) {
          Ordering::Equal => return cur,
          Ordering::Less => cur = Self::left(cur),
          Ordering::Greater => cur = Self::right(cur),
        }
      }
    }
    null_mut()
  }

  /// Lowest node that orders greater than or equal to `key`, or null.
  pub(crate) unsafe fn search_or_next(&self, key: *const L::T) -> *mut L::T {
    let mut ret = null_mut();
    let mut cur = self.root;
    unsafe {
      while !cur.is_null() {
        match L::cmp(key, cur) {
          Ordering::Equal => return cur,
          Ordering::Less => {
            ret = cur;
            cur = Self::left(cur);
          }
          Ordering::Greater => cur = Self::right(cur),
        }
      }
    }
    ret
  }

  /// Search with a caller-supplied comparator, for lookups whose order is
  /// not the tree's insertion order (e.g. address-in-range probes against
  /// an address-ordered tree).
  pub(crate) unsafe fn search_with<F>(&self, f: F) -> *mut L::T
  where
    F: Fn(*const L::T) -> Ordering,
  {
    let mut cur = self.root;
    unsafe {
      while !cur.is_null() {
        match f(cur) {
          Ordering::Equal => return cur,
          Ordering::Less => cur = Self::left(cur),
          Ordering::Greater => cur = Self::right(cur),
        }
      }
    }
    null_mut()
  }

  unsafe fn rotate_left(&mut self, x: *mut L::T) {
    unsafe {
      let y = Self::right(x);
      Self::set_right(x, Self::left(y));
      if !Self::left(y).is_null() {
        Self::set_parent(Self::left(y), x);
      }
      Self::set_parent(y, Self::parent(x));
      let p = Self::parent(x);
      if p.is_null() {
        self.root = y;
      } else if x == Self::left(p) {
        Self::set_left(p, y);
      } else {
        Self::set_right(p, y);
      }
      Self::set_left(y, x);
      Self::set_parent(x, y);
    }
  }

  unsafe fn rotate_right(&mut self, x: *mut L::T) {
    unsafe {
      let y = Self::left(x);
      Self::set_left(x, Self::right(y));
      if !Self::right(y).is_null() {
        Self::set_parent(Self::right(y), x);
      }
      Self::set_parent(y, Self::parent(x));
      let p = Self::parent(x);
      if p.is_null() {
        self.root = y;
      } else if x == Self::right(p) {
        Self::set_right(p, y);
      } else {
        Self::set_left(p, y);
      }
      Self::set_right(y, x);
      Self::set_parent(x, y);
    }
  }

  pub(crate) unsafe fn insert(&mut self, z: *mut L::T) {
    unsafe {
      *L::node(z) = RbNode::new();

      let mut parent = null_mut();
      let mut cur = self.root;
      while !cur.is_null() {
        parent = cur;
        cur = if L::cmp(z, cur) == Ordering::Less {
          Self::left(cur)
        } else {
          Self::right(cur)
        };
      }
      Self::set_parent(z, parent);
      if parent.is_null() {
        self.root = z;
      } else if L::cmp(z, parent) == Ordering::Less {
        Self::set_left(parent, z);
      } else {
        Self::set_right(parent, z);
      }
      Self::set_red(z, true);
      self.insert_fixup(z);
    }
  }

  unsafe fn insert_fixup(&mut self, mut z: *mut L::T) {
    unsafe {
      while Self::is_red(Self::parent(z)) {
        let p = Self::parent(z);
        let g = Self::parent(p);
        if p == Self::left(g) {
          let u = Self::right(g);
          if Self::is_red(u) {
            Self::set_red(p, false);
            Self::set_red(u, false);
            Self::set_red(g, true);
            z = g;
          } else {
            if z == Self::right(p) {
              z = p;
              self.rotate_left(z);
            }
            let p = Self::parent(z);
            let g = Self::parent(p);
            Self::set_red(p, false);
            Self::set_red(g, true);
            self.rotate_right(g);
          }
        } else {
          let u = Self::left(g);
          if Self::is_red(u) {
            Self::set_red(p, false);
            Self::set_red(u, false);
            Self::set_red(g, true);
            z = g;
          } else {
            if z == Self::left(p) {
              z = p;
              self.rotate_right(z);
            }
            let p = Self::parent(z);
            let g = Self::parent(p);
            Self::set_red(p, false);
            Self::set_red(g, true);
            self.rotate_left(g);
          }
        }
      }
      Self::set_red(self.root, false);
    }
  }

  /// Replace the subtree rooted at `u` with the one rooted at `v`.
  unsafe fn transplant(&mut self, u: *mut L::T, v: *mut L::T) {
    unsafe {
      let p = Self::parent(u);
      if p.is_null() {
        self.root = v;
      } else if u == Self::left(p) {
        Self::set_left(p, v);
      } else {
        Self::set_right(p, v);
      }
      if !v.is_null() {
        Self::set_parent(v, p);
      }
    }
  }

  pub(crate) unsafe fn remove(&mut self, z: *mut L::T) {
    unsafe {
      let mut y = z;
      let mut y_was_red = Self::is_red(y);
      let x: *mut L::T;
      let x_parent: *mut L::T;

      if Self::left(z).is_null() {
        x = Self::right(z);
        x_parent = Self::parent(z);
        self.transplant(z, x);
      } else if Self::right(z).is_null() {
        x = Self::left(z);
        x_parent = Self::parent(z);
        self.transplant(z, x);
      } else {
        y = Self::minimum(Self::right(z));
        y_was_red = Self::is_red(y);
        x = Self::right(y);
        if Self::parent(y) == z {
          x_parent = y;
          if !x.is_null() {
            Self::set_parent(x, y);
          }
        } else {
          x_parent = Self::parent(y);
          self.transplant(y, x);
          Self::set_right(y, Self::right(z));
          Self::set_parent(Self::right(y), y);
        }
        self.transplant(z, y);
        Self::set_left(y, Self::left(z));
        Self::set_parent(Self::left(y), y);
        Self::set_red(y, Self::is_red(z));
      }

      if !y_was_red {
        self.remove_fixup(x, x_parent);
      }
    }
  }

  unsafe fn remove_fixup(&mut self, mut x: *mut L::T, mut x_parent: *mut L::T) {
    unsafe {
      while x != self.root && !Self::is_red(x) {
        if x_parent.is_null() {
          break;
        }
        if x == Self::left(x_parent) {
          let mut w = Self::right(x_parent);
          if Self::is_red(w) {
            Self::set_red(w, false);
            Self::set_red(x_parent, true);
            self.rotate_left(x_parent);
            w = Self::right(x_parent);
          }
          if !Self::is_red(Self::left(w)) && !Self::is_red(Self::right(w)) {
            Self::set_red(w, true);
            x = x_parent;
            x_parent = Self::parent(x);
          } else {
            if !Self::is_red(Self::right(w)) {
              Self::set_red(Self::left(w), false);
              Self::set_red(w, true);
              self.rotate_right(w);
              w = Self::right(x_parent);
            }
            Self::set_red(w, Self::is_red(x_parent));
            Self::set_red(x_parent, false);
            Self::set_red(Self::right(w), false);
            self.rotate_left(x_parent);
            x = self.root;
            x_parent = null_mut();
          }
        } else {
          let mut w = Self::left(x_parent);
          if Self::is_red(w) {
            Self::set_red(w, false);
            Self::set_red(x_parent, true);
            self.rotate_right(x_parent);
            w = Self::left(x_parent);
          }
          if !Self::is_red(Self::right(w)) && !Self::is_red(Self::left(w)) {
            Self::set_red(w, true);
            x = x_parent;
            x_parent = Self::parent(x);
          } else {
            if !Self::is_red(Self::left(w)) {
              Self::set_red(Self::right(w), false);
              Self::set_red(w, true);
              self.rotate_left(w);
              w = Self::left(x_parent);
            }
            Self::set_red(w, Self::is_red(x_parent));
            Self::set_red(x_parent, false);
            Self::set_red(Self::left(w), false);
            self.rotate_right(x_parent);
            x = self.root;
            x_parent = null_mut();
          }
        }
      }
      if !x.is_null() {
        Self::set_red(x, false);
      }
    }
  }

  /// In-order iteration. The tree must not be mutated while iterating.
  pub(crate) unsafe fn iter(&self) -> RbIter<'_, L> {
    RbIter {
      tree: self,
      cur: unsafe { self.first() },
    }
  }
}

pub(crate) struct RbIter<'a, L: RbTrait> {
  tree: &'a RbTree<L>,
  cur: *mut L::T,
}

impl<'a, L: RbTrait> Iterator for RbIter<'a, L> {
  type Item = *mut L::T;

  fn next(&mut self) -> Option<*mut L::T> {
    if self.cur.is_null() {
      return None;
    }
    let ret = self.cur;
    self.cur = unsafe { self.tree.next(ret) };
    Some(ret)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[repr(C)]
  struct TestNode {
    link: RbNode<TestNode>,
    val: usize,
  }

  struct TestTrait;

  unsafe impl RbTrait for TestTrait {
    type T = TestNode;

    unsafe fn node(x: *mut TestNode) -> *mut RbNode<TestNode> {
      unsafe { &raw mut (*x).link }
    }

    unsafe fn cmp(a: *const TestNode, b: *const TestNode) -> Ordering {
      unsafe { (*a).val.cmp(&(*b).val) }
    }
  }

  fn make(val: usize) -> *mut TestNode {
    Box::into_raw(Box::new(TestNode {
      link: RbNode::new(),
      val,
    }))
  }

  fn key(val: usize) -> TestNode {
    TestNode {
      link: RbNode::new(),
      val,
    }
  }

  fn collect(tree: &RbTree<TestTrait>) -> Vec<usize> {
    unsafe { tree.iter().map(|n| (*n).val).collect() }
  }

  /// Deterministic shuffle; avoids pulling in an RNG dependency.
  fn pseudo_shuffle(vals: &mut Vec<usize>) {
    let mut state = 0x9e3779b97f4a7c15u64;
    for i in (1..vals.len()).rev() {
      state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
      let j = (state >> 33) as usize % (i + 1);
      vals.swap(i, j);
    }
  }

  unsafe fn check_rb_invariants(tree: &RbTree<TestTrait>) {
    unsafe fn black_height(n: *mut TestNode) -> usize {
      if n.is_null() {
        return 1;
      }
      unsafe {
        let l = (*n).link.left;
        let r = (*n).link.right;
        if (*n).link.red {
          assert!(l.is_null() || !(*l).link.red, "red node with red child");
          assert!(r.is_null() || !(*r).link.red, "red node with red child");
        }
        if !l.is_null() {
          assert_eq!((*l).link.parent, n);
          assert!((*l).val < (*n).val);
        }
        if !r.is_null() {
          assert_eq!((*r).link.parent, n);
          assert!((*r).val > (*n).val);
        }
        let bl = black_height(l);
        let br = black_height(r);
        assert_eq!(bl, br, "unequal black heights");
        bl + if (*n).link.red { 0 } else { 1 }
      }
    }

    if !tree.root.is_null() {
      unsafe {
        assert!(!(*tree.root).link.red, "red root");
        assert!((*tree.root).link.parent.is_null());
        black_height(tree.root);
      }
    }
  }

  #[test]
  fn insert_orders_nodes() {
    let mut tree: RbTree<TestTrait> = RbTree::new();
    let mut vals: Vec<usize> = (0..200).map(|i| i * 3).collect();
    pseudo_shuffle(&mut vals);
    unsafe {
      for &v in &vals {
        tree.insert(make(v));
        check_rb_invariants(&tree);
      }
    }
    let got = collect(&tree);
    let mut want = vals.clone();
    want.sort_unstable();
    assert_eq!(got, want);
  }

  #[test]
  fn search_and_lower_bound() {
    let mut tree: RbTree<TestTrait> = RbTree::new();
    unsafe {
      for v in [10, 20, 30, 40, 50] {
        tree.insert(make(v));
      }
      assert_eq!((*tree.search(&key(30))).val, 30);
      assert!(tree.search(&key(35)).is_null());
      assert_eq!((*tree.search_or_next(&key(35))).val, 40);
      assert_eq!((*tree.search_or_next(&key(40))).val, 40);
      assert_eq!((*tree.search_or_next(&key(1))).val, 10);
      assert!(tree.search_or_next(&key(51)).is_null());
    }
  }

  #[test]
  fn neighbours() {
    let mut tree: RbTree<TestTrait> = RbTree::new();
    unsafe {
      for v in [10, 20, 30] {
        tree.insert(make(v));
      }
      let mid = tree.search(&key(20));
      assert_eq!((*tree.prev(mid)).val, 10);
      assert_eq!((*tree.next(mid)).val, 30);
      assert!(tree.prev(tree.first()).is_null());
      assert!(tree.next(tree.last()).is_null());
    }
  }

  #[test]
  fn remove_keeps_order_and_invariants() {
    let mut tree: RbTree<TestTrait> = RbTree::new();
    let mut vals: Vec<usize> = (0..300).collect();
    pseudo_shuffle(&mut vals);
    let nodes: Vec<*mut TestNode> = vals.iter().map(|&v| make(v)).collect();
    unsafe {
      for &n in &nodes {
        tree.insert(n);
      }
      // Remove every other node in shuffled order.
      for (i, &n) in nodes.iter().enumerate() {
        if i % 2 == 0 {
          tree.remove(n);
          check_rb_invariants(&tree);
        }
      }
      let got = collect(&tree);
      let mut want: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, &n)| (*n).val)
        .collect();
      want.sort_unstable();
      assert_eq!(got, want);

      // Drain the rest.
      for (i, &n) in nodes.iter().enumerate() {
        if i % 2 == 1 {
          tree.remove(n);
          check_rb_invariants(&tree);
        }
      }
      assert!(tree.is_empty());
    }
  }

  #[test]
  fn reinsert_after_remove() {
    let mut tree: RbTree<TestTrait> = RbTree::new();
    let n = make(42);
    unsafe {
      tree.insert(n);
      tree.remove(n);
      assert!(tree.is_empty());
      tree.insert(n);
      assert_eq!((*tree.first()).val, 42);
    }
  }
}
