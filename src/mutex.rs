//! Allocation-free locks.
//!
//! The allocator cannot use locks that allocate on contention, and the
//! chunk-recycle path needs to drop and retake a lock mid-operation, so
//! these expose raw `lock`/`unlock` rather than an RAII guard.
//!
//! Contention strategy: an uncontended acquire is a single
//! compare-exchange. Contended waiters watch the flag with exponentially
//! growing pause bursts, and past a cap hand the core back to the
//! scheduler; arena critical sections can span a purge syscall, and
//! burning a full quantum of pause loops behind one loses to a yield.

use core::hint;
use core::sync::atomic::{AtomicBool, Ordering};

/// Doubling pause bursts up to 1 << SPIN_LIMIT_2POW iterations, then
/// sched_yield between probes.
const SPIN_LIMIT_2POW: u32 = 6;

pub(crate) struct Mutex {
  locked: AtomicBool,
}

impl Mutex {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) {
    if self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
    {
      return;
    }
    self.lock_contended();
  }

  #[cold]
  fn lock_contended(&self) {
    let mut backoff = 0;
    loop {
      // Wait for the flag to look free before retrying the swap, so the
      // owner's cache line isn't stolen on every probe.
      while self.locked.load(Ordering::Relaxed) {
        if backoff <= SPIN_LIMIT_2POW {
          for _ in 0..1u32 << backoff {
            hint::spin_loop();
          }
          backoff += 1;
        } else {
          unsafe { libc::sched_yield() };
        }
      }
      if self
        .locked
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
      {
        return;
      }
    }
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }

  /// Forcibly return the lock to the unlocked state. Only valid when no
  /// other thread can hold it (the child side of fork).
  pub(crate) fn reinit(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn exclusion() {
    struct Shared {
      mtx: Mutex,
      counter: AtomicUsize,
    }

    let shared = Arc::new(Shared {
      mtx: Mutex::new(),
      counter: AtomicUsize::new(0),
    });

    let threads: Vec<_> = (0..4)
      .map(|_| {
        let shared = Arc::clone(&shared);
        std::thread::spawn(move || {
          for _ in 0..10_000 {
            shared.mtx.lock();
            let v = shared.counter.load(Ordering::Relaxed);
            shared.counter.store(v + 1, Ordering::Relaxed);
            shared.mtx.unlock();
          }
        })
      })
      .collect();

    for t in threads {
      t.join().unwrap();
    }
    assert_eq!(shared.counter.load(Ordering::Relaxed), 40_000);
  }

  #[test]
  fn uncontended_relock() {
    let mtx = Mutex::new();
    for _ in 0..1000 {
      mtx.lock();
      mtx.unlock();
    }
  }
}
