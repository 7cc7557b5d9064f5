use std::hint::black_box;
use std::time::Instant;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

/// One point per bin category, sitting on the boundaries where the
/// allocator switches strategy: tiny, quantum-spaced, sub-page, and the
/// dedicated-run large classes.
const CLASS_POINTS: &[(&str, usize)] = &[
  ("tiny", 8),
  ("quantum", 160),
  ("quantum_max", 512),
  ("subpage", 1536),
  ("large_min", 4096),
  ("large", 65536),
];

fn bench_class_alloc_free(c: &mut Criterion) {
  let mut group = c.benchmark_group("class_alloc_free");

  for &(label, size) in CLASS_POINTS {
    group.bench_with_input(BenchmarkId::new("pyrope", label), &size, |b, &size| {
      b.iter(|| unsafe {
        let ptr = pyrope::malloc(black_box(size));
        black_box(ptr);
        pyrope::free(ptr);
      })
    });

    group.bench_with_input(BenchmarkId::new("libc", label), &size, |b, &size| {
      b.iter(|| unsafe {
        let ptr = libc::malloc(black_box(size));
        black_box(ptr);
        libc::free(ptr);
      })
    });
  }

  group.finish();
}

/// Whole-chunk allocations bypass the arenas; a free/alloc cycle at these
/// sizes measures the chunk recycle cache.
fn bench_huge_recycle(c: &mut Criterion) {
  let mut group = c.benchmark_group("huge_recycle");

  for size in [2usize << 20, 8 << 20] {
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_with_input(
      BenchmarkId::from_parameter(format!("{}MiB", size >> 20)),
      &size,
      |b, &size| {
        b.iter(|| unsafe {
          let ptr = pyrope::malloc(size);
          black_box(ptr);
          pyrope::free(ptr);
        })
      },
    );
  }

  group.finish();
}

/// Growing a large allocation page class by page class stays in place as
/// long as the following run is free, so this mostly measures run
/// splitting rather than memcpy.
fn bench_realloc_grow_large(c: &mut Criterion) {
  c.bench_function("realloc_grow_large", |b| {
    b.iter(|| unsafe {
      let mut ptr = pyrope::malloc(4096);
      for size in [8192usize, 16384, 32768, 65536] {
        ptr = pyrope::realloc(ptr, size);
        black_box(ptr);
      }
      pyrope::free(ptr);
    })
  });
}

const CONTENDED_THREADS: usize = 4;

/// Small-allocation churn with every thread in the main arena, against
/// the same churn with each thread bound to a private arena. The gap is
/// the arena lock.
fn bench_arena_contention(c: &mut Criterion) {
  let mut group = c.benchmark_group("arena_contention");
  group.throughput(Throughput::Elements(CONTENDED_THREADS as u64));

  for (label, local) in [("shared_arena", false), ("thread_local_arenas", true)] {
    group.bench_function(label, |b| {
      b.iter_custom(|iters| {
        let start = Instant::now();
        std::thread::scope(|scope| {
          for _ in 0..CONTENDED_THREADS {
            scope.spawn(move || {
              if local {
                pyrope::thread_local_arena(true);
              }
              for _ in 0..iters {
                unsafe {
                  let ptr = pyrope::malloc(32);
                  black_box(ptr);
                  pyrope::free(ptr);
                }
              }
              if local {
                pyrope::thread_local_arena(false);
              }
            });
          }
        });
        start.elapsed()
      })
    });
  }

  group.finish();
}

criterion_group!(
  benches,
  bench_class_alloc_free,
  bench_huge_recycle,
  bench_realloc_grow_large,
  bench_arena_contention
);
criterion_main!(benches);
