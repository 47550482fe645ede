//! Loop-level data parallelism
//!
//! Kernels never spawn threads themselves. They receive a [`WorkerPool`]
//! through the kernel context and split their outer loops into disjoint
//! output ranges with [`parallel_for`] or [`parallel_chunks_mut`]. Slicing
//! is static: `n` iterations are cut into at most `num_threads` contiguous
//! ranges of near-equal size.

use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// One unit of work handed to a pool
pub type Job<'a> = Box<dyn FnOnce() + Send + 'a>;

/// Executes a batch of jobs and returns once all of them finished
pub trait WorkerPool: Send + Sync {
    fn num_threads(&self) -> usize;

    fn execute<'a>(&self, jobs: Vec<Job<'a>>);
}

/// Runs every job on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPool;

impl WorkerPool for SerialPool {
    fn num_threads(&self) -> usize {
        1
    }

    fn execute<'a>(&self, jobs: Vec<Job<'a>>) {
        for job in jobs {
            job();
        }
    }
}

/// Dedicated rayon thread pool
pub struct RayonPool {
    pool: ThreadPool,
}

impl RayonPool {
    /// Pool with `threads` workers; 0 picks the available parallelism
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("shl-worker-{}", i))
            .build()?;
        tracing::debug!("worker pool started with {} threads", pool.current_num_threads());
        Ok(RayonPool { pool })
    }
}

impl fmt::Debug for RayonPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonPool")
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl WorkerPool for RayonPool {
    fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn execute<'a>(&self, jobs: Vec<Job<'a>>) {
        if jobs.len() <= 1 {
            for job in jobs {
                job();
            }
            return;
        }
        self.pool.scope(|s| {
            for job in jobs {
                s.spawn(move |_| job());
            }
        });
    }
}

/// Pool for `threads` workers: serial for 1, rayon otherwise. Falls back
/// to serial when the rayon pool cannot be built.
pub fn make_pool(threads: usize) -> Arc<dyn WorkerPool> {
    if threads == 1 {
        return Arc::new(SerialPool);
    }
    match RayonPool::new(threads) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            tracing::warn!("falling back to serial execution: {}", e);
            Arc::new(SerialPool)
        }
    }
}

/// Split `0..n` into at most `parts` contiguous near-equal ranges
pub fn static_ranges(n: usize, parts: usize) -> Vec<Range<usize>> {
    if n == 0 {
        return Vec::new();
    }
    let parts = parts.clamp(1, n);
    let base = n / parts;
    let extra = n % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Call `f` once per static slice of `0..n`
pub fn parallel_for(pool: &dyn WorkerPool, n: usize, f: &(dyn Fn(Range<usize>) + Sync)) {
    let jobs: Vec<Job<'_>> = static_ranges(n, pool.num_threads())
        .into_iter()
        .map(|r| Box::new(move || f(r)) as Job<'_>)
        .collect();
    pool.execute(jobs);
}

/// Cut `data` into `chunk_len` chunks and call `f(chunk_index, chunk)` for
/// each, distributing runs of consecutive chunks over the pool. The last
/// chunk may be shorter.
pub fn parallel_chunks_mut<T: Send>(
    pool: &dyn WorkerPool,
    data: &mut [T],
    chunk_len: usize,
    f: &(dyn Fn(usize, &mut [T]) + Sync),
) {
    if data.is_empty() || chunk_len == 0 {
        return;
    }
    let chunks = data.len().div_ceil(chunk_len);
    let mut rest = data;
    let mut jobs: Vec<Job<'_>> = Vec::new();
    for r in static_ranges(chunks, pool.num_threads()) {
        let take = ((r.end - r.start) * chunk_len).min(rest.len());
        let (part, tail) = std::mem::take(&mut rest).split_at_mut(take);
        rest = tail;
        jobs.push(Box::new(move || {
            for (j, chunk) in part.chunks_mut(chunk_len).enumerate() {
                f(r.start + j, chunk);
            }
        }));
    }
    pool.execute(jobs);
}
