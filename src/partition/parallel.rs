//! Worker pools with explicit worker identity.
//!
//! The operators key per-worker scratch state (deferred-edit queues, split
//! buffers) on a stable worker index, so the fork-join pools used here pin
//! one index per pool thread at startup. Pools are plain Rayon pools; the
//! index is the only extra state.

use once_cell::sync::OnceCell;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::cell::Cell;

thread_local! {
    /// Thread-local storage for the worker index.
    static TLS_WORKER_IDX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Steele/Vigna SplitMix64 mixer used for deterministic hashing and seeding.
#[inline]
pub(crate) fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Build a Rayon thread pool whose workers carry a stable worker index.
///
/// If `num_threads` is `None`, Rayon selects its default thread count.
pub fn build_worker_pool(num_threads: Option<usize>) -> ThreadPool {
    let mut builder = ThreadPoolBuilder::new();
    if let Some(n) = num_threads {
        builder = builder.num_threads(n.max(1));
    }
    builder
        .start_handler(|idx| {
            TLS_WORKER_IDX.with(|c| c.set(Some(idx)));
        })
        .exit_handler(|_| {
            TLS_WORKER_IDX.with(|c| c.set(None));
        })
        .build()
        .expect("failed to build worker pool")
}

/// Install a worker pool and execute `f` within it. All Rayon parallelism
/// inside `f` uses this pool.
pub fn install_with_worker_pool<F, R>(num_threads: Option<usize>, f: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    match num_threads {
        Some(_) => build_worker_pool(num_threads).install(f),
        None => default_pool().install(f),
    }
}

/// The process-default worker pool, built on first use.
pub fn default_pool() -> &'static ThreadPool {
    static POOL: OnceCell<ThreadPool> = OnceCell::new();
    POOL.get_or_init(|| build_worker_pool(None))
}

/// Returns the current worker index, if on a pool worker thread.
pub fn worker_index() -> Option<usize> {
    TLS_WORKER_IDX.with(|c| c.get())
}

/// Worker index, defaulting to 0 outside a pool (single-threaded regions).
pub fn worker_index_or_serial() -> usize {
    worker_index().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn worker_index_exposed_inside_pool() {
        let pool = build_worker_pool(Some(3));
        pool.install(|| {
            (0..1000).into_par_iter().for_each(|_| {
                let idx = worker_index().expect("index must be set on pool threads");
                assert!(idx < 3);
            });
        });
    }

    #[test]
    fn splitmix_is_deterministic_and_mixing() {
        assert_eq!(splitmix64(42), splitmix64(42));
        assert_ne!(splitmix64(1), splitmix64(2));
    }
}
