//! Deferred adjacency edits.
//!
//! During parallel phases the adjacency containers are single-writer:
//! workers queue NNList/NEList edits here instead of mutating shared rows,
//! and the edits are committed after the barrier. Queues are keyed by
//! `(worker, bucket(vertex))`; a bucket owns the vertices congruent to it
//! modulo the bucket count, so commits touch disjoint rows and can proceed
//! bucket-parallel.

use std::cell::UnsafeCell;

use rayon::prelude::*;

use crate::mesh::slots::SharedSlice;
use crate::mesh::{insert_sorted, remove_sorted, Mesh2};

/// Buckets per worker; spreads commit work beyond the worker count.
pub(crate) const BUCKET_SCALING: usize = 32;

/// One worker's queued edits for one bucket.
#[derive(Debug, Default)]
pub(crate) struct DeferredBatch {
    add_nn: Vec<(i32, i32)>,
    rem_nn: Vec<(i32, i32)>,
    add_ne: Vec<(i32, i32)>,
    rem_ne: Vec<(i32, i32)>,
}

impl DeferredBatch {
    fn is_empty(&self) -> bool {
        self.add_nn.is_empty()
            && self.rem_nn.is_empty()
            && self.add_ne.is_empty()
            && self.rem_ne.is_empty()
    }
}

/// Bank of `workers x buckets` edit queues.
#[derive(Debug)]
pub(crate) struct DeferredOperations {
    n_workers: usize,
    n_buckets: usize,
    queues: Vec<UnsafeCell<DeferredBatch>>,
}

// SAFETY: a queue row `worker * n_buckets + bucket` is only written by the
// worker that owns it (callers pass their own worker index), and the bank is
// only drained through `&mut self` after the parallel phase.
unsafe impl Sync for DeferredOperations {}

impl DeferredOperations {
    pub fn new(n_workers: usize) -> Self {
        let n_workers = n_workers.max(1);
        let n_buckets = BUCKET_SCALING * n_workers;
        let queues = (0..n_workers * n_buckets)
            .map(|_| UnsafeCell::new(DeferredBatch::default()))
            .collect();
        Self {
            n_workers,
            n_buckets,
            queues,
        }
    }

    /// Rebuild the bank for a new worker count, dropping any stale queues.
    pub fn reset(&mut self, n_workers: usize) {
        if self.n_workers != n_workers.max(1) {
            *self = Self::new(n_workers);
        } else {
            debug_assert!(self.queues.iter_mut().all(|q| q.get_mut().is_empty()));
        }
    }

    pub fn n_buckets(&self) -> usize {
        self.n_buckets
    }

    fn bucket_of(&self, v: i32) -> usize {
        v as usize % self.n_buckets
    }

    /// # Safety
    /// `worker` must be the caller's own worker index and no other thread may
    /// use the same index concurrently.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot(&self, worker: usize, v: i32) -> &mut DeferredBatch {
        debug_assert!(worker < self.n_workers);
        let idx = worker * self.n_buckets + self.bucket_of(v);
        &mut *self.queues[idx].get()
    }

    pub fn add_nn(&self, v: i32, n: i32, worker: usize) {
        // SAFETY: worker owns its queue row (see type-level invariant).
        unsafe { self.slot(worker, v) }.add_nn.push((v, n));
    }

    pub fn rem_nn(&self, v: i32, n: i32, worker: usize) {
        unsafe { self.slot(worker, v) }.rem_nn.push((v, n));
    }

    pub fn add_ne(&self, v: i32, e: i32, worker: usize) {
        unsafe { self.slot(worker, v) }.add_ne.push((v, e));
    }

    pub fn rem_ne(&self, v: i32, e: i32, worker: usize) {
        unsafe { self.slot(worker, v) }.rem_ne.push((v, e));
    }

    /// Drain every worker's queue for one bucket.
    fn take_bucket(&mut self, bucket: usize) -> Vec<DeferredBatch> {
        (0..self.n_workers)
            .map(|w| std::mem::take(self.queues[w * self.n_buckets + bucket].get_mut()))
            .filter(|b| !b.is_empty())
            .collect()
    }
}

impl Mesh2 {
    /// Queue `n` for insertion into `NNList[v]`.
    pub(crate) fn deferred_add_nn(&self, v: i32, n: i32, worker: usize) {
        self.deferred.add_nn(v, n, worker);
    }

    /// Queue `n` for removal from `NNList[v]`.
    pub(crate) fn deferred_rem_nn(&self, v: i32, n: i32, worker: usize) {
        self.deferred.rem_nn(v, n, worker);
    }

    /// Queue `e` for insertion into `NEList[v]`.
    pub(crate) fn deferred_add_ne(&self, v: i32, e: i32, worker: usize) {
        self.deferred.add_ne(v, e, worker);
    }

    /// Queue `e` for removal from `NEList[v]`.
    pub(crate) fn deferred_rem_ne(&self, v: i32, e: i32, worker: usize) {
        self.deferred.rem_ne(v, e, worker);
    }

    /// Apply all queued edits for one bucket.
    pub(crate) fn commit_deferred(&mut self, bucket: usize) {
        let batches = self.deferred.take_bucket(bucket);
        for batch in &batches {
            apply_batch(&mut self.nnlist, &mut self.nelist, batch);
        }
    }

    /// Apply every queued edit, bucket-parallel.
    ///
    /// Buckets own disjoint vertex sets (`v % n_buckets == bucket`), so the
    /// row writes of different buckets never alias.
    pub(crate) fn commit_deferred_all(&mut self) {
        let n_buckets = self.deferred.n_buckets();
        let per_bucket: Vec<Vec<DeferredBatch>> =
            (0..n_buckets).map(|b| self.deferred.take_bucket(b)).collect();

        let nn = SharedSlice::new(&mut self.nnlist);
        let ne = SharedSlice::new(&mut self.nelist);
        per_bucket.par_iter().for_each(|batches| {
            for batch in batches {
                for &(v, n) in &batch.add_nn {
                    // SAFETY: every vertex in these batches is congruent to
                    // this bucket index, so no other bucket task touches row v.
                    insert_sorted(unsafe { nn.get_mut(v as usize) }, n);
                }
                for &(v, n) in &batch.rem_nn {
                    remove_sorted(unsafe { nn.get_mut(v as usize) }, n);
                }
                for &(v, e) in &batch.add_ne {
                    insert_sorted(unsafe { ne.get_mut(v as usize) }, e);
                }
                for &(v, e) in &batch.rem_ne {
                    remove_sorted(unsafe { ne.get_mut(v as usize) }, e);
                }
            }
        });
    }
}

fn apply_batch(nnlist: &mut [Vec<i32>], nelist: &mut [Vec<i32>], batch: &DeferredBatch) {
    for &(v, n) in &batch.add_nn {
        insert_sorted(&mut nnlist[v as usize], n);
    }
    for &(v, n) in &batch.rem_nn {
        remove_sorted(&mut nnlist[v as usize], n);
    }
    for &(v, e) in &batch.add_ne {
        insert_sorted(&mut nelist[v as usize], e);
    }
    for &(v, e) in &batch.rem_ne {
        remove_sorted(&mut nelist[v as usize], e);
    }
}

#[cfg(test)]
mod tests {
    use crate::mesh::tests::two_triangle_square;

    #[test]
    fn bucketed_commit_applies_queued_edits() {
        let mut mesh = two_triangle_square();
        // Retract the diagonal by hand through the queue.
        mesh.deferred_rem_nn(0, 2, 0);
        mesh.deferred_rem_nn(2, 0, 0);
        mesh.deferred_rem_ne(0, 1, 0);
        for bucket in 0..mesh.deferred.n_buckets() {
            mesh.commit_deferred(bucket);
        }
        assert_eq!(mesh.nn_list(0), &[1, 3]);
        assert_eq!(mesh.nn_list(2), &[1, 3]);
        assert_eq!(mesh.ne_list(0), &[0]);
    }

    #[test]
    fn parallel_commit_matches_sequential() {
        let mut mesh = two_triangle_square();
        mesh.deferred_add_nn(1, 3, 0);
        mesh.deferred_add_nn(3, 1, 0);
        mesh.deferred_add_ne(1, 1, 0);
        mesh.commit_deferred_all();
        assert_eq!(mesh.nn_list(1), &[0, 2, 3]);
        assert_eq!(mesh.nn_list(3), &[0, 1, 2]);
        assert_eq!(mesh.ne_list(1), &[0, 1]);

        // Duplicate adds keep set semantics.
        mesh.deferred_add_nn(1, 3, 0);
        mesh.commit_deferred_all();
        assert_eq!(mesh.nn_list(1), &[0, 2, 3]);
    }
}
