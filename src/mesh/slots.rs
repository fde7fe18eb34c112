//! Shared slot views used inside independent-set parallel phases.
//!
//! The operators mutate mesh storage from several workers at once, with
//! exclusivity guaranteed structurally (thread partitions, bucketed commits,
//! claimed sentinel slots) rather than by locks. `SharedSlice` is the one
//! place that turns that guarantee into mutable access; every caller states
//! the disjointness argument at the call site.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, AtomicU8};

/// A slice whose elements may be written concurrently from multiple workers,
/// provided no two workers touch the same index.
pub(crate) struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Mutable access to one slot.
    ///
    /// # Safety
    /// No other thread may access index `i` (read or write) while the
    /// returned reference lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, i: usize) -> &mut T {
        debug_assert!(i < self.len);
        &mut *self.ptr.add(i)
    }

    /// Shared access to one slot.
    ///
    /// # Safety
    /// No other thread may write index `i` while the returned reference
    /// lives.
    pub unsafe fn get(&self, i: usize) -> &T {
        debug_assert!(i < self.len);
        &*self.ptr.add(i)
    }
}

/// Reinterpret a plain `i32` slice as atomics for lock-free sentinel-slot
/// claims. `AtomicI32` is guaranteed to have the same size and alignment as
/// `i32`, and the original borrow is held for the full lifetime.
pub(crate) fn as_atomic_i32(slice: &mut [i32]) -> &[AtomicI32] {
    unsafe { &*(slice as *mut [i32] as *const [AtomicI32]) }
}

/// `u8` counterpart of [`as_atomic_i32`], used for mark bitmaps.
pub(crate) fn as_atomic_u8(slice: &mut [u8]) -> &[AtomicU8] {
    unsafe { &*(slice as *mut [u8] as *const [AtomicU8]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn disjoint_parallel_writes() {
        let mut data = vec![0usize; 1024];
        let view = SharedSlice::new(&mut data);
        (0..1024usize).into_par_iter().for_each(|i| {
            // SAFETY: each index is visited by exactly one task.
            unsafe {
                *view.get_mut(i) = i * 2;
            }
        });
        assert!(data.iter().enumerate().all(|(i, &v)| v == i * 2));
    }

    #[test]
    fn atomic_view_claims() {
        let mut data = vec![-1i32; 8];
        {
            let atoms = as_atomic_i32(&mut data);
            assert!(atoms[3]
                .compare_exchange(-1, 7, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok());
            assert!(atoms[3]
                .compare_exchange(-1, 9, Ordering::Relaxed, Ordering::Relaxed)
                .is_err());
        }
        assert_eq!(data[3], 7);
    }
}
