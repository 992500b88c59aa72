//! Aligned, allocator-backed storage.
//!
//! Every buffer the engine touches (weights, sequences, gate scratch) is an
//! `AlignedVec` carved out of an `Allocator`. Allocation never panics: a
//! refused request becomes `GruError::OutOfMemory` so the caller can abort
//! before writing any output.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gru_core::{GruError, Result};

/// Alignment of every buffer, wide enough for any 512-bit vector load.
pub const ALIGN: usize = 64;

/// Element types that are valid when every byte is zero.
///
/// # Safety
/// The all-zero bit pattern must be a valid value of the implementing type.
pub unsafe trait Zeroable: Copy + Send + Sync + 'static {}

unsafe impl Zeroable for f32 {}
unsafe impl Zeroable for u16 {}
unsafe impl Zeroable for i8 {}
unsafe impl Zeroable for i32 {}
unsafe impl Zeroable for u8 {}
unsafe impl Zeroable for half::f16 {}
unsafe impl Zeroable for half::bf16 {}

/// Source of raw memory for tensors.
///
/// The runtime keeps two of these: one for scratch that dies with the call
/// (workspace) and one for tensors handed back to the caller (blob).
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Return zeroed memory for `layout`, or `None` when the request cannot
    /// be satisfied.
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Release memory obtained from `alloc_zeroed`.
    ///
    /// # Safety
    /// `ptr` must come from `self.alloc_zeroed(layout)` with the same layout
    /// and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Global-heap allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: callers never request zero-sized layouts (AlignedVec
        // short-circuits len == 0).
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Shared handle to the system allocator.
pub fn system() -> Arc<dyn Allocator> {
    Arc::new(SystemAllocator)
}

/// Allocator with a hard byte budget on top of the system heap.
///
/// Used to cap per-layer workspace and to exercise out-of-memory paths.
#[derive(Debug)]
pub struct BudgetAllocator {
    limit: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl BudgetAllocator {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Bytes currently outstanding.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// High-water mark since construction.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Allocator for BudgetAllocator {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        let size = layout.size();
        let reserved = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&next| next <= self.limit)
            });
        let before = match reserved {
            Ok(before) => before,
            Err(used) => {
                log::debug!(
                    "budget allocator refused {} bytes ({} of {} in use)",
                    size,
                    used,
                    self.limit
                );
                return None;
            }
        };
        self.peak.fetch_max(before + size, Ordering::AcqRel);

        match SystemAllocator.alloc_zeroed(layout) {
            Some(ptr) => Some(ptr),
            None => {
                self.used.fetch_sub(size, Ordering::AcqRel);
                None
            }
        }
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        SystemAllocator.dealloc(ptr, layout);
        self.used.fetch_sub(layout.size(), Ordering::AcqRel);
    }
}

// ============================================================
// AlignedVec
// ============================================================

/// A fixed-length, zero-initialized, `ALIGN`-aligned vector.
pub struct AlignedVec<T: Zeroable> {
    ptr: NonNull<T>,
    len: usize,
    alloc: Arc<dyn Allocator>,
}

// Safety: AlignedVec owns its data; Zeroable implies Send + Sync.
unsafe impl<T: Zeroable> Send for AlignedVec<T> {}
unsafe impl<T: Zeroable> Sync for AlignedVec<T> {}

impl<T: Zeroable> AlignedVec<T> {
    fn layout_for(len: usize) -> Result<Layout> {
        let size = std::mem::size_of::<T>()
            .checked_mul(len)
            .ok_or(GruError::OutOfMemory { bytes: usize::MAX })?;
        Layout::from_size_align(size, ALIGN).map_err(|_| GruError::OutOfMemory { bytes: size })
    }

    /// Allocate `len` zeroed elements from `alloc`.
    pub fn try_zeroed(len: usize, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
                alloc: Arc::clone(alloc),
            });
        }

        let layout = Self::layout_for(len)?;
        let raw = alloc
            .alloc_zeroed(layout)
            .ok_or(GruError::OutOfMemory {
                bytes: layout.size(),
            })?;

        Ok(Self {
            ptr: raw.cast(),
            len,
            alloc: Arc::clone(alloc),
        })
    }

    /// Allocate from the system heap and copy `src` in.
    pub fn from_slice(src: &[T]) -> Result<Self> {
        let mut v = Self::try_zeroed(src.len(), &system())?;
        v.copy_from_slice(src);
        Ok(v)
    }

    /// Deep copy through the same allocator.
    pub fn try_clone(&self) -> Result<Self> {
        let mut v = Self::try_zeroed(self.len, &self.alloc)?;
        v.copy_from_slice(self);
        Ok(v)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing allocation in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.alloc
    }
}

impl<T: Zeroable> Deref for AlignedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: ptr is valid for len initialized (zeroed or written) elements.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Zeroable> DerefMut for AlignedVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: unique borrow of an owned allocation of len elements.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Zeroable> Drop for AlignedVec<T> {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Ok(layout) = Self::layout_for(self.len) {
            // SAFETY: allocated by self.alloc with this exact layout.
            unsafe { self.alloc.dealloc(self.ptr.cast(), layout) };
        }
    }
}

impl<T: Zeroable + fmt::Debug> fmt::Debug for AlignedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlignedVec(len={}, align={})", self.len, ALIGN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_and_aligned() {
        let v: AlignedVec<f32> = AlignedVec::try_zeroed(100, &system()).unwrap();
        assert_eq!(v.len(), 100);
        assert!(v.iter().all(|&x| x == 0.0));
        assert_eq!(v.as_ptr() as usize % ALIGN, 0);
    }

    #[test]
    fn test_empty_vec() {
        let v: AlignedVec<i8> = AlignedVec::try_zeroed(0, &system()).unwrap();
        assert!(v.is_empty());
        assert_eq!(&v[..], &[] as &[i8]);
    }

    #[test]
    fn test_budget_refuses_and_recovers() {
        let budget = Arc::new(BudgetAllocator::new(1024));
        let alloc: Arc<dyn Allocator> = budget.clone();

        let a: AlignedVec<f32> = AlignedVec::try_zeroed(128, &alloc).unwrap();
        assert_eq!(budget.used(), 512);

        let err = AlignedVec::<f32>::try_zeroed(256, &alloc).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(budget.used(), 512);

        drop(a);
        assert_eq!(budget.used(), 0);
        assert_eq!(budget.peak(), 512);

        let b: AlignedVec<f32> = AlignedVec::try_zeroed(256, &alloc).unwrap();
        assert_eq!(b.capacity_bytes(), 1024);
    }

    #[test]
    fn test_try_clone_is_deep() {
        let mut a = AlignedVec::from_slice(&[1.0f32, 2.0, 3.0]).unwrap();
        let b = a.try_clone().unwrap();
        a[0] = 9.0;
        assert_eq!(&b[..], &[1.0, 2.0, 3.0]);
    }
}
