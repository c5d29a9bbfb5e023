//! ArrayBuffer allocator with external-memory accounting.
//!
//! The engine heap limit does not cover ArrayBuffer backing stores, so every
//! backing store goes through this allocator, which tracks the total and
//! optionally refuses allocations past a cap. It also carries the zero-fill
//! toggle: managed code may switch zeroing off around a single allocation it
//! is about to overwrite, unless the process runs with `zero_fill_buffers`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Shared switch read by the allocator and flipped from the managed side.
#[derive(Debug, Clone)]
pub struct ZeroFillToggle(Arc<AtomicBool>);

impl ZeroFillToggle {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn set(&self, zero_fill: bool) {
        self.0.store(zero_fill, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ArrayBufferAllocator {
    /// Maximum bytes outstanding, `None` for no cap
    max: Option<usize>,
    count: AtomicUsize,
    limit_hit: AtomicBool,
    zero_fill: ZeroFillToggle,
    zero_fill_all: bool,
}

impl std::fmt::Debug for ArrayBufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayBufferAllocator")
            .field("max", &self.max)
            .field("count", &self.current_usage())
            .field("zero_fill_all", &self.zero_fill_all)
            .finish()
    }
}

impl ArrayBufferAllocator {
    pub fn new(max_bytes: Option<usize>, zero_fill_all: bool) -> Arc<Self> {
        Arc::new(Self {
            max: max_bytes,
            count: AtomicUsize::new(0),
            limit_hit: AtomicBool::new(false),
            zero_fill: ZeroFillToggle::new(),
            zero_fill_all,
        })
    }

    pub fn zero_fill_toggle(&self) -> ZeroFillToggle {
        self.zero_fill.clone()
    }

    /// Whether the next uninitialized allocation must still be zeroed.
    pub fn should_zero_fill(&self) -> bool {
        self.zero_fill_all || self.zero_fill.get()
    }

    /// Allocate `n` zeroed bytes, or `None` past the cap.
    pub fn allocate(&self, n: usize) -> Option<Box<[u8]>> {
        if !self.reserve(n) {
            return None;
        }

        Some(vec![0u8; n].into_boxed_slice())
    }

    /// Return a buffer obtained from [`allocate`](Self::allocate).
    pub fn free(&self, buffer: Box<[u8]>) {
        self.release(buffer.len());
    }

    pub fn current_usage(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Set once an allocation has been refused.
    pub fn limit_hit(&self) -> bool {
        self.limit_hit.load(Ordering::SeqCst)
    }

    fn reserve(&self, n: usize) -> bool {
        let total = self.count.fetch_add(n, Ordering::SeqCst) + n;

        match self.max {
            Some(max) if total > max => {
                log::warn!(
                    "ArrayBuffer allocation denied: {}MB exceeds limit of {}MB",
                    total / 1024 / 1024,
                    max / 1024 / 1024
                );
                self.limit_hit.store(true, Ordering::SeqCst);
                // Roll back, a refused allocation must not consume quota.
                self.count.fetch_sub(n, Ordering::SeqCst);
                false
            }
            _ => true,
        }
    }

    fn release(&self, n: usize) {
        self.count.fetch_sub(n, Ordering::SeqCst);
    }
}

#[cfg(feature = "v8")]
mod v8_vtable {
    use super::ArrayBufferAllocator;
    use std::ffi::c_void;
    use std::sync::Arc;
    use v8::{RustAllocatorVtable, UniqueRef};

    impl ArrayBufferAllocator {
        /// Convert to a V8 allocator for `CreateParams`.
        pub fn into_v8_allocator(self: Arc<Self>) -> UniqueRef<v8::Allocator> {
            let vtable: &'static RustAllocatorVtable<ArrayBufferAllocator> = &RustAllocatorVtable {
                allocate,
                allocate_uninitialized,
                free,
                drop,
            };

            unsafe { v8::new_rust_allocator(Arc::into_raw(self), vtable) }
        }
    }

    unsafe extern "C" fn allocate(allocator: &ArrayBufferAllocator, n: usize) -> *mut c_void {
        if !allocator.reserve(n) {
            return std::ptr::null_mut();
        }

        Box::into_raw(vec![0u8; n].into_boxed_slice()) as *mut [u8] as *mut c_void
    }

    #[allow(clippy::uninit_vec)]
    unsafe extern "C" fn allocate_uninitialized(
        allocator: &ArrayBufferAllocator,
        n: usize,
    ) -> *mut c_void {
        if allocator.should_zero_fill() {
            return unsafe { allocate(allocator, n) };
        }

        if !allocator.reserve(n) {
            return std::ptr::null_mut();
        }

        // The toggle only covers the allocation it was switched off for.
        allocator.zero_fill.set(true);

        let mut store = Vec::with_capacity(n);
        // SAFETY: capacity is n and V8 initializes the bytes before reading them
        unsafe { store.set_len(n) };

        Box::into_raw(store.into_boxed_slice()) as *mut [u8] as *mut c_void
    }

    unsafe extern "C" fn free(allocator: &ArrayBufferAllocator, data: *mut c_void, n: usize) {
        allocator.release(n);
        // SAFETY: data came from allocate/allocate_uninitialized with size n
        let _ = unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(data as *mut u8, n)) };
    }

    unsafe extern "C" fn drop(allocator: *const ArrayBufferAllocator) {
        // SAFETY: created via Arc::into_raw in into_v8_allocator
        let _ = unsafe { Arc::from_raw(allocator) };
    }
}
