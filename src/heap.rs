//! Heap growth.
//!
//! [`SegFit`](crate::SegFit) obtains memory by moving a break forward through
//! the [`Sbrk`] trait. [`Heap`] implements it over a region reserved up
//! front: the region never moves, and growing the heap only makes more of it
//! available to the allocator.
//!
//! ```text
//!   base                         break                              limit
//!   ├────────────────────────────┼──────────────────────────────────────┤
//!   │   managed by the allocator │          not yet handed out          │
//!   └────────────────────────────┴──────────────────────────────────────┘
//! ```

use core::{alloc::Layout, fmt, num::NonZeroUsize, ptr::NonNull};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

use crate::{
    base::BasePtr,
    block::{ALIGN, MAX_BLOCK_SIZE},
    polyfill::*,
    AllocError, AllocInitError, BackingAllocator, Raw,
};

/// A primitive that extends a contiguous heap.
///
/// # Safety
///
/// [`SegFit`](crate::SegFit) reads and writes every byte an implementation
/// hands out, so implementations must uphold the following invariants:
/// - Each successful call to `extend(n)` returns the value `top()` had
///   before the call, and afterwards `extent()` has grown by exactly `n` and
///   `top()` has moved forward by exactly `n` bytes.
/// - The pointer returned by `extend` has provenance over every byte handed
///   out by this and all previous calls, starting from the pointer returned
///   by the first call.
/// - All bytes handed out are valid for reads and writes, are not accessed
///   by anything else, and stay valid until the implementation is dropped.
/// - `extent()` and `top()` report the heap truthfully at all times.
pub unsafe trait Sbrk {
    /// Extends the heap by `increment` bytes.
    ///
    /// On success, returns a pointer to the first newly available byte, which
    /// is the previous top of the heap.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the heap cannot grow by `increment` bytes. The heap
    /// is left unchanged.
    fn extend(&mut self, increment: usize) -> Result<NonNull<u8>, AllocError>;

    /// Returns the number of bytes handed out so far.
    fn extent(&self) -> usize;

    /// Returns a pointer one past the last byte handed out so far.
    fn top(&self) -> NonNull<u8>;
}

// SAFETY: forwards to `S`, which upholds the contract.
unsafe impl<S: Sbrk + ?Sized> Sbrk for &mut S {
    fn extend(&mut self, increment: usize) -> Result<NonNull<u8>, AllocError> {
        (**self).extend(increment)
    }

    fn extent(&self) -> usize {
        (**self).extent()
    }

    fn top(&self) -> NonNull<u8> {
        (**self).top()
    }
}

/// A fixed-capacity region that is handed out front to back.
pub struct Heap<A: BackingAllocator> {
    base: BasePtr,
    brk: usize,
    layout: Layout,
    backing_allocator: A,
}

impl Heap<Raw> {
    /// Constructs a new `Heap` from a raw pointer.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - `capacity` is zero or larger than the largest block size a boundary
    ///   tag can describe.
    /// - `region` is not aligned to [`ALIGN`](crate::ALIGN).
    /// - the region would extend past the end of the address space.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `capacity` bytes, and
    /// no other code may access that memory while the `Heap` or any allocator
    /// using it exists.
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        capacity: usize,
    ) -> Result<Heap<Raw>, AllocInitError> {
        unsafe { RawHeap::try_new(region, capacity).map(|h| h.with_backing_allocator(Raw)) }
    }
}

#[cfg(any(feature = "alloc", test))]
impl Heap<Global> {
    /// Attempts to construct a new `Heap` of `capacity` bytes backed by the
    /// global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is invalid (see [`Heap::new_raw`]) or
    /// if the region could not be allocated from the global allocator.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(capacity: usize) -> Result<Heap<Global>, AllocInitError> {
        let layout = Self::region_layout(capacity)?;

        unsafe {
            let region_raw = alloc::alloc::alloc(layout);
            let region_ptr = NonNull::new(region_raw).ok_or(AllocInitError::AllocFailed(layout))?;

            match RawHeap::try_new(region_ptr, capacity) {
                Ok(h) => Ok(h.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region_ptr.as_ptr(), layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> Heap<A> {
    /// Returns the layout of a region of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `capacity` is zero, exceeds the largest block size a
    /// boundary tag can describe, or cannot be represented as a [`Layout`].
    pub fn region_layout(capacity: usize) -> Result<Layout, AllocInitError> {
        if capacity == 0 || capacity > MAX_BLOCK_SIZE {
            return Err(AllocInitError::InvalidConfig);
        }

        Layout::from_size_align(capacity, ALIGN).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the total number of bytes the heap can hand out.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Rewinds the break to the start of the region.
    ///
    /// # Safety
    ///
    /// No pointers into the region handed out before the reset may be
    /// dereferenced afterwards, and any allocator using this heap must be
    /// dropped or forgotten first.
    pub unsafe fn reset(&mut self) {
        self.brk = 0;
    }
}

// SAFETY: the region is reserved up front and handed out front to back, and
// every pointer is derived from the region's base pointer.
unsafe impl<A: BackingAllocator> Sbrk for Heap<A> {
    fn extend(&mut self, increment: usize) -> Result<NonNull<u8>, AllocError> {
        let new_brk = self
            .brk
            .checked_add(increment)
            .filter(|&brk| brk <= self.capacity())
            .ok_or(AllocError)?;

        let old_top = self.top();
        self.brk = new_brk;

        log::trace!(
            "heap break moved by {increment} bytes to {new_brk}/{}",
            self.capacity()
        );

        Ok(old_top)
    }

    fn extent(&self) -> usize {
        self.brk
    }

    fn top(&self) -> NonNull<u8> {
        let top = NonZeroUsize::new(self.base.addr().get() + self.brk).unwrap();
        NonNullStrict::with_addr(self.base.ptr(), top)
    }
}

impl<A: BackingAllocator> Drop for Heap<A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), self.layout)
        };
    }
}

impl<A: BackingAllocator> fmt::Debug for Heap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base.ptr())
            .field("brk", &self.brk)
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct RawHeap {
    base: BasePtr,
    layout: Layout,
}

impl RawHeap {
    unsafe fn try_new(region: NonNull<u8>, capacity: usize) -> Result<RawHeap, AllocInitError> {
        let layout = Heap::<Raw>::region_layout(capacity)?;

        // Verify that the base pointer matches the layout.
        let addr = NonNullStrict::addr(region).get();
        if addr & !(layout.align() - 1) != addr {
            return Err(AllocInitError::InvalidConfig);
        }

        // Ensure pointer calculations will not overflow.
        addr.checked_add(capacity)
            .ok_or(AllocInitError::InvalidLocation)?;

        Ok(RawHeap {
            base: BasePtr::new(region, capacity),
            layout,
        })
    }

    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> Heap<A> {
        Heap {
            base: self.base,
            brk: 0,
            layout: self.layout,
            backing_allocator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_capacity_errors() {
        Heap::<Global>::try_new(0).unwrap_err();
        Heap::<Global>::try_new(MAX_BLOCK_SIZE + 1).unwrap_err();
        Heap::<Global>::try_new(usize::MAX).unwrap_err();
    }

    #[test]
    fn misaligned_region_errors() {
        let mut words = [0_u64; 4];
        let region = NonNull::from(&mut words).cast::<u8>();
        let misaligned = region.with_addr(region.addr().checked_add(1).unwrap());

        unsafe { Heap::new_raw(misaligned, 16) }.unwrap_err();
    }

    #[test]
    fn extend_moves_break() {
        let mut heap = Heap::<Global>::try_new(64).unwrap();
        let start = heap.top();
        assert_eq!(heap.extent(), 0);

        let a = heap.extend(16).unwrap();
        assert_eq!(a, start);
        assert_eq!(heap.extent(), 16);

        let b = heap.extend(48).unwrap();
        assert_eq!(b.addr().get(), a.addr().get() + 16);
        assert_eq!(heap.extent(), 64);
        assert_eq!(heap.top().addr().get(), start.addr().get() + 64);
    }

    #[test]
    fn extend_past_capacity_fails() {
        let mut heap = Heap::<Global>::try_new(64).unwrap();
        heap.extend(40).unwrap();
        assert_eq!(heap.extend(32), Err(AllocError));
        assert_eq!(heap.extent(), 40);
        assert_eq!(heap.extend(usize::MAX), Err(AllocError));
        heap.extend(24).unwrap();
    }

    #[test]
    fn zero_extend_returns_top() {
        let mut heap = Heap::<Global>::try_new(64).unwrap();
        heap.extend(8).unwrap();
        let top = heap.top();
        assert_eq!(heap.extend(0), Ok(top));
    }

    #[test]
    fn reset_rewinds() {
        let mut heap = Heap::<Global>::try_new(64).unwrap();
        let start = heap.top();
        heap.extend(64).unwrap();
        unsafe { heap.reset() };
        assert_eq!(heap.extent(), 0);
        assert_eq!(heap.extend(8), Ok(start));
    }

    #[test]
    fn raw_heap_over_stack_region() {
        let mut words = [0_u64; 8];
        let region = NonNull::from(&mut words).cast::<u8>();
        let mut heap = unsafe { Heap::new_raw(region, 64) }.unwrap();
        assert_eq!(heap.extend(64), Ok(region));
        heap.extend(8).unwrap_err();
    }
}
