use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::{block::Tag, polyfill::*};

/// A pointer to the base of the heap managed by an allocator.
///
/// Every access to heap memory, whether a boundary tag, a free-list link or
/// a payload, goes through a pointer derived from this one, so all of them
/// share the provenance of the region handed out by the growth primitive.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        NonNullStrict::addr(ptr)
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns a copy of `self` covering `extent` bytes.
    #[inline]
    pub fn with_extent(self, extent: usize) -> BasePtr {
        BasePtr::new(self.ptr, extent)
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the number of bytes currently covered by `self`.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        NonZeroUsize::new(self.addr().get() + self.extent).unwrap()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.addr() <= addr && addr < self.limit()
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        NonNullStrict::addr(self.ptr)
    }

    /// Calculates the offset from `self` to `addr`.
    pub fn offset_to(self, addr: NonZeroUsize) -> usize {
        addr.get().checked_sub(self.addr().get()).unwrap()
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: NonZeroUsize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        NonNullStrict::with_addr(self.ptr, addr)
    }

    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr));

        let ptr = Strict::with_addr(self.ptr.as_ptr(), addr.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Reads the boundary tag at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be aligned to `WSIZE`.
    /// - The word at `addr` must be within the provenance of `self` and valid
    ///   for reads.
    #[inline]
    pub unsafe fn read_tag(self, addr: NonZeroUsize) -> Tag {
        unsafe { self.with_addr(addr).cast::<Tag>().as_ptr().read() }
    }

    /// Writes the boundary tag `tag` at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be aligned to `WSIZE`.
    /// - The word at `addr` must be within the provenance of `self` and valid
    ///   for writes.
    /// - The word at `addr` must not belong to the payload of an allocated
    ///   block.
    #[inline]
    pub unsafe fn write_tag(self, addr: NonZeroUsize, tag: Tag) {
        unsafe { self.with_addr(addr).cast::<Tag>().as_ptr().write(tag) }
    }

    /// Initializes a `FreeLink` at the given address.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `addr` must be a properly aligned address for `FreeLink` values.
    /// - The memory at `addr` must be within the provenance of `self` and valid
    ///   for reads and writes for `size_of::<FreeLink>()` bytes.
    /// - The memory at `addr` must be the payload of a free block.
    #[inline]
    pub unsafe fn init_link_at(self, addr: NonZeroUsize, link: FreeLink) {
        debug_assert!(self.contains_addr(addr));
        debug_assert!(self.contains_addr(link.next), "next link out of region");
        debug_assert!(self.contains_addr(link.prev), "prev link out of region");

        unsafe {
            self.with_addr(addr)
                .cast::<FreeLink>()
                .as_ptr()
                .write(link)
        };
    }

    /// Returns a mutable reference to the `FreeLink` at `link`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `link` must be a properly aligned address for `FreeLink` values.
    /// - The memory at `link` must contain a properly initialized `FreeLink` value.
    /// - The memory at `link` must be within the provenance of `self` and
    ///   unallocated by the associated allocator.
    /// - No other reference to the same `FreeLink` may be live.
    #[inline]
    pub unsafe fn link_mut<'a>(self, link: NonZeroUsize) -> &'a mut FreeLink {
        debug_assert!(self.contains_addr(link));

        let link = unsafe { self.with_addr(link).cast::<FreeLink>().as_mut() };

        debug_assert!(self.contains_addr(link.next), "next link out of region");
        debug_assert!(self.contains_addr(link.prev), "prev link out of region");

        link
    }

    /// Reads a copy of the `FreeLink` at `link`.
    ///
    /// # Safety
    ///
    /// Same as [`BasePtr::link_mut`], except that shared access is permitted.
    #[inline]
    pub unsafe fn link(self, link: NonZeroUsize) -> FreeLink {
        debug_assert!(self.contains_addr(link));

        unsafe { self.with_addr(link).cast::<FreeLink>().as_ptr().read() }
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    ///
    /// # Safety
    ///
    /// Both ranges must lie within the provenance of `self` and be valid for
    /// reads (`src`) and writes (`dst`) for `len` bytes.
    #[inline]
    pub unsafe fn copy(self, src: NonZeroUsize, dst: NonZeroUsize, len: usize) {
        unsafe {
            ptr::copy(
                self.with_addr(src).as_ptr(),
                self.with_addr(dst).as_ptr(),
                len,
            )
        };
    }
}

// Rather than using pointers, store only the addresses of the previous and
// next links.  This avoids accidentally violating stacked borrows; the
// links "point to" other blocks, but by forgoing actual pointers, no borrow
// is implied.
//
// NOTE: Using this method, any actual pointer to a block must be acquired
// via the allocator base pointer, and NOT by casting these addresses
// directly!

/// A double link in a circular list of free blocks.
///
/// This type is embedded in the payload of a free block, forming an intrusive
/// ring. A block that is alone in its ring links to itself in both
/// directions.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeLink {
    pub prev: NonZeroUsize,
    pub next: NonZeroUsize,
}
