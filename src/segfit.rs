//! Segregated-fit allocation.
//!
//! ## Heap layout
//!
//! ```text
//!   ┌─────┬──────────┬──────────┬───────┬───────┬─────┬──────────┐
//!   │ pad │ prologue │ prologue │ block │ block │ ... │ epilogue │
//!   │  0  │  hdr 8/1 │  ftr 8/1 │       │       │     │  hdr 0/1 │
//!   └─────┴──────────┴──────────┴───────┴───────┴─────┴──────────┘
//! ```
//!
//! The prologue and epilogue are permanently allocated sentinels, so
//! coalescing never needs to special-case the ends of the heap.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                   |
//! |--------------------------|-----------|------------------------------|
//! | Allocate                 | O(1)      | O(free blocks)               |
//! | Deallocate               | O(1)      | O(free blocks in class)      |
//! | Reallocate               | O(1)      | O(free blocks + block size)  |
//!
//! #### Fragmentation
//!
//! Adjacent free blocks are always merged, so external fragmentation is
//! limited to free blocks separated by live allocations. Internal
//! fragmentation is bounded by the header/footer overhead, the rounding to
//! `DSIZE`, and remainders smaller than `MIN_BLOCK_SIZE` which are left
//! attached to an allocation instead of becoming unusable free blocks.

use core::{cmp, fmt, ptr::NonNull};

use crate::{
    base::BasePtr,
    block::{adjusted_size, Block, Tag, CHUNK_SIZE, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, WSIZE},
    check::HeapViolation,
    heap::Sbrk,
    polyfill::*,
    seglist::{classify, SegLists},
    AllocError, AllocInitError,
};

/// A segregated-fit allocator.
///
/// This takes one const parameter, `CLASSES`, the number of size classes.
/// Class `i` holds free blocks of up to `32 << i` bytes, except for the last
/// class, which holds all larger blocks. With `CLASSES == 1` the allocator
/// degenerates to a single address-ordered explicit free list.
///
/// The heap is obtained from `S`, which must be empty when the allocator is
/// constructed and must not be extended by anyone else while the allocator
/// exists.
pub struct SegFit<S: Sbrk, const CLASSES: usize = 9> {
    base: BasePtr,
    /// The prologue block. Its payload address is where the heap's blocks
    /// start.
    prologue: Block,
    lists: SegLists<CLASSES>,
    source: S,
}

impl<S: Sbrk, const CLASSES: usize> SegFit<S, CLASSES> {
    /// Constructs a new `SegFit` over the heap provided by `source`.
    ///
    /// This installs the alignment padding, prologue and epilogue, then grows
    /// the heap by one chunk of [`CHUNK_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the following are true:
    /// - `CLASSES` is zero.
    /// - `source` has already handed out memory, or hands out memory that is
    ///   not aligned to [`DSIZE`].
    /// - `source` cannot provide the sentinels and the first chunk.
    pub fn try_new(mut source: S) -> Result<SegFit<S, CLASSES>, AllocInitError> {
        if CLASSES == 0 || source.extent() != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let start = source
            .extend(4 * WSIZE)
            .map_err(|_| AllocInitError::GrowFailed)?;
        if NonNullStrict::addr(start).get() % DSIZE != 0 || source.extent() != 4 * WSIZE {
            return Err(AllocInitError::InvalidConfig);
        }

        let base = BasePtr::new(start, 4 * WSIZE);
        let prologue = Block::from_addr(base.addr().checked_add(2 * WSIZE).unwrap());

        unsafe {
            base.write_tag(base.addr(), Tag::PADDING);
            prologue.set_tags(base, Tag::PROLOGUE);
            base.write_tag(prologue.next(base).header_addr(), Tag::EPILOGUE);
        }

        let mut segfit = SegFit {
            base,
            prologue,
            lists: SegLists::new(),
            source,
        };

        segfit
            .grow(CHUNK_SIZE / WSIZE)
            .map_err(|_| AllocInitError::GrowFailed)?;

        log::debug!(
            "initialized heap at {:#x} with {} size classes",
            base.addr(),
            CLASSES
        );

        Ok(segfit)
    }

    /// Returns the growth primitive backing this allocator.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns the number of bytes currently managed, including sentinels.
    pub fn heap_size(&self) -> usize {
        self.source.extent()
    }

    /// Grows the heap by `words` words, rounded up to an even number, and
    /// returns the resulting free block.
    ///
    /// The new block takes over the old epilogue as its header, and a new
    /// epilogue is written after it. If the block preceding it was free, the
    /// two are merged and the merged block is returned.
    fn grow(&mut self, words: usize) -> Result<Block, AllocError> {
        let words = words.checked_add(words % 2).ok_or(AllocError)?;
        let size = words.checked_mul(WSIZE).ok_or(AllocError)?;

        // Every block size in the heap must fit in a tag.
        if size > MAX_BLOCK_SIZE.saturating_sub(self.source.extent()) {
            return Err(AllocError);
        }

        let old_top = self.base.limit();
        let old_extent = self.base.extent();

        let ptr = self.source.extend(size)?;

        // The new memory must continue the heap exactly where it ended.
        if NonNullStrict::addr(ptr) != old_top || self.source.extent() != old_extent + size {
            log::error!("heap source did not extend contiguously");
            return Err(AllocError);
        }

        self.base = self.base.with_extent(old_extent + size);

        let block = Block::from_addr(old_top);

        log::trace!(
            "grew heap by {} bytes at offset {:#x}",
            size,
            self.base.offset_to(block.addr())
        );

        unsafe {
            block.set_tags(self.base, Tag::new(size, false));
            self.base
                .write_tag(block.next(self.base).header_addr(), Tag::EPILOGUE);

            Ok(self
                .lists
                .insert_back(self.base, block, classify::<CLASSES>(size)))
        }
    }

    /// Attempts to allocate a block of memory of `size` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] of length `size`, aligned to
    /// [`ALIGN`](crate::ALIGN). The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero, or if the heap cannot grow enough to
    /// hold the block.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.assert_consistent();

        if size == 0 {
            return Err(AllocError);
        }

        let asize = adjusted_size(size).ok_or(AllocError)?;

        let block = match unsafe { self.lists.find_fit(self.base, asize) } {
            Some(b) => b,
            None => {
                log::trace!("no fit for {asize}-byte block");
                self.grow(cmp::max(asize, CHUNK_SIZE) / WSIZE)?
            }
        };

        unsafe { self.place(block, asize) };

        Ok(self.base.with_addr_and_size(block.addr(), size))
    }

    /// Allocates the first `asize` bytes of the free block `block`.
    ///
    /// The remainder is split off as a new free block if it is large enough
    /// to stand on its own.
    ///
    /// # Safety
    ///
    /// `block` must be a free list member of at least `asize` bytes.
    unsafe fn place(&mut self, block: Block, asize: usize) {
        let base = self.base;

        unsafe {
            let fsize = block.size(base);
            let rsize = fsize - asize;

            if rsize < MIN_BLOCK_SIZE {
                self.lists.delete(base, block);
                block.set_tags(base, Tag::new(fsize, true));
                return;
            }

            let class = classify::<CLASSES>(rsize);
            let rest = Block::from_addr(block.offset(asize));

            if classify::<CLASSES>(fsize) == class {
                // The remainder takes over the block's position in its list.
                // The block's header still records `fsize` until it is
                // unlinked.
                rest.set_tags(base, Tag::new(rsize, false));
                self.lists.insert_after(base, Some(block), rest, class);
                self.lists.delete(base, block);

                block.set_tags(base, Tag::new(asize, true));
            } else {
                self.lists.delete(base, block);

                block.set_tags(base, Tag::new(asize, true));
                rest.set_tags(base, Tag::new(rsize, false));

                self.lists.insert(base, rest);
            }
        }
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// The block is merged with any free physical neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.assert_consistent();

        let block = Block::from_addr(NonNullStrict::addr(ptr));

        unsafe {
            let size = block.size(self.base);
            block.set_tags(self.base, Tag::new(size, false));
            self.lists.insert(self.base, block);
        }
    }

    /// Resizes the block referenced by `ptr` to hold `size` bytes.
    ///
    /// The block is resized in place when possible: shrinking always stays in
    /// place, and growing absorbs free physical neighbours if they provide
    /// enough room. Absorbing the preceding block moves the contents
    /// backward, so the returned pointer may differ from `ptr` even when no
    /// new block is allocated. Otherwise a new block is allocated, the
    /// contents are copied and the old block is freed.
    ///
    /// The first `min(old size, size)` bytes are preserved.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero or if no block of `size` bytes can be
    /// obtained. In either case the block referenced by `ptr` is left
    /// untouched and remains allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator. On success, `ptr` must no longer be used.
    pub unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.assert_consistent();

        if size == 0 {
            return Err(AllocError);
        }

        let base = self.base;
        let block = Block::from_addr(NonNullStrict::addr(ptr));
        let new_size = adjusted_size(size).ok_or(AllocError)?;
        let old_size = unsafe { block.size(base) };

        if new_size <= old_size {
            unsafe { self.split_allocated(block, new_size, old_size) };
            return Ok(base.with_addr_and_size(block.addr(), size));
        }

        let (prev, next) = unsafe {
            let prev_footer = block.prev_footer(base);
            let next_header = block.next_header(base);

            (
                prev_footer.is_free().then(|| block.prev(base)),
                next_header.is_free().then(|| block.next(base)),
            )
        };

        let prev_size = prev.map_or(0, |b| unsafe { b.size(base) });
        let next_size = next.map_or(0, |b| unsafe { b.size(base) });
        let total = prev_size + old_size + next_size;

        if total < new_size {
            return unsafe { self.relocate(block, old_size, size) };
        }

        unsafe {
            if let Some(p) = prev {
                self.lists.delete(base, p);
            }
            if let Some(n) = next {
                self.lists.delete(base, n);
            }

            let merged = match prev {
                Some(p) => {
                    base.copy(block.addr(), p.addr(), old_size - DSIZE);
                    p
                }
                None => block,
            };

            self.split_allocated(merged, new_size, total);

            Ok(base.with_addr_and_size(merged.addr(), size))
        }
    }

    /// Marks the `size`-byte region at `block` as an allocated block of
    /// `new_size` bytes, freeing the tail if it can stand on its own.
    ///
    /// If the tail is too small, the whole region stays allocated.
    ///
    /// # Safety
    ///
    /// The `size` bytes starting at `block`'s header must not belong to any
    /// other block or free list, and `new_size <= size`.
    unsafe fn split_allocated(&mut self, block: Block, new_size: usize, size: usize) {
        let base = self.base;
        let rest_size = size - new_size;

        unsafe {
            if rest_size < MIN_BLOCK_SIZE {
                block.set_tags(base, Tag::new(size, true));
                return;
            }

            block.set_tags(base, Tag::new(new_size, true));

            let rest = Block::from_addr(block.offset(new_size));
            rest.set_tags(base, Tag::new(rest_size, false));
            self.lists.insert(base, rest);
        }
    }

    /// Moves the contents of `block` to a newly allocated block of `size`
    /// bytes and frees `block`.
    unsafe fn relocate(
        &mut self,
        block: Block,
        old_size: usize,
        size: usize,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let new = self.allocate(size)?;
        let new_addr = NonNullStrict::addr(new.cast::<u8>());

        unsafe {
            // The new block is larger, so the whole old payload fits.
            self.base.copy(block.addr(), new_addr, old_size - DSIZE);
            self.deallocate(self.base.with_addr(block.addr()));
        }

        Ok(new)
    }

    /// Verifies the structure of the heap.
    ///
    /// See [`HeapViolation`] for the properties that are checked.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn check(&self) -> Result<(), HeapViolation> {
        crate::check::check(
            self.base,
            self.prologue,
            &self.lists,
            self.source.extent(),
            NonNullStrict::addr(self.source.top()),
        )
    }

    /// Runs the checker if the `heap-check` feature is enabled, panicking on
    /// a violation.
    #[inline]
    fn assert_consistent(&self) {
        #[cfg(feature = "heap-check")]
        if let Err(violation) = self.check() {
            log::error!("heap check failed: {violation}");
            panic!("heap check failed: {violation}");
        }
    }

    /// Returns the payload address of the first block after the prologue.
    #[cfg(test)]
    pub(crate) fn first_block(&self) -> core::num::NonZeroUsize {
        self.prologue.offset(DSIZE)
    }

    #[cfg(test)]
    pub(crate) fn base_ptr(&self) -> BasePtr {
        self.base
    }

    #[cfg(test)]
    pub(crate) fn lists_mut(&mut self) -> &mut SegLists<CLASSES> {
        &mut self.lists
    }
}

impl<S: Sbrk, const CLASSES: usize> fmt::Debug for SegFit<S, CLASSES> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegFit")
            .field("base", &self.base.ptr())
            .field("heap_size", &self.heap_size())
            .field("CLASSES", &CLASSES)
            .finish()
    }
}
