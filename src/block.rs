//! Block layout and boundary tags.
//!
//! ```text
//!        header         payload (or FreeLink when free)          footer
//!   ┌──────────────┬────────────────────────────────────────┬──────────────┐
//!   │ size | alloc │                 ...                    │ size | alloc │
//!   └──────────────┴────────────────────────────────────────┴──────────────┘
//!                  ▲
//!                  block address
//! ```
//!
//! A block is identified by the address of its payload. The header word sits
//! immediately before the payload and the footer word occupies the last
//! `WSIZE` bytes of the block, so the size recorded in a tag covers header,
//! payload and footer.

use core::{fmt, mem, num::NonZeroUsize};

use crate::base::{BasePtr, FreeLink};

/// Word size: the size of a boundary tag.
pub const WSIZE: usize = mem::size_of::<Tag>();

/// Double word size: the alignment quantum for block sizes and payloads.
pub const DSIZE: usize = 2 * WSIZE;

/// The alignment of every payload returned by the allocator.
pub const ALIGN: usize = DSIZE;

/// The smallest block the allocator will create.
///
/// A free block must hold its header, its footer and a [`FreeLink`].
pub const MIN_BLOCK_SIZE: usize = 3 * DSIZE;

/// The minimum number of bytes by which the heap is grown.
pub const CHUNK_SIZE: usize = 1 << 12;

/// The largest block size a boundary tag can describe.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX as usize) & !(DSIZE - 1);

const ALLOCATED: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

const _: () = assert!(MIN_BLOCK_SIZE >= 2 * WSIZE + mem::size_of::<FreeLink>());
const _: () = assert!(mem::align_of::<FreeLink>() <= ALIGN);

/// A boundary tag: a block size and an allocated flag packed into one word.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Tag(u32);

impl Tag {
    /// The tag of the epilogue header.
    pub const EPILOGUE: Tag = Tag::new(0, true);

    /// The tag of the prologue header and footer.
    pub const PROLOGUE: Tag = Tag::new(DSIZE, true);

    /// The alignment padding word at the very start of the heap.
    pub const PADDING: Tag = Tag(0);

    /// Packs `size` and `allocated` into a tag.
    ///
    /// `size` must be a multiple of `DSIZE` no larger than `MAX_BLOCK_SIZE`.
    #[inline]
    pub const fn new(size: usize, allocated: bool) -> Tag {
        debug_assert!(size % DSIZE == 0);
        debug_assert!(size <= MAX_BLOCK_SIZE);

        Tag(size as u32 | if allocated { ALLOCATED } else { 0 })
    }

    #[inline]
    pub const fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        !self.is_allocated()
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

/// Computes the block size needed to serve a request for `size` bytes.
///
/// The result includes header and footer overhead, is rounded up to `DSIZE`
/// and is never smaller than `MIN_BLOCK_SIZE`. Returns `None` if the block
/// would be too large to describe with a tag.
pub fn adjusted_size(size: usize) -> Option<usize> {
    let asize = if size <= 2 * DSIZE {
        MIN_BLOCK_SIZE
    } else {
        size.checked_add(DSIZE + (DSIZE - 1))? & !(DSIZE - 1)
    };

    (asize <= MAX_BLOCK_SIZE).then_some(asize)
}

/// A block in the heap, identified by its payload address.
///
/// The payload of an allocated block belongs to the caller. The payload of a
/// free block holds a [`FreeLink`]; [`Block::link_mut`] is the only way to
/// reach it.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Block(NonZeroUsize);

// All methods below which take a `BasePtr` share the same safety contract:
// `self` must be the payload address of a block (or sentinel) inside the heap
// described by `base`, and the tags it depends on must be initialized.
impl Block {
    #[inline]
    pub fn from_addr(addr: NonZeroUsize) -> Block {
        debug_assert_eq!(addr.get() % ALIGN, 0);
        Block(addr)
    }

    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.0
    }

    /// Returns the address `offset` bytes past this block's payload.
    #[inline]
    pub fn offset(self, offset: usize) -> NonZeroUsize {
        self.0.checked_add(offset).unwrap()
    }

    #[inline]
    pub fn header_addr(self) -> NonZeroUsize {
        NonZeroUsize::new(self.0.get() - WSIZE).unwrap()
    }

    #[inline]
    pub unsafe fn footer_addr(self, base: BasePtr) -> NonZeroUsize {
        let size = unsafe { self.size(base) };
        NonZeroUsize::new(self.0.get() + size - DSIZE).unwrap()
    }

    #[inline]
    pub unsafe fn header(self, base: BasePtr) -> Tag {
        unsafe { base.read_tag(self.header_addr()) }
    }

    #[inline]
    pub unsafe fn footer(self, base: BasePtr) -> Tag {
        unsafe { base.read_tag(self.footer_addr(base)) }
    }

    #[inline]
    pub unsafe fn size(self, base: BasePtr) -> usize {
        unsafe { self.header(base).size() }
    }

    #[inline]
    pub unsafe fn is_allocated(self, base: BasePtr) -> bool {
        unsafe { self.header(base).is_allocated() }
    }

    /// Writes `tag` to both the header and the footer of this block.
    ///
    /// The footer location is derived from the size in `tag`, not from the
    /// current header.
    #[inline]
    pub unsafe fn set_tags(self, base: BasePtr, tag: Tag) {
        let footer = NonZeroUsize::new(self.0.get() + tag.size() - DSIZE).unwrap();

        unsafe {
            base.write_tag(self.header_addr(), tag);
            base.write_tag(footer, tag);
        }
    }

    /// Returns the physically following block.
    #[inline]
    pub unsafe fn next(self, base: BasePtr) -> Block {
        let size = unsafe { self.size(base) };
        Block(self.offset(size))
    }

    /// Returns the physically preceding block, found through its footer.
    #[inline]
    pub unsafe fn prev(self, base: BasePtr) -> Block {
        let prev_size = unsafe { self.prev_footer(base).size() };
        Block(NonZeroUsize::new(self.0.get() - prev_size).unwrap())
    }

    /// Returns the footer tag of the physically preceding block.
    #[inline]
    pub unsafe fn prev_footer(self, base: BasePtr) -> Tag {
        let addr = NonZeroUsize::new(self.0.get() - DSIZE).unwrap();
        unsafe { base.read_tag(addr) }
    }

    /// Returns the header tag of the physically following block.
    #[inline]
    pub unsafe fn next_header(self, base: BasePtr) -> Tag {
        unsafe { self.next(base).header(base) }
    }

    /// Returns the free-list link stored in this block's payload.
    ///
    /// The block must be free and its link must be initialized.
    #[inline]
    pub unsafe fn link_mut<'a>(self, base: BasePtr) -> &'a mut FreeLink {
        debug_assert!(unsafe { !self.is_allocated(base) });

        unsafe { base.link_mut(self.0) }
    }

    /// Returns a copy of the free-list link stored in this block's payload.
    #[inline]
    pub unsafe fn link(self, base: BasePtr) -> FreeLink {
        unsafe { base.link(self.0) }
    }

    /// Initializes the free-list link in this block's payload.
    #[inline]
    pub unsafe fn init_link(self, base: BasePtr, prev: Block, next: Block) {
        unsafe {
            base.init_link_at(
                self.0,
                FreeLink {
                    prev: prev.0,
                    next: next.0,
                },
            )
        };
    }

    #[inline]
    pub unsafe fn next_free(self, base: BasePtr) -> Block {
        Block(unsafe { self.link(base).next })
    }

    #[inline]
    pub unsafe fn prev_free(self, base: BasePtr) -> Block {
        Block(unsafe { self.link(base).prev })
    }

    #[inline]
    pub unsafe fn set_next_free(self, base: BasePtr, next: Block) {
        unsafe { self.link_mut(base).next = next.0 };
    }

    #[inline]
    pub unsafe fn set_prev_free(self, base: BasePtr, prev: Block) {
        unsafe { self.link_mut(base).prev = prev.0 };
    }
}
