//! Heap consistency checking.
//!
//! The checker is independent of the allocation paths: it only reads the
//! heap, walking the physical chain of blocks from the prologue to the
//! epilogue and then every free list, and cross-checks the two views.

use core::{fmt, num::NonZeroUsize};

use crate::{
    base::BasePtr,
    block::{Block, Tag, ALIGN, DSIZE, MIN_BLOCK_SIZE, WSIZE},
    seglist::{classify, SegLists},
};

/// A violation of the heap's structural invariants.
///
/// Block locations are given as offsets from the start of the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapViolation {
    /// The alignment padding or the prologue header and footer differ from
    /// what initialization installed.
    Prologue,

    /// The word before the top of the heap is not an epilogue header.
    Epilogue,

    /// A block is smaller than the minimum block size.
    Undersized {
        /// Offset of the block's payload.
        block: usize,
    },

    /// A block extends past the epilogue.
    Overrun {
        /// Offset of the block's payload.
        block: usize,
    },

    /// A block's header and footer differ.
    TagMismatch {
        /// Offset of the block's payload.
        block: usize,
    },

    /// A free block has a free physical neighbour.
    Uncoalesced {
        /// Offset of the block's payload.
        block: usize,
    },

    /// The sizes of all blocks and sentinels do not add up to the heap size.
    SizeMismatch {
        /// The total size found by walking the heap.
        walked: usize,
        /// The heap size reported by the growth primitive.
        extent: usize,
    },

    /// A free list refers to an address that is not a block in the heap.
    StrayLink {
        /// The size class of the list.
        class: usize,
    },

    /// A free list member is marked allocated.
    AllocatedInList {
        /// Offset of the block's payload.
        block: usize,
        /// The size class of the list.
        class: usize,
    },

    /// A free list member belongs to a different size class.
    Misclassified {
        /// Offset of the block's payload.
        block: usize,
        /// The size class of the list.
        class: usize,
    },

    /// A free list member's successor does not link back to it.
    BrokenLink {
        /// Offset of the block's payload.
        block: usize,
        /// The size class of the list.
        class: usize,
    },

    /// A free list is not in ascending address order.
    Unordered {
        /// Offset of the first block out of order.
        block: usize,
        /// The size class of the list.
        class: usize,
    },

    /// The number of free blocks in the heap differs from the number of free
    /// list members.
    FreeCountMismatch {
        /// Free blocks found by walking the heap.
        walked: usize,
        /// Members found in the free lists.
        listed: usize,
    },
}

impl fmt::Display for HeapViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapViolation::Prologue => f.write_str("padding or prologue words are inconsistent"),
            HeapViolation::Epilogue => f.write_str("last word is not an epilogue header"),
            HeapViolation::Undersized { block } => {
                write!(f, "block at {block:#x} is smaller than the minimum block size")
            }
            HeapViolation::Overrun { block } => {
                write!(f, "block at {block:#x} extends past the epilogue")
            }
            HeapViolation::TagMismatch { block } => {
                write!(f, "block at {block:#x} has different header and footer")
            }
            HeapViolation::Uncoalesced { block } => {
                write!(f, "free block at {block:#x} has a free neighbour")
            }
            HeapViolation::SizeMismatch { walked, extent } => {
                write!(f, "blocks add up to {walked} bytes, heap has {extent}")
            }
            HeapViolation::StrayLink { class } => {
                write!(f, "free list {class} links outside the heap")
            }
            HeapViolation::AllocatedInList { block, class } => {
                write!(f, "allocated block at {block:#x} is in free list {class}")
            }
            HeapViolation::Misclassified { block, class } => {
                write!(f, "block at {block:#x} does not belong in free list {class}")
            }
            HeapViolation::BrokenLink { block, class } => {
                write!(f, "free list {class} is broken after block at {block:#x}")
            }
            HeapViolation::Unordered { block, class } => {
                write!(f, "free list {class} is out of order at block {block:#x}")
            }
            HeapViolation::FreeCountMismatch { walked, listed } => {
                write!(f, "{walked} free blocks in the heap, {listed} in free lists")
            }
        }
    }
}

/// Checks the heap that starts at `base`.
///
/// `extent` and `top` are the heap size and the address one past the end of
/// the heap, as reported by the growth primitive.
pub(crate) fn check<const CLASSES: usize>(
    base: BasePtr,
    prologue: Block,
    lists: &SegLists<CLASSES>,
    extent: usize,
    top: NonZeroUsize,
) -> Result<(), HeapViolation> {
    // Padding, prologue header and prologue footer.
    unsafe {
        if base.read_tag(base.addr()) != Tag::PADDING
            || prologue.header(base) != Tag::PROLOGUE
            || prologue.footer(base) != Tag::PROLOGUE
        {
            return Err(HeapViolation::Prologue);
        }
    }

    let epilogue = top
        .get()
        .checked_sub(WSIZE)
        .and_then(NonZeroUsize::new)
        .filter(|&addr| base.contains_addr(addr))
        .ok_or(HeapViolation::Epilogue)?;
    if unsafe { base.read_tag(epilogue) } != Tag::EPILOGUE {
        return Err(HeapViolation::Epilogue);
    }

    let walked_free = walk_blocks(base, prologue, epilogue, extent)?;
    let listed_free = walk_lists(base, prologue, lists, epilogue)?;

    if walked_free != listed_free {
        return Err(HeapViolation::FreeCountMismatch {
            walked: walked_free,
            listed: listed_free,
        });
    }

    Ok(())
}

/// Walks the physical chain of blocks and returns the number of free blocks.
fn walk_blocks(
    base: BasePtr,
    prologue: Block,
    epilogue: NonZeroUsize,
    extent: usize,
) -> Result<usize, HeapViolation> {
    // Padding, prologue and epilogue.
    let mut walked = 3 * WSIZE + WSIZE;
    let mut free = 0;

    let mut block = Block::from_addr(prologue.offset(DSIZE));

    while block.header_addr() != epilogue {
        let offset = base.offset_to(block.addr());

        if block.header_addr() > epilogue {
            return Err(HeapViolation::Overrun { block: offset });
        }

        let header = unsafe { block.header(base) };
        if header.size() < MIN_BLOCK_SIZE {
            return Err(HeapViolation::Undersized { block: offset });
        }

        // The footer must lie before the epilogue.
        if block.offset(header.size() - DSIZE) >= epilogue {
            return Err(HeapViolation::Overrun { block: offset });
        }

        if unsafe { block.footer(base) } != header {
            return Err(HeapViolation::TagMismatch { block: offset });
        }

        if header.is_free() {
            let coalesced = unsafe {
                block.prev_footer(base).is_allocated() && block.next_header(base).is_allocated()
            };
            if !coalesced {
                return Err(HeapViolation::Uncoalesced { block: offset });
            }

            free += 1;
        }

        walked += header.size();
        block = unsafe { block.next(base) };
    }

    if walked != extent {
        return Err(HeapViolation::SizeMismatch { walked, extent });
    }

    Ok(free)
}

/// Walks every free list and returns the total number of members.
///
/// Must only be called once the physical chain is known to be sound.
fn walk_lists<const CLASSES: usize>(
    base: BasePtr,
    prologue: Block,
    lists: &SegLists<CLASSES>,
    epilogue: NonZeroUsize,
) -> Result<usize, HeapViolation> {
    let first = prologue.offset(DSIZE);
    let in_heap = |block: Block| {
        let addr = block.addr();
        addr >= first && addr < epilogue && addr.get() % ALIGN == 0
    };

    // A well-formed list cannot have more members than this.
    let limit = base.extent() / MIN_BLOCK_SIZE;

    let mut listed = 0;

    for class in 0..CLASSES {
        let head = match lists.head(class) {
            Some(h) => h,
            None => continue,
        };

        let mut block = head;
        let mut members = 0;

        loop {
            if !in_heap(block) || members > limit {
                return Err(HeapViolation::StrayLink { class });
            }

            let offset = base.offset_to(block.addr());
            let header = unsafe { block.header(base) };

            if header.is_allocated() {
                return Err(HeapViolation::AllocatedInList {
                    block: offset,
                    class,
                });
            }

            if classify::<CLASSES>(header.size()) != class {
                return Err(HeapViolation::Misclassified {
                    block: offset,
                    class,
                });
            }

            let next = unsafe { block.next_free(base) };
            if !in_heap(next) {
                return Err(HeapViolation::StrayLink { class });
            }

            if unsafe { next.prev_free(base) } != block {
                return Err(HeapViolation::BrokenLink {
                    block: offset,
                    class,
                });
            }

            members += 1;

            if next == head {
                break;
            }

            if next <= block {
                return Err(HeapViolation::Unordered {
                    block: base.offset_to(next.addr()),
                    class,
                });
            }

            block = next;
        }

        listed += members;
    }

    Ok(listed)
}
