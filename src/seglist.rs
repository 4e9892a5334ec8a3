//! Segregated free lists.
//!
//! Each size class owns one circular, doubly-linked ring of free blocks,
//! kept in ascending address order starting from the class head. Inserting a
//! block coalesces it with any free physical neighbours first, so no two
//! adjacent blocks are ever both free.

use crate::{
    base::BasePtr,
    block::{Block, Tag, DSIZE},
};

/// Returns the largest block size held by size class `class`, or `None` if
/// the class is unbounded.
pub fn class_limit<const CLASSES: usize>(class: usize) -> Option<usize> {
    if class + 1 >= CLASSES {
        return None;
    }

    let shift = u32::try_from(class).ok()?;
    1_usize.checked_shl(shift)?.checked_mul(4 * DSIZE)
}

/// Returns the size class of a free block of `size` bytes.
pub fn classify<const CLASSES: usize>(size: usize) -> usize {
    (0..CLASSES)
        .find(|&class| class_limit::<CLASSES>(class).map_or(true, |limit| size <= limit))
        .unwrap_or(CLASSES - 1)
}

/// The heads of the segregated free lists.
pub struct SegLists<const CLASSES: usize> {
    heads: [Option<Block>; CLASSES],
}

impl<const CLASSES: usize> SegLists<CLASSES> {
    pub const fn new() -> SegLists<CLASSES> {
        SegLists {
            heads: [None; CLASSES],
        }
    }

    /// Returns the head of the list for `class`.
    #[inline]
    pub fn head(&self, class: usize) -> Option<Block> {
        self.heads[class]
    }

    /// Removes `block` from the list of its size class.
    ///
    /// # Safety
    ///
    /// `block` must be a member of the list matching the size recorded in its
    /// header.
    pub unsafe fn delete(&mut self, base: BasePtr, block: Block) {
        unsafe {
            let class = classify::<CLASSES>(block.size(base));
            let next = block.next_free(base);

            // `block` is the only member of its list.
            if next == block {
                self.heads[class] = None;
                return;
            }

            if self.heads[class] == Some(block) {
                self.heads[class] = Some(next);
            }

            let prev = block.prev_free(base);
            prev.set_next_free(base, next);
            next.set_prev_free(base, prev);
        }
    }

    /// Inserts the free block `block`, first merging it with any free
    /// physical neighbours.
    ///
    /// Returns the block that ends up in a free list, which starts at or
    /// before `block`.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of the heap described by `base`, with
    /// valid tags, and must not currently be a member of any list.
    pub unsafe fn insert(&mut self, base: BasePtr, block: Block) -> Block {
        unsafe {
            let mut block = block;
            let mut size = block.size(base);

            let prev_alloc = block.prev_footer(base).is_allocated();
            let next_alloc = block.next_header(base).is_allocated();

            match (prev_alloc, next_alloc) {
                (true, true) => (),

                // Absorb the successor.
                (true, false) => {
                    let next = block.next(base);
                    size += next.size(base);
                    self.delete(base, next);
                    block.set_tags(base, Tag::new(size, false));
                }

                // Absorb into the predecessor.
                (false, true) => {
                    block = block.prev(base);
                    size += block.size(base);
                    if !self.resize(base, block, size) {
                        return block;
                    }
                }

                // Absorb the successor, then absorb into the predecessor.
                (false, false) => {
                    let next = block.next(base);
                    size += next.size(base);
                    self.delete(base, next);
                    block = block.prev(base);
                    size += block.size(base);
                    if !self.resize(base, block, size) {
                        return block;
                    }
                }
            }

            let class = classify::<CLASSES>(size);

            let head = match self.heads[class] {
                Some(h) if h < block => h,
                // Empty list, or `block` is the new lowest address.
                _ => {
                    self.insert_after(base, None, block, class);
                    return block;
                }
            };

            // Find the last member whose address is below `block`.
            let mut anchor = head;
            loop {
                let next = anchor.next_free(base);
                if next == head || next > block {
                    break;
                }
                anchor = next;
            }

            self.insert_after(base, Some(anchor), block, class);
            block
        }
    }

    /// Links `block` into the list for `class` directly after `anchor`,
    /// without coalescing.
    ///
    /// If `anchor` is `None`, `block` becomes the head of the list.
    ///
    /// # Safety
    ///
    /// `block` must be a free block not in any list, with room for a
    /// `FreeLink` in its payload, and `anchor`, if present, must be a member
    /// of the list for `class`.
    pub unsafe fn insert_after(
        &mut self,
        base: BasePtr,
        anchor: Option<Block>,
        block: Block,
        class: usize,
    ) {
        unsafe {
            match anchor {
                Some(prev) => {
                    let next = prev.next_free(base);
                    block.init_link(base, prev, next);
                    next.set_prev_free(base, block);
                    prev.set_next_free(base, block);
                }

                None => {
                    match self.heads[class] {
                        Some(head) => {
                            let tail = head.prev_free(base);
                            block.init_link(base, tail, head);
                            head.set_prev_free(base, block);
                            tail.set_next_free(base, block);
                        }

                        None => block.init_link(base, block, block),
                    }

                    self.heads[class] = Some(block);
                }
            }
        }
    }

    /// Inserts a block freshly obtained from heap growth.
    ///
    /// Nothing follows such a block but the epilogue, so only the
    /// predecessor can be free. Otherwise the block has the highest address
    /// in the heap and is appended at the tail of its class.
    ///
    /// # Safety
    ///
    /// Same as [`SegLists::insert`].
    pub unsafe fn insert_back(&mut self, base: BasePtr, block: Block, class: usize) -> Block {
        unsafe {
            if block.prev_footer(base).is_free() {
                return self.insert(base, block);
            }

            let tail = self.heads[class].map(|head| head.prev_free(base));
            self.insert_after(base, tail, block, class);
        }

        block
    }

    /// Finds the first free block of at least `size` bytes, searching each
    /// class in list order, starting at the class of `size`.
    ///
    /// # Safety
    ///
    /// All lists must be well formed.
    pub unsafe fn find_fit(&self, base: BasePtr, size: usize) -> Option<Block> {
        for class in classify::<CLASSES>(size)..CLASSES {
            let head = match self.heads[class] {
                Some(h) => h,
                None => continue,
            };

            let mut block = head;
            loop {
                if unsafe { block.size(base) } >= size {
                    return Some(block);
                }

                block = unsafe { block.next_free(base) };
                if block == head {
                    break;
                }
            }
        }

        None
    }

    /// Rewrites the tags of the free block `block` for `new_size` bytes.
    ///
    /// If the size class changes, the block is removed from its list first
    /// and `true` is returned; the caller must reinsert it. Otherwise the
    /// block keeps its list position and `false` is returned.
    ///
    /// # Safety
    ///
    /// `block` must be a member of the list matching its current size, and
    /// the heap must hold `new_size` bytes starting at `block`'s header.
    pub unsafe fn resize(&mut self, base: BasePtr, block: Block, new_size: usize) -> bool {
        unsafe {
            let relink = classify::<CLASSES>(block.size(base)) != classify::<CLASSES>(new_size);
            if relink {
                self.delete(base, block);
            }

            block.set_tags(base, Tag::new(new_size, false));
            relink
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_limits_double() {
        assert_eq!(class_limit::<9>(0), Some(32));
        assert_eq!(class_limit::<9>(1), Some(64));
        assert_eq!(class_limit::<9>(7), Some(4096));
        assert_eq!(class_limit::<9>(8), None);
        assert_eq!(class_limit::<1>(0), None);
    }

    #[test]
    fn classify_picks_first_fitting_class() {
        assert_eq!(classify::<9>(24), 0);
        assert_eq!(classify::<9>(32), 0);
        assert_eq!(classify::<9>(40), 1);
        assert_eq!(classify::<9>(64), 1);
        assert_eq!(classify::<9>(65), 2);
        assert_eq!(classify::<9>(4096), 7);
        assert_eq!(classify::<9>(4104), 8);
        assert_eq!(classify::<9>(usize::MAX), 8);
    }

    #[test]
    fn classify_with_one_class() {
        assert_eq!(classify::<1>(24), 0);
        assert_eq!(classify::<1>(1 << 30), 0);
    }

    #[test]
    fn classify_with_many_classes_does_not_overflow() {
        // Limits that overflow `usize` hold every size.
        let class = classify::<128>(usize::MAX);
        assert!(class < 127);
        assert_eq!(class_limit::<128>(class), None);
        assert_eq!(class_limit::<128>(usize::BITS as usize + 1), None);
    }

    #[test]
    fn classify_is_monotonic() {
        let mut last = 0;
        for size in (24..1 << 16).step_by(DSIZE) {
            let class = classify::<9>(size);
            assert!(class >= last);
            last = class;
        }
    }
}
