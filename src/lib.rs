//! A segregated-fit, boundary-tag memory allocator.
//!
//! [`SegFit`] manages a single contiguous heap that grows on demand through a
//! [`Sbrk`] implementation. Every block carries its size and allocation state
//! in a header word and an identical footer word, which lets neighbouring free
//! blocks be found and merged in constant time. Free blocks are kept in one
//! address-ordered, circular doubly-linked list per size class, and
//! allocations take the first block that fits, scanning size classes in
//! ascending order.
//!
//! ## Example
//!
//! ```
//! # #[cfg(feature = "alloc")]
//! # fn main() {
//! use segfit::{Global, Heap, SegFit};
//!
//! let heap = Heap::<Global>::try_new(1 << 20).unwrap();
//! let mut segfit: SegFit<_> = SegFit::try_new(heap).unwrap();
//!
//! let block = segfit.allocate(100).unwrap();
//! assert_eq!(block.len(), 100);
//!
//! let block = unsafe { segfit.reallocate(block.cast(), 1000) }.unwrap();
//! unsafe { segfit.deallocate(block.cast()) };
//!
//! segfit.check().unwrap();
//! # }
//! # #[cfg(not(feature = "alloc"))]
//! # fn main() {}
//! ```
//!
//! ## Crate features
//!
//! - `alloc`: enables [`Global`], which backs a [`Heap`] with memory from the
//!   global allocator.
//! - `heap-check`: runs [`SegFit::check`] on entry to every public operation
//!   and panics on the first violation.

#![doc(html_root_url = "https://docs.rs/segfit/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by unstable features.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod block;
pub mod check;
pub mod heap;
mod polyfill;
pub mod segfit;
mod seglist;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    block::{ALIGN, CHUNK_SIZE, DSIZE, MIN_BLOCK_SIZE, WSIZE},
    check::HeapViolation,
    heap::{Heap, Sbrk},
    segfit::SegFit,
};

/// The error type for allocator constructors.
#[derive(Clone, Debug)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory for the managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    InvalidConfig,

    /// The location of the allocator is invalid.
    ///
    /// This variant is returned when the full size of the managed region
    /// would not fit at the provided address, i.e., pointer calculations
    /// would overflow.
    InvalidLocation,

    /// The heap could not be grown far enough to hold the initial sentinels
    /// and the first free chunk.
    GrowFailed,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate region (size {}, align {})",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
            AllocInitError::InvalidLocation => f.write_str("region overflows the address space"),
            AllocInitError::GrowFailed => f.write_str("initial heap growth failed"),
        }
    }
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory allocation failed")
    }
}

/// Types which provide memory which backs a [`Heap`].
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that a heap is not backed by another
///   allocator. This is the case when constructing the heap from raw
///   pointers.
/// - The `Global` marker type indicates that a heap is backed by the global
///   allocator. The heap will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that a heap is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
