#![cfg(test)]
extern crate std;

use core::{marker::PhantomData, mem, ptr::NonNull, slice};

use crate::{
    check::HeapViolation, AllocError, AllocInitError, Global, Heap, SegFit, CHUNK_SIZE,
};

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

trait QcAllocator: Sized {
    type Params: Arbitrary + core::fmt::Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError>;

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<[u8]>, AllocError>;

    fn check(&self) -> Result<(), HeapViolation>;
}

// SegFit =====================================================================

#[derive(Clone, Debug)]
struct SegFitParams {
    capacity: usize,
}

impl Arbitrary for SegFitParams {
    fn arbitrary(g: &mut Gen) -> Self {
        // At least the sentinels and the initial chunk.
        SegFitParams {
            capacity: CHUNK_SIZE * (2 + usize::arbitrary(g) % 64),
        }
    }
}

impl<const CLASSES: usize> QcAllocator for SegFit<Heap<Global>, CLASSES> {
    type Params = SegFitParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        SegFit::try_new(Heap::try_new(params.capacity)?)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.deallocate(ptr) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<NonNull<[u8]>, AllocError> {
        unsafe { self.reallocate(ptr, size) }
    }

    fn check(&self) -> Result<(), HeapViolation> {
        self.check()
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
    Realloc,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer that can hold `len` `u32` values.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
    /// Resize an existing allocation to hold `len` `u32` values.
    ///
    /// The allocation is chosen as for `Free`.
    Realloc { index: usize, len: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 14;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Free,
                AllocatorOpTag::Realloc,
            ])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                len: limited_size(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
            AllocatorOpTag::Realloc => AllocatorOp::Realloc {
                index: usize::arbitrary(g),
                len: limited_size(g),
            },
        }
    }
}

type OpId = u32;

/// An outstanding allocation, painted with the id of the operation that last
/// produced it.
struct Allocation {
    op_id: OpId,
    ptr: NonNull<u32>,
    len: usize,
}

impl Allocation {
    fn new(op_id: OpId, raw: NonNull<[u8]>, len: usize) -> Allocation {
        Allocation {
            op_id,
            ptr: raw.cast(),
            len,
        }
    }

    fn as_bytes(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    fn paint(&mut self) {
        let slice = unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        slice.fill(self.op_id);
    }

    /// Returns `true` if the first `len` elements still hold this
    /// allocation's id.
    fn intact(&self, len: usize) -> bool {
        let slice = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), len) };
        slice.iter().all(|&elem| elem == self.op_id)
    }
}

trait Prop {
    /// The allocator to test for this property.
    type Allocator: QcAllocator;

    /// Examines the allocator after every operation.
    fn post_op(allocator: &Self::Allocator) -> bool {
        let _ = allocator;
        true
    }

    /// Examines an allocation before it is freed or resized.
    fn pre_release(allocation: &Allocation) -> bool {
        let _ = allocation;
        true
    }

    /// Examines an allocation after it was resized from `old`.
    fn post_reallocate(old: &Allocation, new: &Allocation) -> bool {
        let _ = (old, new);
        true
    }
}

struct AllocatorChecker<P: Prop> {
    allocator: P::Allocator,
    allocations: Vec<Allocation>,
    num_ops: u32,
}

impl<P: Prop> AllocatorChecker<P> {
    fn new(
        params: <P::Allocator as QcAllocator>::Params,
        capacity: usize,
    ) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: P::Allocator::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { len } => {
                let size = len * mem::size_of::<u32>();

                match self.allocator.allocate(size) {
                    Ok(raw) => {
                        if raw.len() != size {
                            return false;
                        }

                        let mut a = Allocation::new(op_id, raw, len);
                        a.paint();
                        self.allocations.push(a);
                    }

                    // Zero-sized requests fail, and running out of memory
                    // is allowed.
                    Err(AllocError) => (),
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !P::pre_release(&a) {
                    return false;
                }

                unsafe { self.allocator.deallocate(a.as_bytes()) };
            }

            AllocatorOp::Realloc { index, len } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();

                if !P::pre_release(&self.allocations[index]) {
                    return false;
                }

                let size = len * mem::size_of::<u32>();
                let old = &self.allocations[index];

                match unsafe { self.allocator.reallocate(old.as_bytes(), size) } {
                    Ok(raw) => {
                        if raw.len() != size {
                            return false;
                        }

                        let mut new = Allocation::new(old.op_id, raw, len);
                        if !P::post_reallocate(old, &new) {
                            return false;
                        }

                        new.op_id = op_id;
                        new.paint();
                        self.allocations[index] = new;
                    }

                    // On failure the old allocation is untouched.
                    Err(AllocError) => {
                        if !P::pre_release(old) {
                            return false;
                        }
                    }
                }
            }
        }

        P::post_op(&self.allocator)
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in self.allocations.drain(..) {
            if !P::pre_release(&a) {
                return false;
            }

            unsafe { self.allocator.deallocate(a.as_bytes()) };
        }

        P::post_op(&self.allocator)
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

/// Live allocations never overlap, and their contents survive other
/// operations and reallocation.
struct MutuallyExclusive<A: QcAllocator> {
    phantom: PhantomData<A>,
}

impl<A: QcAllocator> Prop for MutuallyExclusive<A> {
    type Allocator = A;

    fn pre_release(allocation: &Allocation) -> bool {
        allocation.intact(allocation.len)
    }

    fn post_reallocate(old: &Allocation, new: &Allocation) -> bool {
        new.intact(old.len.min(new.len))
    }
}

/// The heap passes the consistency checker after every operation.
struct Consistent<A: QcAllocator> {
    phantom: PhantomData<A>,
}

impl<A: QcAllocator> Prop for Consistent<A> {
    type Allocator = A;

    fn post_op(allocator: &A) -> bool {
        match allocator.check() {
            Ok(()) => true,
            Err(violation) => {
                std::eprintln!("heap check failed: {violation}");
                false
            }
        }
    }
}

fn check<P: Prop>(params: <P::Allocator as QcAllocator>::Params, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: AllocatorChecker<P> = AllocatorChecker::new(params, ops.capacity()).unwrap();
    checker.run(ops)
}

#[test]
fn segfit_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<SegFit<Heap<Global>, 9>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<MutuallyExclusive<SegFit<Heap<Global>, 1>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<MutuallyExclusive<SegFit<Heap<Global>, 4>>> as fn(_, _) -> bool);
}

#[test]
fn segfit_heap_stays_consistent() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<Consistent<SegFit<Heap<Global>, 9>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<Consistent<SegFit<Heap<Global>, 1>>> as fn(_, _) -> bool);
    qc.quickcheck(check::<Consistent<SegFit<Heap<Global>, 16>>> as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}

#[test]
fn readme_deps() {
    version_sync::assert_markdown_deps_updated!("README.md");
}
