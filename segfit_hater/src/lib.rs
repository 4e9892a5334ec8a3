#![deny(unsafe_op_in_unsafe_fn)]

use std::{alloc::Layout, ptr::NonNull};

use alloc_hater::{AllocatorOp, Evaluator, Failed, Subject};
use arbitrary::{Arbitrary, Unstructured};
use segfit::{AllocError, AllocInitError, Global, Heap, SegFit, ALIGN, CHUNK_SIZE};

const MAX_CAPACITY_CHUNKS: usize = 256;
const MAX_SIZE: usize = 64 * 1024;
const MAX_ALIGN_SHIFT: u8 = 5; // 16 bytes

/// A heap capacity and an operation sequence with bounded sizes.
#[derive(Clone, Debug)]
pub struct Args {
    pub capacity: usize,
    pub ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let capacity = CHUNK_SIZE * (1 + usize::arbitrary(un)? % MAX_CAPACITY_CHUNKS);

        let mut ops = Vec::new();
        while !un.is_empty() {
            ops.push(AllocatorOp::arbitrary_bounded(
                un,
                MAX_SIZE,
                MAX_ALIGN_SHIFT,
            )?);
        }

        Ok(Args { capacity, ops })
    }
}

/// Evaluates `args.ops` against a fresh `SegFit` with `CLASSES` size
/// classes. Capacities too small to initialize are skipped.
pub fn evaluate<const CLASSES: usize>(args: Args) -> Result<(), Failed> {
    let Args { capacity, ops } = args;

    let segfit = match SegFitSubject::<CLASSES>::new(capacity) {
        Ok(s) => s,
        Err(_) => return Ok(()),
    };

    Evaluator::new(segfit).evaluate(ops)
}

pub struct SegFitSubject<const CLASSES: usize>(SegFit<Heap<Global>, CLASSES>);

impl<const CLASSES: usize> SegFitSubject<CLASSES> {
    /// Creates a subject whose heap can grow to `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self, AllocInitError> {
        let s = SegFit::try_new(Heap::try_new(capacity)?)?;
        Ok(SegFitSubject(s))
    }
}

impl<const CLASSES: usize> Subject for SegFitSubject<CLASSES> {
    type Op = ();
    type AllocError = AllocError;

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, Self::AllocError> {
        // Payloads are only ever aligned to `ALIGN`.
        if layout.align() > ALIGN {
            return Err(AllocError);
        }

        self.0.allocate(layout.size())
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _layout: Layout) {
        unsafe { self.0.deallocate(ptr) };
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        _layout: Layout,
        new_size: usize,
    ) -> Result<NonNull<[u8]>, Self::AllocError> {
        unsafe { self.0.reallocate(ptr, new_size) }
    }

    fn is_consistent(&self) -> bool {
        self.0.check().is_ok()
    }

    fn handle_custom_op(&mut self, (): ()) {}
}
