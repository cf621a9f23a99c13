//! Heap consistency auditing.
//!
//! [`Heap::audit`] walks the whole block run and every class list and
//! reports the first broken invariant. It is meant to be called between
//! operations (the heap is only consistent at those points) and is the
//! crate's observability surface: the allocator itself never prints or
//! logs, since it may be running underneath the machinery that would do
//! the printing.

use std::fmt;

use crate::{
    freelist::{class_of, CLASSES},
    header::{
        block_size, footer_of, get_word, header_of, is_allocated, is_prev_allocated, next_block,
        ALIGNMENT, ALLOC_BIT, MIN_BLOCK_SIZE,
    },
    heap::Heap,
};

/// A violated heap invariant. Addresses are reported as raw payload
/// addresses, which is what the offending caller saw.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuditError {
    /// Two free blocks touch; the coalescer must never let this survive.
    AdjacentFreeBlocks { at: usize },
    /// A header's predecessor-allocated bit disagrees with the predecessor.
    PrevAllocMismatch { at: usize },
    /// A payload address is not 8-aligned.
    UnalignedPayload { at: usize },
    /// A free block's footer is not a copy of its header.
    FooterMismatch { at: usize },
    /// A listable free block is missing from its class list.
    UnlistedFreeBlock { at: usize },
    /// A free block appears more than once on its class list.
    RelistedFreeBlock { at: usize },
    /// An allocated block sits on a free list.
    ListedAllocatedBlock { at: usize },
    /// A listed block's size falls outside its class range.
    MisclassedBlock { at: usize, class: usize },
    /// A listed address points outside the heap.
    ListedOutOfBounds { at: usize },
    /// The epilogue header lost its allocated bit.
    MalformedEpilogue { word: u32 },
    /// Walking the blocks by size did not land on the epilogue: some size
    /// field is corrupt.
    BrokenWalk { expected: usize, actual: usize },
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditError::AdjacentFreeBlocks { at } => {
                write!(f, "uncoalesced free blocks at {at:#x}")
            }
            AuditError::PrevAllocMismatch { at } => {
                write!(f, "stale predecessor-allocated bit at {at:#x}")
            }
            AuditError::UnalignedPayload { at } => {
                write!(f, "unaligned payload address {at:#x}")
            }
            AuditError::FooterMismatch { at } => {
                write!(f, "free block header/footer mismatch at {at:#x}")
            }
            AuditError::UnlistedFreeBlock { at } => {
                write!(f, "free block at {at:#x} missing from its class list")
            }
            AuditError::RelistedFreeBlock { at } => {
                write!(f, "free block at {at:#x} listed more than once")
            }
            AuditError::ListedAllocatedBlock { at } => {
                write!(f, "allocated block at {at:#x} found on a free list")
            }
            AuditError::MisclassedBlock { at, class } => {
                write!(f, "block at {at:#x} listed under wrong class {class}")
            }
            AuditError::ListedOutOfBounds { at } => {
                write!(f, "free list entry {at:#x} points outside the heap")
            }
            AuditError::MalformedEpilogue { word } => {
                write!(f, "malformed epilogue header {word:#010x}")
            }
            AuditError::BrokenWalk { expected, actual } => {
                write!(
                    f,
                    "block walk ended at {actual:#x} instead of the epilogue at {expected:#x}"
                )
            }
        }
    }
}

impl std::error::Error for AuditError {}

impl Heap {
    /// Verifies every quiescent-point invariant of the heap.
    pub fn audit(&self) -> Result<(), AuditError> {
        unsafe {
            // One pass over the block run. The prologue counts as the
            // allocated predecessor of the first block.
            let mut prev_allocated = true;
            let mut bp = self.bottom();

            while block_size(bp) != 0 {
                let at = bp.as_ptr() as usize;

                if at % ALIGNMENT != 0 {
                    return Err(AuditError::UnalignedPayload { at });
                }
                if is_prev_allocated(bp) != prev_allocated {
                    return Err(AuditError::PrevAllocMismatch { at });
                }

                let allocated = is_allocated(bp);
                if !allocated {
                    if !prev_allocated {
                        return Err(AuditError::AdjacentFreeBlocks { at });
                    }
                    if get_word(header_of(bp)) != get_word(footer_of(bp)) {
                        return Err(AuditError::FooterMismatch { at });
                    }
                    if block_size(bp) >= MIN_BLOCK_SIZE {
                        let listed = self
                            .free_list
                            .class_blocks(class_of(block_size(bp)))
                            .filter(|&entry| entry == bp)
                            .count();
                        if listed == 0 {
                            return Err(AuditError::UnlistedFreeBlock { at });
                        }
                        if listed > 1 {
                            return Err(AuditError::RelistedFreeBlock { at });
                        }
                    }
                }

                prev_allocated = allocated;
                bp = next_block(bp);
            }

            // The walk by sizes must land exactly on the epilogue sentinel;
            // anything else means a size field telescoped wrong.
            let word = get_word(header_of(bp));
            if word & ALLOC_BIT == 0 {
                return Err(AuditError::MalformedEpilogue { word });
            }
            let expected = self.epilogue().as_ptr() as usize;
            let actual = header_of(bp).as_ptr() as usize;
            if actual != expected {
                return Err(AuditError::BrokenWalk { expected, actual });
            }

            // One pass over the index: everything listed must be a free,
            // in-bounds block filed under the right class.
            for class in 0..CLASSES {
                for entry in self.free_list.class_blocks(class) {
                    let at = entry.as_ptr() as usize;

                    if !self.segment.contains(entry) {
                        return Err(AuditError::ListedOutOfBounds { at });
                    }
                    if is_allocated(entry) {
                        return Err(AuditError::ListedAllocatedBlock { at });
                    }
                    if class_of(block_size(entry)) != class {
                        return Err(AuditError::MisclassedBlock { at, class });
                    }
                }
            }

            Ok(())
        }
    }
}
