//! The size-class index and the free-list operator.
//!
//! Free blocks of at least [`MIN_BLOCK_SIZE`] bytes are threaded through
//! singly-linked lists, one per power-of-two size class. The list heads live
//! in a small table at the very bottom of the heap segment, so the index is
//! itself allocated from the heap it serves. A free block's successor link
//! occupies its first 8 payload bytes, which is fine because nobody else
//! owns those bytes while the block is free:
//!
//! ```text
//!  heap base
//!  +-----------+-----------+------+------------+
//!  | class 0   | class 1   | ...  | class 25   |  <- head slots, 8 bytes each
//!  +-----|-----+-----------+------+-----|------+
//!        |                              |
//!        v                              v
//!  +-----------+                  +-----------+
//!  | free 24 B | -> free 32 B     | free 2 MB | -> None
//!  +-----------+                  +-----------+
//! ```
//!
//! A head slot and a free block's link slot have the same shape (8 bytes
//! holding a successor address or null), so insertion and removal walk a
//! single chain of slots without special-casing the head.
//!
//! The lists are singly linked to keep the smallest class viable: a doubly
//! linked list would need 16 bytes of payload for its links, pushing the
//! minimum listable block to 24 bytes. Removal is O(list length), which is
//! acceptable because the common removal (a fit found by [`FreeList::find_fit`]
//! and consumed immediately) pops the head.

use std::ptr::NonNull;

use crate::header::{self, DWORD, MIN_BLOCK_SIZE};
use crate::Pointer;

/// Number of size classes.
pub(crate) const CLASSES: usize = 26;

/// Offset applied to the class exponent base; with the 3 bits of alignment
/// this puts the smallest class bound at `2^5 = 32` bytes, so class 0 holds
/// the 16- and 24-byte blocks.
const BIAS: usize = 2;

const CLASS_SHIFT: usize = BIAS + 3;

/// Bytes occupied by the head-slot table at the heap base.
pub(crate) const INDEX_SIZE: usize = CLASSES * DWORD;

/// Class for a block of `size` bytes: the smallest `i` whose upper bound
/// `2^(i + 5)` reaches `size`, clamped to the last class.
pub(crate) fn class_of(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK_SIZE);

    let exponent = size.next_power_of_two().trailing_zeros() as usize;
    exponent.saturating_sub(CLASS_SHIFT).min(CLASSES - 1)
}

/// The segregated free-list index. Holds only the table address; the lists
/// themselves are woven through the free blocks' payloads.
#[derive(Debug)]
pub(crate) struct FreeList {
    table: NonNull<u8>,
}

impl FreeList {
    /// Writes an empty index (all heads null) at `table`, which must point
    /// to [`INDEX_SIZE`] writable bytes.
    pub unsafe fn init(table: NonNull<u8>) -> Self {
        for class in 0..CLASSES {
            put_slot(header::offset(table, (class * DWORD) as isize), None);
        }

        Self { table }
    }

    unsafe fn head_slot(&self, class: usize) -> NonNull<u8> {
        debug_assert!(class < CLASSES);
        header::offset(self.table, (class * DWORD) as isize)
    }

    /// Prepends `bp` to the list of its class. No intra-class order is
    /// maintained.
    pub unsafe fn insert(&mut self, bp: NonNull<u8>) {
        debug_assert!(!header::is_allocated(bp));
        debug_assert!(header::block_size(bp) >= MIN_BLOCK_SIZE);

        let head = self.head_slot(class_of(header::block_size(bp)));
        put_slot(bp, get_slot(head));
        put_slot(head, Some(bp));
    }

    /// Splices `bp` out of the list of its class.
    pub unsafe fn remove(&mut self, bp: NonNull<u8>) {
        let mut slot = self.head_slot(class_of(header::block_size(bp)));

        loop {
            match get_slot(slot) {
                Some(cursor) if cursor == bp => {
                    put_slot(slot, get_slot(bp));
                    return;
                }
                Some(cursor) => slot = cursor,
                None => {
                    debug_assert!(false, "block missing from its class list");
                    return;
                }
            }
        }
    }

    /// First block that can hold `size` bytes: first-fit within the starting
    /// class, then ascending through the larger classes. Blocks in a higher
    /// class are large enough by construction, so the first hit wins.
    pub unsafe fn find_fit(&self, size: usize) -> Pointer<u8> {
        for class in class_of(size)..CLASSES {
            let mut cursor = get_slot(self.head_slot(class));

            while let Some(bp) = cursor {
                if header::block_size(bp) >= size {
                    return Some(bp);
                }
                cursor = get_slot(bp);
            }
        }

        None
    }

    /// Iterates the blocks currently listed under `class`.
    pub unsafe fn class_blocks(&self, class: usize) -> impl Iterator<Item = NonNull<u8>> {
        std::iter::successors(get_slot(self.head_slot(class)), |&bp| unsafe {
            get_slot(bp)
        })
    }
}

/// Reads the successor address stored at `slot` (a head cell or the first 8
/// payload bytes of a free block).
unsafe fn get_slot(slot: NonNull<u8>) -> Pointer<u8> {
    NonNull::new(slot.as_ptr().cast::<*mut u8>().read())
}

unsafe fn put_slot(slot: NonNull<u8>, next: Pointer<u8>) {
    let raw = next.map_or(std::ptr::null_mut(), NonNull::as_ptr);
    slot.as_ptr().cast::<*mut u8>().write(raw);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::write_block;

    #[test]
    fn class_selection() {
        for (size, class) in [
            (16, 0),
            (24, 0),
            (32, 0),
            (33, 1),
            (64, 1),
            (65, 2),
            (104, 2),
            (1504, 6),
            (2112, 7),
            (1 << 20, 15),
            (1 << 40, CLASSES - 1),
        ] {
            assert_eq!(class_of(size), class, "size {size}");
        }
    }

    /// Scratch memory shaped like the bottom of a real heap: the index table
    /// followed by room for hand-built blocks. Every pointer into it derives
    /// from one raw base so Miri's borrow tracking stays happy.
    #[repr(align(8))]
    struct Arena([u8; INDEX_SIZE + 512]);

    /// Carves a free block of `size` bytes at `at` bytes past the table.
    unsafe fn free_block(base: *mut u8, at: usize, size: usize) -> NonNull<u8> {
        assert_eq!(at % 8, 0);
        let bp = NonNull::new_unchecked(base.add(INDEX_SIZE + at + 8));
        write_block(bp, size, false);
        bp
    }

    #[test]
    fn insert_prepends_within_class() {
        let mut arena = Arena([0; INDEX_SIZE + 512]);
        let base = arena.0.as_mut_ptr();

        unsafe {
            let mut list = FreeList::init(NonNull::new_unchecked(base));

            let first = free_block(base, 0, 24);
            let second = free_block(base, 32, 24);

            list.insert(first);
            list.insert(second);

            let class: Vec<_> = list.class_blocks(0).collect();
            assert_eq!(class, [second, first]);
        }
    }

    #[test]
    fn remove_from_head_middle_and_tail() {
        let mut arena = Arena([0; INDEX_SIZE + 512]);
        let base = arena.0.as_mut_ptr();

        unsafe {
            let mut list = FreeList::init(NonNull::new_unchecked(base));

            let blocks = [
                free_block(base, 0, 24),
                free_block(base, 32, 24),
                free_block(base, 64, 24),
            ];
            for bp in blocks {
                list.insert(bp);
            }

            // List is [2, 1, 0]; remove the middle, then head, then tail.
            list.remove(blocks[1]);
            assert_eq!(
                list.class_blocks(0).collect::<Vec<_>>(),
                [blocks[2], blocks[0]]
            );

            list.remove(blocks[2]);
            assert_eq!(list.class_blocks(0).collect::<Vec<_>>(), [blocks[0]]);

            list.remove(blocks[0]);
            assert_eq!(list.class_blocks(0).count(), 0);
        }
    }

    #[test]
    fn find_fit_is_good_fit() {
        let mut arena = Arena([0; INDEX_SIZE + 512]);
        let base = arena.0.as_mut_ptr();

        unsafe {
            let mut list = FreeList::init(NonNull::new_unchecked(base));

            let small = free_block(base, 0, 24);
            let large = free_block(base, 32, 128);
            list.insert(large);
            list.insert(small);

            // A 24-byte request starts in class 0 and takes the first fit
            // there, even though a larger block exists.
            assert_eq!(list.find_fit(24), Some(small));

            // A 32-byte request also starts in class 0, but nothing in the
            // class is big enough, so the search climbs to the next class.
            assert_eq!(list.find_fit(32), Some(large));

            assert_eq!(list.find_fit(256), None);
        }
    }
}
