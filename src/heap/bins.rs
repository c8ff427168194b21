//! Exact-size bins for small free blocks.
//!
//! The bin array lives at the bottom of the heap itself: five 4-byte slots
//! holding head offsets (0 = empty). Slot `i` holds blocks of exactly
//! `(i + 1) * 8` bytes; the final slot belongs to the tree root (see
//! `tree.rs`). Insertion always prepends, so a bin hands back its most
//! recently freed block first.
//!
//! The size-8 bin is special: a minimum block has room for a successor
//! offset but not a predecessor, so that one list is singly linked and its
//! removal walks from the head.

use super::region::HeapRegion;
use super::tag::{ALIGN, MIN_BLOCK, NIL, SMALL_BIN_COUNT, THRESHOLD};

/// Bin slot index for a small block size.
pub(crate) fn bin_index(size: u32) -> usize {
    debug_assert!(size >= MIN_BLOCK && size <= THRESHOLD && size.is_multiple_of(ALIGN));
    (size / ALIGN - 1) as usize
}

impl HeapRegion {
    pub(crate) fn bin_head(&self, index: usize) -> u32 {
        debug_assert!(index < SMALL_BIN_COUNT);
        self.get32(index as u32 * 4)
    }

    pub(crate) fn set_bin_head(&mut self, index: usize, bp: u32) {
        debug_assert!(index < SMALL_BIN_COUNT);
        self.put32(index as u32 * 4, bp);
    }

    /// Prepend `bp` to its size class. O(1).
    pub(crate) fn bin_insert(&mut self, bp: u32, size: u32) {
        let index = bin_index(size);
        let head = self.bin_head(index);
        self.set_succ(bp, head);
        if size > MIN_BLOCK {
            self.set_pred(bp, NIL);
            if head != NIL {
                self.set_pred(head, bp);
            }
        }
        self.set_bin_head(index, bp);
    }

    /// Splice `bp` out of its size class. O(1) except for the singly linked
    /// minimum-size bin, which is walked from the head.
    pub(crate) fn bin_remove(&mut self, bp: u32, size: u32) {
        let index = bin_index(size);
        if size == MIN_BLOCK {
            let head = self.bin_head(index);
            if head == bp {
                let next = self.succ(bp);
                self.set_bin_head(index, next);
                return;
            }
            let mut cur = head;
            loop {
                let next = self.succ(cur);
                debug_assert!(next != NIL, "block {bp} missing from minimum-size bin");
                if next == bp {
                    self.set_succ(cur, self.succ(bp));
                    return;
                }
                cur = next;
            }
        }

        let pred = self.pred(bp);
        let succ = self.succ(bp);
        if pred == NIL {
            self.set_bin_head(index, succ);
        } else {
            self.set_succ(pred, succ);
        }
        if succ != NIL {
            self.set_pred(succ, pred);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Region with the bin slots zeroed and room for hand-built blocks.
    fn empty_bins() -> HeapRegion {
        let mut heap = HeapRegion::new(1 << 20).unwrap();
        heap.sbrk(4096).unwrap();
        for i in 0..SMALL_BIN_COUNT {
            heap.set_bin_head(i, NIL);
        }
        heap
    }

    fn free_block(heap: &mut HeapRegion, bp: u32, size: u32) {
        heap.write_block(bp, size, false, true, false);
    }

    #[test]
    fn test_bin_index_classes() {
        assert_eq!(bin_index(8), 0);
        assert_eq!(bin_index(16), 1);
        assert_eq!(bin_index(24), 2);
        assert_eq!(bin_index(32), 3);
    }

    #[test]
    fn test_insert_prepends() {
        let mut heap = empty_bins();
        free_block(&mut heap, 64, 24);
        free_block(&mut heap, 128, 24);

        heap.bin_insert(64, 24);
        heap.bin_insert(128, 24);

        // Most recently inserted block is the head.
        assert_eq!(heap.bin_head(bin_index(24)), 128);
        assert_eq!(heap.succ(128), 64);
        assert_eq!(heap.pred(64), 128);
        assert_eq!(heap.pred(128), NIL);
        assert_eq!(heap.succ(64), NIL);
    }

    #[test]
    fn test_remove_head_middle_tail() {
        let mut heap = empty_bins();
        for bp in [64u32, 128, 192] {
            free_block(&mut heap, bp, 16);
            heap.bin_insert(bp, 16);
        }
        // List is 192 -> 128 -> 64.

        // Middle
        heap.bin_remove(128, 16);
        assert_eq!(heap.bin_head(bin_index(16)), 192);
        assert_eq!(heap.succ(192), 64);
        assert_eq!(heap.pred(64), 192);

        // Head
        heap.bin_remove(192, 16);
        assert_eq!(heap.bin_head(bin_index(16)), 64);
        assert_eq!(heap.pred(64), NIL);

        // Last survivor
        heap.bin_remove(64, 16);
        assert_eq!(heap.bin_head(bin_index(16)), NIL);
    }

    #[test]
    fn test_minimum_bin_is_singly_linked() {
        let mut heap = empty_bins();
        for bp in [64u32, 96, 160] {
            free_block(&mut heap, bp, 8);
            heap.bin_insert(bp, 8);
        }
        // List is 160 -> 96 -> 64, linked through successor offsets only.
        assert_eq!(heap.bin_head(0), 160);
        assert_eq!(heap.succ(160), 96);
        assert_eq!(heap.succ(96), 64);
        assert_eq!(heap.succ(64), NIL);

        // Removing from the middle walks the chain.
        heap.bin_remove(96, 8);
        assert_eq!(heap.succ(160), 64);

        heap.bin_remove(64, 8);
        assert_eq!(heap.succ(160), NIL);

        heap.bin_remove(160, 8);
        assert_eq!(heap.bin_head(0), NIL);
    }

    #[test]
    fn test_bins_are_independent() {
        let mut heap = empty_bins();
        free_block(&mut heap, 64, 16);
        free_block(&mut heap, 128, 32);
        heap.bin_insert(64, 16);
        heap.bin_insert(128, 32);

        assert_eq!(heap.bin_head(bin_index(16)), 64);
        assert_eq!(heap.bin_head(bin_index(32)), 128);
        assert_eq!(heap.bin_head(bin_index(24)), NIL);

        heap.bin_remove(64, 16);
        assert_eq!(heap.bin_head(bin_index(16)), NIL);
        assert_eq!(heap.bin_head(bin_index(32)), 128);
    }
}
