//! Block-level view over the heap region: header/footer addressing, physical
//! navigation, and the link fields of free blocks.
//!
//! A block is named by its payload offset `bp` (always 8-aligned). The
//! header is the word at `bp - 4`; a free block of more than minimum size
//! repeats that word as a footer at `bp + size - 8`. Which further fields
//! exist depends on the block's state and size:
//!
//! - any free block: 4-byte successor offset at `bp`
//! - free, size >= 16: 4-byte predecessor offset at `bp + 4`
//! - free, size > [`THRESHOLD`]: 8-byte left/right/parent link words at
//!   `bp + 8 / 16 / 24`, each holding a base-relative offset (0 = null)
//!
//! Callers pick accessors according to the header bits; nothing here checks
//! that a field exists for the block's current shape beyond debug asserts.

use super::region::HeapRegion;
use super::tag::{self, HDR, MIN_BLOCK, NIL, THRESHOLD};

impl HeapRegion {
    // ----------------------------------------------------------------
    // Boundary tags
    // ----------------------------------------------------------------

    pub(crate) fn header(&self, bp: u32) -> u32 {
        self.get32(bp - HDR)
    }

    pub(crate) fn put_header(&mut self, bp: u32, word: u32) {
        self.put32(bp - HDR, word);
    }

    pub(crate) fn block_size(&self, bp: u32) -> u32 {
        tag::size_of(self.header(bp))
    }

    pub(crate) fn footer(&self, bp: u32) -> u32 {
        self.get32(bp + self.block_size(bp) - 2 * HDR)
    }

    /// Write a complete boundary tag for the block at `bp`. The footer is
    /// written only when the block shape calls for one (free and above
    /// minimum size); allocated blocks use those bytes as payload.
    pub(crate) fn write_block(
        &mut self,
        bp: u32,
        size: u32,
        alloc: bool,
        prev_alloc: bool,
        prev_small: bool,
    ) {
        debug_assert!(bp.is_multiple_of(8), "payload offset {bp} misaligned");
        let word = tag::pack(size, alloc, prev_alloc, prev_small);
        self.put_header(bp, word);
        if !alloc && size > MIN_BLOCK {
            self.put32(bp + size - 2 * HDR, word);
        }
    }

    /// Write a fresh epilogue header at `bp` (zero-size, allocated).
    pub(crate) fn write_epilogue(&mut self, bp: u32, prev_alloc: bool, prev_small: bool) {
        self.put_header(bp, tag::pack(0, true, prev_alloc, prev_small));
    }

    /// Copy the block's allocation state and minimum-size flag into its
    /// physical successor's header. Must be called after every transition
    /// that changes either — splits, merges, frees, and heap growth alike —
    /// so the successor can always trust its own prev bits.
    pub(crate) fn sync_successor(&mut self, bp: u32) {
        let word = self.header(bp);
        let size = tag::size_of(word);
        let nbp = bp + size;
        let nh = self.header(nbp);
        // A free successor of a free block would have been coalesced away.
        debug_assert!(
            tag::is_alloc(nh) || tag::is_alloc(word),
            "adjacent free blocks at {bp} and {nbp}"
        );
        let nh = tag::with_prev_alloc(nh, tag::is_alloc(word));
        let nh = tag::with_prev_small(nh, size == MIN_BLOCK);
        self.put_header(nbp, nh);
    }

    // ----------------------------------------------------------------
    // Physical navigation
    // ----------------------------------------------------------------

    pub(crate) fn next_block(&self, bp: u32) -> u32 {
        bp + self.block_size(bp)
    }

    /// Payload offset of the physical predecessor. Only meaningful when the
    /// predecessor is free: a minimum-size predecessor is found by the
    /// header flag, any other by reading its footer.
    pub(crate) fn prev_block(&self, bp: u32) -> u32 {
        let word = self.header(bp);
        debug_assert!(!tag::prev_alloc_of(word), "predecessor of {bp} has no footer");
        if tag::prev_small_of(word) {
            bp - MIN_BLOCK
        } else {
            bp - tag::size_of(self.get32(bp - 2 * HDR))
        }
    }

    // ----------------------------------------------------------------
    // Free-list links (offsets from the heap base, 0 = null)
    // ----------------------------------------------------------------

    pub(crate) fn succ(&self, bp: u32) -> u32 {
        self.get32(bp)
    }

    pub(crate) fn set_succ(&mut self, bp: u32, to: u32) {
        self.put32(bp, to);
    }

    pub(crate) fn pred(&self, bp: u32) -> u32 {
        debug_assert!(self.block_size(bp) > MIN_BLOCK, "minimum block has no pred field");
        self.get32(bp + 4)
    }

    pub(crate) fn set_pred(&mut self, bp: u32, to: u32) {
        debug_assert!(self.block_size(bp) > MIN_BLOCK, "minimum block has no pred field");
        self.put32(bp + 4, to);
    }

    // ----------------------------------------------------------------
    // Tree links (size > THRESHOLD only)
    // ----------------------------------------------------------------

    pub(crate) fn left(&self, bp: u32) -> u32 {
        self.tree_link(bp, 8)
    }

    pub(crate) fn set_left(&mut self, bp: u32, to: u32) {
        self.set_tree_link(bp, 8, to);
    }

    pub(crate) fn right(&self, bp: u32) -> u32 {
        self.tree_link(bp, 16)
    }

    pub(crate) fn set_right(&mut self, bp: u32, to: u32) {
        self.set_tree_link(bp, 16, to);
    }

    pub(crate) fn parent(&self, bp: u32) -> u32 {
        self.tree_link(bp, 24)
    }

    pub(crate) fn set_parent(&mut self, bp: u32, to: u32) {
        self.set_tree_link(bp, 24, to);
    }

    fn tree_link(&self, bp: u32, field: u32) -> u32 {
        debug_assert!(self.block_size(bp) > THRESHOLD, "block {bp} has no tree links");
        let raw = self.get64(bp + field);
        debug_assert!(raw <= u64::from(u32::MAX));
        #[allow(clippy::cast_possible_truncation)]
        let off = raw as u32;
        off
    }

    fn set_tree_link(&mut self, bp: u32, field: u32, to: u32) {
        debug_assert!(self.block_size(bp) > THRESHOLD, "block {bp} has no tree links");
        self.put64(bp + field, u64::from(to));
    }

    /// Clear every intra-block field a tree-resident block can carry.
    pub(crate) fn clear_links(&mut self, bp: u32) {
        self.set_succ(bp, NIL);
        self.set_pred(bp, NIL);
        self.set_left(bp, NIL);
        self.set_right(bp, NIL);
        self.set_parent(bp, NIL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tag::{is_alloc, prev_alloc_of, prev_small_of, size_of};

    fn region_with(bytes: usize) -> HeapRegion {
        let mut region = HeapRegion::new(1 << 20).unwrap();
        region.sbrk(bytes).unwrap();
        region
    }

    #[test]
    fn test_header_footer_addressing() {
        let mut heap = region_with(256);
        heap.write_block(32, 48, false, true, false);
        assert_eq!(size_of(heap.header(32)), 48);
        assert!(!is_alloc(heap.header(32)));
        assert_eq!(heap.footer(32), heap.header(32));
        // Footer sits in the last 4 bytes of the block: [28, 76) -> word at 72.
        assert_eq!(heap.get32(72), heap.header(32));
    }

    #[test]
    fn test_allocated_block_has_no_footer() {
        let mut heap = region_with(256);
        // Pre-dirty the byte range, then write an allocated tag: the footer
        // slot must stay untouched (it belongs to the payload).
        heap.put32(72, 0xFFFF_FFFF);
        heap.write_block(32, 48, true, false, false);
        assert_eq!(heap.get32(72), 0xFFFF_FFFF);
    }

    #[test]
    fn test_minimum_free_block_has_no_footer() {
        let mut heap = region_with(256);
        heap.put32(32, 0xAAAA_5555);
        heap.write_block(32, 8, false, true, false);
        // Size 8 means header + successor field only; the word at bp is the
        // successor slot, not a footer, and write_block must not touch it.
        assert_eq!(heap.get32(32), 0xAAAA_5555);
    }

    #[test]
    fn test_next_and_prev_navigation() {
        let mut heap = region_with(512);
        heap.write_block(32, 64, false, true, false);
        heap.write_block(96, 48, false, false, false);
        assert_eq!(heap.next_block(32), 96);
        // Predecessor found through its footer.
        assert_eq!(heap.prev_block(96), 32);
    }

    #[test]
    fn test_prev_navigation_over_minimum_block() {
        let mut heap = region_with(512);
        // A minimum-size free block has no footer; its successor finds it
        // purely from the prev_small flag.
        heap.write_block(40, 8, false, true, false);
        heap.write_block(48, 32, false, false, true);
        assert_eq!(heap.prev_block(48), 40);
    }

    #[test]
    fn test_sync_successor_propagates_state() {
        let mut heap = region_with(512);
        heap.write_block(32, 8, true, true, false);
        heap.write_block(40, 48, true, false, false);
        heap.sync_successor(32);
        let nh = heap.header(40);
        assert!(prev_alloc_of(nh));
        assert!(prev_small_of(nh));
        assert_eq!(size_of(nh), 48);
        assert!(is_alloc(nh));
    }

    #[test]
    fn test_tree_links_roundtrip() {
        let mut heap = region_with(512);
        heap.write_block(32, 64, false, true, false);
        heap.clear_links(32);
        assert_eq!(heap.left(32), NIL);
        assert_eq!(heap.right(32), NIL);
        assert_eq!(heap.parent(32), NIL);
        heap.set_left(32, 104);
        heap.set_right(32, 208);
        heap.set_parent(32, 312);
        assert_eq!(heap.left(32), 104);
        assert_eq!(heap.right(32), 208);
        assert_eq!(heap.parent(32), 312);
    }

    #[test]
    fn test_list_links_roundtrip() {
        let mut heap = region_with(512);
        heap.write_block(32, 24, false, true, false);
        heap.set_succ(32, 96);
        heap.set_pred(32, 200);
        assert_eq!(heap.succ(32), 96);
        assert_eq!(heap.pred(32), 200);
    }
}
