//! Whole-heap consistency checker.
//!
//! Walks every block in address order, then walks the free index, and
//! verifies that the two views agree: boundary tags intact, predecessor
//! bits propagated, no adjacent free blocks, every free block indexed in
//! exactly one place, list and tree links bidirectional, tree ordered.
//! A `FixedBitSet` keyed by payload offset carries free blocks from the
//! address walk into the index walk; a bit cleared twice is a duplicate
//! index entry, a bit never cleared is an unindexed free block.
//!
//! This is diagnostic machinery: it allocates freely (bitset, stacks) and
//! costs a full heap walk, so it is run on demand or behind
//! `check_each_op`, never on the allocation fast path.

use super::alloc::TreeBinAllocator;
use super::tag::{
    ALIGN, MIN_BLOCK, NIL, SMALL_BIN_COUNT, THRESHOLD, is_alloc, prev_alloc_of, prev_small_of,
    size_of,
};
use fixedbitset::FixedBitSet;
use std::fmt;

#[derive(Debug)]
pub enum CheckError {
    PrologueCorrupt { word: u32 },
    EpilogueCorrupt { bp: u32, word: u32 },
    MisalignedBlock { bp: u32 },
    BadBlockSize { bp: u32, size: u32 },
    BlockPastBreak { bp: u32, size: u32 },
    PrevBitsMismatch { bp: u32 },
    AdjacentFreeBlocks { bp: u32 },
    FooterMismatch { bp: u32, header: u32, footer: u32 },
    IndexEntryInvalid { bp: u32 },
    UnindexedFreeBlocks { count: usize },
    WrongBin { bp: u32, size: u32, bin: usize },
    ChainSizeMismatch { bp: u32, node_size: u32 },
    ListLinkBroken { bp: u32 },
    TreeLinkBroken { bp: u32 },
    TreeOrderViolation { bp: u32 },
    SmallBlockInTree { bp: u32, size: u32 },
    CounterSkew { counter: &'static str, walked: usize, recorded: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::PrologueCorrupt { word } => {
                write!(f, "prologue corrupt: header {word:#010x}")
            }
            CheckError::EpilogueCorrupt { bp, word } => {
                write!(f, "epilogue corrupt at offset {bp}: header {word:#010x}")
            }
            CheckError::MisalignedBlock { bp } => {
                write!(f, "block payload at offset {bp} is not 8-aligned")
            }
            CheckError::BadBlockSize { bp, size } => {
                write!(f, "block at offset {bp} has impossible size {size}")
            }
            CheckError::BlockPastBreak { bp, size } => {
                write!(f, "block at offset {bp} (size {size}) extends past the break")
            }
            CheckError::PrevBitsMismatch { bp } => write!(
                f,
                "block at offset {bp} disagrees with its predecessor's state"
            ),
            CheckError::AdjacentFreeBlocks { bp } => {
                write!(f, "block at offset {bp} and its predecessor are both free")
            }
            CheckError::FooterMismatch { bp, header, footer } => write!(
                f,
                "free block at offset {bp}: header {header:#010x} != footer {footer:#010x}"
            ),
            CheckError::IndexEntryInvalid { bp } => write!(
                f,
                "index names offset {bp}, which is not an unclaimed free block"
            ),
            CheckError::UnindexedFreeBlocks { count } => {
                write!(f, "{count} free block(s) missing from the index")
            }
            CheckError::WrongBin { bp, size, bin } => {
                write!(f, "block at offset {bp} (size {size}) is in bin {bin}")
            }
            CheckError::ChainSizeMismatch { bp, node_size } => write!(
                f,
                "block at offset {bp} chained under a tree node of size {node_size}"
            ),
            CheckError::ListLinkBroken { bp } => {
                write!(f, "free-list links around offset {bp} are inconsistent")
            }
            CheckError::TreeLinkBroken { bp } => {
                write!(f, "tree links around offset {bp} are inconsistent")
            }
            CheckError::TreeOrderViolation { bp } => {
                write!(f, "tree node at offset {bp} violates the size ordering")
            }
            CheckError::SmallBlockInTree { bp, size } => {
                write!(f, "block at offset {bp} (size {size}) is too small for the tree")
            }
            CheckError::CounterSkew { counter, walked, recorded } => write!(
                f,
                "counter `{counter}` records {recorded} but the walk found {walked}"
            ),
        }
    }
}

impl std::error::Error for CheckError {}

/// Summary of a successful consistency check.
#[derive(Debug, Clone, Copy)]
pub struct CheckReport {
    /// Real blocks between prologue and epilogue.
    pub blocks: usize,
    /// Free blocks found by the address walk (== index population).
    pub free_blocks: usize,
    /// Bytes in those free blocks.
    pub free_bytes: usize,
    /// Size of the largest free block.
    pub largest_free: u32,
}

impl TreeBinAllocator {
    /// Verify every structural invariant of the heap and the free index.
    ///
    /// # Errors
    ///
    /// Returns the first violation found. A violation is only reachable
    /// through memory corruption or an allocator bug; the heap should be
    /// considered unusable afterwards.
    pub fn check_heap(&self) -> Result<CheckReport, CheckError> {
        let heap = &self.heap;
        #[allow(clippy::cast_possible_truncation)]
        let brk = heap.size() as u32;

        // Prologue: minimum-size, allocated, header echoed by its footer.
        let pro = self.prologue;
        let pro_word = heap.header(pro);
        if size_of(pro_word) != MIN_BLOCK || !is_alloc(pro_word) || heap.footer(pro) != pro_word {
            return Err(CheckError::PrologueCorrupt { word: pro_word });
        }

        // ----------------------------------------------------------------
        // Address-order walk.
        // ----------------------------------------------------------------
        let mut free_set = FixedBitSet::with_capacity((brk / ALIGN) as usize + 1);
        let mut blocks = 0usize;
        let mut free_blocks = 0usize;
        let mut free_bytes = 0usize;
        let mut largest_free = 0u32;

        let mut bp = pro + MIN_BLOCK;
        let mut expect_prev_alloc = true;
        let mut expect_prev_small = true; // the prologue is a minimum block
        let mut prev_was_free = false;

        loop {
            if bp > brk {
                return Err(CheckError::BlockPastBreak { bp, size: 0 });
            }
            let word = heap.header(bp);
            let size = size_of(word);

            if size == 0 {
                // Epilogue: allocated, flush against the break, prev bits
                // mirroring the last real block.
                if !is_alloc(word) || bp != brk {
                    return Err(CheckError::EpilogueCorrupt { bp, word });
                }
                if prev_alloc_of(word) != expect_prev_alloc
                    || prev_small_of(word) != expect_prev_small
                {
                    return Err(CheckError::PrevBitsMismatch { bp });
                }
                break;
            }

            if !bp.is_multiple_of(ALIGN) {
                return Err(CheckError::MisalignedBlock { bp });
            }
            if size < MIN_BLOCK || !size.is_multiple_of(ALIGN) {
                return Err(CheckError::BadBlockSize { bp, size });
            }
            if bp + size > brk {
                return Err(CheckError::BlockPastBreak { bp, size });
            }
            if prev_alloc_of(word) != expect_prev_alloc
                || prev_small_of(word) != expect_prev_small
            {
                return Err(CheckError::PrevBitsMismatch { bp });
            }

            let alloc = is_alloc(word);
            if !alloc {
                if prev_was_free {
                    return Err(CheckError::AdjacentFreeBlocks { bp });
                }
                if size > MIN_BLOCK {
                    let footer = heap.footer(bp);
                    if footer != word {
                        return Err(CheckError::FooterMismatch {
                            bp,
                            header: word,
                            footer,
                        });
                    }
                }
                free_set.insert((bp / ALIGN) as usize);
                free_blocks += 1;
                free_bytes += size as usize;
                largest_free = largest_free.max(size);
            }

            blocks += 1;
            prev_was_free = !alloc;
            expect_prev_alloc = alloc;
            expect_prev_small = size == MIN_BLOCK;
            bp += size;
        }

        // ----------------------------------------------------------------
        // Index walk. Every entry must claim (and clear) exactly one bit
        // from the address walk; the visit counter bounds any cycle a
        // corrupted link could form.
        // ----------------------------------------------------------------
        let mut visited = 0usize;
        let claim = |set: &mut FixedBitSet, bp: u32| -> Result<(), CheckError> {
            let idx = (bp / ALIGN) as usize;
            if idx >= set.len() || !set.contains(idx) {
                return Err(CheckError::IndexEntryInvalid { bp });
            }
            set.set(idx, false);
            Ok(())
        };

        for bin in 0..SMALL_BIN_COUNT {
            let class = (bin as u32 + 1) * ALIGN;
            let mut prev = NIL;
            let mut cur = heap.bin_head(bin);
            while cur != NIL {
                visited += 1;
                if visited > free_blocks {
                    return Err(CheckError::ListLinkBroken { bp: cur });
                }
                claim(&mut free_set, cur)?;
                let size = heap.block_size(cur);
                if size != class {
                    return Err(CheckError::WrongBin { bp: cur, size, bin });
                }
                // The minimum-size bin has no predecessor links to verify.
                if class > MIN_BLOCK && heap.pred(cur) != prev {
                    return Err(CheckError::ListLinkBroken { bp: cur });
                }
                prev = cur;
                cur = heap.succ(cur);
            }
        }

        let root = heap.tree_root();
        if root != NIL && heap.parent(root) != NIL {
            return Err(CheckError::TreeLinkBroken { bp: root });
        }

        let mut stack = Vec::new();
        if root != NIL {
            stack.push(root);
        }
        while let Some(node) = stack.pop() {
            let node_size = heap.block_size(node);
            if node_size <= THRESHOLD {
                return Err(CheckError::SmallBlockInTree {
                    bp: node,
                    size: node_size,
                });
            }

            // The node's same-size chain. The head carries the tree links
            // and no predecessor; members carry neither child nor parent.
            let mut prev = NIL;
            let mut cur = node;
            while cur != NIL {
                visited += 1;
                if visited > free_blocks {
                    return Err(CheckError::ListLinkBroken { bp: cur });
                }
                claim(&mut free_set, cur)?;
                let size = heap.block_size(cur);
                if size != node_size {
                    return Err(CheckError::ChainSizeMismatch { bp: cur, node_size });
                }
                if heap.pred(cur) != prev {
                    return Err(CheckError::ListLinkBroken { bp: cur });
                }
                prev = cur;
                cur = heap.succ(cur);
            }

            for child in [heap.left(node), heap.right(node)] {
                if child != NIL {
                    if heap.parent(child) != node {
                        return Err(CheckError::TreeLinkBroken { bp: child });
                    }
                    stack.push(child);
                }
            }
        }

        if free_set.count_ones(..) > 0 {
            return Err(CheckError::UnindexedFreeBlocks {
                count: free_set.count_ones(..),
            });
        }

        // In-order traversal must yield strictly increasing sizes. The
        // structure is already known to be duplicate-free and bounded, but
        // keep a pop guard anyway.
        let mut stack = Vec::new();
        let mut cur = root;
        let mut last = 0u32;
        let mut pops = 0usize;
        while cur != NIL || !stack.is_empty() {
            while cur != NIL {
                stack.push(cur);
                cur = heap.left(cur);
            }
            let node = stack.pop().expect("stack non-empty by loop condition");
            pops += 1;
            if pops > free_blocks {
                return Err(CheckError::TreeLinkBroken { bp: node });
            }
            let size = heap.block_size(node);
            if size <= last {
                return Err(CheckError::TreeOrderViolation { bp: node });
            }
            last = size;
            cur = heap.right(node);
        }

        // The running gauges must agree with what the walk saw.
        if self.counters.free_blocks != free_blocks {
            return Err(CheckError::CounterSkew {
                counter: "free_blocks",
                walked: free_blocks,
                recorded: self.counters.free_blocks,
            });
        }
        if self.counters.free_bytes != free_bytes {
            return Err(CheckError::CounterSkew {
                counter: "free_bytes",
                walked: free_bytes,
                recorded: self.counters.free_bytes,
            });
        }

        Ok(CheckReport {
            blocks,
            free_blocks,
            free_bytes,
            largest_free,
        })
    }
}
