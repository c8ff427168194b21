//! Boundary-tag codec: pure bit arithmetic on the 4-byte header/footer word.
//!
//! Word layout (little-endian):
//! - `bits[31:3]` — block size in bytes (always a multiple of 8, so the low
//!   three bits are free for status)
//! - `bit 2` — the physical predecessor is a minimum-size block
//! - `bit 1` — the physical predecessor is allocated
//! - `bit 0` — this block is allocated
//!
//! The predecessor bits exist so allocated blocks need no footer: a block
//! only ever looks backwards when its predecessor is free, and a free
//! predecessor either has a footer (size above minimum) or is exactly
//! [`MIN_BLOCK`] bytes away (flagged by bit 2).

/// Payload alignment and size-class granularity.
pub(crate) const ALIGN: u32 = 8;

/// Header/footer word size.
pub(crate) const HDR: u32 = 4;

/// Smallest representable block: header + one 4-byte successor offset.
pub(crate) const MIN_BLOCK: u32 = 8;

/// Largest block size kept in the exact-size bins. Anything bigger carries
/// tree links (header + succ + pred + three 8-byte link words = 36 bytes,
/// so 40 is the smallest tree-resident size).
pub(crate) const THRESHOLD: u32 = 32;

/// Number of exact-size bins (8, 16, 24, 32).
pub(crate) const SMALL_BIN_COUNT: usize = (THRESHOLD / ALIGN) as usize;

/// Bin slots persisted at the bottom of the heap: the exact-size bins plus
/// one slot holding the tree root.
pub(crate) const BIN_COUNT: usize = SMALL_BIN_COUNT + 1;

/// Null link/offset sentinel. Offset 0 is the bin array itself and can never
/// name a block.
pub(crate) const NIL: u32 = 0;

const ALLOC_BIT: u32 = 0x1;
const PREV_ALLOC_BIT: u32 = 0x2;
const PREV_SMALL_BIT: u32 = 0x4;
const SIZE_MASK: u32 = !0x7;

/// Pack a block size and its three status bits into one tag word.
/// `size` must be a multiple of 8; zero is legal (the epilogue).
pub(crate) fn pack(size: u32, alloc: bool, prev_alloc: bool, prev_small: bool) -> u32 {
    debug_assert!(size & !SIZE_MASK == 0, "size {size} is not a multiple of 8");
    debug_assert!(size == 0 || size >= MIN_BLOCK);
    size | (u32::from(alloc) * ALLOC_BIT)
        | (u32::from(prev_alloc) * PREV_ALLOC_BIT)
        | (u32::from(prev_small) * PREV_SMALL_BIT)
}

pub(crate) fn size_of(word: u32) -> u32 {
    word & SIZE_MASK
}

pub(crate) fn is_alloc(word: u32) -> bool {
    word & ALLOC_BIT != 0
}

pub(crate) fn prev_alloc_of(word: u32) -> bool {
    word & PREV_ALLOC_BIT != 0
}

pub(crate) fn prev_small_of(word: u32) -> bool {
    word & PREV_SMALL_BIT != 0
}

pub(crate) fn with_prev_alloc(word: u32, prev_alloc: bool) -> u32 {
    if prev_alloc {
        word | PREV_ALLOC_BIT
    } else {
        word & !PREV_ALLOC_BIT
    }
}

pub(crate) fn with_prev_small(word: u32, prev_small: bool) -> u32 {
    if prev_small {
        word | PREV_SMALL_BIT
    } else {
        word & !PREV_SMALL_BIT
    }
}

/// Round `n` up to the next multiple of the payload alignment.
pub(crate) fn align_up(n: usize) -> usize {
    (n + (ALIGN as usize - 1)) & !(ALIGN as usize - 1)
}
