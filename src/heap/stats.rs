//! Diagnostic counters.
//!
//! Maintained inline by the allocator (which is single-threaded by
//! contract, so these are plain fields, not atomics). Gauge decrements
//! saturate instead of panicking so a bookkeeping bug shows up as a skewed
//! number rather than an abort; the consistency checker cross-validates the
//! free-side gauges against an actual heap walk.

/// Running totals owned by the allocator.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub live_blocks: usize,
    pub live_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocations: u64,
    pub releases: u64,
    pub resizes: u64,
    pub heap_extensions: u64,
}

impl Counters {
    pub fn gauge_sub(gauge: &mut usize, val: usize) {
        *gauge = gauge.saturating_sub(val);
    }
}

/// Point-in-time snapshot of allocator state, for diagnostic display.
/// Individual fields are exact at the instant of the call; this is not an
/// input to allocation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Address space reserved for the heap.
    pub reserved: usize,
    /// Current break: bytes of the reservation in use.
    pub heap_size: usize,
    /// Allocated blocks currently outstanding.
    pub live_blocks: usize,
    /// Bytes in allocated blocks (headers included).
    pub live_bytes: usize,
    /// Free blocks currently indexed.
    pub free_blocks: usize,
    /// Bytes in free blocks (headers and footers included).
    pub free_bytes: usize,
    /// Cumulative successful allocations.
    pub allocations: u64,
    /// Cumulative releases (invalid releases are not counted).
    pub releases: u64,
    /// Cumulative resize requests that passed validation.
    pub resizes: u64,
    /// Cumulative heap extensions.
    pub heap_extensions: u64,
}
