use super::bins::bin_index;
use super::region::HeapRegion;
use super::stats::{Counters, HeapStats};
use super::tag::{
    self, ALIGN, BIN_COUNT, HDR, MIN_BLOCK, NIL, THRESHOLD, align_up, is_alloc, prev_alloc_of,
    prev_small_of, size_of,
};
use super::vm::VmError;
use std::ptr::NonNull;

/// Largest serviceable request. The header stores sizes in 29 effective
/// bits, and anything bigger is out of contract anyway.
pub(crate) const MAX_REQUEST: usize = 1 << 30;

/// Configuration for [`TreeBinAllocator`]. All fields have sensible
/// defaults. Set at init time via `TreeBinAllocator::with_config()`.
#[derive(Clone, Debug)]
pub struct TreeBinConfig {
    /// Address space reserved for the heap. The heap can never grow past
    /// this. Default: 256 MB.
    pub reserve_limit: usize,

    /// Minimum heap extension. Requests larger than this extend by exactly
    /// their own (adjusted) size. Default: 64 bytes.
    pub chunk_size: usize,

    /// Run the full consistency check at the entry of every public
    /// operation, panicking on the first violation. Expensive; meant for
    /// debugging and tests. Default: false.
    pub check_each_op: bool,
}

impl Default for TreeBinConfig {
    fn default() -> Self {
        Self {
            reserve_limit: 256 * 1024 * 1024,
            chunk_size: 1 << 6,
            check_each_op: false,
        }
    }
}

/// A dynamic storage allocator over one contiguous, upward-growing heap.
///
/// Free blocks are found by size through a two-part index persisted inside
/// the heap itself: exact-size bins for small blocks and a size-keyed BST
/// of same-size lists for everything else. Allocated blocks carry no
/// footer, so the per-allocation overhead is one 4-byte header.
///
/// Single-threaded by contract: operations take `&mut self`, there is no
/// locking, and none is permitted inside. Wrap the value externally if
/// cross-thread use is required.
pub struct TreeBinAllocator {
    pub(crate) heap: HeapRegion,
    pub(crate) counters: Counters,
    /// Payload offset of the prologue sentinel; the first real block starts
    /// one minimum block later.
    pub(crate) prologue: u32,
    config: TreeBinConfig,
}

impl TreeBinAllocator {
    /// Create an allocator with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the reservation or the initial heap extension
    /// fails.
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(TreeBinConfig::default())
    }

    /// Create an allocator with an explicit configuration.
    ///
    /// Lays out the bottom of the heap: the bin array, alignment padding,
    /// the allocated prologue sentinel, and the zero-size epilogue header,
    /// then grows the heap by one chunk so the first request finds a block.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the reservation or the initial extension fails.
    pub fn with_config(config: TreeBinConfig) -> Result<Self, VmError> {
        let mut config = config;
        config.chunk_size = config.chunk_size.max(MIN_BLOCK as usize);

        let mut heap = HeapRegion::new(config.reserve_limit)?;

        // Pad so the prologue payload (and every payload after it) lands
        // 8-aligned: headers sit at offsets = 4 (mod 8).
        let bin_bytes = (BIN_COUNT as u32) * 4;
        let pad = (HDR + ALIGN - bin_bytes % ALIGN) % ALIGN;
        let pro_hdr = bin_bytes + pad;
        let prologue = pro_hdr + HDR;

        heap.sbrk((prologue + MIN_BLOCK) as usize)?;
        for i in 0..BIN_COUNT {
            heap.put32(i as u32 * 4, NIL);
        }

        let word = tag::pack(MIN_BLOCK, true, true, false);
        heap.put32(pro_hdr, word);
        heap.put32(pro_hdr + HDR, word);
        // The epilogue's predecessor is the prologue: allocated, minimum size.
        heap.write_epilogue(prologue + MIN_BLOCK, true, true);

        let mut alloc = Self {
            heap,
            counters: Counters::default(),
            prologue,
            config,
        };
        alloc.extend_heap(alloc.config.chunk_size)?;
        Ok(alloc)
    }

    /// Allocate `size` bytes and return the 8-aligned payload pointer.
    /// Returns `None` for zero-size or oversized requests and on heap
    /// exhaustion; the heap is unchanged in every failure case.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.maybe_verify();
        if size == 0 || size > MAX_REQUEST {
            return None;
        }
        let asize = Self::adjusted(size);
        let mut bp = self.find_fit(asize);
        if bp == NIL {
            let grow = (asize as usize).max(self.config.chunk_size);
            bp = self.extend_heap(grow).ok()?;
        }
        self.place(bp, asize);
        self.counters.allocations += 1;
        self.counters.live_blocks += 1;
        self.counters.live_bytes += self.heap.block_size(bp) as usize;
        Some(self.heap.ptr_at(bp))
    }

    /// Return the block at `ptr` to the free index, merging with free
    /// neighbors. Null, out-of-heap, and misaligned pointers are ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, point outside the heap, or be a payload pointer
    /// previously returned by this allocator and not released since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        self.maybe_verify();
        let Some(bp) = self.payload_offset(ptr) else {
            return;
        };
        let word = self.heap.header(bp);
        debug_assert!(is_alloc(word), "double release of block {bp}");
        let size = size_of(word);

        self.counters.releases += 1;
        Counters::gauge_sub(&mut self.counters.live_blocks, 1);
        Counters::gauge_sub(&mut self.counters.live_bytes, size as usize);

        self.heap
            .write_block(bp, size, false, prev_alloc_of(word), prev_small_of(word));
        let bp = self.coalesce(bp);
        self.heap.sync_successor(bp);
        self.index_insert(bp);
    }

    /// Grow or shrink the block at `ptr` to hold `size` bytes.
    ///
    /// Shrinking (or matching) requests return `ptr` unchanged. Growth
    /// absorbs a free physical successor when that suffices; otherwise the
    /// payload moves to a fresh allocation and the old block is released.
    /// On failure the original block is untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`release`](Self::release) for `ptr`.
    pub unsafe fn resize(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            // Safety: forwarded caller contract.
            unsafe { self.release(ptr) };
            return None;
        }
        if ptr.is_null() {
            return self.allocate(size);
        }
        self.maybe_verify();
        let bp = self.payload_offset(ptr)?;
        if size > MAX_REQUEST {
            return None;
        }
        self.counters.resizes += 1;

        let asize = Self::adjusted(size);
        let old_size = self.heap.block_size(bp);
        if asize <= old_size {
            return Some(self.heap.ptr_at(bp));
        }

        let nbp = self.heap.next_block(bp);
        let next_word = self.heap.header(nbp);
        if !is_alloc(next_word) {
            let merged = old_size + size_of(next_word);
            if merged >= asize {
                self.index_remove(nbp);
                let word = self.heap.header(bp);
                self.heap
                    .write_block(bp, merged, true, prev_alloc_of(word), prev_small_of(word));
                self.place(bp, asize);
                let new_size = self.heap.block_size(bp) as usize;
                self.counters.live_bytes += new_size - (old_size as usize);
                return Some(self.heap.ptr_at(bp));
            }
        }

        // Move: allocate first so failure leaves the original intact.
        let new_ptr = self.allocate(size)?;
        let src = self.heap.ptr_at(bp);
        // Safety: distinct blocks; the old payload (old_size - 4 bytes) fits
        // in the strictly larger new block.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr().cast_const(),
                new_ptr.as_ptr(),
                (old_size - HDR) as usize,
            );
        }
        // Safety: src is a live payload pointer of this allocator.
        unsafe { self.release(src.as_ptr()) };
        Some(new_ptr)
    }

    /// Allocate zero-filled space for `count` elements of `size` bytes.
    /// Overflow of `count * size` returns `None`.
    pub fn zeroed_allocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.allocate(bytes)?;
        // Safety: `bytes` payload bytes were just allocated at `ptr`.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Some(ptr)
    }

    /// Point-in-time counter snapshot.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            reserved: self.heap.reserved(),
            heap_size: self.heap.size(),
            live_blocks: self.counters.live_blocks,
            live_bytes: self.counters.live_bytes,
            free_blocks: self.counters.free_blocks,
            free_bytes: self.counters.free_bytes,
            allocations: self.counters.allocations,
            releases: self.counters.releases,
            resizes: self.counters.resizes,
            heap_extensions: self.counters.heap_extensions,
        }
    }

    // ----------------------------------------------------------------
    // Sizing and pointer validation
    // ----------------------------------------------------------------

    /// Request size -> block size: header overhead, 8-byte alignment,
    /// minimum block floor.
    fn adjusted(n: usize) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let asize = align_up(n + HDR as usize).max(MIN_BLOCK as usize) as u32;
        asize
    }

    /// Offset of a caller-supplied payload pointer, or `None` when it is
    /// null, outside the block area, or misaligned (those are ignored by
    /// contract).
    fn payload_offset(&self, ptr: *const u8) -> Option<u32> {
        if ptr.is_null() {
            return None;
        }
        let addr = ptr as usize;
        let base = self.heap.low() as usize;
        let first = base + (self.prologue + MIN_BLOCK) as usize;
        if addr < first || addr >= base + self.heap.size() {
            return None;
        }
        if !(addr - base).is_multiple_of(ALIGN as usize) {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        let off = (addr - base) as u32;
        Some(off)
    }

    // ----------------------------------------------------------------
    // Free index dispatch
    // ----------------------------------------------------------------

    fn index_insert(&mut self, bp: u32) {
        let size = self.heap.block_size(bp);
        if size <= THRESHOLD {
            self.heap.bin_insert(bp, size);
        } else {
            self.heap.tree_insert(bp);
        }
        self.counters.free_blocks += 1;
        self.counters.free_bytes += size as usize;
    }

    fn index_remove(&mut self, bp: u32) {
        let size = self.heap.block_size(bp);
        if size <= THRESHOLD {
            self.heap.bin_remove(bp, size);
        } else {
            self.heap.tree_remove(bp);
        }
        Counters::gauge_sub(&mut self.counters.free_blocks, 1);
        Counters::gauge_sub(&mut self.counters.free_bytes, size as usize);
    }

    /// Smallest indexed block that can hold `asize` bytes: the exact bin
    /// for small requests, the tree's best fit otherwise. NIL on a miss.
    fn find_fit(&self, asize: u32) -> u32 {
        if asize <= THRESHOLD {
            let head = self.heap.bin_head(bin_index(asize));
            if head != NIL {
                return head;
            }
        }
        self.heap.tree_best_fit(asize)
    }

    // ----------------------------------------------------------------
    // Placement and coalescing
    // ----------------------------------------------------------------

    /// Carve an allocated block of `asize` bytes out of the block at `bp`.
    /// A remainder of at least one minimum block is split off and
    /// reindexed; anything smaller stays with the allocation.
    ///
    /// `bp` is normally a free block fresh from the index; the in-place
    /// resize path hands in an already-allocated merged block, which must
    /// not be removed from the index again.
    fn place(&mut self, bp: u32, asize: u32) {
        let word = self.heap.header(bp);
        let fsize = size_of(word);
        debug_assert!(fsize >= asize);
        let prev_alloc = prev_alloc_of(word);
        let prev_small = prev_small_of(word);

        if !is_alloc(word) {
            self.index_remove(bp);
        }

        let rem = fsize - asize;
        if rem >= MIN_BLOCK {
            self.heap.write_block(bp, asize, true, prev_alloc, prev_small);
            let rbp = bp + asize;
            self.heap
                .write_block(rbp, rem, false, true, asize == MIN_BLOCK);
            self.heap.sync_successor(rbp);
            self.index_insert(rbp);
        } else {
            self.heap.write_block(bp, fsize, true, prev_alloc, prev_small);
            self.heap.sync_successor(bp);
        }
    }

    /// Merge the free block at `bp` with whichever physical neighbors are
    /// free, removing the absorbed neighbors from the index. Returns the
    /// payload offset of the merged block, which the caller still has to
    /// sync and index.
    fn coalesce(&mut self, bp: u32) -> u32 {
        let word = self.heap.header(bp);
        debug_assert!(!is_alloc(word));

        let prev_free = !prev_alloc_of(word);
        let nbp = self.heap.next_block(bp);
        let next_free = !is_alloc(self.heap.header(nbp));

        if !prev_free && !next_free {
            return bp;
        }

        let mut bp = bp;
        let mut size = size_of(word);
        if next_free {
            self.index_remove(nbp);
            size += self.heap.block_size(nbp);
        }
        if prev_free {
            let pbp = self.heap.prev_block(bp);
            self.index_remove(pbp);
            size += self.heap.block_size(pbp);
            bp = pbp;
        }

        let start = self.heap.header(bp);
        self.heap
            .write_block(bp, size, false, prev_alloc_of(start), prev_small_of(start));
        bp
    }

    /// Grow the heap by at least `bytes` (8-aligned) and hand back the
    /// resulting free block, already coalesced against the old tail and
    /// indexed. The old epilogue header becomes the new block's header and
    /// a fresh epilogue is written at the new end.
    fn extend_heap(&mut self, bytes: usize) -> Result<u32, VmError> {
        let size = align_up(bytes);
        let bp = self.heap.sbrk(size)?;
        #[allow(clippy::cast_possible_truncation)]
        let size = size as u32;

        let old_epilogue = self.heap.header(bp);
        self.heap.write_block(
            bp,
            size,
            false,
            prev_alloc_of(old_epilogue),
            prev_small_of(old_epilogue),
        );
        self.heap
            .write_epilogue(bp + size, false, size == MIN_BLOCK);

        let bp = self.coalesce(bp);
        self.heap.sync_successor(bp);
        self.index_insert(bp);
        self.counters.heap_extensions += 1;
        Ok(bp)
    }

    fn maybe_verify(&self) {
        if self.config.check_each_op
            && let Err(e) = self.check_heap()
        {
            panic!("heap consistency violated: {e}");
        }
    }
}
