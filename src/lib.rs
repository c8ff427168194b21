//! treebin: a general-purpose dynamic storage allocator over one contiguous,
//! upward-growing heap region.
//!
//! Free blocks are indexed two ways depending on size:
//! - exact-size bins (doubly-linked lists) for small blocks, and
//! - a binary search tree keyed by block size for large blocks, where each
//!   tree node is itself the head of a list of equally-sized blocks.
//!
//! Allocated blocks carry no footer; the bytes a footer would occupy are
//! payload. Coalescing still works in constant time because every header
//! records the allocation state (and minimum-size-ness) of its physical
//! predecessor.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("treebin supports only 64-bit targets.");

// public module: contains implementation details (hidden via pub(crate))
pub mod heap;

// allocator + configuration
pub use heap::alloc::{TreeBinAllocator, TreeBinConfig};

// diagnostics
pub use heap::check::{CheckError, CheckReport};
pub use heap::stats::HeapStats;

// errors
pub use heap::vm::VmError;
