#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! An external reference-count ledger: a side table that tracks ownership counts and shape
//! metadata for pointers whose memory is allocated elsewhere.
//!
//! This package provides [`Ledger`], which associates each tracked pointer with a [`RefRecord`]
//! holding its reference count, element size and element count. Nothing is stored inside the
//! tracked allocations themselves, so the ledger works with any block the caller can describe,
//! including ones allocated by foreign code.
//!
//! The ledger is meant for manual memory management that wants deterministic, explicit
//! reference counting without a tracing collector:
//!
//! - **Explicit counting**: increment when sharing a pointer, decrement when releasing it.
//! - **Clamped decrements**: releasing more references than exist stops at zero.
//! - **Batched reclamation**: a count reaching zero frees nothing. [`Ledger::sweep()`] frees
//!   every zero-count block in one pass when the caller is ready.
//! - **Merge on re-add**: registering an already-tracked pointer adds references instead of
//!   replacing its record.
//! - **Pluggable allocator**: the [`LedgerAllocator`] trait decides where blocks come from and
//!   go to. The default is the process C allocator ([`SystemAllocator`]).
//! - **Optional provenance**: the ledger can record the source location of each registration.
//! - **Isolated domains**: there is no global ledger. Create as many as you need.
//!
//! The ledger is not a garbage collector. It does not scan for roots and does not detect
//! cycles, so cyclic structures leak unless the caller breaks them.
//!
//! # Example
//!
//! ```rust
//! use ref_ledger::Ledger;
//!
//! let mut ledger = Ledger::new();
//!
//! // Allocate a block for four u64 values with one owner.
//! let ptr = ledger.allocate_and_track(8, 4, 1).unwrap();
//!
//! // Share it with a second owner.
//! ledger.increment(ptr.as_ptr());
//! assert_eq!(ledger.count(ptr.as_ptr()), 2);
//!
//! // Both owners release it.
//! ledger.decrement(ptr.as_ptr());
//! ledger.decrement(ptr.as_ptr());
//! assert_eq!(ledger.count(ptr.as_ptr()), 0);
//!
//! // The block is still tracked until we sweep.
//! assert!(ledger.contains(ptr.as_ptr()));
//! assert_eq!(ledger.sweep(), 1);
//! assert!(!ledger.contains(ptr.as_ptr()));
//! ```
//!
//! Tracking memory that was allocated elsewhere:
//!
//! ```rust
//! use ref_ledger::{Ledger, LedgerAllocator, SystemAllocator};
//!
//! let mut ledger = Ledger::new();
//!
//! let block = SystemAllocator.allocate(16, 1).unwrap();
//!
//! // SAFETY: The block came from the ledger's allocator, so the ledger may free it.
//! unsafe { ledger.track_existing_bytes(block.as_ptr(), 16, 1) }.unwrap();
//!
//! // Take it back without freeing it.
//! let block = ledger.untrack(block.as_ptr());
//! assert_eq!(ledger.count(block), 0);
//!
//! // SAFETY: We own the block again and free it exactly once.
//! unsafe { SystemAllocator.deallocate(std::ptr::NonNull::new(block).unwrap()) };
//! ```

mod allocator;
mod builder;
mod drop_policy;
mod error;
mod ledger;
mod ptr_map;
mod record;

pub use allocator::*;
pub use builder::*;
pub use drop_policy::*;
pub use error::Error;
pub use ledger::*;
pub(crate) use ptr_map::*;
pub use record::*;
