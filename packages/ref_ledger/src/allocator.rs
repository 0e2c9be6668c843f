use std::ffi::c_void;
use std::ptr::NonNull;

/// The memory source a [`Ledger`][crate::Ledger] uses when it allocates or frees on the caller's
/// behalf.
///
/// The ledger calls [`allocate()`](Self::allocate) from
/// [`allocate_and_track()`][crate::Ledger::allocate_and_track] and
/// [`duplicate()`][crate::Ledger::duplicate], and [`deallocate()`](Self::deallocate) from
/// [`sweep()`][crate::Ledger::sweep] and the forced-free operations. Deallocation receives only
/// the pointer, matching the C `free()` contract, because blocks registered via
/// [`track_existing()`][crate::Ledger::track_existing] may not have a meaningful Rust
/// [`Layout`][std::alloc::Layout].
///
/// The allocator receives `&self` and has no access to the ledger, so deallocation can never
/// re-enter the ledger mid-sweep.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::ptr::NonNull;
///
/// use ref_ledger::{Ledger, LedgerAllocator, SystemAllocator};
///
/// /// Counts frees, delegating the real work to the system allocator.
/// #[derive(Debug, Default)]
/// struct CountingAllocator {
///     frees: Cell<usize>,
/// }
///
/// // SAFETY: We forward to SystemAllocator, which upholds the trait contract.
/// unsafe impl LedgerAllocator for CountingAllocator {
///     fn allocate(&self, element_size: usize, element_count: usize) -> Option<NonNull<u8>> {
///         SystemAllocator.allocate(element_size, element_count)
///     }
///
///     unsafe fn deallocate(&self, ptr: NonNull<u8>) {
///         self.frees.set(self.frees.get() + 1);
///
///         // SAFETY: Forwarding the caller's guarantee.
///         unsafe { SystemAllocator.deallocate(ptr) }
///     }
/// }
///
/// let mut ledger = Ledger::builder()
///     .allocator(CountingAllocator::default())
///     .build();
///
/// ledger.allocate_and_track(4, 4, 0).unwrap();
/// assert_eq!(ledger.sweep(), 1);
/// assert_eq!(ledger.allocator().frees.get(), 1);
/// ```
///
/// # Safety
///
/// Implementations must return either `None` or a pointer to a fresh block that is valid for
/// reads and writes of at least `element_size * element_count` bytes and does not overlap any
/// other live block. [`deallocate()`](Self::deallocate) must accept every pointer previously
/// returned by [`allocate()`](Self::allocate) on the same instance.
pub unsafe trait LedgerAllocator {
    /// Allocates a block large enough for `element_count` elements of `element_size` bytes.
    ///
    /// Returns `None` if memory is unavailable or the requested size overflows `usize`.
    fn allocate(&self, element_size: usize, element_count: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate()`](Self::allocate) on this allocator (or
    /// otherwise be acceptable to it, as documented by the implementation) and must not have
    /// been deallocated already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>);
}

/// The process C allocator, reached through `malloc()` and `free()`.
///
/// This is the default allocator of a [`Ledger`][crate::Ledger]. Because it deallocates with
/// `free()`, it accepts any pointer obtained from the C allocator, including ones the caller
/// allocated outside the ledger and later registered via
/// [`track_existing()`][crate::Ledger::track_existing].
///
/// Zero-byte requests are rounded up to one byte so that every successful allocation yields a
/// unique non-null address, which the ledger needs as a key.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SystemAllocator;

// SAFETY: malloc() returns fresh, non-overlapping blocks of at least the requested size and
// free() accepts every pointer malloc() returned.
unsafe impl LedgerAllocator for SystemAllocator {
    fn allocate(&self, element_size: usize, element_count: usize) -> Option<NonNull<u8>> {
        let size = element_size.checked_mul(element_count)?.max(1);

        // SAFETY: malloc() has no preconditions; a null result is handled below.
        let ptr = unsafe { libc::malloc(size) };

        NonNull::new(ptr.cast::<u8>())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // SAFETY: Forwarding the caller's guarantee that `ptr` came from malloc() and is live.
        unsafe {
            libc::free(ptr.as_ptr().cast::<c_void>());
        }
    }
}
