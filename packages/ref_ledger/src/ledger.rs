use std::panic::Location;
use std::ptr::{self, NonNull};
use std::thread;

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::{
    DropPolicy, Error, InsertOutcome, LedgerAllocator, LedgerBuilder, PtrMap, RefRecord,
    SystemAllocator,
};

/// A side table that tracks reference counts and shape metadata for pointers whose memory
/// lives elsewhere.
///
/// The ledger never embeds bookkeeping into the blocks it tracks. Instead, it keeps one
/// [`RefRecord`] per tracked pointer, keyed by address. The caller treats the ledger as the
/// single source of truth for "how many owners does this pointer have" and drives the counts
/// explicitly: increment when sharing, decrement when releasing.
///
/// Reaching a count of zero never frees anything by itself. Reclamation is a separate, batched
/// step performed by [`sweep()`](Self::sweep), which frees every zero-count block at once. This
/// lets a caller finish mutating a larger reference graph before any memory goes away.
///
/// # Tracked and untracked pointers
///
/// A pointer is tracked if and only if the ledger holds a record for it. Untracked pointers are
/// transparent to queries ([`count()`](Self::count) returns 0) and inert to mutation (the
/// refcount operations return `None` and change nothing). The null pointer is never tracked.
///
/// Use [`contains()`](Self::contains) when you need to tell "never tracked" apart from
/// "tracked with zero references".
///
/// # Memory ownership
///
/// Blocks obtained from [`allocate_and_track()`](Self::allocate_and_track) come from the
/// ledger's [`LedgerAllocator`]. Blocks registered via
/// [`track_existing()`](Self::track_existing) must be acceptable to that same allocator,
/// because [`sweep()`](Self::sweep) will eventually free them through it. Use
/// [`untrack()`](Self::untrack) to take a block back out of the ledger without freeing it.
///
/// Cyclic structures are not detected. A cycle keeps every member's count above zero and leaks
/// unless the caller breaks it.
///
/// # Examples
///
/// ```rust
/// use ref_ledger::Ledger;
///
/// let mut ledger = Ledger::new();
///
/// // Allocate room for four u64 values, with one initial owner.
/// let ptr = ledger.allocate_and_track(8, 4, 1).unwrap();
/// assert_eq!(ledger.count(ptr.as_ptr()), 1);
///
/// // Two more owners come along.
/// ledger.increment(ptr.as_ptr());
/// ledger.increment(ptr.as_ptr());
/// assert_eq!(ledger.count(ptr.as_ptr()), 3);
///
/// // Releasing more references than exist clamps at zero.
/// ledger.decrement_by(ptr.as_ptr(), 5);
/// assert_eq!(ledger.count(ptr.as_ptr()), 0);
/// assert!(ledger.contains(ptr.as_ptr()));
///
/// // Nothing was freed yet. The sweep reclaims the block.
/// assert_eq!(ledger.sweep(), 1);
/// assert!(!ledger.contains(ptr.as_ptr()));
/// ```
///
/// # Thread safety
///
/// The ledger is thread-mobile ([`Send`], if its allocator is) but it is not thread-safe
/// ([`Sync`]). All mutation goes through `&mut self`, so sharing a ledger between threads
/// requires external synchronization such as a `Mutex`.
#[derive(Debug)]
pub struct Ledger<A = SystemAllocator>
where
    A: LedgerAllocator,
{
    records: PtrMap,
    allocator: A,
    capture_provenance: bool,
    drop_policy: DropPolicy,
}

impl Ledger<SystemAllocator> {
    /// Creates a ledger with the default configuration.
    ///
    /// See [`builder()`](Self::builder) for the available options.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let ledger = Ledger::new();
    ///
    /// assert!(ledger.is_empty());
    /// ```
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring and constructing a [`Ledger`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::{DropPolicy, Ledger, SystemAllocator};
    ///
    /// let ledger = Ledger::builder()
    ///     .allocator(SystemAllocator)
    ///     .capture_provenance(true)
    ///     .drop_policy(DropPolicy::FreeTracked)
    ///     .build();
    /// ```
    #[inline]
    pub fn builder() -> LedgerBuilder<SystemAllocator> {
        LedgerBuilder::new()
    }
}

impl Default for Ledger<SystemAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Ledger<A>
where
    A: LedgerAllocator,
{
    #[must_use]
    pub(crate) fn new_inner(allocator: A, capture_provenance: bool, drop_policy: DropPolicy) -> Self {
        Self {
            records: PtrMap::new(),
            allocator,
            capture_provenance,
            drop_policy,
        }
    }

    /// The allocator this ledger allocates and frees through.
    #[must_use]
    #[inline]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Whether registering operations record their caller's source location.
    #[must_use]
    #[inline]
    pub fn captures_provenance(&self) -> bool {
        self.capture_provenance
    }

    /// What the ledger does with still-tracked blocks when it is dropped.
    #[must_use]
    #[inline]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// The number of tracked pointers, including those with a reference count of zero.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::new();
    /// assert_eq!(ledger.len(), 0);
    ///
    /// ledger.allocate_and_track(4, 1, 0).unwrap();
    /// assert_eq!(ledger.len(), 1);
    ///
    /// ledger.sweep();
    /// assert_eq!(ledger.len(), 0);
    /// ```
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ledger tracks no pointers at all.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over every tracked pointer and its record.
    ///
    /// The iteration order is unspecified and changes when pointers are removed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::new();
    /// ledger.allocate_and_track(8, 2, 1).unwrap();
    /// ledger.allocate_and_track(4, 4, 1).unwrap();
    ///
    /// let total_bytes: usize = ledger.iter().map(|(_, record)| record.byte_len()).sum();
    /// assert_eq!(total_bytes, 32);
    /// ```
    pub fn iter(&self) -> impl Iterator<Item = (NonNull<u8>, &RefRecord)> {
        self.records.iter()
    }

    /// Whether `ptr` is tracked by this ledger.
    ///
    /// This is the presence-aware counterpart of [`count()`](Self::count): a tracked pointer
    /// with zero references is still tracked until the next [`sweep()`](Self::sweep).
    #[must_use]
    #[inline]
    pub fn contains<T>(&self, ptr: *const T) -> bool {
        self.records.contains(ptr.addr())
    }

    /// Allocates a block of `element_count` elements of `element_size` bytes each and starts
    /// tracking it with `initial_refs` references.
    ///
    /// Returns `None` if the allocator cannot satisfy the request, in which case nothing is
    /// registered. This is the only registering operation that allocates.
    ///
    /// The contents of the new block are uninitialized.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let ptr = ledger.allocate_and_track(8, 4, 1).unwrap();
    ///
    /// // SAFETY: The block holds four u64 values and we initialize all of them.
    /// unsafe {
    ///     let values = ptr.cast::<u64>();
    ///     for i in 0..4 {
    ///         values.add(i).write(i as u64);
    ///     }
    /// }
    ///
    /// assert_eq!(ledger.count(ptr.as_ptr()), 1);
    /// ```
    #[track_caller]
    pub fn allocate_and_track(
        &mut self,
        element_size: usize,
        element_count: usize,
        initial_refs: usize,
    ) -> Option<NonNull<u8>> {
        let Some(ptr) = self.allocator.allocate(element_size, element_count) else {
            trace!(element_size, element_count, "allocation for tracked block failed");
            return None;
        };

        Some(self.register(ptr, element_size, element_count, initial_refs))
    }

    /// Allocates a single block of `size` bytes and starts tracking it with `initial_refs`
    /// references.
    ///
    /// This is shorthand for [`allocate_and_track(size, 1, initial_refs)`][Self::allocate_and_track].
    #[track_caller]
    pub fn allocate_bytes_and_track(
        &mut self,
        size: usize,
        initial_refs: usize,
    ) -> Option<NonNull<u8>> {
        self.allocate_and_track(size, 1, initial_refs)
    }

    /// Starts tracking a block the caller already owns, without allocating.
    ///
    /// If `ptr` is already tracked, the existing record is kept and this call behaves exactly
    /// like [`increment_by(ptr, initial_refs)`][Self::increment_by]: the shape passed here is
    /// ignored and only the reference count grows. Accidental double registration therefore
    /// degrades into extra references instead of discarding earlier ownership information.
    ///
    /// Returns `None` only if `ptr` is null.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::{Ledger, LedgerAllocator, SystemAllocator};
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let block = SystemAllocator.allocate(16, 1).unwrap();
    ///
    /// // SAFETY: The block came from the ledger's allocator and we hand it over.
    /// unsafe {
    ///     ledger.track_existing(block.as_ptr(), 16, 1, 2).unwrap();
    ///     ledger.track_existing(block.as_ptr(), 16, 1, 3).unwrap();
    /// }
    ///
    /// // The second registration merged into the first.
    /// assert_eq!(ledger.count(block.as_ptr()), 5);
    /// assert_eq!(ledger.len(), 1);
    ///
    /// ledger.recount(block.as_ptr(), 0).unwrap();
    /// ledger.sweep();
    /// ```
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `ptr` can be released through this ledger's allocator, because a later
    ///   [`sweep()`](Self::sweep) or forced free will do exactly that.
    /// - The block is valid for reads of `element_size * element_count` bytes for as long as it
    ///   stays tracked, if [`duplicate()`](Self::duplicate) is ever called on it.
    /// - The block is not freed by other means while tracked, unless it is
    ///   [untracked](Self::untrack) first.
    #[track_caller]
    pub unsafe fn track_existing<T>(
        &mut self,
        ptr: *mut T,
        element_size: usize,
        element_count: usize,
        initial_refs: usize,
    ) -> Option<NonNull<T>> {
        let ptr = NonNull::new(ptr)?;

        Some(
            self.register(ptr.cast::<u8>(), element_size, element_count, initial_refs)
                .cast::<T>(),
        )
    }

    /// Starts tracking a single block of `size` bytes that the caller already owns.
    ///
    /// This is shorthand for
    /// [`track_existing(ptr, size, 1, initial_refs)`][Self::track_existing].
    ///
    /// # Safety
    ///
    /// Same as [`track_existing()`](Self::track_existing).
    #[track_caller]
    pub unsafe fn track_existing_bytes<T>(
        &mut self,
        ptr: *mut T,
        size: usize,
        initial_refs: usize,
    ) -> Option<NonNull<T>> {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { self.track_existing(ptr, size, 1, initial_refs) }
    }

    /// Stops tracking `ptr` without freeing it. Ownership of the block fully reverts to the
    /// caller.
    ///
    /// Untracking a pointer that is not tracked is a no-op. Either way, `ptr` is returned
    /// unchanged.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::{Ledger, LedgerAllocator, SystemAllocator};
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let ptr = ledger.allocate_and_track(8, 1, 0).unwrap();
    ///
    /// let ptr = ledger.untrack(ptr.as_ptr());
    /// assert!(!ledger.contains(ptr));
    ///
    /// // The sweep does not touch untracked memory.
    /// assert_eq!(ledger.sweep(), 0);
    ///
    /// // SAFETY: We own the block again and it came from the system allocator.
    /// unsafe {
    ///     ptr.write(42);
    ///     SystemAllocator.deallocate(std::ptr::NonNull::new(ptr).unwrap());
    /// }
    /// ```
    pub fn untrack<T>(&mut self, ptr: *mut T) -> *mut T {
        if self.records.remove(ptr.addr()).is_some() {
            trace!(address = ptr.addr(), "pointer untracked");
        }

        ptr
    }

    /// Allocates a new block with the same shape as the tracked block at `ptr`, copies the
    /// bytes over and starts tracking the copy with `initial_refs` references.
    ///
    /// The copy is shallow: pointers stored inside the block are copied as plain bytes and the
    /// blocks they point to are neither duplicated nor have their counts changed.
    ///
    /// Returns `None` without reading any memory if `ptr` is not tracked. Also returns `None`
    /// if the allocation fails.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let original = ledger.allocate_and_track(4, 1, 1).unwrap().cast::<u32>();
    ///
    /// // SAFETY: The block is large enough for a u32.
    /// unsafe { original.write(7) };
    ///
    /// // SAFETY: The tracked shape matches the block and the block is initialized.
    /// let copy = unsafe { ledger.duplicate(original.as_ptr(), 1) }.unwrap();
    ///
    /// // SAFETY: Both blocks are valid and initialized.
    /// unsafe {
    ///     original.write(8);
    ///     assert_eq!(copy.read(), 7);
    /// }
    /// ```
    ///
    /// # Safety
    ///
    /// If `ptr` is tracked, the block must be valid for reads of the byte length recorded for
    /// it, and those bytes must be initialized.
    #[track_caller]
    pub unsafe fn duplicate<T>(&mut self, ptr: *mut T, initial_refs: usize) -> Option<NonNull<T>> {
        let source = self.records.get(ptr.addr())?;
        let (element_size, element_count) = (source.element_size(), source.element_count());
        let byte_len = source.byte_len();

        let Some(copy) = self.allocator.allocate(element_size, element_count) else {
            trace!(
                address = ptr.addr(),
                element_size,
                element_count,
                "allocation for duplicate block failed"
            );
            return None;
        };

        // SAFETY: The caller guarantees the source is valid for `byte_len` reads. The allocator
        // contract guarantees the fresh block is valid for as many writes and does not overlap
        // any live block, including the source.
        unsafe {
            ptr::copy_nonoverlapping(ptr.cast::<u8>().cast_const(), copy.as_ptr(), byte_len);
        }

        Some(
            self.register(copy, element_size, element_count, initial_refs)
                .cast::<T>(),
        )
    }

    /// Adds one reference to `ptr`.
    ///
    /// Returns `ptr` on success or `None` if `ptr` is not tracked by this ledger.
    #[inline]
    pub fn increment<T>(&mut self, ptr: *mut T) -> Option<NonNull<T>> {
        self.increment_by(ptr, 1)
    }

    /// Adds `n` references to `ptr`.
    ///
    /// Returns `ptr` on success or `None` if `ptr` is not tracked by this ledger.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let ptr = ledger.allocate_and_track(1, 1, 1).unwrap();
    /// assert!(ledger.increment_by(ptr.as_ptr(), 4).is_some());
    /// assert_eq!(ledger.count(ptr.as_ptr()), 5);
    ///
    /// // Pointers the ledger does not know about are reported, not modified.
    /// let mut local = 0_u8;
    /// assert!(ledger.increment_by(&raw mut local, 4).is_none());
    /// ```
    pub fn increment_by<T>(&mut self, ptr: *mut T, n: usize) -> Option<NonNull<T>> {
        let record = self.records.get_mut(ptr.addr())?;
        record.add_refs(n);

        NonNull::new(ptr)
    }

    /// Releases one reference to `ptr`, stopping at zero.
    ///
    /// Returns `ptr` on success or `None` if `ptr` is not tracked by this ledger.
    #[inline]
    pub fn decrement<T>(&mut self, ptr: *mut T) -> Option<NonNull<T>> {
        self.decrement_by(ptr, 1)
    }

    /// Releases `n` references to `ptr`.
    ///
    /// The count is clamped at zero: releasing more references than exist is not an error.
    /// Reaching zero does not free the block; that only happens in [`sweep()`](Self::sweep).
    ///
    /// Returns `ptr` on success or `None` if `ptr` is not tracked by this ledger.
    pub fn decrement_by<T>(&mut self, ptr: *mut T, n: usize) -> Option<NonNull<T>> {
        let record = self.records.get_mut(ptr.addr())?;
        record.remove_refs(n);

        NonNull::new(ptr)
    }

    /// The current reference count of `ptr`, or 0 if `ptr` is not tracked.
    ///
    /// An untracked pointer is indistinguishable from a tracked one with zero references here.
    /// Use [`contains()`](Self::contains) if the difference matters.
    #[must_use]
    #[inline]
    pub fn count<T>(&self, ptr: *const T) -> usize {
        self.records.get(ptr.addr()).map_or(0, RefRecord::refcount)
    }

    /// Frees every tracked block whose reference count is exactly zero and stops tracking it.
    ///
    /// Returns the number of blocks freed. Blocks with a nonzero count are untouched, including
    /// their counts.
    ///
    /// The cost is linear in the number of tracked pointers.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let dead = ledger.allocate_and_track(8, 1, 0).unwrap();
    /// let live = ledger.allocate_and_track(8, 1, 2).unwrap();
    ///
    /// assert_eq!(ledger.sweep(), 1);
    ///
    /// assert!(!ledger.contains(dead.as_ptr()));
    /// assert_eq!(ledger.count(live.as_ptr()), 2);
    /// ```
    pub fn sweep(&mut self) -> usize {
        // Removal moves entries around in the map, so we first decide the complete set of
        // victims and only then start removing.
        let zero_count = self
            .records
            .iter()
            .filter(|(_, record)| record.refcount() == 0)
            .map(|(key, _)| key.as_ptr().addr())
            .collect::<Vec<_>>();

        let mut freed: usize = 0;

        for address in zero_count {
            let Some((ptr, _)) = self.records.remove(address) else {
                continue;
            };

            // SAFETY: Every tracked pointer was either allocated by our allocator or handed to
            // us via track_existing(), whose caller guaranteed the allocator accepts it. The
            // record is gone, so we will never free this pointer again.
            unsafe {
                self.allocator.deallocate(ptr);
            }

            // Cannot overflow: we free at most as many blocks as fit in memory.
            freed = freed.wrapping_add(1);
        }

        debug!(freed, remaining = self.records.len(), "ledger swept");

        freed
    }

    /// Frees `ptr` regardless of its reference count and stops tracking it.
    ///
    /// If `ptr` was tracked, its final record is returned. An untracked pointer is still
    /// freed through the ledger's allocator, and `Ok(None)` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullPointer`] if `ptr` is null. Nothing is freed in that case.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let ptr = ledger.allocate_and_track(8, 1, 3).unwrap();
    ///
    /// // SAFETY: Nobody uses the block after this point.
    /// let record = unsafe { ledger.force_free(ptr.as_ptr()) }.unwrap().unwrap();
    ///
    /// assert_eq!(record.refcount(), 3);
    /// assert!(!ledger.contains(ptr.as_ptr()));
    /// ```
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `ptr` can be released through this ledger's allocator and has not been freed already.
    /// - No owner uses the block after this call, whatever its reference count claimed.
    pub unsafe fn force_free<T>(&mut self, ptr: *mut T) -> Result<Option<RefRecord>> {
        let ptr = NonNull::new(ptr).ok_or(Error::NullPointer)?;

        let record = self
            .records
            .remove(ptr.as_ptr().addr())
            .map(|(_, record)| record);

        debug!(
            address = ptr.as_ptr().addr(),
            refcount = record.as_ref().map(RefRecord::refcount),
            "forced free"
        );

        // SAFETY: Forwarding the caller's guarantee that the allocator accepts `ptr`.
        unsafe {
            self.allocator.deallocate(ptr.cast::<u8>());
        }

        Ok(record)
    }

    /// Frees `ptr` and stops tracking it, but only if it currently has at most `max_refs`
    /// references.
    ///
    /// On success, returns the final record of the freed pointer. On refusal, nothing changes.
    ///
    /// # Errors
    ///
    /// - [`Error::NullPointer`] if `ptr` is null.
    /// - [`Error::Untracked`] if `ptr` is not tracked, because its reference count is unknown.
    /// - [`Error::TooManyReferences`] if the reference count exceeds `max_refs`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::{Error, Ledger};
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let ptr = ledger.allocate_and_track(8, 1, 2).unwrap();
    ///
    /// // SAFETY: Only freed on success, after which nobody uses the block.
    /// let refused = unsafe { ledger.force_free_if_below(ptr.as_ptr(), 1) };
    /// assert!(matches!(refused, Err(Error::TooManyReferences { refcount: 2, .. })));
    ///
    /// // SAFETY: As above.
    /// let record = unsafe { ledger.force_free_if_below(ptr.as_ptr(), 2) }.unwrap();
    /// assert_eq!(record.refcount(), 2);
    /// ```
    ///
    /// # Safety
    ///
    /// Same as [`force_free()`](Self::force_free), for the case where the free proceeds.
    pub unsafe fn force_free_if_below<T>(&mut self, ptr: *mut T, max_refs: usize) -> Result<RefRecord> {
        if ptr.is_null() {
            return Err(Error::NullPointer);
        }

        let address = ptr.addr();
        let refcount = self
            .records
            .get(address)
            .ok_or(Error::Untracked { address })?
            .refcount();

        if refcount > max_refs {
            return Err(Error::TooManyReferences {
                address,
                refcount,
                max_refs,
            });
        }

        // SAFETY: Forwarding the caller's guarantees.
        let record = unsafe { self.force_free(ptr) }?;

        record.ok_or(Error::Untracked { address })
    }

    /// A mutable handle to the record of `ptr`, or `None` if `ptr` is not tracked.
    ///
    /// This is a low-level escape hatch that bypasses the reference counting protocol. The
    /// caller becomes responsible for keeping the record truthful: a wrong shape makes
    /// [`duplicate()`](Self::duplicate) read the wrong number of bytes and a wrong count makes
    /// [`sweep()`](Self::sweep) free a block too early or never.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::new();
    ///
    /// let ptr = ledger.allocate_and_track(8, 1, 1).unwrap();
    ///
    /// let record = ledger.info(ptr.as_ptr()).unwrap();
    /// record.set_refcount(10);
    ///
    /// assert_eq!(ledger.count(ptr.as_ptr()), 10);
    /// ```
    #[must_use]
    pub fn info<T>(&mut self, ptr: *mut T) -> Option<&mut RefRecord> {
        self.records.get_mut(ptr.addr())
    }

    /// A read-only view of the record of `ptr`, or `None` if `ptr` is not tracked.
    #[must_use]
    pub fn record<T>(&self, ptr: *const T) -> Option<&RefRecord> {
        self.records.get(ptr.addr())
    }

    /// Records that the block at `ptr` is now a single block of `new_size` bytes.
    ///
    /// This only updates metadata, e.g. after the caller grew or shrank the block in place
    /// with the allocator directly. Nothing is reallocated.
    ///
    /// Returns the previous byte length of the block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Untracked`] if `ptr` is not tracked.
    pub fn resize<T>(&mut self, ptr: *mut T, new_size: usize) -> Result<usize> {
        let record = self.tracked_mut(ptr)?;
        let previous = record.byte_len();

        record.set_element_size(new_size);
        record.set_element_count(1);

        Ok(previous)
    }

    /// Records that the block at `ptr` now holds `new_count` elements of its existing element
    /// size.
    ///
    /// This only updates metadata. Nothing is reallocated.
    ///
    /// Returns the previous byte length of the block.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Untracked`] if `ptr` is not tracked.
    pub fn resize_elements<T>(&mut self, ptr: *mut T, new_count: usize) -> Result<usize> {
        let record = self.tracked_mut(ptr)?;
        let previous = record.byte_len();

        record.set_element_count(new_count);

        Ok(previous)
    }

    /// Sets the reference count of `ptr` directly, returning the previous count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Untracked`] if `ptr` is not tracked.
    pub fn recount<T>(&mut self, ptr: *mut T, new_count: usize) -> Result<usize> {
        let record = self.tracked_mut(ptr)?;
        let previous = record.refcount();

        record.set_refcount(new_count);

        Ok(previous)
    }

    fn tracked_mut<T>(&mut self, ptr: *mut T) -> Result<&mut RefRecord> {
        let address = ptr.addr();

        self.records
            .get_mut(address)
            .ok_or(Error::Untracked { address })
    }

    /// Registers `ptr` with a fresh record or, if already present, adds `initial_refs` to the
    /// existing record.
    #[track_caller]
    fn register(
        &mut self,
        ptr: NonNull<u8>,
        element_size: usize,
        element_count: usize,
        initial_refs: usize,
    ) -> NonNull<u8> {
        let record = RefRecord::new(
            initial_refs,
            element_size,
            element_count,
            self.caller_provenance(),
        );

        match self.records.insert(ptr, record) {
            InsertOutcome::Inserted => {}
            InsertOutcome::AlreadyExisted => {
                trace!(
                    address = ptr.as_ptr().addr(),
                    initial_refs, "pointer already tracked, merging references"
                );

                if let Some(existing) = self.records.get_mut(ptr.as_ptr().addr()) {
                    existing.add_refs(initial_refs);
                }
            }
        }

        ptr
    }

    #[track_caller]
    fn caller_provenance(&self) -> Option<&'static Location<'static>> {
        if self.capture_provenance {
            Some(Location::caller())
        } else {
            None
        }
    }
}

impl<A> Drop for Ledger<A>
where
    A: LedgerAllocator,
{
    #[cfg_attr(test, mutants::skip)] // Mutating the policy checks leaks or double-frees memory.
    fn drop(&mut self) {
        match self.drop_policy {
            DropPolicy::ForgetTracked => {}
            DropPolicy::FreeTracked => {
                let keys = self.records.drain_keys();

                if !keys.is_empty() {
                    warn!(
                        count = keys.len(),
                        "ledger dropped with tracked blocks, freeing them"
                    );
                }

                for ptr in keys {
                    // SAFETY: Same reasoning as in sweep(): every tracked pointer is acceptable
                    // to our allocator, and draining the map ensures each is freed only once.
                    unsafe {
                        self.allocator.deallocate(ptr);
                    }
                }
            }
            DropPolicy::MustNotDropTracked => {
                // If we are already panicking, we do not want to panic again because that will
                // simply obscure whatever the original panic was, leading to debug difficulties.
                if !thread::panicking() {
                    assert!(
                        self.records.is_empty(),
                        "dropped a Ledger with {} tracked pointers - this is forbidden by DropPolicy::MustNotDropTracked",
                        self.records.len()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::cell::Cell;
    use std::fmt::Debug;
    use std::rc::Rc;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(Ledger: Send, Debug, Default);
    assert_not_impl_any!(Ledger: Sync);

    /// Shared between a test and the allocator it hands to a ledger, so the test can observe
    /// allocator activity even after the ledger is gone.
    #[derive(Debug, Default)]
    struct AllocatorStats {
        allocations: Cell<usize>,
        deallocations: Cell<usize>,
        fail_allocations: Cell<bool>,
    }

    #[derive(Debug, Default)]
    struct CountingAllocator {
        stats: Rc<AllocatorStats>,
    }

    // SAFETY: Delegates to SystemAllocator, which upholds the contract.
    unsafe impl LedgerAllocator for CountingAllocator {
        fn allocate(&self, element_size: usize, element_count: usize) -> Option<NonNull<u8>> {
            if self.stats.fail_allocations.get() {
                return None;
            }

            self.stats.allocations.set(self.stats.allocations.get() + 1);
            SystemAllocator.allocate(element_size, element_count)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>) {
            self.stats
                .deallocations
                .set(self.stats.deallocations.get() + 1);
            unsafe { SystemAllocator.deallocate(ptr) }
        }
    }

    fn counting_ledger(policy: DropPolicy) -> (Ledger<CountingAllocator>, Rc<AllocatorStats>) {
        let allocator = CountingAllocator::default();
        let stats = Rc::clone(&allocator.stats);

        let ledger = Ledger::builder()
            .allocator(allocator)
            .drop_policy(policy)
            .build();

        (ledger, stats)
    }

    #[test]
    fn smoke_test() {
        let mut ledger = Ledger::new();

        assert!(ledger.is_empty());

        let p = ledger.allocate_and_track(8, 4, 1).unwrap();
        assert_eq!(ledger.count(p.as_ptr()), 1);

        ledger.increment(p.as_ptr()).unwrap();
        ledger.increment(p.as_ptr()).unwrap();
        assert_eq!(ledger.count(p.as_ptr()), 3);

        ledger.decrement_by(p.as_ptr(), 5).unwrap();
        assert_eq!(ledger.count(p.as_ptr()), 0);

        assert_eq!(ledger.sweep(), 1);
        assert_eq!(ledger.count(p.as_ptr()), 0);
        assert!(!ledger.contains(p.as_ptr()));
        assert!(ledger.is_empty());
    }

    #[test]
    fn allocate_records_shape() {
        let mut ledger = Ledger::new();

        let p = ledger.allocate_and_track(8, 4, 2).unwrap();

        let record = ledger.record(p.as_ptr()).unwrap();
        assert_eq!(record.refcount(), 2);
        assert_eq!(record.element_size(), 8);
        assert_eq!(record.element_count(), 4);
        assert_eq!(record.byte_len(), 32);

        let q = ledger.allocate_bytes_and_track(24, 0).unwrap();

        let record = ledger.record(q.as_ptr()).unwrap();
        assert_eq!(record.element_size(), 24);
        assert_eq!(record.element_count(), 1);

        ledger.recount(p.as_ptr(), 0).unwrap();
        assert_eq!(ledger.sweep(), 2);
    }

    #[test]
    fn allocation_failure_registers_nothing() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);
        stats.fail_allocations.set(true);

        assert!(ledger.allocate_and_track(8, 4, 1).is_none());
        assert!(ledger.is_empty());
        assert_eq!(stats.allocations.get(), 0);
    }

    #[test]
    fn overflowing_shape_fails_to_allocate() {
        let mut ledger = Ledger::new();

        assert!(ledger.allocate_and_track(usize::MAX, 2, 1).is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn track_existing_merges_on_re_add() {
        let mut ledger = Ledger::new();
        let q = SystemAllocator.allocate(16, 1).unwrap();

        unsafe {
            ledger.track_existing(q.as_ptr(), 16, 1, 2).unwrap();
            ledger.track_existing(q.as_ptr(), 99, 7, 3).unwrap();
        }

        assert_eq!(ledger.count(q.as_ptr()), 5);
        assert_eq!(ledger.len(), 1);

        // Shape from the first registration is kept.
        let record = ledger.record(q.as_ptr()).unwrap();
        assert_eq!(record.element_size(), 16);
        assert_eq!(record.element_count(), 1);

        ledger.recount(q.as_ptr(), 0).unwrap();
        assert_eq!(ledger.sweep(), 1);
    }

    #[test]
    fn track_existing_null_is_rejected() {
        let mut ledger = Ledger::new();

        let result = unsafe { ledger.track_existing(ptr::null_mut::<u64>(), 8, 1, 1) };

        assert!(result.is_none());
        assert!(ledger.is_empty());
    }

    #[test]
    fn track_existing_bytes_records_single_block() {
        let mut ledger = Ledger::new();
        let q = SystemAllocator.allocate(12, 1).unwrap();

        unsafe { ledger.track_existing_bytes(q.as_ptr(), 12, 0) }.unwrap();

        let record = ledger.record(q.as_ptr()).unwrap();
        assert_eq!(record.element_size(), 12);
        assert_eq!(record.element_count(), 1);
        assert_eq!(record.refcount(), 0);

        assert_eq!(ledger.sweep(), 1);
    }

    #[test]
    fn untrack_is_idempotent_and_keeps_memory() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        let p = ledger.allocate_and_track(8, 1, 0).unwrap();

        assert_eq!(ledger.untrack(p.as_ptr()), p.as_ptr());
        assert_eq!(ledger.untrack(p.as_ptr()), p.as_ptr());

        assert_eq!(ledger.count(p.as_ptr()), 0);
        assert!(!ledger.contains(p.as_ptr()));

        // The sweep leaves the untracked block alone.
        assert_eq!(ledger.sweep(), 0);
        assert_eq!(stats.deallocations.get(), 0);

        // The memory is still ours to use and free.
        unsafe {
            p.cast::<u64>().write(123);
            assert_eq!(p.cast::<u64>().read(), 123);
            SystemAllocator.deallocate(p);
        }
    }

    #[test]
    fn refcount_operations_on_untracked_are_inert() {
        let mut ledger = Ledger::new();
        let mut local = 5_u32;
        let untracked = &raw mut local;

        assert!(ledger.increment(untracked).is_none());
        assert!(ledger.increment_by(untracked, 3).is_none());
        assert!(ledger.decrement(untracked).is_none());
        assert!(ledger.decrement_by(untracked, 3).is_none());
        assert_eq!(ledger.count(untracked), 0);
        assert!(ledger.info(untracked).is_none());
        assert!(ledger.record(untracked).is_none());
        assert!(ledger.is_empty());
        assert_eq!(local, 5);
    }

    #[test]
    fn null_pointer_is_inert() {
        let mut ledger = Ledger::new();
        let null = ptr::null_mut::<u8>();

        assert!(ledger.increment(null).is_none());
        assert!(ledger.decrement(null).is_none());
        assert_eq!(ledger.count(null), 0);
        assert!(!ledger.contains(null));
        assert_eq!(ledger.untrack(null), null);
        assert!(unsafe { ledger.duplicate(null, 1) }.is_none());
        assert_eq!(unsafe { ledger.force_free(null) }, Err(Error::NullPointer));
        assert_eq!(
            unsafe { ledger.force_free_if_below(null, usize::MAX) },
            Err(Error::NullPointer)
        );
    }

    #[test]
    fn decrement_never_goes_below_zero() {
        let mut ledger = Ledger::new();
        let p = ledger.allocate_and_track(1, 1, 2).unwrap();

        for expected in [1, 0, 0, 0] {
            ledger.decrement(p.as_ptr()).unwrap();
            assert_eq!(ledger.count(p.as_ptr()), expected);
        }

        ledger.increment_by(p.as_ptr(), 3).unwrap();
        ledger.decrement_by(p.as_ptr(), usize::MAX).unwrap();
        assert_eq!(ledger.count(p.as_ptr()), 0);

        ledger.sweep();
    }

    #[test]
    fn reaching_zero_does_not_free() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        let p = ledger.allocate_and_track(8, 1, 1).unwrap();
        ledger.decrement(p.as_ptr()).unwrap();

        assert_eq!(stats.deallocations.get(), 0);
        assert!(ledger.contains(p.as_ptr()));

        // The block can be revived before the sweep.
        ledger.increment(p.as_ptr()).unwrap();
        assert_eq!(ledger.sweep(), 0);

        ledger.decrement(p.as_ptr()).unwrap();
        assert_eq!(ledger.sweep(), 1);
        assert_eq!(stats.deallocations.get(), 1);
    }

    #[test]
    fn sweep_frees_exactly_the_zero_count_entries() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        // Interleave dead and live entries so removals shuffle live entries around.
        let pointers = (0..64_usize)
            .map(|i| {
                let refs = if i % 3 == 0 { 0 } else { i };
                (ledger.allocate_and_track(8, 1, refs).unwrap(), refs)
            })
            .collect::<Vec<_>>();

        let dead = pointers.iter().filter(|(_, refs)| *refs == 0).count();

        assert_eq!(ledger.sweep(), dead);
        assert_eq!(stats.deallocations.get(), dead);
        assert_eq!(ledger.len(), pointers.len() - dead);

        for (ptr, refs) in &pointers {
            if *refs == 0 {
                assert!(!ledger.contains(ptr.as_ptr()));
            } else {
                assert_eq!(ledger.count(ptr.as_ptr()), *refs);
            }
        }

        // A second sweep finds nothing.
        assert_eq!(ledger.sweep(), 0);

        for (ptr, _) in pointers.iter().filter(|(_, refs)| *refs != 0) {
            ledger.recount(ptr.as_ptr(), 0).unwrap();
        }

        assert_eq!(ledger.sweep(), pointers.len() - dead);
        assert!(ledger.is_empty());
    }

    #[test]
    fn sweep_frees_all_when_everything_is_dead() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        for _ in 0..10 {
            ledger.allocate_and_track(4, 2, 0).unwrap();
        }

        assert_eq!(ledger.sweep(), 10);
        assert_eq!(stats.deallocations.get(), 10);
        assert!(ledger.is_empty());
    }

    #[test]
    fn sweep_on_empty_ledger_is_noop() {
        let mut ledger = Ledger::new();

        assert_eq!(ledger.sweep(), 0);
    }

    #[test]
    fn duplicate_copies_into_independent_storage() {
        let mut ledger = Ledger::new();

        let original = ledger.allocate_and_track(4, 3, 1).unwrap().cast::<u32>();
        unsafe {
            for i in 0..3 {
                original.add(i).write(u32::try_from(i).unwrap() + 10);
            }
        }

        let copy = unsafe { ledger.duplicate(original.as_ptr(), 4) }.unwrap();

        assert_ne!(copy, original);
        assert_eq!(ledger.count(copy.as_ptr()), 4);
        assert_eq!(ledger.count(original.as_ptr()), 1);

        let record = ledger.record(copy.as_ptr()).unwrap();
        assert_eq!(record.element_size(), 4);
        assert_eq!(record.element_count(), 3);

        unsafe {
            original.write(99);

            assert_eq!(copy.read(), 10);
            assert_eq!(copy.add(1).read(), 11);
            assert_eq!(copy.add(2).read(), 12);
        }

        ledger.recount(original.as_ptr(), 0).unwrap();
        ledger.recount(copy.as_ptr(), 0).unwrap();
        assert_eq!(ledger.sweep(), 2);
    }

    #[test]
    fn duplicate_untracked_does_not_allocate() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);
        let mut local = 1_u64;

        assert!(unsafe { ledger.duplicate(&raw mut local, 1) }.is_none());
        assert_eq!(stats.allocations.get(), 0);
    }

    #[test]
    fn duplicate_allocation_failure_registers_nothing() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        let p = ledger.allocate_and_track(8, 1, 0).unwrap();
        stats.fail_allocations.set(true);

        assert!(unsafe { ledger.duplicate(p.as_ptr(), 1) }.is_none());
        assert_eq!(ledger.len(), 1);

        ledger.sweep();
    }

    #[test]
    fn force_free_ignores_refcount_and_removes_record() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        let p = ledger.allocate_and_track(8, 1, 5).unwrap();

        let record = unsafe { ledger.force_free(p.as_ptr()) }.unwrap().unwrap();

        assert_eq!(record.refcount(), 5);
        assert!(!ledger.contains(p.as_ptr()));
        assert_eq!(stats.deallocations.get(), 1);

        // A sweep afterwards must not free it again.
        assert_eq!(ledger.sweep(), 0);
        assert_eq!(stats.deallocations.get(), 1);
    }

    #[test]
    fn force_free_untracked_still_frees() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        let block = SystemAllocator.allocate(8, 1).unwrap();

        let record = unsafe { ledger.force_free(block.as_ptr()) }.unwrap();

        assert!(record.is_none());
        assert_eq!(stats.deallocations.get(), 1);
    }

    #[test]
    fn force_free_if_below_respects_limit() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        let p = ledger.allocate_and_track(8, 1, 3).unwrap();
        let address = p.as_ptr().addr();

        assert_eq!(
            unsafe { ledger.force_free_if_below(p.as_ptr(), 2) },
            Err(Error::TooManyReferences {
                address,
                refcount: 3,
                max_refs: 2,
            })
        );
        assert_eq!(ledger.count(p.as_ptr()), 3);
        assert_eq!(stats.deallocations.get(), 0);

        // The limit is inclusive.
        let record = unsafe { ledger.force_free_if_below(p.as_ptr(), 3) }.unwrap();
        assert_eq!(record.refcount(), 3);
        assert!(!ledger.contains(p.as_ptr()));
        assert_eq!(stats.deallocations.get(), 1);
    }

    #[test]
    fn force_free_if_below_refuses_untracked() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);
        let mut local = 0_u8;
        let untracked = &raw mut local;

        assert_eq!(
            unsafe { ledger.force_free_if_below(untracked, usize::MAX) },
            Err(Error::Untracked {
                address: untracked.addr()
            })
        );
        assert_eq!(stats.deallocations.get(), 0);
    }

    #[test]
    fn info_allows_direct_mutation() {
        let mut ledger = Ledger::new();
        let p = ledger.allocate_and_track(8, 2, 1).unwrap();

        {
            let record = ledger.info(p.as_ptr()).unwrap();
            record.set_refcount(0);
            record.set_element_count(1);
        }

        let record = ledger.record(p.as_ptr()).unwrap();
        assert_eq!(record.refcount(), 0);
        assert_eq!(record.byte_len(), 8);

        assert_eq!(ledger.sweep(), 1);
    }

    #[test]
    fn resize_updates_shape_only() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::MustNotDropTracked);
        let p = ledger.allocate_and_track(8, 4, 2).unwrap();

        assert_eq!(ledger.resize(p.as_ptr(), 16), Ok(32));

        let record = ledger.record(p.as_ptr()).unwrap();
        assert_eq!(record.element_size(), 16);
        assert_eq!(record.element_count(), 1);
        assert_eq!(record.refcount(), 2);
        assert_eq!(stats.allocations.get(), 1);

        ledger.recount(p.as_ptr(), 0).unwrap();
        ledger.sweep();
    }

    #[test]
    fn resize_elements_keeps_element_size() {
        let mut ledger = Ledger::new();
        let p = ledger.allocate_and_track(8, 4, 0).unwrap();

        assert_eq!(ledger.resize_elements(p.as_ptr(), 2), Ok(32));

        let record = ledger.record(p.as_ptr()).unwrap();
        assert_eq!(record.element_size(), 8);
        assert_eq!(record.element_count(), 2);

        ledger.sweep();
    }

    #[test]
    fn recount_sets_count_directly() {
        let mut ledger = Ledger::new();
        let p = ledger.allocate_and_track(8, 1, 2).unwrap();

        assert_eq!(ledger.recount(p.as_ptr(), 40), Ok(2));
        assert_eq!(ledger.count(p.as_ptr()), 40);

        assert_eq!(ledger.recount(p.as_ptr(), 0), Ok(40));
        assert_eq!(ledger.sweep(), 1);
    }

    #[test]
    fn metadata_operations_on_untracked_fail() {
        let mut ledger = Ledger::new();
        let mut local = 0_u16;
        let untracked = &raw mut local;
        let expected = Err(Error::Untracked {
            address: untracked.addr(),
        });

        assert_eq!(ledger.resize(untracked, 4), expected);
        assert_eq!(ledger.resize_elements(untracked, 4), expected);
        assert_eq!(ledger.recount(untracked, 4), expected);
        assert!(ledger.is_empty());
    }

    #[test]
    fn provenance_points_at_caller_when_enabled() {
        let mut ledger = Ledger::builder().capture_provenance(true).build();

        let expected_line = line!() + 1;
        let p = ledger.allocate_and_track(8, 1, 0).unwrap();

        let location = ledger.record(p.as_ptr()).unwrap().provenance().unwrap();
        assert_eq!(location.file(), file!());
        assert_eq!(location.line(), expected_line);

        let copy_line = line!() + 1;
        let copy = unsafe { ledger.duplicate(p.as_ptr(), 0) }.unwrap();

        let location = ledger.record(copy.as_ptr()).unwrap().provenance().unwrap();
        assert_eq!(location.line(), copy_line);

        ledger.sweep();
    }

    #[test]
    fn provenance_absent_when_disabled() {
        let mut ledger = Ledger::new();

        let p = ledger.allocate_and_track(8, 1, 0).unwrap();

        assert!(ledger.record(p.as_ptr()).unwrap().provenance().is_none());

        ledger.sweep();
    }

    #[test]
    fn iter_visits_every_record() {
        let mut ledger = Ledger::new();

        let a = ledger.allocate_and_track(1, 1, 1).unwrap();
        let b = ledger.allocate_and_track(2, 1, 2).unwrap();

        let mut seen = ledger
            .iter()
            .map(|(ptr, record)| (ptr, record.refcount()))
            .collect::<Vec<_>>();
        seen.sort_by_key(|(_, refs)| *refs);

        assert_eq!(seen, vec![(a, 1), (b, 2)]);

        ledger.recount(a.as_ptr(), 0).unwrap();
        ledger.recount(b.as_ptr(), 0).unwrap();
        ledger.sweep();
    }

    #[test]
    fn drop_policy_forget_tracked_leaves_memory() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::ForgetTracked);

        let p = ledger.allocate_and_track(8, 1, 1).unwrap();
        drop(ledger);

        assert_eq!(stats.deallocations.get(), 0);

        unsafe { SystemAllocator.deallocate(p) };
    }

    #[test]
    fn drop_policy_free_tracked_frees_everything() {
        let (mut ledger, stats) = counting_ledger(DropPolicy::FreeTracked);

        ledger.allocate_and_track(8, 1, 1).unwrap();
        ledger.allocate_and_track(8, 1, 0).unwrap();
        ledger.allocate_and_track(8, 1, 7).unwrap();
        drop(ledger);

        assert_eq!(stats.deallocations.get(), 3);
    }

    #[test]
    fn drop_policy_must_not_drop_tracked_allows_empty() {
        let (mut ledger, _stats) = counting_ledger(DropPolicy::MustNotDropTracked);

        ledger.allocate_and_track(8, 1, 0).unwrap();
        ledger.sweep();
        drop(ledger);
    }

    #[test]
    #[should_panic]
    fn drop_policy_must_not_drop_tracked_panics() {
        let mut ledger = Ledger::builder()
            .drop_policy(DropPolicy::MustNotDropTracked)
            .build();

        ledger.allocate_and_track(8, 1, 1).unwrap();
    }
}
