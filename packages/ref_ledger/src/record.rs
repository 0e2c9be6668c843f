use std::panic::Location;

/// Ownership and shape metadata the [`Ledger`][crate::Ledger] keeps for one tracked pointer.
///
/// A record describes a block as `element_count` elements of `element_size` bytes each, which
/// covers both single-block allocations (`element_count == 1`) and arrays. The reference count
/// is the number of live logical owners the caller has declared via the ledger protocol.
///
/// Records are normally mutated only through the [`Ledger`][crate::Ledger] operations. The
/// setters exist for the [`Ledger::info()`][crate::Ledger::info] escape hatch, which hands out
/// `&mut RefRecord` so the caller can patch metadata directly. Nothing stops such a caller from
/// writing nonsense; keeping the record truthful is then their responsibility.
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
/// let record = ledger.record(ptr.as_ptr()).unwrap();
/// assert_eq!(record.refcount(), 1);
/// assert_eq!(record.element_size(), 8);
/// assert_eq!(record.element_count(), 4);
/// assert_eq!(record.byte_len(), 32);
///
/// ledger.decrement(ptr.as_ptr());
/// ledger.sweep();
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RefRecord {
    refcount: usize,
    element_size: usize,
    element_count: usize,

    /// Where the pointer was registered, if the ledger was configured to capture provenance.
    provenance: Option<&'static Location<'static>>,
}

impl RefRecord {
    #[must_use]
    pub(crate) const fn new(
        refcount: usize,
        element_size: usize,
        element_count: usize,
        provenance: Option<&'static Location<'static>>,
    ) -> Self {
        Self {
            refcount,
            element_size,
            element_count,
            provenance,
        }
    }

    /// The number of live logical owners of the tracked block.
    #[must_use]
    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount
    }

    /// Overwrites the reference count, bypassing the clamping rules of the ledger protocol.
    #[inline]
    pub fn set_refcount(&mut self, refcount: usize) {
        self.refcount = refcount;
    }

    /// The size in bytes of one element of the tracked block.
    #[must_use]
    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Overwrites the element size, e.g. after the caller reallocated the block elsewhere.
    #[inline]
    pub fn set_element_size(&mut self, element_size: usize) {
        self.element_size = element_size;
    }

    /// The number of elements in the tracked block.
    #[must_use]
    #[inline]
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Overwrites the element count, e.g. after the caller reallocated the block elsewhere.
    #[inline]
    pub fn set_element_count(&mut self, element_count: usize) {
        self.element_count = element_count;
    }

    /// The logical extent of the tracked block in bytes.
    ///
    /// Saturates at `usize::MAX` if the recorded shape is too large to represent, which can
    /// only happen if the record was patched by hand via [`Ledger::info()`][crate::Ledger::info].
    #[must_use]
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.element_size.saturating_mul(self.element_count)
    }

    /// The source location that registered the pointer with the ledger.
    ///
    /// This is `None` unless the ledger was built with
    /// [`capture_provenance(true)`][crate::LedgerBuilder::capture_provenance].
    ///
    /// # Example
    ///
    /// ```rust
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::builder().capture_provenance(true).build();
    ///
    /// let ptr = ledger.allocate_bytes_and_track(16, 0).unwrap();
    ///
    /// let location = ledger.record(ptr.as_ptr()).unwrap().provenance().unwrap();
    /// println!("registered at {}:{}", location.file(), location.line());
    ///
    /// ledger.sweep();
    /// ```
    #[must_use]
    #[inline]
    pub fn provenance(&self) -> Option<&'static Location<'static>> {
        self.provenance
    }

    /// Grows the reference count by `n`, saturating at `usize::MAX`.
    #[inline]
    pub(crate) fn add_refs(&mut self, n: usize) {
        self.refcount = self.refcount.saturating_add(n);
    }

    /// Shrinks the reference count by `n`, clamping at zero.
    #[inline]
    pub(crate) fn remove_refs(&mut self, n: usize) {
        self.refcount = self.refcount.saturating_sub(n);
    }
}
