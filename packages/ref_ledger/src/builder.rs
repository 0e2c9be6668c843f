use crate::{DropPolicy, Ledger, LedgerAllocator, SystemAllocator};

/// Builder for creating an instance of [`Ledger`].
///
/// All settings are optional. Without any customization, the builder produces the same ledger
/// as [`Ledger::new()`]: backed by the [`SystemAllocator`], without provenance capture and
/// with [`DropPolicy::ForgetTracked`].
///
/// # Examples
///
/// ```
/// use ref_ledger::{DropPolicy, Ledger};
///
/// let ledger = Ledger::builder()
///     .capture_provenance(true)
///     .drop_policy(DropPolicy::FreeTracked)
///     .build();
///
/// assert!(ledger.captures_provenance());
/// assert_eq!(ledger.drop_policy(), DropPolicy::FreeTracked);
/// ```
#[derive(Debug)]
#[must_use]
pub struct LedgerBuilder<A = SystemAllocator>
where
    A: LedgerAllocator,
{
    allocator: A,
    capture_provenance: bool,
    drop_policy: DropPolicy,
}

impl LedgerBuilder<SystemAllocator> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            allocator: SystemAllocator,
            capture_provenance: false,
            drop_policy: DropPolicy::default(),
        }
    }
}

impl<A> LedgerBuilder<A>
where
    A: LedgerAllocator,
{
    /// Sets the allocator the ledger uses to allocate, duplicate and free tracked blocks.
    ///
    /// # Examples
    ///
    /// ```
    /// use ref_ledger::{Ledger, SystemAllocator};
    ///
    /// let ledger = Ledger::builder().allocator(SystemAllocator).build();
    /// ```
    #[inline]
    pub fn allocator<B>(self, allocator: B) -> LedgerBuilder<B>
    where
        B: LedgerAllocator,
    {
        LedgerBuilder {
            allocator,
            capture_provenance: self.capture_provenance,
            drop_policy: self.drop_policy,
        }
    }

    /// Sets whether registering operations record the source location of their caller in the
    /// [`RefRecord`][crate::RefRecord] they create.
    ///
    /// Provenance has no effect on reference counting. It is off by default.
    ///
    /// # Examples
    ///
    /// ```
    /// use ref_ledger::Ledger;
    ///
    /// let mut ledger = Ledger::builder().capture_provenance(true).build();
    ///
    /// let ptr = ledger.allocate_bytes_and_track(8, 0).unwrap();
    /// let location = ledger.record(ptr.as_ptr()).unwrap().provenance().unwrap();
    /// assert_eq!(location.file(), file!());
    ///
    /// ledger.sweep();
    /// ```
    #[inline]
    pub fn capture_provenance(mut self, capture: bool) -> Self {
        self.capture_provenance = capture;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the ledger. This governs how to treat
    /// remaining tracked blocks when the ledger is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use ref_ledger::{DropPolicy, Ledger};
    ///
    /// let ledger = Ledger::builder()
    ///     .drop_policy(DropPolicy::MustNotDropTracked)
    ///     .build();
    /// ```
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the ledger with the specified configuration.
    #[must_use]
    #[inline]
    pub fn build(self) -> Ledger<A> {
        Ledger::new_inner(self.allocator, self.capture_provenance, self.drop_policy)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ptr::NonNull;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(LedgerBuilder: Send, std::fmt::Debug);

    #[derive(Debug)]
    struct FailingAllocator;

    // SAFETY: Never hands out memory, so there is nothing to get wrong.
    unsafe impl LedgerAllocator for FailingAllocator {
        fn allocate(&self, _element_size: usize, _element_count: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>) {
            unreachable!("this allocator never allocates");
        }
    }

    #[test]
    fn builder_new_creates_default_state() {
        let builder = LedgerBuilder::new();

        assert!(!builder.capture_provenance);
        assert_eq!(builder.drop_policy, DropPolicy::default());
    }

    #[test]
    fn capture_provenance_sets_flag() {
        let builder = LedgerBuilder::new().capture_provenance(true);
        assert!(builder.capture_provenance);

        let builder = builder.capture_provenance(false);
        assert!(!builder.capture_provenance);
    }

    #[test]
    fn drop_policy_can_be_overridden() {
        let builder = LedgerBuilder::new()
            .drop_policy(DropPolicy::MustNotDropTracked)
            .drop_policy(DropPolicy::FreeTracked);

        assert_eq!(builder.drop_policy, DropPolicy::FreeTracked);
    }

    #[test]
    fn allocator_keeps_other_settings() {
        let builder = LedgerBuilder::new()
            .capture_provenance(true)
            .drop_policy(DropPolicy::FreeTracked)
            .allocator(FailingAllocator);

        assert!(builder.capture_provenance);
        assert_eq!(builder.drop_policy, DropPolicy::FreeTracked);
    }

    #[test]
    fn build_applies_configuration() {
        let mut ledger = LedgerBuilder::new()
            .allocator(FailingAllocator)
            .capture_provenance(true)
            .drop_policy(DropPolicy::MustNotDropTracked)
            .build();

        assert!(ledger.captures_provenance());
        assert_eq!(ledger.drop_policy(), DropPolicy::MustNotDropTracked);

        // The custom allocator is the one in use.
        assert!(ledger.allocate_and_track(1, 1, 1).is_none());
        assert!(ledger.is_empty());
    }
}
