/// Determines what happens to still-tracked blocks when a [`Ledger`][crate::Ledger] is dropped.
///
/// By default, the ledger forgets its records and leaves the memory alone.
///
/// # Examples
///
/// ```
/// use ref_ledger::{DropPolicy, Ledger};
///
/// // The drop policy is set at ledger creation time.
/// let ledger = Ledger::builder()
///     .drop_policy(DropPolicy::MustNotDropTracked)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The ledger discards its records without touching the memory they describe. Ownership
    /// of every remaining block reverts to the caller, as if each had been untracked. This is
    /// the default.
    #[default]
    ForgetTracked,

    /// The ledger deallocates every remaining tracked block through its allocator, regardless
    /// of reference count.
    ///
    /// This is useful for ledgers that own an isolated memory domain, such as one per test or
    /// per subsystem, which should be torn down as a unit.
    FreeTracked,

    /// The ledger will panic if it still tracks any pointers when it is dropped.
    ///
    /// This may be valuable to detect reference-count leaks: a well-behaved program releases
    /// every reference and sweeps before it discards the ledger.
    MustNotDropTracked,
}
