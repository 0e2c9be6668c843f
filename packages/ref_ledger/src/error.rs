use thiserror::Error;

/// Errors reported by the status-returning operations of a [`Ledger`][crate::Ledger].
///
/// Operations that return a pointer report failure as `None` instead, mirroring the null
/// pointer they stand in for.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The caller supplied a null pointer. The ledger never tracks the null pointer.
    #[error("the null pointer cannot be tracked by a ledger")]
    NullPointer,

    /// The pointer is not tracked by this ledger.
    #[error("pointer {address:#x} is not tracked by this ledger")]
    Untracked {
        /// The address of the untracked pointer.
        address: usize,
    },

    /// A conditional free was refused because the pointer has too many live references.
    #[error(
        "pointer {address:#x} has {refcount} references, which exceeds the permitted maximum of {max_refs}"
    )]
    TooManyReferences {
        /// The address of the pointer that was not freed.
        address: usize,

        /// The reference count of the pointer at the time of the call.
        refcount: usize,

        /// The maximum reference count the caller was willing to free at.
        max_refs: usize,
    },
}

/// A specialized `Result` type for ledger operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
