use core::alloc::AllocError;

/// Failures reported by this crate's own operations.
///
/// Errors raised while building a payload are never wrapped in this type; the
/// constructors hand them back to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Storage for a control block could not be obtained.
    #[error("failed to allocate a control block")]
    Alloc,
    /// An empty pointer was dereferenced.
    #[error("dereferenced an empty pointer")]
    NullDereference,
    /// A registration was attempted after the tracking registry shut down.
    #[error("the tracking registry has already been shut down")]
    RegistryFinalized,
}

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Error::Alloc
    }
}
