use crate::allocator::AllocError;

/// Failure of a fallible construction such as
/// [`Shared::try_new_with`][crate::Shared::try_new_with].
///
/// Construction is all-or-nothing: by the time either variant is returned the
/// allocation, if there was one, has already been handed back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error<E> {
    /// No memory was available. The value constructor was never called.
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// The value constructor itself failed.
    #[error("value construction failed: {0}")]
    Construction(E),
}

impl<E> Error<E> {
    /// The constructor's error, if that is what failed.
    pub fn into_construction(self) -> Option<E> {
        match self {
            Error::Construction(e) => Some(e),
            Error::Alloc(_) => None,
        }
    }
}
