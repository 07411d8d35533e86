//! Unified error type for admission-gated calls.

use std::fmt;

use crate::breaker::ServiceUnavailable;
use crate::shedder::ServiceOverloaded;

/// Error returned by the call wrappers and middleware: either an admission
/// gate refused the call, or the wrapped operation itself failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error<E> {
    /// The breaker decided to fast-fail the call.
    Unavailable,
    /// The shedder refused the call under overload.
    Overloaded,
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "circuit breaker is open"),
            Self::Overloaded => write!(f, "service overloaded"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Error<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> Error<E> {
    /// Check if the breaker refused the call.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Check if the shedder refused the call.
    pub fn is_overloaded(&self) -> bool {
        matches!(self, Self::Overloaded)
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<ServiceUnavailable> for Error<E> {
    fn from(_: ServiceUnavailable) -> Self {
        Self::Unavailable
    }
}

impl<E> From<ServiceOverloaded> for Error<E> {
    fn from(_: ServiceOverloaded) -> Self {
        Self::Overloaded
    }
}
