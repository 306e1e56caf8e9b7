//! Error type for [`super::manager::RefCountManager`].

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
// (none)

/// Errors raised while creating or tearing down a refcounted resource.
#[derive(Debug, Error)]
pub enum RefCountError<E: std::error::Error + Send + Sync + 'static> {
    /// The resource's own `spawn` factory failed.
    #[error("failed to create resource: {0}")]
    Create(#[source] E),

    /// The task backing a resource was dropped without completing its
    /// stop handshake (e.g. it panicked). Treated as a creation failure
    /// by any caller waiting on the resource.
    #[error("resource task ended unexpectedly during startup or shutdown")]
    TaskLost,
}
