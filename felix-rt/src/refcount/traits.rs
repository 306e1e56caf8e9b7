//! The [`RefCountedResource`] trait: how a [`super::manager::RefCountManager`]
//! creates and tears down the thing it counts references to.

// Layer 1: Standard library imports
use std::error::Error;
use std::hash::Hash;

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use tokio::task::JoinHandle;

// Layer 3: Internal module imports
// (none)

/// A resource keyed by `Id` whose lifetime is driven by a reference count
/// rather than by an owning actor's own address.
///
/// This is the generic shape behind the endpoint manager's per-endpoint
/// dataplane state (referenced by every profile an endpoint belongs to)
/// and the tag index's per-tag address sets (referenced by every profile
/// whose rules mention the tag): many independent owners, the resource
/// exists exactly while at least one of them is interested in it, and
/// tearing it down is itself asynchronous (a kernel commit, a final
/// message drain) rather than instantaneous.
#[async_trait]
pub trait RefCountedResource: Send + Sync + 'static {
    /// Identifies one instance of the resource (a tag name, an endpoint id, ...).
    type Id: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static;

    /// A cheaply cloneable live handle to a running instance (typically a
    /// mailbox sender for the actor backing it).
    type Handle: Clone + Send + Sync + 'static;

    /// Error returned when creation fails.
    type Error: Error + Send + Sync + 'static;

    /// Bring up a new instance of the resource for `id`.
    ///
    /// Returns a live handle plus the [`JoinHandle`] of the task backing
    /// it, so the manager can tell when the instance has actually gone
    /// away (as opposed to merely being asked to).
    async fn spawn(&self, id: &Self::Id) -> Result<(Self::Handle, JoinHandle<()>), Self::Error>;

    /// Ask a running instance to begin stopping. Called exactly once,
    /// the moment the refcount for `id` drops to zero. The instance is
    /// considered fully stopped only once the [`JoinHandle`] returned
    /// from [`spawn`](Self::spawn) resolves.
    async fn request_stop(&self, handle: &Self::Handle);
}
