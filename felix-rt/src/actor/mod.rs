//! Actor system core with zero-cost abstractions.
//!
//! This module provides the foundational actor components for building
//! concurrent applications using the actor model: a per-message handler
//! plus a once-per-batch coalescing hook.
//!
//! # Components
//!
//! - [`Actor`] - Core trait that all actors must implement
//! - [`ActorContext`] - Actor identity, broker handle, and batch bookkeeping
//! - [`ActorLifecycle`] - State tracking for the actor's own task
//! - [`ActorState`] - Lifecycle state enum (Starting, Running, Stopping, ...)
//! - [`ErrorAction`] - Per-error decision enum (Stop, Resume, Restart, Escalate)
//!
//! # Actor Model Basics
//!
//! Actors are independent units of computation that:
//! - Maintain isolated state (no shared memory)
//! - Communicate via asynchronous message passing
//! - Process messages in a batch: drain everything pending, handle each,
//!   then run `finish_batch` once
//! - Follow a defined lifecycle (pre_start → handle_message* → finish_batch
//!   → ... → post_stop)
//!
//! # Module Organization
//!
//! This mod.rs file contains ONLY module declarations and re-exports.
//! Implementation code is in individual module files:
//!
//! - `traits.rs` - Actor trait and ErrorAction enum
//! - `context.rs` - ActorContext implementation
//! - `lifecycle.rs` - ActorLifecycle and ActorState
//!
//! # See Also
//!
//! - [`message`](crate::message) - Message system for actor communication
//! - [`broker`](crate::broker) - Message routing between actors
//! - [`refcount`](crate::refcount) - Shared-ownership lifecycle for actors
//!   addressed by an application-defined id

pub mod context;
pub mod lifecycle;
pub mod spawn;
pub mod traits;

pub use context::ActorContext;
pub use lifecycle::{ActorLifecycle, ActorState};
pub use spawn::{run_batch_actor, spawn_batch_actor};
pub use traits::{Actor, ErrorAction};
