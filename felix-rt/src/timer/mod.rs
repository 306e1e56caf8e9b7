//! Timer primitives used by the dataplane commit path and the watcher's
//! resync loop.
//!
//! This module contains ONLY module declarations and re-exports.
//! Implementation code is in individual module files:
//!
//! - `retry.rs` - [`RetryOnce`], the dataplane commit's fixed single retry
//! - `resync.rs` - [`JitteredInterval`], the watcher's jittered resync tick

pub mod resync;
pub mod retry;

pub use resync::JitteredInterval;
pub use retry::RetryOnce;
