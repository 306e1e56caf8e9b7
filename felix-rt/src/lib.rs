//! # felix-rt - a small actor-fabric runtime
//!
//! Batch-draining mailboxes, an in-memory message broker, and the
//! reference-counting and timer primitives that a single-process
//! reconciliation agent needs to serialise access to shared dataplane
//! state without a server-grade actor system on top.
//!
//! # Module Organization
//!
//! - [`actor`] - Actor trait, lifecycle, and the batch-draining run loop
//! - [`message`] - Message trait, envelopes, and priority system
//! - [`mailbox`] - Message queuing with backpressure control
//! - [`broker`] - Message routing between registered actor addresses
//! - [`refcount`] - Reference-counted lifecycle for shared resources
//! - [`monitoring`] - Event tracking for observability
//! - [`timer`] - Jittered intervals and single-retry backoff helpers
//! - [`util`] - Utilities (ActorAddress, ActorId, MessageId)
//! - [`prelude`] - Convenience re-exports of the above
//!
//! ## Separation of Concerns
//! - **Actor**: defines message handling logic only
//! - **Message**: defines message type and metadata
//! - **Mailbox**: manages message queuing and backpressure
//! - **Broker**: routes messages between actors, hidden from actors
//!
//! Generic `MessageBroker<M>` parameters throughout keep dispatch
//! monomorphized rather than routed through `dyn` trait objects.

pub mod actor;
pub mod broker;
pub mod mailbox;
pub mod message;
pub mod monitoring;
pub mod prelude;
pub mod refcount;
pub mod timer;
pub mod util;

// Re-export commonly used types
pub use actor::{
    run_batch_actor, spawn_batch_actor, Actor, ActorContext, ActorLifecycle, ActorState,
    ErrorAction,
};
pub use broker::{ActorRegistry, BrokerError, InMemoryMessageBroker, MessageBroker, PoolStrategy};
pub use mailbox::{
    BackpressureStrategy, BoundedMailbox, BoundedMailboxSender, MailboxCapacity, MailboxError,
    MailboxReceiver, MailboxSender, TryRecvError, UnboundedMailbox, UnboundedMailboxSender,
};
pub use message::{Message, MessageEnvelope, MessagePriority};
pub use monitoring::{
    ActorEvent, ActorEventKind, BrokerEvent, BrokerEventKind, EventSeverity, InMemoryMonitor,
    MailboxEvent, MailboxEventKind, Monitor, MonitoringConfig, MonitoringError, MonitoringEvent,
    MonitoringSnapshot, NoopMonitor, SupervisionEvent, SupervisionEventKind, SystemEvent,
    SystemEventKind,
};
pub use refcount::{RefCountError, RefCountManager, RefCountedResource};
pub use timer::{JitteredInterval, RetryOnce};
pub use util::{ActorAddress, ActorId, MessageId};
