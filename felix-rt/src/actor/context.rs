//! Actor context: per-actor identity, broker handle, and batch bookkeeping.

// Layer 1: Standard library imports
use std::marker::PhantomData;
use std::time::Duration;

// Layer 2: Third-party crate imports
use chrono::{DateTime, Utc}; // §3.2 MANDATORY

// Layer 3: Internal module imports
use crate::broker::MessageBroker;
use crate::message::{Message, MessageEnvelope};
use crate::util::{ActorAddress, ActorId};

/// Per-actor context handed to every lifecycle hook and message handler.
///
/// Carries the actor's own address, its injected broker handle (ADR-006),
/// and the identity of the batch currently being processed. The
/// reentrancy guard checks `self_address` against the target of any
/// synchronous send issued from inside a handler to reject an actor
/// calling back into its own in-flight batch.
pub struct ActorContext<M: Message, B: MessageBroker<M>> {
    address: ActorAddress,
    id: ActorId,
    broker: B,
    created_at: DateTime<Utc>,
    /// Monotonically increasing batch counter, incremented once per
    /// `finish_batch` call. Exposed so actors can tag log lines with the
    /// batch they were produced in.
    batch_seq: u64,
    _marker: PhantomData<M>,
}

impl<M: Message, B: MessageBroker<M>> ActorContext<M, B> {
    /// Create a new actor context bound to the given address and broker.
    pub fn new(address: ActorAddress, broker: B) -> Self {
        Self {
            id: *address.id(),
            address,
            broker,
            created_at: Utc::now(), // §3.2
            batch_seq: 0,
            _marker: PhantomData,
        }
    }

    /// The actor's own address.
    pub fn address(&self) -> &ActorAddress {
        &self.address
    }

    /// The actor's own id.
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// When this actor was spawned.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sequence number of the batch currently (or most recently) being
    /// processed. Incremented by the spawn loop right before
    /// `finish_batch` is invoked.
    pub fn batch_seq(&self) -> u64 {
        self.batch_seq
    }

    pub(crate) fn advance_batch(&mut self) {
        self.batch_seq += 1;
    }

    /// Fire-and-forget send to another actor, tagged with this actor as
    /// sender. Does not wait for the message to be handled.
    pub async fn send(&self, envelope: MessageEnvelope<M>) -> Result<(), B::Error> {
        let envelope = envelope.with_sender(self.address.clone());
        self.broker.send(envelope).await
    }

    /// Synchronous request-reply send. Forbidden to target `self` (would
    /// deadlock the batch currently in flight); the actor fabric does not
    /// police this at compile time, so callers must not invoke `request`
    /// against their own address from within `handle_message`.
    pub async fn request<R>(
        &self,
        envelope: MessageEnvelope<M>,
        timeout: Duration,
    ) -> Result<Option<MessageEnvelope<R>>, B::Error>
    where
        R: Message + for<'de> serde::Deserialize<'de>,
    {
        let envelope = envelope.with_sender(self.address.clone());
        self.broker.request(envelope, timeout).await
    }

    /// Borrow the injected broker directly, for actors that need broker
    /// operations beyond `send`/`request` (e.g. registry lookups).
    pub fn broker(&self) -> &B {
        &self.broker
    }
}
