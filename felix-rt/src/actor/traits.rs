//! Core Actor trait with batch message processing and generic constraints
//! for zero-cost abstractions.
//!
//! This module provides the foundational `Actor` trait that all actors must
//! implement, along with the `ErrorAction` enum for supervision decisions.
//!
//! # Batch processing
//!
//! An actor's spawn loop ([`crate::actor::spawn::run_batch_actor`]) drains
//! every currently pending message into a batch before invoking the
//! actor, calls
//! `handle_message` once per message in arrival order, then calls
//! `finish_batch` exactly once after the batch is drained. This lets
//! actors that own expensive external resources (a kernel table, an
//! address-set) coalesce many logical updates into a single commit instead
//! of committing once per message.
//!
//! # Design Philosophy
//!
//! - **Zero-cost abstractions**: Generic constraints instead of trait objects
//! - **Type safety**: Associated types for Message and Error
//! - **Supervision**: `ErrorAction` enum for per-message fault handling
//! - **Batching**: `finish_batch` runs once per drained batch, not per message

// Layer 1: Standard library imports
use std::error::Error;

// Layer 2: Third-party crate imports
use async_trait::async_trait;

// Layer 3: Internal module imports
use super::context::ActorContext;
use crate::message::Message;

/// Core Actor trait with batch-oriented message processing.
///
/// All actors must implement this trait to participate in the actor
/// fabric. `handle_message` is invoked once per message within a batch;
/// `finish_batch` runs once after every message in the batch has been
/// handled, and is where an actor should perform work that is cheap to do
/// once but expensive to repeat per message (e.g. committing a dataplane
/// rewrite).
#[async_trait]
pub trait Actor: Send + Sync + 'static {
    /// The type of messages this actor can handle.
    type Message: Message;

    /// The error type returned by actor operations.
    type Error: Error + Send + Sync + 'static;

    /// Handle a single message drawn from the current batch.
    ///
    /// Errors are recorded against that message's completion signal (if
    /// any) and do not abort the rest of the batch — `finish_batch` still
    /// runs once the batch is fully drained.
    async fn handle_message<B: crate::broker::MessageBroker<Self::Message>>(
        &mut self,
        message: Self::Message,
        context: &mut ActorContext<Self::Message, B>,
    ) -> Result<(), Self::Error>;

    /// Called exactly once after every message in the current batch has
    /// been passed to `handle_message`, before the actor blocks again
    /// waiting for the next batch.
    ///
    /// Default implementation does nothing; actors that do not need
    /// batch-level coalescing (the common case for simple actors) never
    /// need to override it.
    async fn finish_batch<B: crate::broker::MessageBroker<Self::Message>>(
        &mut self,
        _context: &mut ActorContext<Self::Message, B>,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Lifecycle hook called before the actor starts receiving messages.
    ///
    /// Default implementation does nothing and returns `Ok(())`.
    async fn pre_start<B: crate::broker::MessageBroker<Self::Message>>(
        &mut self,
        _context: &mut ActorContext<Self::Message, B>,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Lifecycle hook called when the actor is stopping.
    ///
    /// Default implementation does nothing and returns `Ok(())`.
    async fn post_stop<B: crate::broker::MessageBroker<Self::Message>>(
        &mut self,
        _context: &mut ActorContext<Self::Message, B>,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Handle an error raised by `handle_message` or `finish_batch` and
    /// return a supervision decision.
    ///
    /// Default implementation returns `ErrorAction::Stop`.
    async fn on_error<B: crate::broker::MessageBroker<Self::Message>>(
        &mut self,
        _error: Self::Error,
        _context: &mut ActorContext<Self::Message, B>,
    ) -> ErrorAction {
        ErrorAction::Stop
    }
}

/// Supervision decision returned by `Actor::on_error`.
///
/// There is no in-place restart machinery in this fabric (no supervision
/// tree): `Restart` and `Escalate` are both treated by the spawn loop as
/// "stop this actor's task", since the only recovery path available is a
/// whole-process restart by the init system. The variants are kept
/// distinct so `on_error` implementations can still express intent and so
/// logs distinguish the two cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Stop the actor permanently; no further messages are processed.
    Stop,

    /// Resume processing, ignoring the error.
    Resume,

    /// Restart was requested. There is no actor-level restart in this
    /// fabric; this is equivalent to `Stop` but distinguishes "transient,
    /// unrecoverable at this layer" from `Stop`'s "permanent" in logs.
    Restart,

    /// Escalate: equivalent to `Stop`, but signals to logs/monitoring that
    /// the failure is severe enough that a human should look at it.
    Escalate,
}

impl Default for ErrorAction {
    fn default() -> Self {
        Self::Stop
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::InMemoryMessageBroker;
    use crate::mailbox::metrics::AtomicMetrics;
    use crate::mailbox::UnboundedMailboxSender;
    use crate::util::ActorAddress;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestMessage {
        #[allow(dead_code)]
        content: String,
    }

    impl Message for TestMessage {
        const MESSAGE_TYPE: &'static str = "test";
    }

    #[derive(Debug)]
    struct TestError {
        #[allow(dead_code)]
        message: String,
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Test error: {}", self.message)
        }
    }

    impl Error for TestError {}

    type TestSender = UnboundedMailboxSender<TestMessage, AtomicMetrics>;
    type TestBroker = InMemoryMessageBroker<TestMessage, TestSender>;

    struct TestActor {
        message_count: u32,
        finish_batch_count: u32,
        should_fail: bool,
    }

    #[async_trait]
    impl Actor for TestActor {
        type Message = TestMessage;
        type Error = TestError;

        async fn handle_message<B: crate::broker::MessageBroker<Self::Message>>(
            &mut self,
            _message: Self::Message,
            _context: &mut ActorContext<Self::Message, B>,
        ) -> Result<(), Self::Error> {
            if self.should_fail {
                return Err(TestError {
                    message: "intentional failure".to_string(),
                });
            }
            self.message_count += 1;
            Ok(())
        }

        async fn finish_batch<B: crate::broker::MessageBroker<Self::Message>>(
            &mut self,
            _context: &mut ActorContext<Self::Message, B>,
        ) -> Result<(), Self::Error> {
            self.finish_batch_count += 1;
            Ok(())
        }

        async fn on_error<B: crate::broker::MessageBroker<Self::Message>>(
            &mut self,
            _error: Self::Error,
            _context: &mut ActorContext<Self::Message, B>,
        ) -> ErrorAction {
            if self.message_count < 3 {
                ErrorAction::Restart
            } else {
                ErrorAction::Stop
            }
        }
    }

    #[tokio::test]
    async fn handle_message_success_increments_counter() {
        let mut actor = TestActor {
            message_count: 0,
            finish_batch_count: 0,
            should_fail: false,
        };
        let address = ActorAddress::anonymous();
        let broker = TestBroker::new();
        let mut context = ActorContext::new(address, broker);

        let message = TestMessage {
            content: "test".to_string(),
        };

        let result = actor.handle_message(message, &mut context).await;
        assert!(result.is_ok());
        assert_eq!(actor.message_count, 1);
    }

    #[tokio::test]
    async fn handle_message_failure_is_reported() {
        let mut actor = TestActor {
            message_count: 0,
            finish_batch_count: 0,
            should_fail: true,
        };
        let address = ActorAddress::anonymous();
        let broker = TestBroker::new();
        let mut context = ActorContext::new(address, broker);

        let message = TestMessage {
            content: "test".to_string(),
        };

        let result = actor.handle_message(message, &mut context).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn finish_batch_runs_once_per_batch() {
        let mut actor = TestActor {
            message_count: 0,
            finish_batch_count: 0,
            should_fail: false,
        };
        let address = ActorAddress::anonymous();
        let broker = TestBroker::new();
        let mut context = ActorContext::new(address, broker);

        for _ in 0..3 {
            let message = TestMessage {
                content: "test".to_string(),
            };
            actor.handle_message(message, &mut context).await.unwrap();
        }
        actor.finish_batch(&mut context).await.unwrap();

        assert_eq!(actor.message_count, 3);
        assert_eq!(actor.finish_batch_count, 1);
    }

    #[test]
    fn error_action_default_is_stop() {
        assert_eq!(ErrorAction::default(), ErrorAction::Stop);
    }

    #[test]
    fn error_action_equality() {
        assert_eq!(ErrorAction::Stop, ErrorAction::Stop);
        assert_ne!(ErrorAction::Stop, ErrorAction::Resume);
        assert_ne!(ErrorAction::Restart, ErrorAction::Escalate);
    }
}
