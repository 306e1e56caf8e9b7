//! Batch-draining spawn loop for the actor fabric (§4.1).
//!
//! `run_batch_actor` is the thing that actually honours the contract
//! documented on [`crate::actor::Actor`]: it blocks for the first message,
//! then drains every message already queued behind it with `try_recv`
//! before invoking `finish_batch` once. This is what lets a rule-chain
//! actor coalesce fifty queued rule updates into a single kernel commit
//! instead of fifty.
//!
//! This is deliberately independent of any single shared-broker topology:
//! a fabric made of many distinct actor kinds (tag index, profile
//! manager, one rule-chain actor per IP family, one address-set actor per
//! tag...) doesn't fit a design that multiplexes many actors sharing one
//! message type `M` through one broker. Callers here hold direct, typed
//! [`crate::mailbox::MailboxSender`]
//! handles to the actors they depend on; synchronous replies travel as
//! a `tokio::sync::oneshot::Sender` embedded directly in the message
//! variant, exactly like the `CounterMsg::GetCount` example in the crate
//! root docs.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use tokio::task::JoinHandle;

// Layer 3: Internal module imports
use super::context::ActorContext;
use super::traits::{Actor, ErrorAction};
use crate::broker::MessageBroker;
use crate::mailbox::{MailboxReceiver, TryRecvError};
use crate::message::Message;
use crate::util::ActorAddress;

/// Drive one actor to completion: `pre_start`, then repeated batches of
/// `handle_message` capped off by one `finish_batch`, until the mailbox
/// closes, then `post_stop`.
///
/// Returns once the mailbox is closed and `post_stop` has run. Intended
/// to be the body of a `tokio::spawn`'d task (see [`spawn_batch_actor`]).
pub async fn run_batch_actor<A, R, B>(mut actor: A, mut mailbox: R, mut context: ActorContext<A::Message, B>)
where
    A: Actor,
    R: MailboxReceiver<A::Message>,
    B: MessageBroker<A::Message>,
{
    if let Err(error) = actor.pre_start(&mut context).await {
        match actor.on_error(error, &mut context).await {
            ErrorAction::Resume => {}
            ErrorAction::Stop | ErrorAction::Restart | ErrorAction::Escalate => return,
        }
    }

    loop {
        let Some(first) = mailbox.recv().await else {
            break;
        };

        let mut batch = vec![first];
        loop {
            match mailbox.try_recv() {
                Ok(envelope) => batch.push(envelope),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => break,
            }
        }

        let mut should_stop = false;
        for envelope in batch {
            if let Err(error) = actor.handle_message(envelope.payload, &mut context).await {
                match actor.on_error(error, &mut context).await {
                    ErrorAction::Resume => continue,
                    ErrorAction::Stop | ErrorAction::Restart | ErrorAction::Escalate => {
                        should_stop = true;
                        break;
                    }
                }
            }
        }

        context.advance_batch();
        if let Err(error) = actor.finish_batch(&mut context).await {
            match actor.on_error(error, &mut context).await {
                ErrorAction::Resume => {}
                ErrorAction::Stop | ErrorAction::Restart | ErrorAction::Escalate => {
                    should_stop = true;
                }
            }
        }

        if should_stop {
            break;
        }
    }

    let _ = actor.post_stop(&mut context).await;
}

/// Spawn [`run_batch_actor`] onto the tokio runtime.
pub fn spawn_batch_actor<A, R, B>(
    actor: A,
    mailbox: R,
    address: ActorAddress,
    broker: B,
) -> JoinHandle<()>
where
    A: Actor,
    R: MailboxReceiver<A::Message> + Send + 'static,
    B: MessageBroker<A::Message> + 'static,
{
    let context = ActorContext::new(address, broker);
    tokio::spawn(run_batch_actor(actor, mailbox, context))
}
