//! Small runtime helpers shared by all actors.
//!
//! Three pieces glue the actor layer together:
//!
//! - [`ask`]: request/response with a deadline, mapped onto typed
//!   errors. On timeout the reply port is simply dropped; the callee
//!   discovers the dead channel on send and discards the result.
//! - [`start_ticker`]: periodic self-messages driving autonomous actor
//!   behavior (the plate state machine, mover position polling).
//! - [`forward_events`]: pumps a bus subscription into an actor's
//!   mailbox, translating events to typed messages.

use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{ActorRef, Message, RpcReplyPort};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use planar_events::{Event, EventSubscription};

use crate::actors::errors::ActorError;

/// Request/response with a deadline.
pub async fn ask<TMsg, TReply, F>(
    actor: &ActorRef<TMsg>,
    build: F,
    timeout: Duration,
) -> Result<TReply, ActorError>
where
    TMsg: Message,
    TReply: Send + 'static,
    F: FnOnce(RpcReplyPort<TReply>) -> TMsg,
{
    match actor.call(build, Some(timeout)).await {
        Ok(CallResult::Success(reply)) => Ok(reply),
        Ok(CallResult::Timeout) => Err(ActorError::AskTimeout(timeout)),
        Ok(CallResult::SenderError) => Err(ActorError::ActorUnavailable),
        Err(e) => Err(ActorError::channel(e.to_string())),
    }
}

/// Like [`ask`], for callees that reply with a business `Result`.
pub async fn ask_flat<TMsg, TOk, F>(
    actor: &ActorRef<TMsg>,
    build: F,
    timeout: Duration,
) -> Result<TOk, ActorError>
where
    TMsg: Message,
    TOk: Send + 'static,
    F: FnOnce(RpcReplyPort<Result<TOk, ActorError>>) -> TMsg,
{
    ask(actor, build, timeout).await.and_then(|inner| inner)
}

/// Handle for stopping a ticker task.
#[derive(Clone)]
pub struct TickHandle {
    stop_tx: watch::Sender<bool>,
}

impl TickHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Send `make()` to `target` every `interval` until stopped or the
/// target goes away.
pub fn start_ticker<TMsg, F>(target: ActorRef<TMsg>, interval: Duration, make: F) -> TickHandle
where
    TMsg: Message,
    F: Fn() -> TMsg + Send + 'static,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if target.send_message(make()).is_err() {
                        break;
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    TickHandle { stop_tx }
}

/// Forward bus events into an actor mailbox.
///
/// Events for which `map` returns `None` are dropped. The task ends
/// when the subscription closes or the actor stops accepting messages.
pub fn forward_events<TMsg, F>(
    mut subscription: EventSubscription,
    target: ActorRef<TMsg>,
    map: F,
) -> JoinHandle<()>
where
    TMsg: Message,
    F: Fn(&Event) -> Option<TMsg> + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(event) = subscription.recv().await {
            if let Some(message) = map(&event) {
                if target.send_message(message).is_err() {
                    debug!(event_type = %event.event_type, "forward target gone, stopping");
                    break;
                }
            }
        }
    })
}
