//! Coordinators for the streaming call shapes.
//!
//! Each coordinator is an explicit async state machine driven by one task on
//! the call's [`RequestContext`]:
//!
//! - [`coordinator::feed_replies`] - timer-driven server stream.
//! - [`processor::collect_names`] - client stream folded into one reply.
//! - [`processor::echo_replies`] - one reply per request, in order.
//!
//! Outgoing streams are backed by bounded `mpsc` channels; dropping the sender
//! completes the stream, and a closed receiver means the client went away.

pub mod coordinator;
pub mod processor;

use crate::server::service::context::RequestContext;
use greeter_tonic_core::{Error, proto::GreetingReply};
use tokio::sync::mpsc;
use tonic::Status;

/// Sending half of an outgoing reply stream.
pub type ReplySender = mpsc::Sender<Result<GreetingReply, Status>>;

/// Queues `item` on the outgoing stream unless the call is cancelled first.
///
/// A client that stops reading leaves the buffer full and the send pending;
/// cancellation still ends the wait.
///
/// # Errors
///
/// - The context's cancellation error if the call was cancelled.
/// - [`Error::ChannelError`] if the client went away.
pub async fn send_reply(
    ctx: &RequestContext,
    resp_tx: &ReplySender,
    item: Result<GreetingReply, Status>,
) -> greeter_tonic_core::Result<()> {
    tokio::select! {
        biased;
        () = ctx.cancellation().cancelled() => Err(end_cancelled(ctx, resp_tx)),
        sent = resp_tx.send(item) => sent.map_err(|e| Error::ChannelError {
            context: format!("Failed to forward reply: {e}"),
        }),
    }
}

/// Queues the cancellation status as the terminal item if the buffer has
/// room, and returns it.
pub fn end_cancelled(ctx: &RequestContext, resp_tx: &ReplySender) -> Error {
    let err = ctx.cancellation_error();
    if let Err(e) = resp_tx.try_send(Err(err.clone().into())) {
        tracing::debug!("Response channel failed to forward cancellation: {e}");
    }
    err
}
