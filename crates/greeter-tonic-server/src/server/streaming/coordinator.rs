use super::{ReplySender, end_cancelled, send_reply};
use crate::server::service::context::RequestContext;
use core::time::Duration;
use greeter_tonic_core::{
    Error,
    types::{build_reply, to_sequenced_message},
};
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// What a server-streaming greeting should emit.
#[derive(Debug, Clone)]
pub struct ReplyPlan {
    pub name: String,
    pub count: u32,
    pub interval: Duration,
}

/// Emits `plan.count` sequenced greetings, one every `plan.interval`.
///
/// The first reply is sent one interval after the call starts. Every signal
/// of the stream (each reply, the terminal error, and completion by dropping
/// `resp_tx`) comes from the task running this function, which is spawned on
/// `ctx`.
///
/// # Behavior
///
/// - Sequence numbers start at 1 and strictly increase.
/// - If the client disconnects, stops at the next tick and returns a
///   [`Error::ChannelError`].
/// - If the call is cancelled, makes a best effort to send the cancellation
///   status to the client, then returns it. This holds while waiting for a
///   tick and while waiting for room in a full buffer.
pub async fn feed_replies(
    ctx: RequestContext,
    plan: ReplyPlan,
    resp_tx: ReplySender,
) -> greeter_tonic_core::Result<u32> {
    let mut ticker = interval_at(Instant::now() + plan.interval, plan.interval);
    // A slow consumer shifts later replies instead of bunching them up.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for sequence in 1..=plan.count {
        tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => {
                return Err(end_cancelled(&ctx, &resp_tx));
            }
            () = resp_tx.closed() => {
                return Err(Error::ChannelError {
                    context: format!("Client disconnected before reply {sequence}"),
                });
            }
            _ = ticker.tick() => {}
        }

        let reply = build_reply(to_sequenced_message(&plan.name, sequence));
        send_reply(&ctx, &resp_tx, Ok(reply)).await?;
    }

    tracing::debug!(replies = plan.count, "server stream completed");
    Ok(plan.count)
}
