use super::{ReplySender, end_cancelled, send_reply};
use crate::server::{
    service::context::RequestContext,
    telemetry::{increment_replies_sent, record_names_per_call},
};
use core::pin::pin;
use futures::{Stream, StreamExt};
use greeter_tonic_core::{
    Error,
    proto::{GreetingReply, GreetingRequest},
    types::{greeting_for, join_names},
};
use tonic::Status;

/// Folds a client stream of names into a single greeting.
///
/// Names are accumulated in arrival order. When the stream completes, the
/// greeting for the comma-joined names is returned. An error item on the
/// stream ends the call with that exact status and no reply. The accumulator
/// is owned by this future and dropped on every exit path.
pub async fn collect_names<S>(ctx: &RequestContext, incoming: S) -> Result<GreetingReply, Status>
where
    S: Stream<Item = Result<GreetingRequest, Status>>,
{
    let mut incoming = pin!(incoming);
    let mut names: Vec<String> = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => {
                return Err(ctx.cancellation_error().into());
            }
            next = incoming.next() => next,
        };

        match next {
            Some(Ok(request)) => names.push(request.name),
            Some(Err(status)) => {
                tracing::debug!(
                    received = names.len(),
                    "client stream failed: {}",
                    status.message()
                );
                return Err(status);
            }
            None => break,
        }
    }

    record_names_per_call(names.len() as f64);
    Ok(greeting_for(&join_names(&names)))
}

/// Answers every request on `incoming` with its greeting, in order.
///
/// Completion of `incoming` completes the outgoing stream (the sender is
/// dropped on return). An error item is forwarded unchanged as the terminal
/// item. Returns the number of replies sent.
///
/// # Errors
///
/// - [`Error::ChannelError`] if the client stopped reading replies.
/// - The context's cancellation error if the call was cancelled, including
///   while waiting for room in a full buffer. It is also forwarded to the
///   client when possible.
pub async fn echo_replies<S>(
    ctx: RequestContext,
    incoming: S,
    resp_tx: ReplySender,
) -> greeter_tonic_core::Result<usize>
where
    S: Stream<Item = Result<GreetingRequest, Status>>,
{
    let mut incoming = pin!(incoming);
    let mut replied = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => {
                return Err(end_cancelled(&ctx, &resp_tx));
            }
            () = resp_tx.closed() => {
                return Err(Error::ChannelError {
                    context: format!("Client disconnected after {replied} replies"),
                });
            }
            next = incoming.next() => next,
        };

        match next {
            Some(Ok(request)) => {
                send_reply(&ctx, &resp_tx, Ok(greeting_for(&request.name))).await?;
                increment_replies_sent(ctx.method());
                replied += 1;
            }
            Some(Err(status)) => {
                tracing::debug!(replied, "client stream failed: {}", status.message());
                send_reply(&ctx, &resp_tx, Err(status)).await?;
                return Ok(replied);
            }
            None => return Ok(replied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::service::context::CallRegistry;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tonic::Code;

    fn context(method: &'static str) -> RequestContext {
        let registry = Arc::new(CallRegistry::default());
        RequestContext::new(registry.begin(method).unwrap(), &CancellationToken::new())
    }

    fn request(name: &str) -> Result<GreetingRequest, Status> {
        Ok(GreetingRequest {
            name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn collects_names_in_arrival_order() {
        let ctx = context("GreetAll");
        let incoming = futures::stream::iter(vec![request("Alice"), request("Bob")]);
        let reply = collect_names(&ctx, incoming).await.unwrap();
        assert_eq!(reply.message, "Hello, Alice, Bob!");
    }

    #[tokio::test]
    async fn collecting_an_empty_stream_greets_nobody() {
        let ctx = context("GreetAll");
        let reply = collect_names(&ctx, futures::stream::empty()).await.unwrap();
        assert_eq!(reply.message, "Hello, !");
    }

    #[tokio::test]
    async fn upstream_error_is_propagated_without_reply() {
        let ctx = context("GreetAll");
        let incoming = futures::stream::iter(vec![
            request("Alice"),
            Err(Status::aborted("client gave up")),
            request("never seen"),
        ]);
        let status = collect_names(&ctx, incoming).await.unwrap_err();
        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(status.message(), "client gave up");
    }

    #[tokio::test]
    async fn collecting_stops_on_cancellation() {
        let ctx = context("GreetAll");
        ctx.cancellation().cancel();
        let status = collect_names(&ctx, futures::stream::pending()).await.unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn echoes_one_reply_per_request_then_completes() {
        let ctx = context("GreetAllAndMany");
        let (tx, mut rx) = mpsc::channel(8);
        let incoming = futures::stream::iter(vec![request("A"), request("B")]);
        let sent = echo_replies(ctx, incoming, tx).await.unwrap();
        assert_eq!(sent, 2);

        assert_eq!(rx.recv().await.unwrap().unwrap().message, "Hello, A!");
        assert_eq!(rx.recv().await.unwrap().unwrap().message, "Hello, B!");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn echo_forwards_upstream_error_verbatim() {
        let ctx = context("GreetAllAndMany");
        let (tx, mut rx) = mpsc::channel(8);
        let incoming = futures::stream::iter(vec![
            request("A"),
            Err(Status::data_loss("torn frame")),
            request("B"),
        ]);
        assert_eq!(echo_replies(ctx, incoming, tx).await.unwrap(), 1);

        assert_eq!(rx.recv().await.unwrap().unwrap().message, "Hello, A!");
        let status = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::DataLoss);
        assert_eq!(status.message(), "torn frame");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn echo_replies_as_requests_arrive() {
        let ctx = context("GreetAllAndMany");
        let (req_tx, req_rx) = mpsc::channel(1);
        let (tx, mut rx) = mpsc::channel(8);
        let task = ctx.spawn(echo_replies(
            ctx.clone(),
            tokio_stream::wrappers::ReceiverStream::new(req_rx),
            tx,
        ));

        req_tx.send(request("first")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().message, "Hello, first!");
        req_tx.send(request("second")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().message, "Hello, second!");

        drop(req_tx);
        assert!(rx.recv().await.is_none());
        assert_eq!(task.await.unwrap(), Ok(2));
    }

    #[tokio::test]
    async fn echo_stops_when_client_stops_reading() {
        let ctx = context("GreetAllAndMany");
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let result = echo_replies(ctx, futures::stream::pending(), tx).await;
        assert!(matches!(result, Err(Error::ChannelError { .. })));
    }

    #[tokio::test]
    async fn cancellation_ends_an_echo_stuck_on_a_full_buffer() {
        let ctx = context("GreetAllAndMany");
        let (tx, mut rx) = mpsc::channel(1);
        let incoming = futures::stream::iter(vec![request("A"), request("B"), request("C")]);
        let task = ctx.spawn(echo_replies(ctx.clone(), incoming, tx));

        // "Hello, A!" fills the buffer; the echo of B waits for room.
        while rx.capacity() > 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        ctx.cancellation().cancel();

        assert_eq!(task.await.unwrap(), Err(Error::RequestCancelled));
        assert_eq!(rx.recv().await.unwrap().unwrap().message, "Hello, A!");
        assert!(rx.recv().await.is_none());
    }
}
