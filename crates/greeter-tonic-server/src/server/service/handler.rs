//! gRPC service implementation for the greeter.
//!
//! [`GreetingService`] implements the generated [`Greeter`] trait in every
//! call shape gRPC offers:
//!
//! | RPC               | shape                   | executes on                     |
//! |-------------------|-------------------------|---------------------------------|
//! | `Greet`           | unary                   | the calling task                |
//! | `GreetLazy`       | unary, delayed          | a timer on the call's context   |
//! | `GreetBlocking`   | unary, delayed          | the runtime's blocking threads  |
//! | `GreetMany`       | server streaming        | a ticker task on the context    |
//! | `GreetAll`        | client streaming        | the calling task                |
//! | `GreetAllAndMany` | bidirectional streaming | a task on the call's context    |
//!
//! Only `Greet` validates its input. `GreetLazy` and `GreetBlocking` greet an
//! empty name as-is.

use crate::server::{
    config::ServerConfig,
    service::context::{CallRegistry, RequestContext},
    streaming::{
        ReplySender,
        coordinator::{ReplyPlan, feed_replies},
        processor::{collect_names, echo_replies},
    },
    telemetry::{increment_call_errors, increment_replies_sent},
};
use core::pin::Pin;
use futures::TryStreamExt;
use greeter_tonic_core::{
    Error,
    proto::{GreetingReply, GreetingRequest, greeter_server::Greeter},
    types::{EMPTY_NAME_REASON, greeting_for},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

const GREET: &str = "Greet";
const GREET_LAZY: &str = "GreetLazy";
const GREET_BLOCKING: &str = "GreetBlocking";
const GREET_MANY: &str = "GreetMany";
const GREET_ALL: &str = "GreetAll";
const GREET_ALL_AND_MANY: &str = "GreetAllAndMany";

type ReplyStream = Pin<Box<dyn Stream<Item = Result<GreetingReply, Status>> + Send>>;
type ReplyReceiver = mpsc::Receiver<Result<GreetingReply, Status>>;

/// gRPC greeter service.
///
/// Cheap to clone; clones share the call registry and the shutdown token.
#[derive(Clone)]
pub struct GreetingService {
    config: ServerConfig,
    calls: Arc<CallRegistry>,
    shutdown_token: CancellationToken,
}

impl GreetingService {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            calls: Arc::new(CallRegistry::default()),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Number of calls currently in flight.
    pub fn inflight_calls(&self) -> usize {
        self.calls.inflight()
    }

    /// Gracefully shuts the service down.
    ///
    /// 1. Refuses new calls with `UNAVAILABLE`.
    /// 2. Waits up to `shutdown_timeout` for in-flight calls to finish.
    /// 3. Cancels whatever is left; those calls end with `UNAVAILABLE`.
    pub async fn shutdown(&self) {
        if !self.calls.is_accepting() {
            tracing::debug!("Shutdown already in progress");
            return;
        }

        tracing::info!("Refusing new calls");
        self.calls.refuse_new();

        tracing::info!("Draining in-flight calls ({} active)", self.inflight_calls());
        if self.calls.drain(self.config.shutdown_timeout).await {
            tracing::debug!("All in-flight calls drained successfully");
        } else {
            tracing::warn!(
                "Graceful drain timed out ({} calls still active)",
                self.inflight_calls()
            );
        }

        tracing::debug!("Cancelling remaining calls via shutdown token");
        self.shutdown_token.cancel();
    }

    fn begin_call(&self, method: &'static str) -> Result<RequestContext, Status> {
        let guard = self.calls.begin(method).inspect_err(|_| increment_call_errors(method))?;
        Ok(RequestContext::new(guard, &self.shutdown_token))
    }

    fn reply_channel(&self) -> (ReplySender, ReplyReceiver) {
        mpsc::channel(self.config.stream_buffer_size)
    }
}

fn task_failed(err: JoinError) -> Error {
    Error::ChannelError {
        context: format!("Call task failed: {err}"),
    }
}

fn reply_stream(method: &'static str, rx: ReplyReceiver) -> ReplyStream {
    let stream = ReceiverStream::new(rx)
        .inspect_ok(move |_| increment_replies_sent(method))
        .inspect_err(move |_| increment_call_errors(method));
    Box::pin(stream)
}

#[tonic::async_trait]
impl Greeter for GreetingService {
    type GreetManyStream = ReplyStream;
    type GreetAllAndManyStream = ReplyStream;

    /// Greets immediately; rejects an empty name with `INVALID_ARGUMENT`.
    #[tracing::instrument(skip_all, fields(name = %req.get_ref().name))]
    async fn greet(
        &self,
        req: Request<GreetingRequest>,
    ) -> Result<Response<GreetingReply>, Status> {
        let _ctx = self.begin_call(GREET)?;
        let name = req.into_inner().name;

        if name.is_empty() {
            increment_call_errors(GREET);
            return Err(Error::InvalidArgument {
                reason: EMPTY_NAME_REASON.to_string(),
            }
            .into());
        }

        increment_replies_sent(GREET);
        Ok(Response::new(greeting_for(&name)))
    }

    /// Greets after `lazy_delay`, using a timer on the call's context.
    #[tracing::instrument(skip_all, fields(name = %req.get_ref().name))]
    async fn greet_lazy(
        &self,
        req: Request<GreetingRequest>,
    ) -> Result<Response<GreetingReply>, Status> {
        let ctx = self.begin_call(GREET_LAZY)?;
        // If the client goes away, tonic drops this future and the guard
        // cancels the pending timer.
        let _cancel_on_drop = ctx.cancellation().clone().drop_guard();
        let name = req.into_inner().name;
        if name.is_empty() {
            tracing::debug!("Lazy greeting for an empty name");
        }

        let scheduled = ctx.schedule_after(self.config.lazy_delay, move |ctx| async move {
            tracing::debug!(call_id = ctx.id(), "Lazy greeting fired");
            greeting_for(&name)
        });

        match scheduled.await.map_err(task_failed).and_then(|res| res) {
            Ok(reply) => {
                increment_replies_sent(GREET_LAZY);
                Ok(Response::new(reply))
            }
            Err(e) => {
                increment_call_errors(GREET_LAZY);
                Err(e.into())
            }
        }
    }

    /// Greets after blocking one of the runtime's blocking threads for
    /// `lazy_delay`. The calling task only awaits the reply, and stops
    /// waiting as soon as the call is cancelled.
    #[tracing::instrument(skip_all, fields(name = %req.get_ref().name))]
    async fn greet_blocking(
        &self,
        req: Request<GreetingRequest>,
    ) -> Result<Response<GreetingReply>, Status> {
        let ctx = self.begin_call(GREET_BLOCKING)?;
        let _cancel_on_drop = ctx.cancellation().clone().drop_guard();
        let name = req.into_inner().name;
        if name.is_empty() {
            tracing::debug!("Blocking greeting for an empty name");
        }

        let delay = self.config.lazy_delay;
        let cancel = ctx.cancellation().clone();
        let work = ctx.spawn_blocking(move || {
            if cancel.is_cancelled() {
                tracing::debug!("Skipping abandoned blocking greeting");
                return None;
            }
            std::thread::sleep(delay);
            Some(greeting_for(&name))
        });

        let result = tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => Err(ctx.cancellation_error()),
            joined = work => joined
                .map_err(task_failed)
                .and_then(|reply| reply.ok_or_else(|| ctx.cancellation_error())),
        };

        match result {
            Ok(reply) => {
                increment_replies_sent(GREET_BLOCKING);
                Ok(Response::new(reply))
            }
            Err(e) => {
                increment_call_errors(GREET_BLOCKING);
                Err(e.into())
            }
        }
    }

    /// Streams `stream_count` sequenced greetings, one every
    /// `stream_interval`.
    #[tracing::instrument(skip_all, fields(name = %req.get_ref().name))]
    async fn greet_many(
        &self,
        req: Request<GreetingRequest>,
    ) -> Result<Response<Self::GreetManyStream>, Status> {
        let ctx = self.begin_call(GREET_MANY)?;
        let plan = ReplyPlan {
            name: req.into_inner().name,
            count: self.config.stream_count,
            interval: self.config.stream_interval,
        };

        let (resp_tx, resp_rx) = self.reply_channel();
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            if let Err(e) = feed_replies(task_ctx, plan, resp_tx).await {
                tracing::warn!("Server stream ended early: {e}");
            }
        });

        Ok(Response::new(reply_stream(GREET_MANY, resp_rx)))
    }

    /// Collects every name on the request stream and greets them all at once.
    #[tracing::instrument(skip_all)]
    async fn greet_all(
        &self,
        req: Request<Streaming<GreetingRequest>>,
    ) -> Result<Response<GreetingReply>, Status> {
        let ctx = self.begin_call(GREET_ALL)?;
        let _cancel_on_drop = ctx.cancellation().clone().drop_guard();

        let reply = collect_names(&ctx, req.into_inner())
            .await
            .inspect_err(|_| increment_call_errors(GREET_ALL))?;

        increment_replies_sent(GREET_ALL);
        Ok(Response::new(reply))
    }

    /// Greets every request on the stream as soon as it arrives.
    #[tracing::instrument(skip_all)]
    async fn greet_all_and_many(
        &self,
        req: Request<Streaming<GreetingRequest>>,
    ) -> Result<Response<Self::GreetAllAndManyStream>, Status> {
        let ctx = self.begin_call(GREET_ALL_AND_MANY)?;
        let incoming = req.into_inner();

        let (resp_tx, resp_rx) = self.reply_channel();
        let task_ctx = ctx.clone();
        ctx.spawn(async move {
            match echo_replies(task_ctx, incoming, resp_tx).await {
                Ok(replied) => tracing::debug!(replied, "Bidirectional stream completed"),
                Err(e) => tracing::warn!("Bidirectional stream ended early: {e}"),
            }
        });

        // Replies are counted by `echo_replies`; only errors are counted here.
        let stream = ReceiverStream::new(resp_rx)
            .inspect_err(|_| increment_call_errors(GREET_ALL_AND_MANY));
        Ok(Response::new(Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router::LocalServer;
    use core::time::Duration;
    use tokio_stream::StreamExt;
    use tonic::Code;

    fn config() -> ServerConfig {
        ServerConfig {
            lazy_delay: Duration::from_millis(200),
            stream_interval: Duration::from_millis(20),
            stream_count: 5,
            stream_buffer_size: 4,
            shutdown_timeout: Duration::from_millis(200),
            ..ServerConfig::default()
        }
    }

    fn request(name: &str) -> Request<GreetingRequest> {
        Request::new(GreetingRequest {
            name: name.to_string(),
        })
    }

    fn named(name: &str) -> GreetingRequest {
        GreetingRequest {
            name: name.to_string(),
        }
    }

    async fn wait_for_inflight(service: &GreetingService, calls: usize) {
        while service.inflight_calls() < calls {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn greet_formats_name() {
        let service = GreetingService::new(config());
        let reply = service.greet(request("Alice")).await.unwrap().into_inner();
        assert_eq!(reply.message, "Hello, Alice!");
        assert_eq!(service.inflight_calls(), 0);
    }

    #[tokio::test]
    async fn greet_rejects_empty_name() {
        let service = GreetingService::new(config());
        let status = service.greet(request("")).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "Name cannot be empty");
    }

    #[tokio::test(start_paused = true)]
    async fn greet_lazy_waits_for_the_default_delay() {
        let service = GreetingService::new(ServerConfig::default());
        let started = tokio::time::Instant::now();
        let reply = service.greet_lazy(request("Alice")).await.unwrap().into_inner();
        assert_eq!(reply.message, "Hello, Alice!");
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn greet_lazy_does_not_validate() {
        let service = GreetingService::new(config());
        let reply = service.greet_lazy(request("")).await.unwrap().into_inner();
        assert_eq!(reply.message, "Hello, !");
    }

    #[tokio::test]
    async fn greet_blocking_matches_lazy_output() {
        let service = GreetingService::new(config());
        let started = std::time::Instant::now();
        let reply = service.greet_blocking(request("Dan")).await.unwrap().into_inner();
        assert_eq!(reply.message, "Hello, Dan!");
        assert!(started.elapsed() >= config().lazy_delay);
    }

    #[tokio::test]
    async fn concurrent_blocking_greetings_do_not_queue() {
        let service = GreetingService::new(ServerConfig {
            lazy_delay: Duration::from_millis(500),
            ..config()
        });
        let started = std::time::Instant::now();

        let calls = (0..16).map(|i| {
            let service = service.clone();
            tokio::spawn(async move { service.greet_blocking(request(&format!("n{i}"))).await })
        });
        for (i, call) in futures::future::join_all(calls).await.into_iter().enumerate() {
            let reply = call.unwrap().unwrap().into_inner();
            assert_eq!(reply.message, format!("Hello, n{i}!"));
        }

        // Sixteen sleeps of one delay each, all in parallel.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(1_000), "{elapsed:?}");
    }

    #[tokio::test]
    async fn calls_are_refused_after_shutdown() {
        let service = GreetingService::new(config());
        service.shutdown().await;

        let status = service.greet(request("late")).await.unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn shutdown_cancels_calls_that_outlive_the_drain() {
        let service = GreetingService::new(ServerConfig {
            lazy_delay: Duration::from_secs(30),
            ..config()
        });

        let pending = tokio::spawn({
            let service = service.clone();
            async move { service.greet_lazy(request("slow")).await }
        });
        wait_for_inflight(&service, 1).await;

        service.shutdown().await;
        let status = pending.await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn shutdown_cancels_blocking_calls_that_outlive_the_drain() {
        let service = GreetingService::new(ServerConfig {
            lazy_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(100),
            ..config()
        });
        let started = std::time::Instant::now();

        let pending = tokio::spawn({
            let service = service.clone();
            async move { service.greet_blocking(request("slow")).await }
        });
        wait_for_inflight(&service, 1).await;

        service.shutdown().await;
        let status = pending.await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(service.inflight_calls(), 0);
    }

    #[tokio::test]
    async fn end_to_end_unary_calls() {
        let server = LocalServer::start(GreetingService::new(config())).await;
        let mut client = server.greeter();

        let reply = client.greet(named("Alice")).await.unwrap().into_inner();
        assert_eq!(reply.message, "Hello, Alice!");

        let status = client.greet(named("")).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "Name cannot be empty");

        let started = std::time::Instant::now();
        let reply = client.greet_lazy(named("Lazy")).await.unwrap().into_inner();
        assert_eq!(reply.message, "Hello, Lazy!");
        assert!(started.elapsed() >= config().lazy_delay);

        let started = std::time::Instant::now();
        let reply = client.greet_blocking(named("Blocky")).await.unwrap().into_inner();
        assert_eq!(reply.message, "Hello, Blocky!");
        assert!(started.elapsed() >= config().lazy_delay);
    }

    #[tokio::test]
    async fn end_to_end_server_stream() {
        let server = LocalServer::start(GreetingService::new(config())).await;

        let messages: Vec<String> = server
            .greeter()
            .greet_many(named("Bob"))
            .await
            .unwrap()
            .into_inner()
            .map(|reply| reply.unwrap().message)
            .collect()
            .await;

        let expected: Vec<String> = (1..=5)
            .map(|i| format!("Hello, Bob! (sequence: {i})"))
            .collect();
        assert_eq!(messages, expected);
    }

    #[tokio::test]
    async fn end_to_end_client_stream() {
        let server = LocalServer::start(GreetingService::new(config())).await;

        let outbound = tokio_stream::iter(vec![named("Alice"), named("Bob")]);
        let reply = server.greeter().greet_all(outbound).await.unwrap().into_inner();
        assert_eq!(reply.message, "Hello, Alice, Bob!");
    }

    #[tokio::test]
    async fn end_to_end_bidirectional_stream() {
        let server = LocalServer::start(GreetingService::new(config())).await;

        let (req_tx, req_rx) = mpsc::channel(4);
        let mut inbound = server
            .greeter()
            .greet_all_and_many(ReceiverStream::new(req_rx))
            .await
            .unwrap()
            .into_inner();

        req_tx.send(named("A")).await.unwrap();
        assert_eq!(inbound.message().await.unwrap().unwrap().message, "Hello, A!");
        req_tx.send(named("B")).await.unwrap();
        assert_eq!(inbound.message().await.unwrap().unwrap().message, "Hello, B!");

        drop(req_tx);
        assert!(inbound.message().await.unwrap().is_none());
    }
}
