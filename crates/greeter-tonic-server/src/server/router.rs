//! gRPC router assembly.
//!
//! Every listener the binary supports is served through [`serve`], which
//! mounts the greeter next to the health and reflection services behind
//! permissive CORS and gRPC-Web translation. Shutdown follows one sequence
//! regardless of what triggered it:
//!
//! 1. Health reports `NOT_SERVING` for `greeter.Greeter`.
//! 2. [`GreetingService::shutdown`] refuses, drains, then cancels calls.
//! 3. The transport stops accepting connections and finishes gracefully.

use crate::server::service::handler::GreetingService;
use core::future::Future;
use futures::Stream;
use greeter_tonic_core::proto::{FILE_DESCRIPTOR_SET, greeter_server::GreeterServer};
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

/// Wraps the service with every compression encoding the server speaks.
pub fn build_greeter_service(service: GreetingService) -> GreeterServer<GreetingService> {
    GreeterServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

/// Serves `service` on `incoming` until `signal` resolves, then shuts down.
///
/// # Errors
///
/// Returns an error if the reflection service cannot be built or the
/// transport fails.
pub async fn serve<I, IO, IE, F>(
    incoming: I,
    service: GreetingService,
    signal: F,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
    F: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<GreeterServer<GreetingService>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let shutdown = {
        let service = service.clone();
        async move {
            signal.await;
            health_reporter
                .set_not_serving::<GreeterServer<GreetingService>>()
                .await;
            service.shutdown().await;
        }
    };

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_greeter_service(service))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    tracing::info!("Service shut down successfully");
    Ok(())
}

/// Serves on a Unix domain socket at `path`, removing the socket file once
/// the server stops.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or [`serve`] fails.
#[cfg(unix)]
pub async fn serve_uds<F>(path: &str, service: GreetingService, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    use tokio::net::UnixListener;
    use tokio_stream::wrappers::UnixListenerStream;

    let incoming = UnixListenerStream::new(UnixListener::bind(path)?);
    let res = serve(incoming, service, signal).await;
    // A panic can still leave the socket file behind.
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!("Failed to remove socket file {path}: {e}");
    }
    res
}

/// A server on an ephemeral loopback port. Dropping it fires the shutdown
/// signal.
#[cfg(test)]
pub struct LocalServer {
    pub addr: std::net::SocketAddr,
    pub channel: tonic::transport::Channel,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

#[cfg(test)]
impl LocalServer {
    pub async fn start(service: GreetingService) -> Self {
        use tokio_stream::wrappers::TcpListenerStream;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(serve(
            TcpListenerStream::new(listener),
            service,
            async move {
                let _ = stopped.await;
            },
        ));

        let channel = tonic::transport::Channel::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();

        Self {
            addr,
            channel,
            stop: Some(stop),
            task,
        }
    }

    pub fn greeter(
        &self,
    ) -> greeter_tonic_core::proto::greeter_client::GreeterClient<tonic::transport::Channel> {
        greeter_tonic_core::proto::greeter_client::GreeterClient::new(self.channel.clone())
    }

    /// Fires the shutdown signal without waiting for the server to stop.
    pub fn trigger_shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Fires the shutdown signal, closes the client connection and waits for
    /// [`serve`] to return.
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.trigger_shutdown();
        let Self { channel, task, .. } = self;
        drop(channel);
        task.await.unwrap()
    }
}
