#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CliArgs, ServerConfig};
use server::router::serve;
use server::service::handler::GreetingService;
use server::telemetry::init_telemetry;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;

// mimalloc holds up better than the system allocator under contention,
// especially on musl.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let config = ServerConfig::try_from(CliArgs::parse())?;
    let providers = init_telemetry()?;

    if cfg!(debug_assertions) {
        tracing::info!("Starting greeter service with full config: {config:#?}");
    }
    let addr = config.server_addr.clone();
    let uds = config.uds;
    let service = GreetingService::new(config);

    let res = if uds {
        tracing::info!("Listening on unix socket {addr}");
        serve_unix(&addr, service).await
    } else {
        let tcp = TcpListener::bind(&addr).await?;
        tracing::info!("Listening on {}", tcp.local_addr()?);
        serve(TcpListenerStream::new(tcp), service, shutdown_signal()).await
    };

    providers.shutdown();
    res
}

#[cfg(unix)]
async fn serve_unix(path: &str, service: GreetingService) -> anyhow::Result<()> {
    server::router::serve_uds(path, service, shutdown_signal()).await
}

#[cfg(not(unix))]
async fn serve_unix(_path: &str, _service: GreetingService) -> anyhow::Result<()> {
    anyhow::bail!("Unix domain sockets are not supported on this platform");
}

/// Resolves on SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
