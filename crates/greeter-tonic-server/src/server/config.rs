use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `greeter-tonic-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a local
/// `.env` file is loaded first). The defaults reproduce the canonical greeter
/// behavior: a 3 second delay for the lazy and blocking greetings, and five
/// streamed replies one second apart.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "greeter-tonic-server",
    version,
    about = "A gRPC greeter exercising every call shape"
)]
pub struct CliArgs {
    /// Delay before `GreetLazy` and `GreetBlocking` reply, in milliseconds.
    ///
    /// Environment variable: `LAZY_DELAY_MS`
    #[arg(long, env = "LAZY_DELAY_MS", default_value_t = 3_000)]
    pub lazy_delay_ms: u64,

    /// Interval between `GreetMany` replies, in milliseconds.
    ///
    /// Environment variable: `STREAM_INTERVAL_MS`
    #[arg(long, env = "STREAM_INTERVAL_MS", default_value_t = 1_000)]
    pub stream_interval_ms: u64,

    /// Number of replies emitted by `GreetMany`.
    ///
    /// Environment variable: `STREAM_COUNT`
    #[arg(long, env = "STREAM_COUNT", default_value_t = 5)]
    pub stream_count: u32,

    /// Capacity of the response buffer of every streaming call.
    ///
    /// Lower values propagate client backpressure sooner; higher values allow
    /// more replies to queue before the producer waits.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 8)]
    pub stream_buffer_size: usize,

    /// Seconds to wait for in-flight calls to drain on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/greeter.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub lazy_delay: Duration,
    pub stream_interval: Duration,
    pub stream_count: u32,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub server_addr: String,
    pub uds: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lazy_delay: Duration::from_secs(3),
            stream_interval: Duration::from_secs(1),
            stream_count: 5,
            stream_buffer_size: 8,
            shutdown_timeout: Duration::from_secs(3),
            server_addr: String::from("0.0.0.0:50051"),
            uds: false,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.stream_count == 0 {
            bail!("STREAM_COUNT must be greater than 0");
        }

        if args.stream_interval_ms == 0 {
            bail!("STREAM_INTERVAL_MS must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        Ok(Self {
            lazy_delay: Duration::from_millis(args.lazy_delay_ms),
            stream_interval: Duration::from_millis(args.stream_interval_ms),
            stream_count: args.stream_count,
            stream_buffer_size: args.stream_buffer_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}
