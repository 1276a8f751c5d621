//! Courier worker - serves a demo implementation to its parent process.
//!
//! Protocol frames travel over stdin/stdout, so all logging goes to stderr.
//! The worker exits when the parent disconnects gracefully, when its stdin
//! closes, or on Ctrl-C.

mod worker;

use anyhow::Result;
use clap::Parser;
use courier_core::{serve_stdio, ConnectionConfig, MessageEndpoint};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Upper bound on waiting for queued frames to reach the parent at exit.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "courier-worker")]
#[command(about = "Serve a demo Courier implementation over stdio")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Name reported in the handshake
    #[arg(long, default_value = "EchoWorker")]
    name: String,

    /// How long a worker-initiated disconnect waits for the parent (0 = forever)
    #[arg(long, default_value_t = 5000)]
    disconnect_timeout_ms: u64,
}

impl Args {
    fn connection_config(&self) -> ConnectionConfig {
        let timeout = match self.disconnect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        ConnectionConfig::default().with_disconnect_timeout(timeout)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; stdout is reserved for protocol frames
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Courier worker {} (PID {})", args.name, std::process::id());

    let implementation = Arc::new(worker::echo_worker(&args.name));
    let (connection, endpoint) = serve_stdio(implementation, args.connection_config());

    tokio::select! {
        _ = connection.closed() => {
            info!("Parent disconnected");
        }
        _ = endpoint.closed() => {
            info!("Parent closed stdin");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
            connection.disconnect().await;
        }
    }

    endpoint.disconnect();
    if tokio::time::timeout(FLUSH_TIMEOUT, endpoint.flushed())
        .await
        .is_err()
    {
        warn!("Timed out flushing pending frames");
    }

    info!("Courier worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["courier-worker"]);
        assert!(!args.debug);
        assert_eq!(args.name, "EchoWorker");
        assert_eq!(args.connection_config(), ConnectionConfig::default());
    }

    #[test]
    fn test_zero_timeout_waits_forever() {
        let args = Args::parse_from(["courier-worker", "--disconnect-timeout-ms", "0", "--name", "W"]);
        assert_eq!(args.name, "W");
        assert_eq!(args.connection_config().disconnect_timeout, None);
    }
}
