//! lifeline: a line echo server and its reconnecting client
//!
//! Server features:
//! - Fail-fast admission control capping concurrent connections
//! - Idle read deadlines that reap zombie connections
//! - Connection TTL forcing periodic reconnection for rebalancing
//! - PING/PONG heartbeats answered inline with echo traffic
//! - Admin endpoint with health and counters
//!
//! Client features:
//! - Random target selection per attempt across a server list
//! - Fresh name resolution and bounded dial on every attempt
//! - Heartbeats with a read deadline longer than the server's idle timeout
//! - Jittered backoff between reconnects
//!
//! Configuration via CLI arguments or TOML file.

mod admin;
mod admission;
mod client;
mod config;
mod connection;
mod heartbeat;
mod protocol;
mod server;
mod stats;

use client::ReconnectDriver;
use config::{ClientConfig, Config, Mode, ServerConfig};
use server::Server;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    match config.mode {
        Mode::Serve(server) => runtime.block_on(run_server(server)),
        Mode::Connect(client) => {
            runtime.block_on(run_client(client));
            Ok(())
        }
    }
}

/// Run the echo server. Only a failure to bind the primary listener returns.
async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        read_timeout_ms = config.connection.read_timeout.as_millis() as u64,
        write_timeout_ms = config.connection.write_timeout.as_millis() as u64,
        max_conn_age_secs = config.connection.max_conn_age.as_secs(),
        "Starting lifeline server"
    );

    let server = Server::bind(&config)?;

    if let Some(addr) = config.admin_listen.clone() {
        let state = admin::AdminState {
            stats: server.stats(),
            gate: server.gate(),
        };
        tokio::spawn(admin::serve(addr, state));
    }

    server.run().await;
    Ok(())
}

/// Run the client: stdin lines go out as messages, replies go to stdout.
async fn run_client(config: ClientConfig) {
    info!(
        servers = ?config.servers.targets(),
        heartbeat_interval_ms = config.heartbeat.interval.as_millis() as u64,
        read_timeout_ms = config.read_timeout.as_millis() as u64,
        "Starting lifeline client"
    );

    let (driver, handle) = ReconnectDriver::new(config);
    let (outbound, mut inbound) = handle.into_parts();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if outbound.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(reply) = inbound.recv().await {
            println!("Server: {}", reply);
        }
    });

    driver.run().await;
}
