//! mprpc - MessagePack-RPC over WebSocket.
//!
//! `mprpc serve` runs a demo server and prints `RPC_PORT=<port>` on stdout once
//! it is listening. `mprpc call` connects to a server, performs one call and
//! prints the result as JSON.

mod handler;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mprpc_core::{PeerConfig, RpcClient, RpcServer, ServerConfig};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mprpc")]
#[command(about = "Bidirectional MessagePack-RPC over WebSocket")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo handler
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Seconds between keep-alive pings (0 = disabled)
        #[arg(long, default_value = "0")]
        heartbeat_secs: u64,

        /// Expose a `shutdown` method that stops the server
        #[arg(long)]
        allow_shutdown: bool,
    },

    /// Call one method and print the result
    Call {
        /// Server URL, e.g. ws://127.0.0.1:9091
        #[arg(long)]
        url: String,

        /// Method name
        method: String,

        /// Parameters as a JSON array (a single JSON value is wrapped)
        params: Option<String>,

        /// Seconds to wait for the response
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries RPC_PORT and call results
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Serve {
            port,
            host,
            heartbeat_secs,
            allow_shutdown,
        } => serve(&host, port, heartbeat_secs, allow_shutdown).await,
        Command::Call {
            url,
            method,
            params,
            timeout_secs,
        } => call(&url, &method, params.as_deref(), timeout_secs).await,
    }
}

async fn serve(host: &str, port: u16, heartbeat_secs: u64, allow_shutdown: bool) -> Result<()> {
    info!("Starting mprpc server");

    let mut config = ServerConfig::from_env();
    if heartbeat_secs > 0 {
        config.peer.heartbeat_interval = Some(Duration::from_secs(heartbeat_secs));
    }

    let shutdown = Arc::new(Notify::new());
    let remote_shutdown = allow_shutdown.then(|| shutdown.clone());
    let server = RpcServer::with_config(handler::demo_factory(remote_shutdown), config);
    let mut handle = server
        .bind((host, port))
        .await
        .with_context(|| format!("failed to bind {}:{}", host, port))?;

    // Print port for the parent process to read (intentional stdout for IPC)
    println!("RPC_PORT={}", handle.port);

    info!("RPC server running on ws://{}", handle.addr());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received, exiting");
        }
        _ = shutdown.notified() => {
            info!("Shutdown requested, exiting");
        }
    }

    handle.shutdown();
    handle.join().await;
    Ok(())
}

async fn call(url: &str, method: &str, params: Option<&str>, timeout_secs: u64) -> Result<()> {
    let params = parse_params(params)?;

    let client = RpcClient::connect_with_config(
        url,
        handler::cli_handler().into_factory(),
        PeerConfig::from_env(),
    )
    .await
    .with_context(|| format!("failed to connect to {}", url))?;

    let outcome = client
        .call(method, params)
        .await?
        .get(Some(Duration::from_secs(timeout_secs)))
        .await;
    let _ = client.disconnect().await;

    let value = outcome.with_context(|| format!("call to {} failed", method))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn parse_params(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(text) = raw else {
        return Ok(Vec::new());
    };
    let value: Value =
        serde_json::from_str(text).with_context(|| format!("params are not valid JSON: {}", text))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}
