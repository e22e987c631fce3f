//! Demo client.
//!
//! Connects (and keeps reconnecting) to a server, greets it, sends a
//! numbered `BUSINESS_REQUEST` on an interval and acknowledges every
//! `FILE_TO_CLIENT_REQUEST`.
//!
//! ```text
//! RUST_LOG=info cargo run --example client -- --server 127.0.0.1:8888 --every 2
//! ```

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wirelink::{Client, ClientConfig, MessageContext, MessageType, WireError};

#[derive(Parser, Debug)]
#[command(about = "wirelink demo client")]
struct Args {
    /// JSON configuration file; command line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server address.
    #[arg(long)]
    server: Option<String>,

    /// Seconds between reconnect attempts.
    #[arg(long)]
    reconnect_delay: Option<u64>,

    /// Seconds between business messages.
    #[arg(long, default_value_t = 5)]
    every: u64,
}

async fn acknowledge(ctx: MessageContext, payload: Bytes) -> wirelink::Result<()> {
    let text = String::from_utf8_lossy(&payload).into_owned();
    tracing::info!("server pushed: {}", text);
    ctx.reply(MessageType::FileToClientResponse, format!("Client received: {}", text))
        .await
}

async fn log_message(ctx: MessageContext, payload: Bytes) -> wirelink::Result<()> {
    tracing::info!(kind = %ctx.kind(), "{}", String::from_utf8_lossy(&payload));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        config.server_addr = server;
    }
    if let Some(secs) = args.reconnect_delay {
        config.reconnect_delay = Duration::from_secs(secs);
    }
    if config.greeting.is_none() {
        config.greeting = Some("Hello from client!".to_string());
    }

    let client = Client::builder()
        .config(config)
        .handle(MessageType::FileToClientRequest, acknowledge)
        .fallback(log_message)
        .start()?;

    let mut ticker = tokio::time::interval(Duration::from_secs(args.every.max(1)));
    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match client.send(format!("message {}", sent + 1)).await {
                    Ok(()) => sent += 1,
                    Err(WireError::NotConnected) => tracing::info!("not connected, skipping"),
                    Err(e) => tracing::warn!("send failed: {}", e),
                }
            }
        }
    }

    tracing::info!(sent, client_id = ?client.client_id(), "stopping");
    client.shutdown().await?;
    Ok(())
}
