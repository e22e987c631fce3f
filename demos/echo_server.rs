//! Echo server.
//!
//! Answers every `BUSINESS_REQUEST` with `"Server received: <payload>"`,
//! logs client greetings and acknowledgements, and can push numbered
//! messages to every client on an interval.
//!
//! ```text
//! RUST_LOG=info cargo run --example echo_server -- --bind 0.0.0.0:8888 --push-every 10
//! ```

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wirelink::{MessageContext, MessageType, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(about = "wirelink echo server")]
struct Args {
    /// JSON configuration file; command line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(long)]
    bind: Option<String>,

    /// Seconds without writes before a heartbeat probe.
    #[arg(long)]
    writer_idle: Option<u64>,

    /// Push ten numbered messages to every client this often (seconds).
    #[arg(long)]
    push_every: Option<u64>,
}

async fn echo(ctx: MessageContext, payload: Bytes) -> wirelink::Result<()> {
    let text = String::from_utf8_lossy(&payload).into_owned();
    tracing::info!(client_id = ?ctx.client_id(), "received: {}", text);
    ctx.reply(MessageType::BusinessResponse, format!("Server received: {}", text))
        .await
}

async fn file_request(ctx: MessageContext, payload: Bytes) -> wirelink::Result<()> {
    tracing::info!(client_id = ?ctx.client_id(), bytes = payload.len(), "file upload");
    ctx.reply(MessageType::FileToServerResponse, "File received").await
}

async fn log_message(ctx: MessageContext, payload: Bytes) -> wirelink::Result<()> {
    tracing::info!(
        client_id = ?ctx.client_id(),
        kind = %ctx.kind(),
        "{}",
        String::from_utf8_lossy(&payload)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(secs) = args.writer_idle {
        config.heartbeat.writer_idle = Duration::from_secs(secs);
    }

    let server = Server::builder()
        .config(config)
        .handle(MessageType::BusinessRequest, echo)
        .handle(MessageType::FileToServerRequest, file_request)
        .fallback(log_message)
        .bind()
        .await?
        .spawn();

    if let Some(secs) = args.push_every {
        let registry = server.registry().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for client_id in registry.list_ids() {
                    for i in 1..=10 {
                        let message = wirelink::Message::new(
                            MessageType::FileToClientRequest,
                            format!("message {} of 10", i),
                        );
                        if let Err(e) = registry.send_to(&client_id, message).await {
                            tracing::warn!(client_id = %client_id, "push failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!(clients = server.connection_count(), "stopping");
    server.shutdown().await?;
    Ok(())
}
