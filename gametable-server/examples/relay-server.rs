//! Minimal CLI to run the gametable relay.
//!
//! Usage:
//!   cargo run -p gametable-server --example relay-server -- [--host 127.0.0.1] [--port 9000]
//!   cargo run -p gametable-server --example relay-server -- --addr 0.0.0.0:9000 --replay-depth 256

use clap::Parser;
use std::error::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gametable_server::{serve_incoming_with_config, ServerConfig};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "relay-server", about = "Gametable WebSocket relay")]
struct Args {
    #[arg(short = 'a', long, value_name = "ADDR", conflicts_with_all = ["host", "port"], help = "Full socket address to bind, e.g. 0.0.0.0:9000")]
    addr: Option<String>,

    #[arg(
        short = 'H',
        long,
        default_value = "127.0.0.1",
        help = "Host to bind when --addr not provided"
    )]
    host: String,

    #[arg(
        short = 'p',
        long,
        default_value_t = 9000,
        help = "Port to bind when --addr not provided"
    )]
    port: u16,

    #[arg(
        long,
        default_value_t = 128,
        help = "Envelopes each room retains for lastnum resumption"
    )]
    replay_depth: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();

    let args = Args::parse();
    let addr = args
        .addr
        .unwrap_or_else(|| format!("{}:{}", args.host, args.port));

    let cfg = ServerConfig {
        replay_depth: args.replay_depth,
        ..Default::default()
    };

    info!(%addr, replay_depth = cfg.replay_depth, "starting gametable relay");
    info!("Press Ctrl-C to stop.");

    let listener = TcpListener::bind(&addr).await?;
    serve_incoming_with_config(listener, cfg).await
}
