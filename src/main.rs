mod buffer;
mod clock;
mod config;
mod control;
mod engine;
mod frame;
mod metrics;
mod mux;
mod producer;
mod stop;
mod timeline;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::{panic, process};

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

use crate::config::PlayoutConfig;
use crate::control::ChannelManager;
use crate::stop::StopSignal;

/// Linear channel playout core: frame-accurate MPEG-TS output, scheduled
/// from the outside over the control socket.
#[derive(Debug, Parser)]
#[command(name = "retrovue-playout", version)]
struct Args {
    /// Control RPC listen address.
    #[arg(long, default_value = "127.0.0.1:9350")]
    listen: SocketAddr,

    /// Optional JSON config file overriding the built-in tuning.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("fatal: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PlayoutConfig::load(path)?,
        None => PlayoutConfig::default(),
    };

    let manager = ChannelManager::new(config);
    let stop = StopSignal::new();

    // Kill every channel cleanly as soon as any thread panics
    {
        let manager = Arc::clone(&manager);
        let orig_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            manager.stop_all();
            orig_hook(panic_info);
            process::exit(120);
        }));
    }

    // Graceful close on SIGINT/SIGTERM
    {
        let manager = Arc::clone(&manager);
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received");
            manager.stop_all();
            stop.stop();
        })?;
    }

    let listener = TcpListener::bind(args.listen).await?;
    control::serve(listener, manager, stop).await
}
