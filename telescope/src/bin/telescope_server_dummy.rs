//! Stellarium telescope server backed by a simulated mount

use anyhow::Context;
use clap::Parser;
use scopelink::DummyServer;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulated mount speaking the Stellarium telescope protocol")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 10001)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Position report interval in milliseconds
    #[arg(short, long, default_value_t = 500)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.bind, args.port);
    let server = DummyServer::bind(&addr, Duration::from_millis(args.interval_ms.max(1)))
        .await
        .with_context(|| format!("binding {}", addr))?;

    tokio::select! {
        result = server.run() => result.context("accepting clients")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}
