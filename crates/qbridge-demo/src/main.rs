//! qbridge Demo - Serves a demo object graph over stdin/stdout.
//!
//! The client is expected to spawn this binary and speak the qbridge
//! protocol over its standard streams. Logs go to stderr.

mod people;

use anyhow::Result;
use clap::Parser;
use people::{Directory, Greeter};
use qbridge_core::{Connection, ConnectionConfig, QPtr};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "qbridge-demo")]
#[command(about = "Demo object graph for qbridge clients")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Seconds an unreferenced object is kept before collection
    #[arg(long, default_value = "5")]
    grace_period: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the protocol, so logs must stay on stderr
    let log_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting qbridge demo");

    let root = QPtr::new(Directory::new());
    let config = ConnectionConfig {
        grace_period: Duration::from_secs(args.grace_period),
        ..ConnectionConfig::default()
    };
    let mut conn = Connection::new_split(tokio::io::stdin(), tokio::io::stdout(), root)
        .with_config(config);
    conn.register_type("Greeter", Greeter::default())?;

    match conn.run().await {
        Err(qbridge_core::BridgeError::Disconnected) => {
            info!("Client disconnected, exiting");
            Ok(())
        }
        Err(e) => {
            error!("Connection failed: {}", e);
            Err(e.into())
        }
        Ok(()) => Ok(()),
    }
}
