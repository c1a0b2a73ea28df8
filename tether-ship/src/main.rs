use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use monoio::net::TcpListener;
use tether_services::ship::{intake, pending::PendingTable, uplink::Supervisor};
use tether_services::tunnel::TunnelTable;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// The ship node: exposes an HTTP proxy to local clients and funnels every
/// request over a single persistent uplink to an offshore node.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Port the client-facing HTTP proxy listens on.
    #[clap(long, env = "SHIP_PORT", default_value_t = tether_core::DEFAULT_SHIP_PORT)]
    ship_port: u16,

    /// Hostname of the offshore node.
    #[clap(long, env = "OFFSHORE_HOST", default_value = "localhost")]
    offshore_host: String,

    /// TCP port of the offshore node.
    #[clap(long, env = "OFFSHORE_PORT", default_value_t = tether_core::DEFAULT_OFFSHORE_PORT)]
    offshore_port: u16,

    /// Capacity of the bounded request queue feeding the uplink.
    #[clap(long, env = "QUEUE_CAPACITY", default_value_t = tether_core::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    let args = Args::parse();

    let listener = TcpListener::bind(("0.0.0.0", args.ship_port))?;
    tracing::info!(port = args.ship_port, "ship listening for clients");

    let pending = PendingTable::new();
    let tunnels = TunnelTable::new();
    let (supervisor, queue) = Supervisor::new(
        args.offshore_host.clone(),
        args.offshore_port,
        pending.clone(),
        tunnels.clone(),
        args.queue_capacity,
    );
    Rc::clone(&supervisor).spawn();

    let (shutdown_tx, shutdown_rx) = async_channel::bounded::<()>(1);
    let inflight = Rc::new(Cell::new(0usize));
    monoio::spawn(intake::serve(listener, queue, pending, tunnels, shutdown_rx, inflight.clone()));

    while !term.load(Ordering::Relaxed) {
        monoio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::info!("SIGTERM received, no longer accepting new client connections");
    let _ = shutdown_tx.send(()).await;

    let deadline = Instant::now() + tether_core::REQUEST_TIMEOUT;
    while inflight.get() > 0 && Instant::now() < deadline {
        monoio::time::sleep(Duration::from_millis(100)).await;
    }
    if inflight.get() > 0 {
        tracing::warn!(
            remaining = inflight.get(),
            "grace period elapsed with client requests still in flight"
        );
    } else {
        tracing::info!("all client requests drained, shutting down");
    }

    Ok(())
}
