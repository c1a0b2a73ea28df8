use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use monoio::net::TcpListener;
use tether_services::offshore::listener;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

/// The offshore node: accepts the ship's single uplink connection and
/// performs the actual outbound fetch to true origin servers on its
/// behalf.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Port the uplink listener binds to.
    #[clap(long, env = "OFFSHORE_PORT", default_value_t = tether_core::DEFAULT_OFFSHORE_PORT)]
    offshore_port: u16,
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

    let tcp_listener = TcpListener::bind(("0.0.0.0", args.offshore_port))?;
    tracing::info!(port = args.offshore_port, "offshore listening for uplink");

    let (shutdown_tx, shutdown_rx) = async_channel::bounded::<()>(1);
    let inflight = Rc::new(Cell::new(0usize));
    monoio::spawn(listener::serve(tcp_listener, shutdown_rx, inflight.clone()));

    while !term.load(Ordering::Relaxed) {
        monoio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::info!("SIGTERM received, no longer accepting new uplink connections");
    let _ = shutdown_tx.send(()).await;

    let deadline = Instant::now() + tether_core::REQUEST_TIMEOUT;
    while inflight.get() > 0 && Instant::now() < deadline {
        monoio::time::sleep(Duration::from_millis(100)).await;
    }
    if inflight.get() > 0 {
        tracing::warn!(
            remaining = inflight.get(),
            "grace period elapsed with origin fetches still in flight"
        );
    } else {
        tracing::info!("all origin fetches drained, shutting down");
    }

    Ok(())
}
