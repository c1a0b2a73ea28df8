//! Accepts the single uplink connection from a ship. Only one is ever
//! active; a second concurrent connect attempt is logged and rejected
//! rather than queued behind the first.

use std::cell::Cell;
use std::rc::Rc;

use monoio::net::tcp::TcpOwnedReadHalf;
use monoio::net::{TcpListener, TcpStream};
use tether_core::{read_frame, write_frame, CorrelationId};
use tracing::{info, warn};

use crate::offshore::worker;
use crate::offshore::UplinkSink;
use crate::tunnel::TunnelTable;

/// Runs the accept loop until `shutdown` fires, at which point it stops
/// taking new uplink connections. `inflight` is incremented for every
/// spawned per-request worker and decremented on its completion, so the
/// caller can wait out a grace period for in-flight origin fetches before
/// the process exits.
pub async fn serve(listener: TcpListener, shutdown: async_channel::Receiver<()>, inflight: Rc<Cell<usize>>) {
    let active = Rc::new(Cell::new(false));

    loop {
        monoio::select! {
            _ = shutdown.recv() => {
                info!("shutdown signaled, no longer accepting uplink connections");
                return;
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, addr)) => {
                        if active.get() {
                            warn!(%addr, "rejecting second concurrent uplink connection");
                            continue;
                        }
                        active.set(true);
                        info!(%addr, "uplink connected");
                        let active = active.clone();
                        let inflight = inflight.clone();
                        monoio::spawn(async move {
                            handle_uplink(stream, inflight).await;
                            active.set(false);
                            info!("uplink disconnected");
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept uplink connection"),
                }
            }
        }
    }
}

async fn handle_uplink(stream: TcpStream, inflight: Rc<Cell<usize>>) {
    let (read_half, mut write_half) = stream.into_split();
    let (sink, rx) = UplinkSink::new();
    let tunnels = TunnelTable::new();

    let writer = monoio::spawn(async move {
        while let Ok((id, payload)) = rx.recv().await {
            if let Err((e, _payload)) = write_frame(&mut write_half, id, payload).await {
                warn!(error = %e, "uplink write failed, dropping connection");
                return;
            }
        }
    });

    reader_loop(read_half, sink, tunnels, inflight).await;
    let _ = writer.await;
}

async fn reader_loop(mut read_half: TcpOwnedReadHalf, sink: UplinkSink, tunnels: TunnelTable, inflight: Rc<Cell<usize>>) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(frame) => dispatch(frame.id, frame.payload, &sink, &tunnels, &inflight),
            Err(e) => {
                if e.is_protocol_violation() {
                    warn!(error = %e, "uplink protocol violation, tearing down connection");
                } else {
                    warn!(error = %e, "uplink read error");
                }
                return;
            }
        }
    }
}

fn dispatch(id: CorrelationId, payload: Vec<u8>, sink: &UplinkSink, tunnels: &TunnelTable, inflight: &Rc<Cell<usize>>) {
    if tunnels.contains(id) {
        if !tunnels.route(id, payload) {
            tracing::debug!(%id, "dropped frame for a tunnel that already closed");
        }
        return;
    }
    inflight.set(inflight.get() + 1);
    let sink = sink.clone();
    let tunnels = tunnels.clone();
    let inflight = inflight.clone();
    monoio::spawn(async move {
        worker::handle_request(id, payload, sink, tunnels).await;
        inflight.set(inflight.get() - 1);
    });
}
