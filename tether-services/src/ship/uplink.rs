//! The ship's uplink supervisor. Owns the single persistent connection to
//! the offshore node and runs three cooperating tasks — Connector, Writer,
//! Reader — as `monoio::spawn`ed local tasks coordinating through channels
//! and the shared pending/tunnel tables, rather than through a lock around
//! the socket itself.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use monoio::net::tcp::{TcpOwnedReadHalf, TcpOwnedWriteHalf};
use monoio::net::TcpStream;
use tether_core::{read_frame, write_frame, CorrelationId, RECONNECT_BACKOFF};
use tracing::{debug, info, warn};

use crate::ship::pending::PendingTable;
use crate::tunnel::{FrameSink, TunnelTable};

/// One item travelling from a handler (or an active tunnel relay) to the
/// uplink Writer.
pub struct OutboundFrame {
    pub id: CorrelationId,
    pub payload: Vec<u8>,
}

/// Handle handed to HTTP handlers and tunnel relays for enqueueing
/// outbound frames. Cloning is cheap (an `async_channel::Sender` clone).
#[derive(Clone)]
pub struct RequestQueue {
    tx: async_channel::Sender<OutboundFrame>,
}

impl RequestQueue {
    /// Attempts to enqueue without blocking. Returns `false` when the
    /// bounded queue is full, the caller's cue to answer `503 Service
    /// Unavailable` immediately rather than grow memory without bound.
    pub fn try_enqueue(&self, id: CorrelationId, payload: Vec<u8>) -> bool {
        self.tx.try_send(OutboundFrame { id, payload }).is_ok()
    }
}

impl FrameSink for RequestQueue {
    async fn send_frame(&self, id: CorrelationId, payload: Vec<u8>) -> bool {
        self.tx.send(OutboundFrame { id, payload }).await.is_ok()
    }
}

pub struct Supervisor {
    host: String,
    port: u16,
    pending: PendingTable,
    tunnels: TunnelTable,
    rx: RefCell<Option<async_channel::Receiver<OutboundFrame>>>,
}

impl Supervisor {
    /// Builds a supervisor plus the queue handle handlers enqueue onto.
    /// `queue_capacity` bounds the request queue.
    pub fn new(
        host: String,
        port: u16,
        pending: PendingTable,
        tunnels: TunnelTable,
        queue_capacity: usize,
    ) -> (Rc<Self>, RequestQueue) {
        let (tx, rx) = async_channel::bounded(queue_capacity);
        let supervisor = Rc::new(Supervisor {
            host,
            port,
            pending,
            tunnels,
            rx: RefCell::new(Some(rx)),
        });
        (supervisor, RequestQueue { tx })
    }

    /// Spawns the supervisor loop as a local monoio task. Never returns
    /// under normal operation.
    pub fn spawn(self: Rc<Self>) {
        monoio::spawn(async move { self.run().await });
    }

    async fn run(self: Rc<Self>) {
        let rx = self
            .rx
            .borrow_mut()
            .take()
            .expect("Supervisor::spawn called more than once");
        // Frames that failed to send on a previous connection; retried
        // ahead of fresh queue items on the next connection.
        let mut requeue: VecDeque<OutboundFrame> = VecDeque::new();

        loop {
            info!(host = %self.host, port = self.port, "dialing offshore uplink");
            let stream = self.dial().await;
            info!("uplink connected");

            let (read_half, write_half) = stream.into_split();
            let reader = monoio::spawn(Self::reader_loop(
                read_half,
                self.pending.clone(),
                self.tunnels.clone(),
            ));

            self.writer_loop(write_half, &rx, &mut requeue).await;
            warn!("uplink disconnected; will reconnect");
            // The Reader observes the same socket's loss independently;
            // give it a moment to notice and exit before redialing.
            let _ = reader.await;
        }
    }

    async fn dial(&self) -> TcpStream {
        loop {
            match TcpStream::connect((self.host.as_str(), self.port)).await {
                Ok(stream) => return stream,
                Err(e) => {
                    warn!(error = %e, backoff = ?RECONNECT_BACKOFF, "failed to dial offshore, retrying");
                    monoio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }

    async fn writer_loop(
        &self,
        mut write_half: TcpOwnedWriteHalf,
        rx: &async_channel::Receiver<OutboundFrame>,
        requeue: &mut VecDeque<OutboundFrame>,
    ) {
        loop {
            let frame = match requeue.pop_front() {
                Some(frame) => frame,
                None => match rx.recv().await {
                    Ok(frame) => frame,
                    Err(_) => {
                        // All senders dropped: process is shutting down.
                        return;
                    }
                },
            };
            match write_frame(&mut write_half, frame.id, frame.payload).await {
                Ok(()) => {}
                Err((e, payload)) => {
                    warn!(id = %frame.id, error = %e, "uplink write failed, re-queueing request");
                    requeue.push_front(OutboundFrame { id: frame.id, payload });
                    return;
                }
            }
        }
    }

    async fn reader_loop(mut read_half: TcpOwnedReadHalf, pending: PendingTable, tunnels: TunnelTable) {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if tunnels.contains(frame.id) {
                        if !tunnels.route(frame.id, frame.payload) {
                            debug!(id = %frame.id, "dropped frame for a tunnel that already closed");
                        }
                        continue;
                    }
                    if !pending.deliver(frame.id, frame.payload) {
                        debug!(id = %frame.id, "orphan response frame (handler already timed out)");
                    }
                }
                Err(e) => {
                    if e.is_protocol_violation() {
                        warn!(error = %e, "uplink protocol violation, tearing down connection");
                    } else {
                        warn!(error = %e, "uplink read error, reconnecting");
                    }
                    return;
                }
            }
        }
    }
}

/// Wraps [`RECONNECT_BACKOFF`] for callers that want the concrete
/// duration without depending on `tether-core` directly.
pub fn reconnect_backoff() -> Duration {
    RECONNECT_BACKOFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use monoio::net::TcpListener;

    // Two responses arriving in the opposite order from their requests
    // must each reach the handler awaiting their own id, never the other's.
    #[monoio::test_all]
    async fn reader_loop_demuxes_out_of_order_responses() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connect_fut = monoio::net::TcpStream::connect(addr);
        let accept_fut = listener.accept();
        let (client, server) = monoio::join!(connect_fut, accept_fut);
        let mut client = client.unwrap();
        let (server, _) = server.unwrap();

        let pending = PendingTable::new();
        let tunnels = TunnelTable::new();
        let id_a = CorrelationId::new_random();
        let id_b = CorrelationId::new_random();
        let rx_a = pending.register(id_a);
        let rx_b = pending.register(id_b);

        let (read_half, _write_half) = server.into_split();
        let reader = monoio::spawn(Supervisor::reader_loop(read_half, pending.clone(), tunnels));

        // B's response is written first even though A was requested first.
        write_frame(&mut client, id_b, b"B".to_vec()).await.unwrap();
        write_frame(&mut client, id_a, b"A".to_vec()).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), b"A");
        assert_eq!(rx_b.recv().await.unwrap(), b"B");

        drop(client);
        let _ = reader.await;
    }

    #[monoio::test_all]
    async fn reader_loop_drops_orphan_frame_for_already_removed_id() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connect_fut = monoio::net::TcpStream::connect(addr);
        let accept_fut = listener.accept();
        let (client, server) = monoio::join!(connect_fut, accept_fut);
        let mut client = client.unwrap();
        let (server, _) = server.unwrap();

        let pending = PendingTable::new();
        let tunnels = TunnelTable::new();
        let id = CorrelationId::new_random();
        // Never registered: simulates a handler that already timed out.

        let (read_half, _write_half) = server.into_split();
        let reader = monoio::spawn(Supervisor::reader_loop(read_half, pending.clone(), tunnels));

        write_frame(&mut client, id, b"late".to_vec()).await.unwrap();
        drop(client);
        // The reader loop exits on EOF without panicking on the orphan.
        let _ = reader.await;
        assert!(pending.is_empty());
    }
}
