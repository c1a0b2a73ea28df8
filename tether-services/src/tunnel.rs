//! The CONNECT tunnel subchannel, shared by the ship (relaying the
//! client's raw socket) and the offshore node (relaying the origin's raw
//! socket).
//!
//! Once the "200 Connection established" handshake frame has gone out for
//! a CONNECT request, both ends stop treating that id as a one-shot
//! request/response and start treating it as a bidirectional byte pipe
//! multiplexed over the same uplink: further frames bearing that id carry
//! raw tunnel bytes in each direction, and an empty-payload frame is the
//! half-close sentinel.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use monoio::net::tcp::TcpOwnedWriteHalf;
use monoio::net::TcpStream;
use tether_core::{CorrelationId, IO_CHUNK_SIZE};
use tracing::debug;

pub type TunnelTx = async_channel::Sender<Vec<u8>>;
pub type TunnelRx = async_channel::Receiver<Vec<u8>>;

/// Routes continuation frames for active tunnels by correlation id. Both
/// the ship and the offshore node keep one of these alongside their
/// one-shot pending/dispatch tables: the uplink Reader checks it before
/// falling through to "orphan, log and drop".
#[derive(Clone, Default)]
pub struct TunnelTable {
    inner: Rc<RefCell<HashMap<CorrelationId, TunnelTx>>>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an active tunnel, returning the receiver its relay task
    /// reads continuation frames from.
    pub fn register(&self, id: CorrelationId) -> TunnelRx {
        let (tx, rx) = async_channel::unbounded();
        self.inner.borrow_mut().insert(id, tx);
        rx
    }

    /// Routes a continuation frame to its tunnel, returning `false` if no
    /// tunnel is registered for `id` (an orphan frame).
    pub fn route(&self, id: CorrelationId, payload: Vec<u8>) -> bool {
        let tx = self.inner.borrow().get(&id).cloned();
        match tx {
            Some(tx) => tx.try_send(payload).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.inner.borrow().contains_key(&id)
    }

    pub fn remove(&self, id: CorrelationId) {
        self.inner.borrow_mut().remove(&id);
    }
}

/// Sink through which a tunnel relay emits outbound frames. The ship
/// implements this over its bounded request queue (so tunnel traffic
/// shares the same backpressure and the same single uplink writer as
/// ordinary requests); the offshore node implements it directly over its
/// one uplink write half, since it is the sole writer there.
pub trait FrameSink: Clone {
    async fn send_frame(&self, id: CorrelationId, payload: Vec<u8>) -> bool;
}

/// Relays bytes between `socket` and the framed uplink for one tunnel
/// session, until both directions have closed or erred. A split-then-
/// bidirectional-copy shape, generalized from a raw TCP-to-TCP splice to a
/// TCP-to-framed-uplink splice.
pub async fn relay<Sink>(id: CorrelationId, socket: TcpStream, inbound: TunnelRx, outbound: Sink)
where
    Sink: FrameSink,
{
    let (read_half, write_half) = socket.into_split();
    monoio::join!(
        socket_to_frames(id, read_half, outbound.clone()),
        frames_to_socket(write_half, inbound),
    );
}

async fn socket_to_frames<Sink>(id: CorrelationId, mut read_half: monoio::net::tcp::TcpOwnedReadHalf, outbound: Sink)
where
    Sink: FrameSink,
{
    loop {
        let buf = vec![0u8; IO_CHUNK_SIZE];
        let (res, buf) = read_half.read(buf).await;
        match res {
            Ok(0) => {
                // Client/origin half-closed its write side: tell the peer.
                let _ = outbound.send_frame(id, Vec::new()).await;
                return;
            }
            Ok(n) => {
                if !outbound.send_frame(id, buf[..n].to_vec()).await {
                    return;
                }
            }
            Err(e) => {
                debug!(%id, error = %e, "tunnel socket read error");
                let _ = outbound.send_frame(id, Vec::new()).await;
                return;
            }
        }
    }
}

async fn frames_to_socket(mut write_half: TcpOwnedWriteHalf, inbound: TunnelRx) {
    loop {
        match inbound.recv().await {
            Ok(payload) if payload.is_empty() => {
                let _ = write_half.shutdown().await;
                return;
            }
            Ok(payload) => {
                let (res, _buf) = write_half.write_all(payload).await;
                if res.is_err() {
                    return;
                }
            }
            Err(_) => {
                // Channel closed: the uplink dropped or the tunnel was torn
                // down from the other side.
                let _ = write_half.shutdown().await;
                return;
            }
        }
    }
}

