//! Client-facing HTTP proxy intake. Accepts arbitrarily many concurrent
//! client connections and handles each independently: reconstructs the
//! literal request bytes, mints a correlation id, enqueues the request on
//! the uplink, and suspends the connection task until the correlated
//! response arrives or the deadline elapses.

use std::cell::Cell;
use std::rc::Rc;

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use tether_core::{CorrelationId, MAX_HEADER_BYTES, REQUEST_TIMEOUT};
use tracing::{info, warn};

use crate::httpraw::{self, responses, HttpRawError};
use crate::ship::pending::PendingTable;
use crate::ship::uplink::RequestQueue;
use crate::tunnel::{self, TunnelTable};

/// Runs the accept loop until `shutdown` fires, at which point it stops
/// taking new client connections. `inflight` is incremented for every
/// spawned per-connection handler and decremented on its completion, so
/// the caller can wait out a grace period for in-flight requests before
/// the process exits.
pub async fn serve(
    listener: TcpListener,
    queue: RequestQueue,
    pending: PendingTable,
    tunnels: TunnelTable,
    shutdown: async_channel::Receiver<()>,
    inflight: Rc<Cell<usize>>,
) {
    loop {
        monoio::select! {
            _ = shutdown.recv() => {
                info!("shutdown signaled, no longer accepting client connections");
                return;
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, addr)) => {
                        info!(%addr, "client connected");
                        inflight.set(inflight.get() + 1);
                        let queue = queue.clone();
                        let pending = pending.clone();
                        let tunnels = tunnels.clone();
                        let inflight = inflight.clone();
                        monoio::spawn(async move {
                            handle_connection(stream, queue, pending, tunnels).await;
                            inflight.set(inflight.get() - 1);
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept client connection"),
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, queue: RequestQueue, pending: PendingTable, tunnels: TunnelTable) {
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let request_bytes = match read_one_request(&mut stream, &mut buf).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "malformed client request");
                let _ = write_all(&mut stream, responses::BAD_REQUEST.to_vec()).await;
                return;
            }
        };

        let parsed = match httpraw::parse_request_head(&head_slice(&request_bytes)) {
            Ok(p) => p,
            Err(_) => {
                let _ = write_all(&mut stream, responses::BAD_REQUEST.to_vec()).await;
                return;
            }
        };

        if parsed.method.eq_ignore_ascii_case("CONNECT") {
            // Either the socket is handed off to the tunnel relay or the
            // handshake fails outright; either way this connection's HTTP
            // loop ends here, so the stream is consumed by value.
            handle_connect(stream, &parsed.target, request_bytes, &queue, &pending, &tunnels).await;
            return;
        }

        if !handle_plain(&mut stream, request_bytes, &queue, &pending).await {
            return;
        }
    }
}

fn head_slice(request_bytes: &[u8]) -> Vec<u8> {
    let end = httpraw::find_head_end(request_bytes).unwrap_or(request_bytes.len());
    request_bytes[..end].to_vec()
}

/// Reads one full request (head plus any declared body) off `stream`,
/// using `buf` as a carry-over accumulator across calls so a pipelined
/// client's next request isn't lost. Returns `Ok(None)` on a clean EOF
/// with no partial request pending.
async fn read_one_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, HttpRawError> {
    loop {
        if let Some(head_end) = httpraw::find_head_end(buf) {
            let parsed = httpraw::parse_request_head(&buf[..head_end])?;
            let total_len = head_end + parsed.content_length.unwrap_or(0);
            while buf.len() < total_len {
                if !read_more(stream, buf).await? {
                    return Err(HttpRawError::ConnectionClosed);
                }
            }
            let request_bytes = buf[..total_len].to_vec();
            buf.drain(..total_len);
            return Ok(Some(request_bytes));
        }

        if buf.len() > MAX_HEADER_BYTES {
            return Err(HttpRawError::HeadersTooLarge);
        }

        if !read_more(stream, buf).await? {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(HttpRawError::ConnectionClosed);
        }
    }
}

/// Reads whatever is available into `buf`, returning `false` on EOF.
async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<bool, HttpRawError> {
    let chunk = vec![0u8; 8 * 1024];
    let (res, chunk) = stream.read(chunk).await;
    let n = res?;
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(true)
}

/// Handles one plain (non-CONNECT) request. Returns `true` if the
/// connection should keep serving further pipelined requests.
async fn handle_plain(
    stream: &mut TcpStream,
    request_bytes: Vec<u8>,
    queue: &RequestQueue,
    pending: &PendingTable,
) -> bool {
    let id = CorrelationId::new_random();
    let rx = pending.register(id);

    if !queue.try_enqueue(id, request_bytes) {
        pending.remove(id);
        warn!(%id, "request queue full, answering 503");
        return write_all(stream, responses::SERVICE_UNAVAILABLE.to_vec()).await.is_ok();
    }

    let outcome = monoio::time::timeout(REQUEST_TIMEOUT, rx.recv()).await;
    pending.remove(id);

    let response = match outcome {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => {
            warn!(%id, "pending channel closed without a response");
            responses::GATEWAY_TIMEOUT.to_vec()
        }
        Err(_) => {
            warn!(%id, "request timed out waiting for offshore response");
            responses::GATEWAY_TIMEOUT.to_vec()
        }
    };

    write_all(stream, response).await.is_ok()
}

/// Handles a CONNECT request: waits for the offshore node's handshake
/// response, then splices the client socket into the tunnel subchannel.
/// Takes `stream` by value since a successful handshake hands it off
/// whole to [`tunnel::relay`].
async fn handle_connect(
    mut stream: TcpStream,
    target: &str,
    request_bytes: Vec<u8>,
    queue: &RequestQueue,
    pending: &PendingTable,
    tunnels: &TunnelTable,
) {
    if httpraw::parse_connect_authority(target).is_err() {
        let _ = write_all(&mut stream, responses::BAD_REQUEST.to_vec()).await;
        return;
    }

    let id = CorrelationId::new_random();
    let response_rx = pending.register(id);

    if !queue.try_enqueue(id, request_bytes) {
        pending.remove(id);
        let _ = write_all(&mut stream, responses::SERVICE_UNAVAILABLE.to_vec()).await;
        return;
    }

    // The tunnel subchannel must not be registered until the handshake
    // frame has actually arrived: `reader_loop` checks `tunnels.contains`
    // before `pending.deliver`, so registering any earlier would route the
    // handshake frame itself into an unread tunnel channel instead of to
    // `response_rx`, and this `recv` would hang until the 60s deadline.
    let outcome = monoio::time::timeout(REQUEST_TIMEOUT, response_rx.recv()).await;
    pending.remove(id);

    let handshake = match outcome {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) | Err(_) => {
            let _ = write_all(&mut stream, responses::GATEWAY_TIMEOUT.to_vec()).await;
            return;
        }
    };

    let established = handshake.starts_with(b"HTTP/1.1 200");
    if write_all(&mut stream, handshake).await.is_err() || !established {
        return;
    }

    let tunnel_rx = tunnels.register(id);
    tunnel::relay(id, stream, tunnel_rx, queue.clone()).await;
    tunnels.remove(id);
}

async fn write_all(stream: &mut TcpStream, bytes: Vec<u8>) -> std::io::Result<()> {
    let (res, _buf) = stream.write_all(bytes).await;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{read_frame, write_frame};

    use crate::ship::uplink::Supervisor;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connect_fut = TcpStream::connect(addr);
        let accept_fut = listener.accept();
        let (client_res, server_res) = monoio::join!(connect_fut, accept_fut);
        (client_res.unwrap(), server_res.unwrap().0)
    }

    /// Stands in for the offshore node on the other end of the uplink:
    /// accepts one connection, answers a CONNECT request's handshake,
    /// echoes back (uppercased) whatever tunnel bytes arrive, then
    /// half-closes. Returns the id it observed so the test can assert on
    /// tunnel-table cleanup afterward.
    async fn fake_offshore(listener: TcpListener) -> CorrelationId {
        let (mut conn, _) = listener.accept().await.unwrap();
        let request = read_frame(&mut conn).await.unwrap();
        assert!(String::from_utf8_lossy(&request.payload).starts_with("CONNECT"));
        let id = request.id;

        write_frame(&mut conn, id, responses::CONNECTION_ESTABLISHED.to_vec())
            .await
            .unwrap();

        let continuation = read_frame(&mut conn).await.unwrap();
        assert_eq!(continuation.id, id);
        let mut echoed = continuation.payload.clone();
        echoed.make_ascii_uppercase();
        write_frame(&mut conn, id, echoed).await.unwrap();

        // Half-close sentinel: no more tunnel bytes from this side.
        write_frame(&mut conn, id, Vec::new()).await.unwrap();
        id
    }

    // Regression test for a bug where `handle_connect` registered the
    // tunnel subchannel before the CONNECT request had even been sent,
    // so `reader_loop`'s tunnel-table check (which runs before the
    // pending-table check) swallowed the handshake frame itself and the
    // handler hung until its 60s deadline. Drives a full CONNECT round
    // trip through `handle_connect`/`tunnel::relay` against a fake
    // offshore peer and would hang (and eventually time out) if that
    // ordering regressed.
    #[monoio::test_all]
    async fn connect_round_trip_establishes_and_relays_tunnel_bytes() {
        let uplink_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let uplink_addr = uplink_listener.local_addr().unwrap();
        let offshore = monoio::spawn(fake_offshore(uplink_listener));

        let pending = PendingTable::new();
        let tunnels = TunnelTable::new();
        let (supervisor, queue) = Supervisor::new(
            uplink_addr.ip().to_string(),
            uplink_addr.port(),
            pending.clone(),
            tunnels.clone(),
            16,
        );
        supervisor.spawn();

        let (mut client, ship_side) = loopback_pair().await;
        let request_bytes = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n".to_vec();

        let connect_fut = handle_connect(ship_side, "example.test:443", request_bytes, &queue, &pending, &tunnels);
        let client_fut = async {
            let buf = vec![0u8; 256];
            let (res, buf) = client.read(buf).await;
            let n = res.unwrap();
            assert_eq!(&buf[..n], responses::CONNECTION_ESTABLISHED);

            let (res, _buf) = client.write_all(b"hello".to_vec()).await;
            res.unwrap();

            let buf = vec![0u8; 256];
            let (res, buf) = client.read(buf).await;
            let n = res.unwrap();
            assert_eq!(&buf[..n], b"HELLO");

            // The fake offshore's half-close sentinel shuts the client's
            // read half down.
            let buf = vec![0u8; 16];
            let (res, _buf) = client.read(buf).await;
            assert_eq!(res.unwrap(), 0);
        };

        monoio::join!(connect_fut, client_fut);
        let id = offshore.await;

        assert!(pending.is_empty());
        assert!(!tunnels.contains(id));
    }
}
