//! Per-request dispatch: one independent worker per inbound frame,
//! spawned by the uplink reader and never waited on by it. Decides
//! between a CONNECT tunnel and a plain origin fetch, and guarantees
//! exactly one response frame is emitted per request frame, including on
//! failure.

use monoio::net::TcpStream;
use tether_core::CorrelationId;
use tracing::warn;

use crate::httpraw::{self, responses};
use crate::offshore::origin;
use crate::offshore::UplinkSink;
use crate::tunnel::{self, FrameSink, TunnelTable};

pub async fn handle_request(id: CorrelationId, request_bytes: Vec<u8>, sink: UplinkSink, tunnels: TunnelTable) {
    let head_end = match httpraw::find_head_end(&request_bytes) {
        Some(end) => end,
        None => {
            sink.send_frame(id, responses::BAD_REQUEST.to_vec()).await;
            return;
        }
    };

    let parsed = match httpraw::parse_request_head(&request_bytes[..head_end]) {
        Ok(p) => p,
        Err(_) => {
            sink.send_frame(id, responses::BAD_REQUEST.to_vec()).await;
            return;
        }
    };

    if parsed.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(id, &parsed.target, sink, tunnels).await;
        return;
    }

    match origin::fetch(&request_bytes).await {
        Ok(response) => {
            sink.send_frame(id, response).await;
        }
        Err(e) => {
            warn!(%id, error = %e, "origin fetch failed");
            sink.send_frame(id, responses::INTERNAL_SERVER_ERROR.to_vec()).await;
        }
    }
}

async fn handle_connect(id: CorrelationId, target: &str, sink: UplinkSink, tunnels: TunnelTable) {
    let (host, port) = match httpraw::parse_connect_authority(target) {
        Ok(hp) => hp,
        Err(_) => {
            sink.send_frame(id, responses::BAD_REQUEST.to_vec()).await;
            return;
        }
    };

    let origin_socket = match TcpStream::connect((host.as_str(), port)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%id, %host, port, error = %e, "failed to connect to CONNECT target");
            sink.send_frame(id, responses::INTERNAL_SERVER_ERROR.to_vec()).await;
            return;
        }
    };

    let tunnel_rx = tunnels.register(id);
    if !sink.send_frame(id, responses::CONNECTION_ESTABLISHED.to_vec()).await {
        tunnels.remove(id);
        return;
    }

    tunnel::relay(id, origin_socket, tunnel_rx, sink).await;
    tunnels.remove(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
    use monoio::net::TcpListener;

    #[monoio::test_all]
    async fn connect_request_establishes_and_relays_tunnel_bytes() {
        let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let origin_addr = origin_listener.local_addr().unwrap();

        // Stands in for the true origin the CONNECT target names: reads
        // whatever the tunnel forwards, then replies once and closes.
        let origin = monoio::spawn(async move {
            let (mut conn, _) = origin_listener.accept().await.unwrap();
            let buf = vec![0u8; 64];
            let (res, buf) = conn.read(buf).await;
            let n = res.unwrap();
            assert_eq!(&buf[..n], b"ping");
            let (res, _buf) = conn.write_all(b"pong".to_vec()).await;
            res.unwrap();
        });

        let (sink, rx) = UplinkSink::new();
        let tunnels = TunnelTable::new();
        let id = CorrelationId::new_random();
        let request = format!(
            "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
            port = origin_addr.port()
        );

        let worker = monoio::spawn(handle_request(id, request.into_bytes(), sink, tunnels.clone()));

        let (established_id, established_payload) = rx.recv().await.unwrap();
        assert_eq!(established_id, id);
        assert_eq!(established_payload, responses::CONNECTION_ESTABLISHED);

        // Simulates the ship forwarding client bytes for this tunnel id —
        // the same routing `offshore::listener::dispatch` performs.
        assert!(tunnels.route(id, b"ping".to_vec()));

        let (reply_id, reply_payload) = rx.recv().await.unwrap();
        assert_eq!(reply_id, id);
        assert_eq!(reply_payload, b"pong");

        let (close_id, close_payload) = rx.recv().await.unwrap();
        assert_eq!(close_id, id);
        assert!(close_payload.is_empty());

        // Our own half-close, unblocking the relay's inbound side so
        // `handle_request` returns.
        assert!(tunnels.route(id, Vec::new()));

        worker.await;
        origin.await;
        assert!(!tunnels.contains(id));
    }
}
