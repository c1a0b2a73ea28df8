//! Plain (non-CONNECT) origin fetch: opens a TCP connection to the origin
//! host, replays the request bytes with `Connection: close` forced, and
//! reads the response until the origin closes the connection.

use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use tether_core::{IO_CHUNK_SIZE, MAX_RESPONSE_BYTES};

use crate::httpraw;

#[derive(thiserror::Error, Debug)]
pub enum OriginError {
    #[error("origin request had no Host header")]
    MissingHost,
    #[error("failed to connect to origin: {0}")]
    Connect(std::io::Error),
    #[error("origin response exceeded the {MAX_RESPONSE_BYTES}-byte cap")]
    ResponseTooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Performs one plain HTTP request/response round trip against the
/// origin named by `request_bytes`'s `Host` header, returning the raw
/// response bytes read until the origin closes its side.
pub async fn fetch(request_bytes: &[u8]) -> Result<Vec<u8>, OriginError> {
    let host_header = httpraw::extract_host(request_bytes).ok_or(OriginError::MissingHost)?;
    let (host, port) = httpraw::split_host_port(&host_header, 80);
    let rewritten = httpraw::force_connection_close(request_bytes);

    let mut stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(OriginError::Connect)?;

    let (res, _buf) = stream.write_all(rewritten).await;
    res?;

    read_until_close(&mut stream).await
}

async fn read_until_close(stream: &mut TcpStream) -> Result<Vec<u8>, OriginError> {
    let mut response = Vec::new();
    loop {
        let chunk = vec![0u8; IO_CHUNK_SIZE];
        let (res, chunk) = stream.read(chunk).await;
        let n = res?;
        if n == 0 {
            return Ok(response);
        }
        if response.len() + n > MAX_RESPONSE_BYTES {
            return Err(OriginError::ResponseTooLarge);
        }
        response.extend_from_slice(&chunk[..n]);
    }
}
