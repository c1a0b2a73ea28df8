//! Wire codec for the uplink: `4-byte big-endian length || 16-byte
//! CorrelationId || payload`.

use std::fmt;

use monoio::io::{AsyncReadRentExt, AsyncWriteRentExt};

/// Length, in bytes, of a [`CorrelationId`].
pub const ID_LEN: usize = 16;

/// Upper bound on a frame's declared body length. The wire protocol does
/// not impose one; we do, to keep a single corrupt length prefix from
/// exhausting memory.
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

/// A 16-byte opaque correlation key matching a response to the request
/// that produced it. Never inspected semantically, only compared.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId([u8; ID_LEN]);

impl CorrelationId {
    /// The reserved all-zero id, available for an optional keepalive
    /// frame; never assigned to a real request.
    pub const RESERVED: CorrelationId = CorrelationId([0u8; ID_LEN]);

    /// Generates a fresh random id. Collisions within one ship process are
    /// astronomically unlikely at 128 bits and are not guarded against.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        CorrelationId(bytes)
    }

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        CorrelationId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn is_reserved(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A decoded frame: the correlation id plus the opaque HTTP payload that
/// followed it.
#[derive(Debug)]
pub struct Frame {
    pub id: CorrelationId,
    pub payload: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("peer closed the connection mid-frame")]
    ShortRead,
    #[error("frame length {0} is shorter than the correlation id ({ID_LEN} bytes)")]
    Malformed(u32),
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN}-byte cap")]
    TooLarge(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Malformed framing is fatal to the whole uplink connection, never
    /// just to the one request that triggered it.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, FrameError::Malformed(_) | FrameError::TooLarge(_))
    }
}

/// Reads one frame off `stream`. Reads exactly 4 bytes for the length
/// prefix, then exactly `L` bytes for the body, then splits the first 16
/// of those into the [`CorrelationId`].
pub async fn read_frame<S>(stream: &mut S) -> Result<Frame, FrameError>
where
    S: monoio::io::AsyncReadRent,
{
    let len_buf = vec![0u8; 4];
    let (res, len_buf) = stream.read_exact(len_buf).await;
    match res {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::ShortRead),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]);
    if (len as usize) < ID_LEN {
        return Err(FrameError::Malformed(len));
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let body_buf = vec![0u8; len as usize];
    let (res, body_buf) = stream.read_exact(body_buf).await;
    match res {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::ShortRead),
        Err(e) => return Err(e.into()),
    }

    let mut id_bytes = [0u8; ID_LEN];
    id_bytes.copy_from_slice(&body_buf[..ID_LEN]);
    let payload = body_buf[ID_LEN..].to_vec();
    Ok(Frame {
        id: CorrelationId(id_bytes),
        payload,
    })
}

/// Writes one frame to `stream`. Callers are responsible for ensuring no
/// two `write_frame` calls run concurrently on the same stream; in this
/// codebase that is guaranteed structurally by having exactly one task own
/// the write half of the uplink socket at a time (see
/// `tether-services::ship::uplink`).
///
/// On failure the original `payload` is handed back alongside the error so
/// a caller that wants at-least-once delivery by re-queueing the frame
/// doesn't need to keep its own extra copy around on the common,
/// successful path.
pub async fn write_frame<S>(
    stream: &mut S,
    id: CorrelationId,
    payload: Vec<u8>,
) -> Result<(), (FrameError, Vec<u8>)>
where
    S: monoio::io::AsyncWriteRent,
{
    let mut wire = Vec::with_capacity(4 + ID_LEN + payload.len());
    let len = (ID_LEN + payload.len()) as u32;
    wire.extend_from_slice(&len.to_be_bytes());
    wire.extend_from_slice(id.as_bytes());
    wire.extend(payload);
    let (res, mut wire) = stream.write_all(wire).await;
    match res {
        Ok(_) => Ok(()),
        Err(e) => {
            let payload = if wire.len() >= 4 + ID_LEN {
                wire.split_off(4 + ID_LEN)
            } else {
                Vec::new()
            };
            Err((FrameError::Io(e), payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monoio::net::{TcpListener, TcpStream};

    // Exercise the codec over a real loopback TCP pair rather than a
    // hand-rolled AsyncReadRent/AsyncWriteRent fake, since monoio's I/O
    // traits are implemented for its own socket types and a loopback pair
    // is cheap enough to set up per test.
    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connect_fut = TcpStream::connect(addr);
        let accept_fut = listener.accept();
        let (client_res, server_res) = monoio::join!(connect_fut, accept_fut);
        (client_res.unwrap(), server_res.unwrap().0)
    }

    #[monoio::test_all]
    async fn round_trips_id_and_payload() {
        let (mut a, mut b) = loopback_pair().await;
        let id = CorrelationId::new_random();
        let payload = b"GET / HTTP/1.1\r\n\r\n".to_vec();

        let write_fut = write_frame(&mut a, id, payload.clone());
        let read_fut = read_frame(&mut b);
        let (write_res, read_res) = monoio::join!(write_fut, read_fut);
        write_res.unwrap();
        let frame = read_res.unwrap();
        assert_eq!(frame.id, id);
        assert_eq!(frame.payload, payload);
    }

    #[monoio::test_all]
    async fn round_trips_empty_payload_as_half_close_sentinel() {
        let (mut a, mut b) = loopback_pair().await;
        let id = CorrelationId::new_random();

        let (write_res, read_res) = monoio::join!(write_frame(&mut a, id, Vec::new()), read_frame(&mut b));
        write_res.unwrap();
        let frame = read_res.unwrap();
        assert_eq!(frame.id, id);
        assert!(frame.payload.is_empty());
    }

    #[monoio::test_all]
    async fn rejects_length_shorter_than_id() {
        let (mut a, mut b) = loopback_pair().await;
        let (res, _buf) = a.write_all(vec![0u8, 0, 0, 4, 1, 2, 3, 4]).await;
        res.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[monoio::test_all]
    async fn rejects_oversized_frame() {
        let (mut a, mut b) = loopback_pair().await;
        let mut buf = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        buf.extend(std::iter::repeat(0u8).take(ID_LEN));
        let (res, _buf) = a.write_all(buf).await;
        res.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[monoio::test_all]
    async fn short_read_mid_frame_is_reported() {
        let (mut a, mut b) = loopback_pair().await;
        // Declares a 32-byte body but only supplies the id (16 bytes), then
        // closes the connection.
        let mut buf = 32u32.to_be_bytes().to_vec();
        buf.extend(std::iter::repeat(0u8).take(ID_LEN));
        let (res, _buf) = a.write_all(buf).await;
        res.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::ShortRead));
    }
}
