//! Constants shared by both nodes, exposed as `pub const` defaults rather
//! than hardcoded literals scattered through the binaries, so the CLI
//! layer in each binary can override them for local testing without
//! touching protocol code.

use std::time::Duration;

/// Default TCP port LocalNode listens on for client HTTP proxy traffic.
pub const DEFAULT_SHIP_PORT: u16 = 8080;

/// Default TCP port RemoteNode listens on for the uplink connection.
pub const DEFAULT_OFFSHORE_PORT: u16 = 9999;

/// Default `OFFSHORE_HOST` when unset.
pub const DEFAULT_OFFSHORE_HOST: &str = "localhost";

/// Wall-clock deadline a client-facing handler waits for its correlated
/// response before surfacing `504 Gateway Timeout`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff between uplink dial attempts while disconnected.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Default capacity of the bounded request queue feeding the uplink
/// Writer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Cap on a buffered "read until close" origin response: reading until
/// close avoids parsing the origin's `Content-Length`/chunked encoding,
/// but needs a bound to keep one slow or malicious origin from growing
/// memory without limit.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Cap on the buffered client request head (request line + headers)
/// while the ship intake looks for the terminating blank line.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Read chunk size used throughout the origin fetch and tunnel relays.
pub const IO_CHUNK_SIZE: usize = 8 * 1024;
