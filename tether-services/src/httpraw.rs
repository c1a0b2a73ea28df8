//! Minimal, byte-preserving HTTP/1.1 head parsing shared by the ship
//! intake and the offshore dispatcher. Both sides need to pick a handful
//! of facts out of a request (method, `Content-Length`, `Host`) without
//! ever reconstructing or re-serializing the bytes they forward — the
//! uplink and the origin connection both see exactly what the client
//! sent. Header inspection uses `httparse`, which parses in place and
//! hands back slices into the original buffer, so casing and ordering are
//! never touched.

use tether_core::MAX_HEADER_BYTES;

#[derive(thiserror::Error, Debug)]
pub enum HttpRawError {
    #[error("client request headers exceeded {MAX_HEADER_BYTES} bytes")]
    HeadersTooLarge,
    #[error("malformed request head")]
    Malformed,
    #[error("client closed the connection")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Byte offset of the first byte after the blank line terminating the
/// request/response head, if the full head is present in `buf`.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub struct ParsedHead {
    pub method: String,
    pub target: String,
    pub content_length: Option<usize>,
}

/// Parses the request line and headers in `head` (the bytes up to and
/// including the terminating `\r\n\r\n`) to extract the method, the
/// request target, and `Content-Length` if present. Does not allocate a
/// copy of `head` itself; the caller keeps forwarding the original bytes.
pub fn parse_request_head(head: &[u8]) -> Result<ParsedHead, HttpRawError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(HttpRawError::Malformed),
        Err(_) => return Err(HttpRawError::Malformed),
    }
    let method = req.method.ok_or(HttpRawError::Malformed)?.to_string();
    let target = req.path.ok_or(HttpRawError::Malformed)?.to_string();
    let content_length = header_value(req.headers, "content-length")
        .map(|v| v.parse::<usize>().map_err(|_| HttpRawError::Malformed))
        .transpose()?;
    Ok(ParsedHead {
        method,
        target,
        content_length,
    })
}

/// Case-insensitive header lookup over an already-parsed `httparse`
/// header slice.
pub fn header_value<'a>(headers: &'a [httparse::Header<'a>], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

/// Extracts the `Host` header from a raw request buffer (head + body),
/// for the offshore dispatcher, which only has the framed byte blob, not
/// a parsed request. Returns `None` if the header is absent or the head
/// cannot be parsed.
pub fn extract_host(request_bytes: &[u8]) -> Option<String> {
    let head_end = find_head_end(request_bytes)?;
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    req.parse(&request_bytes[..head_end]).ok()?;
    header_value(req.headers, "host").map(|s| s.to_string())
}

/// Splits a `Host` header value into `(host, port)`, defaulting to
/// `default_port` when no explicit `:port` suffix is present. Handles
/// bracketed IPv6 literals (`[::1]:8080`) by only splitting on the last
/// colon outside the brackets.
pub fn split_host_port(host_header: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = host_header.strip_prefix('[') {
        // IPv6 literal: "[addr]" or "[addr]:port"
        if let Some(end) = rest.find(']') {
            let addr = &rest[..end];
            let after = &rest[end + 1..];
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(default_port);
            return (addr.to_string(), port);
        }
    }
    match host_header.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host_header.to_string(), default_port),
        },
        None => (host_header.to_string(), default_port),
    }
}

/// Parses a CONNECT request target (`authority-form`, `host:port`) into
/// its parts. Unlike `split_host_port`, there is no sensible default
/// port for CONNECT — a missing port is a malformed request.
pub fn parse_connect_authority(target: &str) -> Result<(String, u16), HttpRawError> {
    let (host, port_str) = target.rsplit_once(':').ok_or(HttpRawError::Malformed)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port_str.parse::<u16>().map_err(|_| HttpRawError::Malformed)?;
    Ok((host.to_string(), port))
}

/// Returns `request_bytes` with its `Connection` header forced to
/// `close`, inserting one if absent. Operates purely on bytes: the head
/// is reparsed, the `Connection` header line (if any) is located by its
/// raw byte span, and that span is replaced/a new line is inserted before
/// the terminating blank line. Forcing the origin to close lets the
/// dispatcher read the response until EOF instead of parsing the origin's
/// `Content-Length` or chunked encoding.
pub fn force_connection_close(request_bytes: &[u8]) -> Vec<u8> {
    let Some(head_end) = find_head_end(request_bytes) else {
        return request_bytes.to_vec();
    };
    let head = &request_bytes[..head_end];
    let body = &request_bytes[head_end..];

    // Find an existing "Connection:" header line within the head (after
    // the request line) so it can be replaced in place.
    let mut line_start = match head.windows(2).position(|w| w == b"\r\n") {
        Some(i) => i + 2,
        None => head.len(),
    };
    let mut existing_line: Option<(usize, usize)> = None;
    while line_start < head.len() {
        let rest = &head[line_start..];
        if rest.starts_with(b"\r\n") {
            break;
        }
        let line_len = rest
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(rest.len());
        let line = &rest[..line_len];
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            if line[..colon].eq_ignore_ascii_case(b"connection") {
                existing_line = Some((line_start, line_start + line_len));
                break;
            }
        }
        line_start += line_len + 2;
    }

    let mut out = Vec::with_capacity(request_bytes.len() + 16);
    match existing_line {
        Some((start, end)) => {
            out.extend_from_slice(&head[..start]);
            out.extend_from_slice(b"Connection: close");
            out.extend_from_slice(&head[end..]);
        }
        None => {
            // Insert right before the terminating blank line.
            let insert_at = head_end.saturating_sub(2);
            out.extend_from_slice(&head[..insert_at]);
            out.extend_from_slice(b"Connection: close\r\n");
            out.extend_from_slice(&head[insert_at..]);
        }
    }
    out.extend_from_slice(body);
    out
}

pub mod responses {
    pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
    pub const BAD_REQUEST: &[u8] =
        b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    pub const NOT_IMPLEMENTED: &[u8] =
        b"HTTP/1.1 501 Not Implemented\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    pub const SERVICE_UNAVAILABLE: &[u8] =
        b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    pub const GATEWAY_TIMEOUT: &[u8] =
        b"HTTP/1.1 504 Gateway Timeout\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    pub const INTERNAL_SERVER_ERROR: &[u8] =
        b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_target_and_content_length() {
        let head = b"POST /upload HTTP/1.1\r\nHost: example.test\r\nContent-Length: 5\r\n\r\n";
        let parsed = parse_request_head(head).unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.target, "/upload");
        assert_eq!(parsed.content_length, Some(5));
    }

    #[test]
    fn extracts_host_with_explicit_port() {
        let req = b"GET / HTTP/1.1\r\nHost: example.test:8080\r\n\r\n";
        let host = extract_host(req).unwrap();
        assert_eq!(split_host_port(&host, 80), ("example.test".to_string(), 8080));
    }

    #[test]
    fn defaults_to_port_80_without_explicit_port() {
        assert_eq!(
            split_host_port("example.test", 80),
            ("example.test".to_string(), 80)
        );
    }

    #[test]
    fn parses_ipv6_host_with_port() {
        assert_eq!(
            split_host_port("[::1]:9000", 80),
            ("::1".to_string(), 9000)
        );
    }

    #[test]
    fn parses_connect_authority() {
        assert_eq!(
            parse_connect_authority("example.test:443").unwrap(),
            ("example.test".to_string(), 443)
        );
    }

    #[test]
    fn connect_authority_without_port_is_malformed() {
        assert!(parse_connect_authority("example.test").is_err());
    }

    #[test]
    fn forces_connection_close_by_inserting_header() {
        let req = b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n".to_vec();
        let rewritten = force_connection_close(&req);
        let text = String::from_utf8(rewritten).unwrap();
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn forces_connection_close_by_replacing_header() {
        let req = b"GET / HTTP/1.1\r\nHost: example.test\r\nConnection: keep-alive\r\n\r\n".to_vec();
        let rewritten = force_connection_close(&req);
        let text = String::from_utf8(rewritten).unwrap();
        assert!(text.contains("Connection: close"));
        assert!(!text.to_lowercase().contains("keep-alive"));
    }
}
