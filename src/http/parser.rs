use crate::http::request::{Method, Request};
use std::collections::HashMap;
use thiserror::Error;

/// Hard ceiling for a request body, whether length-delimited or chunked.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("header section is not terminated")]
    Incomplete,
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unsupported request method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("empty request path")]
    EmptyPath,
    #[error("body is shorter than the declared Content-Length")]
    TruncatedBody,
    #[error("body exceeds the 10 MiB limit")]
    BodyTooLarge,
    #[error("malformed chunked body: {0}")]
    InvalidChunk(&'static str),
}

/// How the body of a message is delimited, as declared by its headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Chunked,
    Length(usize),
}

/// Progress of a growing receive buffer toward one complete message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// More bytes are needed.
    Partial,
    /// The header section and the whole body are present.
    Complete,
    /// The headers declare a body that can never fit under the given limit.
    TooLarge,
}

/// Parses a buffer believed to hold one complete HTTP request.
///
/// Fails on malformed framing; header lines that fail token or value
/// validation are dropped individually instead of failing the request.
/// A request is only returned when it is valid: known method, non-empty
/// path and an HTTP/1.0 or HTTP/1.1 version.
pub fn parse_http_request(buf: &[u8]) -> Result<Request, ParseError> {
    let (headers_end, body_start) = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let header_block = &buf[..headers_end];
    let body_bytes = &buf[body_start..];

    let mut lines = split_lines(header_block);

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let request_line =
        std::str::from_utf8(request_line).map_err(|_| ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    let method = Method::from_token(method_str);
    let (path, query_params) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query_string(query)),
        None => (target, HashMap::new()),
    };

    // Headers
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = parse_header_line(line) {
            headers.insert(name, value);
        }
    }

    // Body
    let body = match framing(&headers) {
        Framing::Chunked => decode_chunked(body_bytes)?,
        Framing::Length(0) => Vec::new(),
        Framing::Length(len) => {
            if body_bytes.len() < len {
                return Err(ParseError::TruncatedBody);
            }
            if len > MAX_BODY_SIZE {
                return Err(ParseError::BodyTooLarge);
            }
            body_bytes[..len].to_vec()
        }
    };

    if method == Method::UNKNOWN {
        return Err(ParseError::InvalidMethod);
    }
    if path.is_empty() {
        return Err(ParseError::EmptyPath);
    }
    if !is_valid_http_version(version) {
        return Err(ParseError::InvalidVersion);
    }

    Ok(Request {
        method,
        path: path.to_string(),
        query_params,
        version: version.to_string(),
        headers,
        body,
        remote_addr: None,
    })
}

/// Decides whether `buf` holds a whole message yet.
///
/// Only the header section is inspected for framing; the body itself is
/// walked only for chunked encoding. A body declared larger than
/// `max_message` reports [`MessageStatus::TooLarge`] as soon as the
/// headers are in, so the caller can refuse it without waiting.
pub fn message_status(buf: &[u8], max_message: usize) -> MessageStatus {
    let Some((headers_end, body_start)) = find_headers_end(buf) else {
        return MessageStatus::Partial;
    };

    let mut headers = HashMap::new();
    for line in split_lines(&buf[..headers_end]).skip(1) {
        if let Some((name, value)) = parse_header_line(line) {
            headers.insert(name, value);
        }
    }

    let body = &buf[body_start..];
    match framing(&headers) {
        Framing::Chunked => {
            if chunked_body_complete(body) {
                MessageStatus::Complete
            } else {
                MessageStatus::Partial
            }
        }
        Framing::Length(len) => {
            if body_start.saturating_add(len) > max_message {
                MessageStatus::TooLarge
            } else if body.len() >= len {
                MessageStatus::Complete
            } else {
                MessageStatus::Partial
            }
        }
    }
}

/// Convenience predicate over [`message_status`] without a size limit.
pub fn is_message_complete(buf: &[u8]) -> bool {
    message_status(buf, usize::MAX) == MessageStatus::Complete
}

/// Returns `(end of headers, start of body)`.
///
/// `\r\n\r\n` is preferred; a bare `\n\n` terminator is accepted as a
/// fallback.
pub fn find_headers_end(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = find(buf, b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    find(buf, b"\n\n").map(|pos| (pos, pos + 2))
}

/// Decodes a chunked transfer-coded body.
///
/// Chunk extensions are ignored, decoding stops at the zero-size chunk and
/// trailers are not interpreted. The assembled body is capped at
/// [`MAX_BODY_SIZE`].
pub fn decode_chunked(data: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        if pos >= data.len() {
            return Err(ParseError::InvalidChunk("missing terminating chunk"));
        }

        let line_len = find(&data[pos..], b"\r\n")
            .ok_or(ParseError::InvalidChunk("unterminated chunk size line"))?;
        let size = parse_chunk_size(&data[pos..pos + line_len])?;
        pos += line_len + 2;

        if size == 0 {
            break;
        }

        if body.len().saturating_add(size) > MAX_BODY_SIZE {
            return Err(ParseError::BodyTooLarge);
        }
        let end = pos
            .checked_add(size)
            .filter(|end| *end <= data.len())
            .ok_or(ParseError::InvalidChunk("truncated chunk data"))?;
        body.extend_from_slice(&data[pos..end]);
        pos = end;

        if data.get(pos..pos + 2) != Some(b"\r\n".as_slice()) {
            return Err(ParseError::InvalidChunk("missing CRLF after chunk data"));
        }
        pos += 2;
    }

    Ok(body)
}

pub fn is_valid_http_version(version: &str) -> bool {
    version == "HTTP/1.0" || version == "HTTP/1.1"
}

/// RFC 7230 `token`: one or more `tchar`.
pub fn is_valid_header_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.iter().all(|&c| {
            c.is_ascii_alphanumeric()
                || matches!(
                    c,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// Field content may hold visible ASCII, SP, HTAB and obs-text; every other
/// control byte (CR and LF included) is refused.
pub fn is_valid_header_value(value: &[u8]) -> bool {
    value
        .iter()
        .all(|&c| c == b'\t' || c == b' ' || (0x21..=0x7e).contains(&c) || c >= 0x80)
}

fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    let colon = line.iter().position(|&c| c == b':')?;
    let name = trim_end(&line[..colon]);
    let value = trim(&line[colon + 1..]);

    if !is_valid_header_name(name) || !is_valid_header_value(value) {
        tracing::debug!(
            header = %String::from_utf8_lossy(name),
            "Dropping header that failed validation"
        );
        return None;
    }

    // Name is pure ASCII after validation.
    let name = String::from_utf8_lossy(name).to_ascii_lowercase();
    let value = String::from_utf8_lossy(value).into_owned();
    Some((name, value))
}

fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => params.insert(k.to_string(), v.to_string()),
            None => params.insert(pair.to_string(), String::new()),
        };
    }
    params
}

fn framing(headers: &HashMap<String, String>) -> Framing {
    let chunked = headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return Framing::Chunked;
    }

    let len = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    Framing::Length(len)
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let size = match line.iter().position(|&c| c == b';') {
        Some(semi) => &line[..semi],
        None => line,
    };
    let size = std::str::from_utf8(trim(size))
        .map_err(|_| ParseError::InvalidChunk("chunk size is not ASCII"))?;
    usize::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunk("invalid chunk size"))
}

/// Walks chunk headers without copying data; true once the zero-size chunk
/// and the blank line ending the (ignored) trailer section are buffered.
/// Structural garbage also reports true so the full parse can reject it
/// immediately instead of waiting for bytes that will never make it valid.
fn chunked_body_complete(data: &[u8]) -> bool {
    let mut pos = 0;
    loop {
        let Some(line_len) = find(&data[pos..], b"\r\n") else {
            return false;
        };
        let Ok(size) = parse_chunk_size(&data[pos..pos + line_len]) else {
            return true;
        };
        pos += line_len + 2;

        if size == 0 {
            // Trailer section: lines until an empty one.
            loop {
                let Some(line_len) = find(&data[pos..], b"\r\n") else {
                    return false;
                };
                if line_len == 0 {
                    return true;
                }
                pos += line_len + 2;
            }
        }

        match pos.checked_add(size).and_then(|p| p.checked_add(2)) {
            Some(next) if next <= data.len() => pos = next,
            Some(_) => return false,
            None => return true,
        }
    }
}

fn split_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block
        .split(|&c| c == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|c| *c != b' ' && *c != b'\t')
        .unwrap_or(bytes.len());
    trim_end(&bytes[start..])
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|c| *c != b' ' && *c != b'\t')
        .map(|i| i + 1)
        .unwrap_or(0);
    &bytes[..end]
}
