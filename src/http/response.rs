use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncRead;

use crate::http::compression;
use crate::http::conditional::{
    etag_matches, file_etag, format_http_time, parse_http_time, truncate_to_secs,
};
use crate::http::mime::mime_type_for_path;
use crate::http::request::Request;

/// Value of the `Server` header stamped on every response.
pub const SERVER_NAME: &str = concat!("lantern/", env!("CARGO_PKG_VERSION"));

/// Files at or above this size are streamed instead of loaded into memory.
pub const STREAM_THRESHOLD: u64 = 256 * 1024;

const FILE_CACHE_CONTROL: &str = "public, max-age=3600";

/// HTTP status codes supported by the server.
///
/// Common HTTP status codes used in responses:
/// - `SwitchingProtocols` (101): WebSocket upgrade accepted
/// - `Ok` (200): Request successful
/// - `NotModified` (304): Conditional GET matched
/// - `BadRequest` (400): Malformed request
/// - `NotFound` (404): Resource not found
/// - `PayloadTooLarge` (413): Request exceeded the size limit
/// - `TooManyRequests` (429): Rate limit exceeded
/// - `InternalServerError` (500): Handler failed
/// - `ServiceUnavailable` (503): Connection limit reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// 101 Switching Protocols
    SwitchingProtocols,
    /// 200 OK
    Ok,
    /// 201 Created
    Created,
    /// 202 Accepted
    Accepted,
    /// 204 No Content
    NoContent,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 302 Found
    Found,
    /// 304 Not Modified
    NotModified,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 409 Conflict
    Conflict,
    /// 411 Length Required
    LengthRequired,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 429 Too Many Requests
    TooManyRequests,
    /// 500 Internal Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
    /// 502 Bad Gateway
    BadGateway,
    /// 503 Service Unavailable
    ServiceUnavailable,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use lantern::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::NotModified.as_u16(), 304);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::SwitchingProtocols => 101,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::Accepted => 202,
            StatusCode::NoContent => 204,
            StatusCode::MovedPermanently => 301,
            StatusCode::Found => 302,
            StatusCode::NotModified => 304,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::Conflict => 409,
            StatusCode::LengthRequired => 411,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::TooManyRequests => 429,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::BadGateway => 502,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use lantern::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::PayloadTooLarge.reason_phrase(), "Payload Too Large");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::SwitchingProtocols => "Switching Protocols",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::Accepted => "Accepted",
            StatusCode::NoContent => "No Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::Found => "Found",
            StatusCode::NotModified => "Not Modified",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::Conflict => "Conflict",
            StatusCode::LengthRequired => "Length Required",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::TooManyRequests => "Too Many Requests",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason_phrase())
    }
}

pub type BodyReader = Pin<Box<dyn AsyncRead + Send>>;

/// Response payload.
///
/// `Full` bodies live in memory. `Stream` bodies are read lazily by the
/// writer in bounded chunks; `len` is what `Content-Length` advertises.
pub enum Body {
    Full(Vec<u8>),
    Stream { reader: BodyReader, len: u64 },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Full(bytes) => bytes.len() as u64,
            Body::Stream { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Full(Vec::new())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Body::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
        }
    }
}

/// Represents a complete HTTP response ready to be sent to a client.
///
/// Header names are canonicalized to Title-Case on insertion. Every body
/// mutator re-derives `Content-Length` unless the response has been
/// switched to chunked transfer encoding.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HashMap<String, String>,
    body: Body,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl Response {
    /// Creates an empty response carrying `Server`, `Date` and a zero
    /// `Content-Length`.
    pub fn new(status: StatusCode) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Server".to_string(), SERVER_NAME.to_string());
        headers.insert("Date".to_string(), format_http_time(SystemTime::now()));
        headers.insert("Content-Length".to_string(), "0".to_string());
        Self {
            status,
            headers,
            body: Body::default(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&canonical_header_name(name))
            .map(|v| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Adds or replaces a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let name = canonical_header_name(name);
        let framing = name == "Transfer-Encoding";
        self.headers.insert(name, value.into());
        if framing {
            self.sync_content_length();
        }
        self
    }

    /// Appends to an existing header as a comma-separated list.
    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        let name = canonical_header_name(name);
        let framing = name == "Transfer-Encoding";
        self.headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        if framing {
            self.sync_content_length();
        }
        self
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        let name = canonical_header_name(name);
        if self.headers.remove(&name).is_some() && name == "Transfer-Encoding" {
            self.sync_content_length();
        }
        self
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// In-memory body bytes; empty for streamed bodies.
    pub fn body_bytes(&self) -> &[u8] {
        match &self.body {
            Body::Full(bytes) => bytes,
            Body::Stream { .. } => &[],
        }
    }

    pub fn into_parts(self) -> (StatusCode, HashMap<String, String>, Body) {
        (self.status, self.headers, self.body)
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = Body::Full(body.into());
        self.sync_content_length();
        self
    }

    pub fn set_content_type(&mut self, content_type: &str) -> &mut Self {
        self.set_header("Content-Type", content_type)
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.set_content_type("text/plain; charset=utf-8");
        self.set_body(text.into())
    }

    pub fn set_html(&mut self, html: impl Into<String>) -> &mut Self {
        self.set_content_type("text/html; charset=utf-8");
        self.set_body(html.into())
    }

    pub fn set_json(&mut self, json: impl Into<String>) -> &mut Self {
        self.set_content_type("application/json");
        self.set_body(json.into())
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.set_header("Connection", if keep_alive { "keep-alive" } else { "close" })
    }

    pub fn set_cache_control(&mut self, value: &str) -> &mut Self {
        self.set_header("Cache-Control", value)
    }

    pub fn set_cors_headers(&mut self, origin: &str) -> &mut Self {
        self.set_header("Access-Control-Allow-Origin", origin);
        self.set_header(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        );
        self.set_header("Access-Control-Allow-Headers", "Content-Type, Authorization")
    }

    /// Sets a quoted `ETag`, with the `W/` prefix when `weak`.
    pub fn set_etag(&mut self, etag: &str, weak: bool) -> &mut Self {
        let value = if weak {
            format!("W/\"{etag}\"")
        } else {
            format!("\"{etag}\"")
        };
        self.set_header("ETag", value)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("ETag")
    }

    pub fn set_last_modified(&mut self, time: SystemTime) -> &mut Self {
        self.set_header("Last-Modified", format_http_time(time))
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.header("Last-Modified").and_then(parse_http_time)
    }

    /// Switches between chunked transfer encoding and a fixed length.
    pub fn set_chunked(&mut self, chunked: bool) -> &mut Self {
        if chunked {
            self.set_header("Transfer-Encoding", "chunked")
        } else {
            self.remove_header("Transfer-Encoding");
            self.sync_content_length();
            self
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn is_compressed(&self) -> bool {
        self.has_header("Content-Encoding")
    }

    /// Loads a whole file into the body.
    ///
    /// A missing file turns the response into a 404; any other read error
    /// into a 500. Never fails outward.
    pub fn set_file_content(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(content) => {
                self.set_content_type(mime_type_for_path(path));
                self.set_body(content)
            }
            Err(e) => self.set_file_error(path, e),
        }
    }

    /// Serves a file as a lazily read body of known size.
    pub fn set_file_stream(&mut self, path: impl AsRef<Path>) -> &mut Self {
        let path = path.as_ref();
        let opened = std::fs::File::open(path).and_then(|file| {
            let len = file.metadata()?.len();
            Ok((file, len))
        });

        match opened {
            Ok((file, len)) => {
                self.set_content_type(mime_type_for_path(path));
                self.body = Body::Stream {
                    reader: Box::pin(tokio::fs::File::from_std(file)),
                    len,
                };
                self.sync_content_length();
                self
            }
            Err(e) => self.set_file_error(path, e),
        }
    }

    fn set_file_error(&mut self, path: &Path, e: io::Error) -> &mut Self {
        if e.kind() == io::ErrorKind::NotFound {
            self.set_status(StatusCode::NotFound);
            self.set_text("File not found")
        } else {
            tracing::warn!(path = %path.display(), error = %e, "failed to read file");
            self.set_status(StatusCode::InternalServerError);
            self.set_text("Error reading file")
        }
    }

    /// Gzips the body with default settings when the client accepts it.
    ///
    /// Returns whether the body was replaced.
    pub fn compress_body_if_supported(&mut self, accept_encoding: &str) -> bool {
        self.compress_body_with(
            accept_encoding,
            compression::DEFAULT_MIN_SIZE,
            compression::DEFAULT_LEVEL,
        )
    }

    pub fn compress_body_with(&mut self, accept_encoding: &str, min_size: usize, level: u32) -> bool {
        if !compression::supports_gzip(accept_encoding) || self.is_compressed() {
            return false;
        }
        let eligible = self
            .header("Content-Type")
            .map(compression::is_compressible)
            .unwrap_or(false);
        let body = match &self.body {
            Body::Full(bytes) if eligible && !bytes.is_empty() && bytes.len() >= min_size => bytes,
            _ => return false,
        };

        let compressed = match compression::gzip_compress(body, level) {
            Ok(compressed) if compressed.len() < body.len() => compressed,
            Ok(_) => return false,
            Err(e) => {
                tracing::debug!(error = %e, "gzip failed, sending identity body");
                return false;
            }
        };

        self.set_body(compressed);
        self.set_header("Content-Encoding", "gzip");
        self.add_header("Vary", "Accept-Encoding");
        true
    }

    fn sync_content_length(&mut self) {
        if self.is_chunked() {
            self.headers.remove("Content-Length");
        } else {
            self.headers
                .insert("Content-Length".to_string(), self.body.len().to_string());
        }
    }

    /// Creates a simple 200 OK text response with the given body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.into())
            .build()
    }

    /// Creates a 404 Not Found response.
    pub fn not_found(message: &str) -> Self {
        let mut response = Self::new(StatusCode::NotFound);
        response.set_text(message);
        response
    }

    pub fn bad_request(message: &str) -> Self {
        let mut response = Self::new(StatusCode::BadRequest);
        response.set_text(message);
        response
    }

    /// Creates a 500 Internal Server Error response.
    pub fn internal_error(message: &str) -> Self {
        let mut response = Self::new(StatusCode::InternalServerError);
        response.set_text(message);
        response
    }

    pub fn json(data: impl Into<String>, status: StatusCode) -> Self {
        let mut response = Self::new(status);
        response.set_json(data);
        response
    }

    /// File response; small files are buffered, large ones streamed.
    pub fn file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut response = Self::new(StatusCode::Ok);
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if size >= STREAM_THRESHOLD {
            response.set_file_stream(path);
        } else {
            response.set_file_content(path);
        }
        response
    }

    /// File response honoring `If-None-Match` and `If-Modified-Since`.
    ///
    /// The ETag is derived from path, size and mtime. `If-None-Match`
    /// takes precedence; the date is only consulted without it.
    pub fn conditional_file_response(path: impl AsRef<Path>, request: &Request) -> Self {
        let path = path.as_ref();
        let meta = match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Self::not_found("File not found"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Self::not_found("File not found");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "stat failed");
                return Self::internal_error("Error processing conditional request");
            }
        };

        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let etag = file_etag(path, meta.len(), modified);
        let quoted = format!("\"{etag}\"");

        let not_modified = match request.if_none_match() {
            Some(candidates) => etag_matches(&quoted, candidates),
            None => request
                .if_modified_since()
                .and_then(parse_http_time)
                .map(|since| truncate_to_secs(modified) <= since)
                .unwrap_or(false),
        };

        if not_modified {
            let mut response = Self::new(StatusCode::NotModified);
            response
                .set_etag(&etag, false)
                .set_last_modified(modified)
                .set_cache_control(FILE_CACHE_CONTROL);
            return response;
        }

        let mut response = Self::file(path);
        if response.status() == StatusCode::Ok {
            response
                .set_etag(&etag, false)
                .set_last_modified(modified)
                .set_cache_control(FILE_CACHE_CONTROL);
        }
        response
    }

    /// HTML error page used by the server for its own failures.
    pub fn error_page(status: StatusCode, message: &str) -> Self {
        let title = status.to_string();
        let html = format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body>\n\
             <h1>{title}</h1>\n<p>{}</p>\n<hr>\n<address>{SERVER_NAME}</address>\n</body>\n</html>\n",
            escape_html(message)
        );
        let mut response = Self::new(status);
        response.set_html(html);
        response
    }
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```
/// # use lantern::http::response::{ResponseBuilder, StatusCode};
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("content-type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// assert_eq!(response.header("Content-Type"), Some("application/json"));
/// assert_eq!(response.header("Content-Length"), Some("2"));
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the final Response.
    ///
    /// `Content-Length` follows the body unless a header set on the builder
    /// overrides it.
    pub fn build(self) -> Response {
        let mut response = Response::new(self.status);
        response.set_body(self.body);
        for (key, value) in self.headers {
            response.set_header(&key, value);
        }
        if response.is_chunked() {
            response.headers.remove("Content-Length");
        }
        response
    }
}

/// `content-type` → `Content-Type`.
pub fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
