use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// HTTP request methods.
///
/// Anything outside the known set parses as `UNKNOWN`; such requests are
/// syntactically accepted by the parser but never considered valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// Any method token this server does not implement
    UNKNOWN,
}

impl Method {
    /// Parses an HTTP method token.
    ///
    /// Matching is case-sensitive, as method tokens are.
    ///
    /// # Example
    ///
    /// ```
    /// # use lantern::http::request::Method;
    /// assert_eq!(Method::from_token("GET"), Method::GET);
    /// assert_eq!(Method::from_token("get"), Method::UNKNOWN);
    /// ```
    pub fn from_token(s: &str) -> Self {
        match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            _ => Method::UNKNOWN,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::UNKNOWN => "UNKNOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a parsed HTTP request from a client.
///
/// Header names are stored lowercased; lookups through [`Request::header`]
/// are case-insensitive. The path is kept exactly as received (no
/// percent-decoding) and the query string is split off into
/// `query_params`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request path without the query string (e.g., "/index.html")
    pub path: String,
    /// Query parameters; duplicate keys keep the last value
    pub query_params: HashMap<String, String>,
    /// HTTP version ("HTTP/1.0" or "HTTP/1.1")
    pub version: String,
    /// Request headers keyed by lowercase name
    pub headers: HashMap<String, String>,
    /// Request body, already de-chunked when chunked encoding was used
    pub body: Vec<u8>,
    /// Peer address of the connection the request arrived on
    pub remote_addr: Option<SocketAddr>,
}

/// Builder for constructing Request objects.
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    path: Option<String>,
    version: Option<String>,
    query_params: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    remote_addr: Option<SocketAddr>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: self.path.ok_or("path missing")?,
            query_params: self.query_params,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            body: self.body,
            remote_addr: self.remote_addr,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(v) => Some(v.as_str()),
            None => self
                .headers
                .get(&key.to_ascii_lowercase())
                .map(|v| v.as_str()),
        }
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.header(key).is_some()
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|v| v.as_str())
    }

    pub fn has_query_param(&self, name: &str) -> bool {
        self.query_params.contains_key(name)
    }

    /// Retrieves the Content-Length header value and parses it as a usize.
    ///
    /// Returns 0 if the header is missing or not a valid number.
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    /// Whether the request carries a chunked `Transfer-Encoding`.
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// An explicit `Connection: close` or `Connection: keep-alive` token wins.
    /// Without one, HTTP/1.1 defaults to keep-alive and HTTP/1.0 to close.
    pub fn is_keep_alive(&self) -> bool {
        if let Some(value) = self.header("connection") {
            let mut tokens = value.split(',').map(|t| t.trim());
            if tokens.clone().any(|t| t.eq_ignore_ascii_case("close")) {
                return false;
            }
            if tokens.any(|t| t.eq_ignore_ascii_case("keep-alive")) {
                return true;
            }
        }
        self.version == "HTTP/1.1"
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.header("if-none-match")
    }

    pub fn if_modified_since(&self) -> Option<&str> {
        self.header("if-modified-since")
    }

    pub fn if_match(&self) -> Option<&str> {
        self.header("if-match")
    }

    pub fn if_unmodified_since(&self) -> Option<&str> {
        self.header("if-unmodified-since")
    }

    pub fn is_conditional(&self) -> bool {
        self.if_none_match().is_some()
            || self.if_modified_since().is_some()
            || self.if_match().is_some()
            || self.if_unmodified_since().is_some()
    }

    /// Serializes the request back into HTTP/1.x wire bytes.
    ///
    /// A `Content-Length` header is added when the body is non-empty and
    /// the request declares neither a length nor a transfer encoding.
    pub fn to_wire_format(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.body.len());

        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.path.as_bytes());
        if !self.query_params.is_empty() {
            let query = self
                .query_params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            buf.push(b'?');
            buf.extend_from_slice(query.as_bytes());
        }
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (k, v) in &self.headers {
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(v.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if !self.body.is_empty()
            && !self.has_header("content-length")
            && !self.has_header("transfer-encoding")
        {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
        buf
    }
}
