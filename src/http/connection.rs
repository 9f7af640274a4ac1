use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::http::parser::{MessageStatus, find_headers_end, message_status, parse_http_request};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::service::{Service, WorkerPool};
use crate::http::writer::ResponseWriter;
use crate::server::stats::ServerStats;
use crate::websocket::handshake::{handshake_rejection, is_websocket_request, validate_handshake};
use crate::websocket::{HandshakeError, WebSocketConfig, WebSocketConnection, WebSocketHandler};

/// Hard cap on bytes buffered for a single request.
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;

pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for receiving one complete request, armed at the start of
    /// every Reading phase.
    pub keep_alive_timeout: Duration,
    pub max_request_size: usize,
    /// Emit an access log line per request.
    pub log_requests: bool,
    pub websocket: WebSocketConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            max_request_size: MAX_REQUEST_SIZE,
            log_requests: true,
            websocket: WebSocketConfig::default(),
        }
    }
}

/// Everything a connection shares with the rest of the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub service: Arc<dyn Service>,
    pub workers: WorkerPool,
    pub stats: Arc<ServerStats>,
    pub config: ConnectionConfig,
}

impl ConnectionContext {
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            workers: WorkerPool::default(),
            stats: Arc::new(ServerStats::new()),
            config: ConnectionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_workers(mut self, workers: WorkerPool) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.stats = stats;
        self
    }
}

/// Request facts kept for the write phase and the access log.
#[derive(Debug)]
pub struct Exchange {
    method: Option<Method>,
    path: String,
    status: StatusCode,
    keep_alive: bool,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, Exchange),
    Upgrading(Request, Arc<dyn WebSocketHandler>),
    Closed,
}

/// How a Reading phase ended.
enum ReadOutcome {
    Request(Request),
    Malformed,
    TooLarge,
    PeerClosed,
    TimedOut,
}

/// One HTTP/1.x connection over any byte stream.
///
/// Requests are handled strictly one at a time: the next request is not
/// read until the previous response has been written.
pub struct Connection<S> {
    stream: S,
    buffer: BytesMut,
    state: ConnectionState,
    peer: Option<SocketAddr>,
    ctx: ConnectionContext,
    bytes_received: u64,
    bytes_sent: u64,
    created_at: Instant,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: Option<SocketAddr>, ctx: ConnectionContext) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            state: ConnectionState::Reading,
            peer,
            ctx,
            bytes_received: 0,
            bytes_sent: 0,
            created_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Drives the connection until it closes or is upgraded to a
    /// WebSocket, which then runs to completion on the same task.
    pub async fn run(mut self) -> anyhow::Result<()> {
        match self.drive().await {
            Ok(Some((request, handler))) => self.upgrade(request, handler).await,
            Ok(None) => {
                self.close().await;
                Ok(())
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> anyhow::Result<Option<(Request, Arc<dyn WebSocketHandler>)>> {
        loop {
            match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => {
                    self.state = match self.read_request().await? {
                        ReadOutcome::Request(request) => ConnectionState::Processing(request),
                        ReadOutcome::Malformed => {
                            self.ctx.stats.record_request();
                            self.error_response(StatusCode::BadRequest, "Bad request")
                        }
                        ReadOutcome::TooLarge => {
                            self.ctx.stats.record_request();
                            self.error_response(StatusCode::PayloadTooLarge, "Request too large")
                        }
                        ReadOutcome::PeerClosed => ConnectionState::Closed,
                        ReadOutcome::TimedOut => {
                            tracing::debug!(peer = ?self.peer, "read timed out");
                            ConnectionState::Closed
                        }
                    };
                }

                ConnectionState::Processing(mut request) => {
                    self.ctx.stats.record_request();
                    request.remote_addr = self.peer;

                    if is_websocket_request(&request) {
                        match self.accept_upgrade(&request) {
                            Ok(handler) => {
                                self.state = ConnectionState::Upgrading(request, handler);
                            }
                            Err(e) => {
                                tracing::debug!(peer = ?self.peer, path = %request.path, reason = %e, "websocket upgrade rejected");
                                let mut response = handshake_rejection(&e.to_string());
                                response.set_keep_alive(false);
                                self.state = self.writing(response, &request, false);
                            }
                        }
                        continue;
                    }

                    let keep_alive = request.is_keep_alive();
                    let mut response = dispatch(&self.ctx, self.peer, &request).await;

                    if !response.has_header("connection") {
                        response.set_keep_alive(keep_alive);
                    }
                    let handler_closes = response
                        .header("connection")
                        .map(|v| v.eq_ignore_ascii_case("close"))
                        .unwrap_or(false);

                    self.state = self.writing(response, &request, keep_alive && !handler_closes);
                }

                ConnectionState::Writing(mut writer, exchange) => {
                    let result = writer.write_to_stream(&mut self.stream).await;
                    let sent = writer.written();
                    self.bytes_sent += sent;
                    self.ctx.stats.add_bytes_sent(sent);
                    result?;

                    if self.ctx.config.log_requests {
                        tracing::info!(
                            peer = ?self.peer,
                            method = exchange.method.map(|m| m.as_str()).unwrap_or("-"),
                            path = %exchange.path,
                            status = exchange.status.as_u16(),
                            bytes = self.bytes_sent,
                            received = self.bytes_received,
                            "request completed"
                        );
                    }

                    if exchange.keep_alive {
                        self.reset_cycle();
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Upgrading(request, handler) => {
                    return Ok(Some((request, handler)));
                }

                ConnectionState::Closed => {
                    return Ok(None);
                }
            }
        }
    }

    /// Buffers bytes until one complete request is present.
    ///
    /// The deadline covers the whole phase, not each individual read.
    async fn read_request(&mut self) -> anyhow::Result<ReadOutcome> {
        let deadline = Instant::now() + self.ctx.config.keep_alive_timeout;
        let limit = self.ctx.config.max_request_size;

        loop {
            if self.buffer.len() > limit {
                return Ok(ReadOutcome::TooLarge);
            }

            match message_status(&self.buffer, limit) {
                MessageStatus::Complete => {
                    return Ok(match parse_http_request(&self.buffer) {
                        Ok(request) => ReadOutcome::Request(request),
                        Err(e) => {
                            tracing::debug!(peer = ?self.peer, error = %e, "malformed request");
                            ReadOutcome::Malformed
                        }
                    });
                }
                MessageStatus::TooLarge => return Ok(ReadOutcome::TooLarge),
                MessageStatus::Partial => {}
            }

            self.buffer.reserve(READ_CHUNK_SIZE);
            let read = tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buffer)).await;

            match read {
                Err(_) => return Ok(ReadOutcome::TimedOut),
                Ok(Ok(0)) => {
                    if !self.buffer.is_empty() {
                        tracing::debug!(peer = ?self.peer, buffered = self.buffer.len(), "peer closed mid-request");
                    }
                    return Ok(ReadOutcome::PeerClosed);
                }
                Ok(Ok(n)) => {
                    self.bytes_received += n as u64;
                    self.ctx.stats.add_bytes_received(n as u64);
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    fn accept_upgrade(&self, request: &Request) -> Result<Arc<dyn WebSocketHandler>, HandshakeError> {
        validate_handshake(request)?;
        self.ctx
            .service
            .websocket_handler(request)
            .ok_or(HandshakeError::NoRoute)
    }

    fn writing(&self, response: Response, request: &Request, keep_alive: bool) -> ConnectionState {
        let exchange = Exchange {
            method: Some(request.method),
            path: request.path.clone(),
            status: response.status(),
            keep_alive,
        };
        let head_only = request.method == Method::HEAD;
        ConnectionState::Writing(ResponseWriter::new(response, head_only), exchange)
    }

    /// Server-generated error; the connection closes after it is sent.
    fn error_response(&self, status: StatusCode, message: &str) -> ConnectionState {
        let mut response = Response::error_page(status, message);
        response.set_keep_alive(false);
        let exchange = Exchange {
            method: None,
            path: String::new(),
            status,
            keep_alive: false,
        };
        ConnectionState::Writing(ResponseWriter::new(response, false), exchange)
    }

    fn reset_cycle(&mut self) {
        self.buffer.clear();
        self.bytes_received = 0;
        self.bytes_sent = 0;
    }

    async fn upgrade(self, request: Request, handler: Arc<dyn WebSocketHandler>) -> anyhow::Result<()> {
        let Connection {
            stream,
            mut buffer,
            peer,
            ctx,
            ..
        } = self;

        // Frames the client pipelined right behind the upgrade request.
        let consumed = find_headers_end(&buffer)
            .map(|(_, body_start)| body_start + request.content_length())
            .unwrap_or(buffer.len())
            .min(buffer.len());
        let leftover = buffer.split_off(consumed);

        let mut ws = WebSocketConnection::new(stream, ctx.config.websocket.clone())
            .with_buffered(&leftover)
            .with_peer(peer);
        ws.handshake(&request).await?;
        tracing::info!(peer = ?peer, path = %request.path, "websocket connection opened");

        let stats = ws.run(handler).await?;
        ctx.stats.add_bytes_sent(stats.bytes_sent);
        ctx.stats.add_bytes_received(stats.bytes_received);
        tracing::debug!(
            peer = ?peer,
            messages_received = stats.messages_received,
            messages_sent = stats.messages_sent,
            "websocket connection closed"
        );
        Ok(())
    }

    /// Best-effort shutdown; errors are swallowed.
    async fn close(&mut self) {
        self.state = ConnectionState::Closed;
        let _ = self.stream.shutdown().await;
        tracing::trace!(
            peer = ?self.peer,
            lifetime_ms = self.created_at.elapsed().as_millis() as u64,
            "connection closed"
        );
    }
}

/// Runs the service on the worker pool; failures and panics become 500.
async fn dispatch(ctx: &ConnectionContext, peer: Option<SocketAddr>, request: &Request) -> Response {
    let service = Arc::clone(&ctx.service);
    let owned = request.clone();

    match ctx.workers.run(move || service.call(&owned)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(peer = ?peer, path = %request.path, error = %e, "handler failed");
            Response::error_page(
                StatusCode::InternalServerError,
                &format!("Internal server error: {e}"),
            )
        }
    }
}

/// Errors that just mean the peer went away.
pub fn is_disconnect(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().is_some_and(|e| {
            matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        })
    })
}
