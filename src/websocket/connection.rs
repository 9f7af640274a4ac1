//! WebSocket connection state machine.
//!
//! ```text
//!   Connecting ──handshake──▶ Open ──close()/protocol error──▶ Closing ──linger──▶ Closed
//!                               │
//!                               └──peer CLOSE / idle timeout / transport error──▶ Closed
//! ```
//!
//! While open, one task multiplexes socket reads, outbound messages queued
//! through [`WebSocketSender`], the ping ticker and the idle timer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::http::request::Request;
use crate::http::writer::serialize_response;
use crate::websocket::frame::{Frame, FrameError, Opcode, close_code};
use crate::websocket::handshake::handshake_response;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CLOSE_LINGER: Duration = Duration::from_millis(100);

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl WebSocketState {
    fn as_u8(self) -> u8 {
        match self {
            WebSocketState::Connecting => 0,
            WebSocketState::Open => 1,
            WebSocketState::Closing => 2,
            WebSocketState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => WebSocketState::Connecting,
            1 => WebSocketState::Open,
            2 => WebSocketState::Closing,
            _ => WebSocketState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Time without a pong before the connection is dropped.
    pub idle_timeout: Duration,
    /// Cap on a single frame payload and on a reassembled message.
    pub max_message_size: usize,
    /// Delay between sending our CLOSE and closing the socket.
    pub close_linger: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            close_linger: DEFAULT_CLOSE_LINGER,
        }
    }
}

/// Application callbacks. They run on the connection task, so they should
/// return quickly; replies go through the supplied sender.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn on_open(&self, _sender: &WebSocketSender) {}

    fn on_text(&self, _sender: &WebSocketSender, _text: String) {}

    fn on_binary(&self, _sender: &WebSocketSender, _data: Vec<u8>) {}

    /// Peer sent a CLOSE frame.
    fn on_close(&self, _code: u16, _reason: &str) {}

    fn on_error(&self, _error: &str) {}
}

#[derive(Debug)]
enum Outbound {
    Frame(Frame),
    Close(u16, String),
}

/// Cloneable handle for pushing messages onto an open connection.
///
/// Every send is ignored unless the connection is open.
#[derive(Debug, Clone)]
pub struct WebSocketSender {
    tx: mpsc::UnboundedSender<Outbound>,
    state: Arc<AtomicU8>,
}

impl WebSocketSender {
    pub fn state(&self) -> WebSocketState {
        WebSocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == WebSocketState::Open
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(Outbound::Frame(Frame::text(text)))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        self.push(Outbound::Frame(Frame::binary(data)))
    }

    pub fn send_ping(&self, data: impl Into<Vec<u8>>) -> bool {
        self.push(Outbound::Frame(Frame::ping(data)))
    }

    /// Starts the closing handshake: CLOSE is sent, then the socket is
    /// closed after a short linger.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.push(Outbound::Close(code, reason.to_string()))
    }

    fn push(&self, message: Outbound) -> bool {
        self.is_open() && self.tx.send(message).is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WebSocketStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub created_at: Instant,
}

impl WebSocketStats {
    fn new() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            created_at: Instant::now(),
        }
    }
}

/// Result of draining complete frames off the receive buffer.
enum Drained {
    NeedMore { pong: bool },
    PeerClosed(u16, String),
    Violation(FrameError),
}

pub struct WebSocketConnection<S> {
    stream: S,
    buffer: BytesMut,
    config: WebSocketConfig,
    state: Arc<AtomicU8>,
    peer: Option<SocketAddr>,
    stats: WebSocketStats,
    fragments: Option<(Opcode, Vec<u8>)>,
    pending: Vec<Frame>,
    tx: mpsc::UnboundedSender<Outbound>,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, config: WebSocketConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            config,
            state: Arc::new(AtomicU8::new(WebSocketState::Connecting.as_u8())),
            peer: None,
            stats: WebSocketStats::new(),
            fragments: None,
            pending: Vec::new(),
            tx,
            rx,
        }
    }

    /// Bytes that arrived after the upgrade request, to be parsed as frames.
    pub fn with_buffered(mut self, bytes: &[u8]) -> Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Completes an HTTP upgrade by writing `101 Switching Protocols`.
    ///
    /// A request that fails validation leaves the connection in
    /// `Connecting` with nothing written; the error downcasts to
    /// [`HandshakeError`](crate::websocket::handshake::HandshakeError).
    pub async fn handshake(&mut self, request: &Request) -> anyhow::Result<()> {
        let response = handshake_response(request)?;
        let bytes = serialize_response(&response);
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_sent += bytes.len() as u64;
        self.set_state(WebSocketState::Open);
        Ok(())
    }

    /// Marks an upgrade completed elsewhere.
    pub fn mark_open(&mut self) {
        self.set_state(WebSocketState::Open);
    }

    pub fn state(&self) -> WebSocketState {
        WebSocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn sender(&self) -> WebSocketSender {
        WebSocketSender {
            tx: self.tx.clone(),
            state: self.state.clone(),
        }
    }

    pub fn stats(&self) -> WebSocketStats {
        self.stats
    }

    fn set_state(&self, state: WebSocketState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Drives the open connection until it closes.
    ///
    /// Only pongs reset the idle timer: a peer that never answers pings is
    /// dropped after `idle_timeout` even while pings keep flowing.
    pub async fn run(mut self, handler: Arc<dyn WebSocketHandler>) -> anyhow::Result<WebSocketStats> {
        if self.state() != WebSocketState::Open {
            anyhow::bail!("WebSocket connection is not open");
        }

        let sender = self.sender();
        handler.on_open(&sender);

        let ping_interval = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        // Frames may have arrived together with the upgrade request.
        if !self.buffer.is_empty() {
            if let Some(stats) = self.after_drain(handler.as_ref(), &sender, idle.as_mut()).await? {
                return Ok(stats);
            }
        }

        loop {
            tokio::select! {
                read = self.stream.read_buf(&mut self.buffer) => {
                    match read {
                        Ok(0) => {
                            handler.on_error("connection closed by peer");
                            return Ok(self.finish().await);
                        }
                        Ok(n) => {
                            self.stats.bytes_received += n as u64;
                            if let Some(stats) = self.after_drain(handler.as_ref(), &sender, idle.as_mut()).await? {
                                return Ok(stats);
                            }
                        }
                        Err(e) => {
                            handler.on_error(&format!("Read error: {e}"));
                            self.finish().await;
                            return Err(e.into());
                        }
                    }
                }
                Some(outbound) = self.rx.recv() => {
                    match outbound {
                        Outbound::Frame(frame) => {
                            if self.state() != WebSocketState::Open {
                                continue;
                            }
                            let data = matches!(frame.opcode, Opcode::Text | Opcode::Binary);
                            if let Err(e) = self.write_frame(&frame).await {
                                handler.on_error(&format!("Write error: {e}"));
                                self.finish().await;
                                return Err(e.into());
                            }
                            if data {
                                self.stats.messages_sent += 1;
                            }
                        }
                        Outbound::Close(code, reason) => {
                            return Ok(self.close_with(code, &reason).await);
                        }
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = self.write_frame(&Frame::ping(Vec::new())).await {
                        handler.on_error(&format!("Write error: {e}"));
                        self.finish().await;
                        return Err(e.into());
                    }
                }
                _ = &mut idle => {
                    tracing::debug!(peer = ?self.peer, "websocket idle timeout");
                    handler.on_error("Connection timeout");
                    return Ok(self.finish().await);
                }
            }
        }
    }

    /// Processes buffered frames. Returns final stats once the connection
    /// has ended.
    async fn after_drain(
        &mut self,
        handler: &dyn WebSocketHandler,
        sender: &WebSocketSender,
        idle: std::pin::Pin<&mut tokio::time::Sleep>,
    ) -> anyhow::Result<Option<WebSocketStats>> {
        let drained = self.drain_frames(handler, sender);

        for frame in std::mem::take(&mut self.pending) {
            if let Err(e) = self.write_frame(&frame).await {
                handler.on_error(&format!("Write error: {e}"));
                self.finish().await;
                return Err(e.into());
            }
        }

        match drained {
            Drained::NeedMore { pong } => {
                if pong {
                    idle.reset(Instant::now() + self.config.idle_timeout);
                }
                Ok(None)
            }
            Drained::PeerClosed(code, reason) => {
                handler.on_close(code, &reason);
                Ok(Some(self.finish().await))
            }
            Drained::Violation(e) => {
                tracing::debug!(peer = ?self.peer, error = %e, "websocket protocol violation");
                handler.on_error(&e.to_string());
                let code = e.close_code().unwrap_or(close_code::PROTOCOL_ERROR);
                Ok(Some(self.close_with(code, &e.to_string()).await))
            }
        }
    }

    fn drain_frames(&mut self, handler: &dyn WebSocketHandler, sender: &WebSocketSender) -> Drained {
        let mut pong = false;
        loop {
            let (frame, consumed) =
                match Frame::parse_with_limit(&self.buffer, self.config.max_message_size) {
                    Ok(parsed) => parsed,
                    Err(FrameError::Incomplete) => return Drained::NeedMore { pong },
                    Err(e) => return Drained::Violation(e),
                };
            self.buffer.advance(consumed);

            if frame.has_reserved_bits() {
                return Drained::Violation(FrameError::Malformed("reserved bits set"));
            }
            if let Some(e) = frame.control_violation() {
                return Drained::Violation(e);
            }

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    if self.fragments.is_some() {
                        return Drained::Violation(FrameError::Malformed(
                            "data frame inside a fragmented message",
                        ));
                    }
                    if frame.fin {
                        if let Err(e) = self.deliver(frame.opcode, frame.payload, handler, sender) {
                            return Drained::Violation(e);
                        }
                    } else {
                        self.fragments = Some((frame.opcode, frame.payload));
                    }
                }
                Opcode::Continuation => {
                    let Some((_, message)) = self.fragments.as_mut() else {
                        return Drained::Violation(FrameError::Malformed(
                            "continuation without a message",
                        ));
                    };
                    let total = message.len() + frame.payload.len();
                    if total > self.config.max_message_size {
                        return Drained::Violation(FrameError::TooLarge {
                            len: total as u64,
                            limit: self.config.max_message_size,
                        });
                    }
                    message.extend_from_slice(&frame.payload);
                    if frame.fin {
                        if let Some((opcode, message)) = self.fragments.take() {
                            if let Err(e) = self.deliver(opcode, message, handler, sender) {
                                return Drained::Violation(e);
                            }
                        }
                    }
                }
                Opcode::Ping => self.pending.push(Frame::pong(frame.payload)),
                Opcode::Pong => pong = true,
                Opcode::Close => {
                    let (code, reason) = frame.close_payload();
                    return Drained::PeerClosed(code, reason);
                }
            }
        }
    }

    fn deliver(
        &mut self,
        opcode: Opcode,
        payload: Vec<u8>,
        handler: &dyn WebSocketHandler,
        sender: &WebSocketSender,
    ) -> Result<(), FrameError> {
        self.stats.messages_received += 1;
        match opcode {
            Opcode::Text => {
                let text = String::from_utf8(payload).map_err(|_| FrameError::InvalidUtf8)?;
                handler.on_text(sender, text);
            }
            _ => handler.on_binary(sender, payload),
        }
        Ok(())
    }

    async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        let bytes = frame.to_bytes();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    /// Sends CLOSE, lingers briefly, then closes the socket.
    async fn close_with(&mut self, code: u16, reason: &str) -> WebSocketStats {
        if matches!(self.state(), WebSocketState::Closing | WebSocketState::Closed) {
            return self.stats;
        }
        self.set_state(WebSocketState::Closing);
        if let Err(e) = self.write_frame(&Frame::close(code, reason)).await {
            tracing::debug!(peer = ?self.peer, error = %e, "failed to send close frame");
        }
        tokio::time::sleep(self.config.close_linger).await;
        self.finish().await
    }

    async fn finish(&mut self) -> WebSocketStats {
        self.set_state(WebSocketState::Closed);
        let _ = self.stream.shutdown().await;
        self.stats
    }
}
