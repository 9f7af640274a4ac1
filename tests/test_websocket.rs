mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{read_response, read_to_close, spawn_connection};
use lantern::http::connection::ConnectionConfig;
use lantern::http::request::{Method, Request, RequestBuilder};
use lantern::http::response::Response;
use lantern::http::service::Service;
use lantern::websocket::frame::close_code;
use lantern::websocket::handshake::{
    compute_accept_key, handshake_response, validate_handshake, validate_websocket_key,
};
use lantern::websocket::{
    Frame, FrameError, HandshakeError, Opcode, WebSocketConfig, WebSocketHandler, WebSocketSender,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const MASK: u32 = 0x37fa_213d;

// ---- frame codec ----

#[test]
fn test_rfc_unmasked_text_frame() {
    let bytes = [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f];
    let (frame, consumed) = Frame::parse(&bytes).unwrap();

    assert_eq!(consumed, 7);
    assert!(frame.fin);
    assert!(!frame.masked);
    assert_eq!(frame.opcode, Opcode::Text);
    assert_eq!(frame.payload, b"Hello");
    assert_eq!(Frame::text("Hello").to_bytes(), bytes);
}

#[test]
fn test_rfc_masked_text_frame() {
    let bytes = [
        0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
    ];
    let (frame, consumed) = Frame::parse(&bytes).unwrap();

    assert_eq!(consumed, bytes.len());
    assert!(frame.masked);
    assert_eq!(frame.masking_key, MASK);
    assert_eq!(frame.payload, b"Hello");
    assert_eq!(Frame::text("Hello").with_mask(MASK).to_bytes(), bytes);
}

#[test]
fn test_rfc_fragmented_text() {
    let first = [0x01, 0x03, 0x48, 0x65, 0x6c];
    let second = [0x80, 0x02, 0x6c, 0x6f];

    let (head, _) = Frame::parse(&first).unwrap();
    assert!(!head.fin);
    assert_eq!(head.opcode, Opcode::Text);

    let (tail, _) = Frame::parse(&second).unwrap();
    assert!(tail.fin);
    assert_eq!(tail.opcode, Opcode::Continuation);
    assert_eq!([head.payload, tail.payload].concat(), b"Hello");
}

#[test]
fn test_length_encodings() {
    for (size, header_len) in [(0usize, 2usize), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        for opcode in [Opcode::Text, Opcode::Binary, Opcode::Ping, Opcode::Pong, Opcode::Close] {
            for masked in [false, true] {
                let mut frame = Frame::new(opcode, payload.clone());
                if masked {
                    frame = frame.with_mask(MASK);
                }
                let bytes = frame.to_bytes();
                let mask_len = if masked { 4 } else { 0 };
                assert_eq!(bytes.len(), header_len + mask_len + size, "{opcode:?} size {size}");

                let (parsed, consumed) = Frame::parse(&bytes).unwrap();
                assert_eq!(consumed, bytes.len(), "{opcode:?} size {size} masked {masked}");
                assert!(parsed.fin);
                assert_eq!(parsed.opcode, opcode);
                assert_eq!(parsed.masked, masked);
                assert_eq!(parsed.payload, payload, "{opcode:?} size {size} masked {masked}");
            }
        }
    }

    let big = Frame::binary(vec![0u8; 65536]).to_bytes();
    assert_eq!(&big[..10], &[0x82, 0x7f, 0, 0, 0, 0, 0, 1, 0, 0]);
}

#[test]
fn test_two_frames_in_one_buffer() {
    let mut bytes = Frame::text("one").to_bytes();
    bytes.extend(Frame::ping(b"p".to_vec()).to_bytes());

    let (first, used) = Frame::parse(&bytes).unwrap();
    assert_eq!(first.payload, b"one");
    let (second, _) = Frame::parse(&bytes[used..]).unwrap();
    assert_eq!(second.opcode, Opcode::Ping);
}

#[test]
fn test_control_frame_rules() {
    // The codec accepts these; the connection rejects them.
    let fragmented_ping = Frame::ping(Vec::new()).with_fin(false).to_bytes();
    let (frame, _) = Frame::parse(&fragmented_ping).unwrap();
    assert!(matches!(frame.control_violation(), Some(FrameError::Malformed(_))));

    let long_ping = Frame::ping(vec![0u8; 126]).to_bytes();
    let (frame, _) = Frame::parse(&long_ping).unwrap();
    assert!(matches!(frame.control_violation(), Some(FrameError::Malformed(_))));

    assert!(Frame::pong(vec![0u8; 125]).control_violation().is_none());
    assert!(Frame::text("x".repeat(200)).control_violation().is_none());
    assert!(Frame::binary(vec![1]).with_fin(false).control_violation().is_none());
}

#[test]
fn test_close_reason_fits_a_control_frame() {
    let long = "é".repeat(100);
    let frame = Frame::close(1000, &long);
    assert!(frame.payload.len() <= 125);
    assert!(frame.control_violation().is_none());

    let (code, reason) = frame.close_payload();
    assert_eq!(code, 1000);
    assert_eq!(reason, "é".repeat(61));

    let ascii = Frame::close(1001, &"a".repeat(200));
    assert_eq!(ascii.payload.len(), 125);
}

#[test]
fn test_close_payload() {
    let (code, reason) = Frame::close(1001, "going").close_payload();
    assert_eq!(code, 1001);
    assert_eq!(reason, "going");

    let (code, reason) = Frame::close(0, "").close_payload();
    assert_eq!(code, close_code::NO_STATUS);
    assert!(reason.is_empty());
}

#[test]
fn test_frame_error_close_codes() {
    assert_eq!(FrameError::Incomplete.close_code(), None);
    assert_eq!(FrameError::Malformed("x").close_code(), Some(1002));
    assert_eq!(FrameError::TooLarge { len: 10, limit: 5 }.close_code(), Some(1009));
    assert_eq!(FrameError::InvalidUtf8.close_code(), Some(1007));
}

// ---- handshake ----

fn upgrade_request(path: &str) -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .path(path)
        .header("Host", "localhost")
        .header("Upgrade", "websocket")
        .header("Connection", "keep-alive, Upgrade")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", CLIENT_KEY)
        .build()
        .unwrap()
}

#[test]
fn test_accept_key_matches_rfc_example() {
    assert_eq!(compute_accept_key(CLIENT_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    assert!(validate_websocket_key(CLIENT_KEY));
    assert!(!validate_websocket_key("not base64!"));
}

#[test]
fn test_handshake_response_headers() {
    let response = handshake_response(&upgrade_request("/ws")).unwrap();
    assert_eq!(response.status().as_u16(), 101);
    assert_eq!(response.header("Upgrade"), Some("websocket"));
    assert_eq!(response.header("Connection"), Some("Upgrade"));
    assert_eq!(
        response.header("Sec-WebSocket-Accept"),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
}

#[test]
fn test_handshake_validation_failures() {
    let mut post = upgrade_request("/ws");
    post.method = Method::POST;
    assert_eq!(validate_handshake(&post), Err(HandshakeError::MethodNotGet));

    let mut old = upgrade_request("/ws");
    old.headers.insert("sec-websocket-version".into(), "8".into());
    assert_eq!(validate_handshake(&old), Err(HandshakeError::UnsupportedVersion));

    let mut keyless = upgrade_request("/ws");
    keyless.headers.remove("sec-websocket-key");
    assert_eq!(validate_handshake(&keyless), Err(HandshakeError::MissingKey));

    let mut plain = upgrade_request("/ws");
    plain.headers.remove("upgrade");
    assert_eq!(validate_handshake(&plain), Err(HandshakeError::NotUpgrade));
}

// ---- live connections ----

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl WebSocketHandler for Recorder {
    fn on_open(&self, sender: &WebSocketSender) {
        self.push("open".into());
        sender.send_text("welcome");
    }

    fn on_text(&self, sender: &WebSocketSender, text: String) {
        self.push(format!("text:{text}"));
        if text == "bye" {
            sender.close(close_code::NORMAL, "done");
        } else {
            sender.send_text(format!("Echo: {text}"));
        }
    }

    fn on_binary(&self, sender: &WebSocketSender, data: Vec<u8>) {
        self.push(format!("binary:{}", data.len()));
        sender.send_binary(data);
    }

    fn on_close(&self, code: u16, reason: &str) {
        self.push(format!("close:{code}:{reason}"));
    }

    fn on_error(&self, error: &str) {
        self.push(format!("error:{error}"));
    }
}

struct WsService {
    handler: Arc<Recorder>,
}

impl Service for WsService {
    fn call(&self, _request: &Request) -> anyhow::Result<Response> {
        Ok(Response::ok("plain"))
    }

    fn websocket_handler(&self, request: &Request) -> Option<Arc<dyn WebSocketHandler>> {
        if request.path == "/ws" {
            Some(self.handler.clone())
        } else {
            None
        }
    }
}

struct Client {
    stream: DuplexStream,
    buf: Vec<u8>,
}

impl Client {
    async fn send(&mut self, frame: Frame) {
        self.stream.write_all(&frame.with_mask(MASK).to_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next server frame, or `None` once the server has closed.
    async fn recv(&mut self) -> Option<Frame> {
        loop {
            match Frame::parse(&self.buf) {
                Ok((frame, used)) => {
                    self.buf.drain(..used);
                    return Some(frame);
                }
                Err(FrameError::Incomplete) => {}
                Err(e) => panic!("server sent a bad frame: {e}"),
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn recv_text(&mut self) -> String {
        let frame = self.recv().await.expect("connection closed");
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(!frame.masked, "server frames are never masked");
        String::from_utf8(frame.payload).unwrap()
    }
}

fn upgrade_bytes(path: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {CLIENT_KEY}\r\n\r\n"
    )
    .into_bytes()
}

async fn open(
    websocket: WebSocketConfig,
) -> (Client, tokio::task::JoinHandle<anyhow::Result<()>>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let service = Arc::new(WsService {
        handler: recorder.clone(),
    });
    let config = ConnectionConfig {
        websocket,
        ..ConnectionConfig::default()
    };
    let (mut stream, handle, _ctx) = spawn_connection(service, config);

    stream.write_all(&upgrade_bytes("/ws")).await.unwrap();
    let response = read_response(&mut stream, false).await.unwrap();
    assert_eq!(response.status, 101);
    assert_eq!(
        response.header("sec-websocket-accept"),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
    assert!(response.header("content-length").is_none());

    let mut client = Client {
        stream,
        buf: Vec::new(),
    };
    assert_eq!(client.recv_text().await, "welcome");
    (client, handle, recorder)
}

#[tokio::test]
async fn test_echo_text_and_binary() {
    let (mut client, _handle, recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::text("hello")).await;
    assert_eq!(client.recv_text().await, "Echo: hello");

    client.send(Frame::binary(vec![1, 2, 3])).await;
    let echoed = client.recv().await.unwrap();
    assert_eq!(echoed.opcode, Opcode::Binary);
    assert_eq!(echoed.payload, vec![1, 2, 3]);

    let events = recorder.events();
    assert_eq!(events, vec!["open", "text:hello", "binary:3"]);
}

#[tokio::test]
async fn test_ping_gets_pong_with_same_payload() {
    let (mut client, _handle, _recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::ping(b"are you there".to_vec())).await;
    let pong = client.recv().await.unwrap();
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(pong.payload, b"are you there");
}

#[tokio::test]
async fn test_fragmented_message_is_reassembled() {
    let (mut client, _handle, _recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::text("Hel").with_fin(false)).await;
    // Control frames may be interleaved with fragments.
    client.send(Frame::ping(Vec::new())).await;
    client.send(Frame::new(Opcode::Continuation, b"lo".to_vec())).await;

    assert_eq!(client.recv().await.unwrap().opcode, Opcode::Pong);
    assert_eq!(client.recv_text().await, "Echo: Hello");
}

#[tokio::test]
async fn test_peer_close_is_reported_without_echo() {
    let (mut client, handle, recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::close(1000, "bye")).await;
    assert!(client.recv().await.is_none());
    handle.await.unwrap().unwrap();

    assert!(recorder.events().contains(&"close:1000:bye".to_string()));
}

#[tokio::test]
async fn test_server_initiated_close() {
    let (mut client, handle, _recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::text("bye")).await;
    let close = client.recv().await.unwrap();
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_payload(), (1000, "done".to_string()));
    assert!(client.recv().await.is_none());
    handle.await.unwrap().unwrap();
}

async fn expect_close_code(client: &mut Client, expected: u16) {
    let close = client.recv().await.expect("expected a close frame");
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(close.close_payload().0, expected);
    assert!(read_to_close(&mut client.stream).await.is_empty());
}

#[tokio::test]
async fn test_reserved_opcode_closes_with_protocol_error() {
    let (mut client, _handle, recorder) = open(WebSocketConfig::default()).await;

    client.send_raw(&[0x83, 0x80, 0, 0, 0, 0]).await;
    expect_close_code(&mut client, close_code::PROTOCOL_ERROR).await;
    assert!(recorder.events().iter().any(|e| e.starts_with("error:")));
}

#[tokio::test]
async fn test_oversized_control_frame_closes_with_protocol_error() {
    let (mut client, _handle, _recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::ping(vec![0u8; 126])).await;
    expect_close_code(&mut client, close_code::PROTOCOL_ERROR).await;
}

#[tokio::test]
async fn test_fragmented_control_frame_closes_with_protocol_error() {
    let (mut client, _handle, _recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::ping(b"p".to_vec()).with_fin(false)).await;
    expect_close_code(&mut client, close_code::PROTOCOL_ERROR).await;
}

#[tokio::test]
async fn test_orphan_continuation_closes_with_protocol_error() {
    let (mut client, _handle, _recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::new(Opcode::Continuation, b"x".to_vec())).await;
    expect_close_code(&mut client, close_code::PROTOCOL_ERROR).await;
}

#[tokio::test]
async fn test_oversize_message_closes_with_1009() {
    let config = WebSocketConfig {
        max_message_size: 16,
        ..WebSocketConfig::default()
    };
    let (mut client, _handle, _recorder) = open(config).await;

    client.send(Frame::text("x".repeat(32))).await;
    expect_close_code(&mut client, close_code::MESSAGE_TOO_BIG).await;
}

#[tokio::test]
async fn test_oversize_reassembly_closes_with_1009() {
    let config = WebSocketConfig {
        max_message_size: 16,
        ..WebSocketConfig::default()
    };
    let (mut client, _handle, _recorder) = open(config).await;

    client.send(Frame::text("x".repeat(10)).with_fin(false)).await;
    client.send(Frame::new(Opcode::Continuation, vec![b'y'; 10])).await;
    expect_close_code(&mut client, close_code::MESSAGE_TOO_BIG).await;
}

#[tokio::test]
async fn test_invalid_utf8_closes_with_1007() {
    let (mut client, _handle, _recorder) = open(WebSocketConfig::default()).await;

    client.send(Frame::new(Opcode::Text, vec![0xff, 0xfe])).await;
    expect_close_code(&mut client, close_code::INVALID_PAYLOAD).await;
}

#[tokio::test]
async fn test_frames_pipelined_with_upgrade() {
    let recorder = Arc::new(Recorder::default());
    let service = Arc::new(WsService {
        handler: recorder.clone(),
    });
    let (mut stream, _handle, _ctx) = spawn_connection(service, ConnectionConfig::default());

    let mut bytes = upgrade_bytes("/ws");
    bytes.extend(Frame::text("early").with_mask(MASK).to_bytes());
    stream.write_all(&bytes).await.unwrap();

    assert_eq!(read_response(&mut stream, false).await.unwrap().status, 101);
    let mut client = Client {
        stream,
        buf: Vec::new(),
    };
    assert_eq!(client.recv_text().await, "welcome");
    assert_eq!(client.recv_text().await, "Echo: early");
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_dropped_after_idle_timeout() {
    let config = WebSocketConfig {
        ping_interval: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(3),
        ..WebSocketConfig::default()
    };
    let (mut client, handle, recorder) = open(config).await;

    let mut pings = 0;
    while let Some(frame) = client.recv().await {
        assert_eq!(frame.opcode, Opcode::Ping);
        pings += 1;
    }
    assert!(pings >= 2, "saw {pings} pings");
    handle.await.unwrap().unwrap();
    assert!(recorder.events().contains(&"error:Connection timeout".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_pongs_keep_connection_alive() {
    let config = WebSocketConfig {
        ping_interval: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(3),
        ..WebSocketConfig::default()
    };
    let (mut client, _handle, _recorder) = open(config).await;

    for _ in 0..5 {
        let ping = client.recv().await.unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        client.send(Frame::pong(ping.payload)).await;
    }

    client.send(Frame::text("still here")).await;
    loop {
        let frame = client.recv().await.unwrap();
        if frame.opcode == Opcode::Text {
            assert_eq!(frame.payload, b"Echo: still here");
            break;
        }
    }
}

#[tokio::test]
async fn test_plain_requests_still_work_on_websocket_service() {
    let service = Arc::new(WsService {
        handler: Arc::new(Recorder::default()),
    });
    let (mut stream, _handle, _ctx) = spawn_connection(service, ConnectionConfig::default());

    stream.write_all(b"GET /ws HTTP/1.1\r\n\r\n").await.unwrap();
    let response = read_response(&mut stream, false).await.unwrap();
    assert_eq!(response.text(), "plain");

    stream.write_all(&upgrade_bytes("/other")).await.unwrap();
    let rejected = read_response(&mut stream, false).await.unwrap();
    assert_eq!(rejected.status, 400);
}
