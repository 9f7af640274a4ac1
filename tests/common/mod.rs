#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use lantern::http::connection::{Connection, ConnectionConfig, ConnectionContext};
use lantern::http::parser::decode_chunked;
use lantern::http::service::Service;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio::task::JoinHandle;

/// A response as a client sees it: lowercase header names.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads exactly one response. Returns `None` on a clean EOF before any
/// byte arrives.
pub async fn read_response<R: AsyncRead + Unpin>(stream: &mut R, head_only: bool) -> Option<RawResponse> {
    let mut buf = Vec::new();
    let headers_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.ok()?;
        if n == 0 {
            assert!(buf.is_empty(), "EOF inside response head");
            return None;
        }
        buf.push(byte[0]);
    };

    let head = String::from_utf8(buf[..headers_end].to_vec()).expect("non UTF-8 head");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let mut body = Vec::new();
    if head_only || status == 101 || status == 304 {
        // no body
    } else if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.contains("chunked"))
    {
        let mut raw = Vec::new();
        while !raw.ends_with(b"0\r\n\r\n") {
            let mut byte = [0u8; 1];
            if stream.read(&mut byte).await.ok()? == 0 {
                panic!("EOF inside chunked body");
            }
            raw.push(byte[0]);
        }
        body = decode_chunked(&raw).expect("invalid chunked body");
    } else {
        let len: usize = headers
            .get("content-length")
            .map(|v| v.parse().unwrap())
            .unwrap_or(0);
        body.resize(len, 0);
        stream.read_exact(&mut body).await.ok()?;
    }

    Some(RawResponse { status, headers, body })
}

/// Reads until the peer closes, returning everything received.
pub async fn read_to_close<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    out
}

/// Runs a connection over an in-memory pipe and returns the client end.
pub fn spawn_connection(
    service: Arc<dyn Service>,
    config: ConnectionConfig,
) -> (DuplexStream, JoinHandle<anyhow::Result<()>>, ConnectionContext) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let ctx = ConnectionContext::new(service).with_config(config);
    let task_ctx = ctx.clone();
    let handle = tokio::spawn(async move { Connection::new(server, None, task_ctx).run().await });
    (client, handle, ctx)
}
