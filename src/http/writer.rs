use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::response::{Body, Response, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Upper bound for a single body write, and for one HTTP chunk.
pub const WRITE_CHUNK_SIZE: usize = 8192;

fn serialize_head(status: StatusCode, headers: &HashMap<String, String>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        status.as_u16(),
        status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Serializes status line, headers and an in-memory body verbatim.
///
/// Streamed bodies are not included; use [`ResponseWriter`] for those.
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = serialize_head(resp.status(), resp.headers());
    buf.extend_from_slice(resp.body_bytes());
    buf
}

/// Sends one response: headers first, then the body in bounded pieces.
pub struct ResponseWriter {
    head: Vec<u8>,
    body: Body,
    chunked: bool,
    head_only: bool,
    written: u64,
}

impl ResponseWriter {
    /// `head_only` suppresses the body (HEAD requests) while keeping the
    /// headers, `Content-Length` included.
    pub fn new(response: Response, head_only: bool) -> Self {
        let chunked = response.is_chunked();
        let (status, headers, body) = response.into_parts();
        Self {
            head: serialize_head(status, &headers),
            body,
            chunked,
            head_only,
            written: 0,
        }
    }

    /// Bytes put on the wire so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let head = std::mem::take(&mut self.head);
        self.write_raw(stream, &head).await?;

        if !self.head_only {
            match std::mem::take(&mut self.body) {
                Body::Full(bytes) => {
                    for piece in bytes.chunks(WRITE_CHUNK_SIZE) {
                        self.write_body_piece(stream, piece).await?;
                    }
                }
                Body::Stream { mut reader, len } => {
                    let mut buf = vec![0u8; WRITE_CHUNK_SIZE];
                    let mut sent = 0u64;
                    loop {
                        let want = if self.chunked {
                            WRITE_CHUNK_SIZE
                        } else {
                            (len - sent).min(WRITE_CHUNK_SIZE as u64) as usize
                        };
                        if want == 0 {
                            break;
                        }
                        let n = reader.read(&mut buf[..want]).await?;
                        if n == 0 {
                            break;
                        }
                        self.write_body_piece(stream, &buf[..n]).await?;
                        sent += n as u64;
                    }
                    if !self.chunked && sent < len {
                        anyhow::bail!("body stream ended after {sent} of {len} bytes");
                    }
                }
            }

            if self.chunked {
                self.write_raw(stream, b"0\r\n\r\n").await?;
            }
        }

        stream.flush().await?;
        Ok(self.written)
    }

    async fn write_body_piece<W>(&mut self, stream: &mut W, piece: &[u8]) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if piece.is_empty() {
            return Ok(());
        }
        if self.chunked {
            let size_line = format!("{:x}\r\n", piece.len());
            self.write_raw(stream, size_line.as_bytes()).await?;
            self.write_raw(stream, piece).await?;
            self.write_raw(stream, b"\r\n").await
        } else {
            self.write_raw(stream, piece).await
        }
    }

    async fn write_raw<W>(&mut self, stream: &mut W, bytes: &[u8]) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut offset = 0;
        while offset < bytes.len() {
            let n = stream.write(&bytes[offset..]).await?;

            if n == 0 {
                return Err(anyhow::anyhow!("connection closed while writing"));
            }

            offset += n;
            self.written += n as u64;
        }

        Ok(())
    }
}
