//! HTTP protocol implementation.
//!
//! This module implements an HTTP/1.1 server with keep-alive connections,
//! optional TLS and a handoff to WebSocket on upgrade.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: The main connection handler implementing the request-response state machine
//! - **`secure`**: TLS handshake in front of the same state machine
//! - **`parser`**: Parses incoming HTTP requests from byte buffers
//! - **`request`**: HTTP request representation and parsing utilities
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Serializes and writes HTTP responses to the client
//! - **`service`**: The application boundary and the handler worker pool
//! - **`conditional`**: ETags and HTTP dates for conditional GET
//! - **`compression`**: gzip content coding
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! Each client connection goes through a state machine:
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Run the service on a worker
//!        └──────┬───────────┘
//!               │ Response ready          Upgrade accepted
//!               ▼                       ─────────────────→ WebSocket
//!        ┌──────────────────┐
//!        │    Writing       │ ← Send response to client
//!        └──────┬───────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lantern::http::connection::{Connection, ConnectionContext};
//! use lantern::http::response::Response;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let ctx = ConnectionContext::new(Arc::new(|_req: &_| Ok(Response::ok("hi"))));
//!
//!     loop {
//!         let (socket, peer) = listener.accept().await?;
//!         let ctx = ctx.clone();
//!         tokio::spawn(async move {
//!             if let Err(e) = Connection::new(socket, Some(peer), ctx).run().await {
//!                 eprintln!("Connection error: {}", e);
//!             }
//!         });
//!     }
//! }
//! ```

pub mod compression;
pub mod conditional;
pub mod connection;
pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod secure;
pub mod service;
pub mod writer;
