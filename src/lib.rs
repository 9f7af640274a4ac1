//! Lantern - HTTP/1.1, TLS and WebSocket server
//!
//! Core library for the connection state machines and the server built
//! around them.

pub mod config;
pub mod http;
pub mod server;
pub mod websocket;
