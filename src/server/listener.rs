//! Accept loops for the HTTP and HTTPS listeners.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::connection::{Connection, ConnectionContext, is_disconnect};
use crate::http::response::{Response, StatusCode};
use crate::http::secure::SecureConnection;
use crate::http::service::{Service, WorkerPool};
use crate::http::writer::serialize_response;
use crate::server::stats::ServerStats;
use crate::server::tls::load_tls_acceptor;

pub struct Server {
    config: Config,
    ctx: ConnectionContext,
}

impl Server {
    pub fn new(config: Config, service: Arc<dyn Service>) -> Self {
        let ctx = ConnectionContext::new(service)
            .with_config(config.connection_config())
            .with_workers(WorkerPool::new(config.worker_threads()));
        Self { config, ctx }
    }

    /// Shares an existing statistics block, typically one a status route
    /// already reads from.
    pub fn with_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.ctx = self.ctx.with_stats(stats);
        self
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.ctx.stats)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds the configured addresses and serves until `shutdown` resolves.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let addr = &self.config.server.listen_addr;
        let http = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("Listening on http://{}", http.local_addr()?);

        let https = if self.config.tls.enabled {
            let acceptor = load_tls_acceptor(&self.config.tls)?;
            let addr = &self.config.tls.listen_addr;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            info!("Listening on https://{}", listener.local_addr()?);
            Some((listener, acceptor))
        } else {
            None
        };

        self.serve(http, https, shutdown).await
    }

    /// Serves already-bound listeners. On shutdown, accepting stops and
    /// open connections get one keep-alive period to finish.
    pub async fn serve(
        self,
        http: TcpListener,
        https: Option<(TcpListener, TlsAcceptor)>,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        let (tls_listener, acceptor) = match https {
            Some((listener, acceptor)) => (Some(listener), Some(acceptor)),
            None => (None, None),
        };

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }

                accepted = http.accept() => match accepted {
                    Ok((socket, peer)) => self.spawn_plain(&mut connections, socket, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },

                accepted = accept_optional(tls_listener.as_ref()) => match (accepted, &acceptor) {
                    (Ok((socket, peer)), Some(acceptor)) => {
                        self.spawn_secure(&mut connections, socket, peer, acceptor.clone());
                    }
                    (Ok(_), None) => {}
                    (Err(e), _) => warn!(error = %e, "TLS accept failed"),
                },

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "connection task panicked");
                        }
                    }
                }
            }
        }

        drop(http);
        drop(tls_listener);
        self.drain(connections).await;
        Ok(())
    }

    async fn drain(&self, mut connections: JoinSet<()>) {
        if connections.is_empty() {
            return;
        }
        info!(open = connections.len(), "waiting for open connections");
        let grace = self.ctx.config.keep_alive_timeout;
        let finished = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!(open = connections.len(), "closing connections still open after grace period");
            connections.shutdown().await;
        }
    }

    fn at_capacity(&self) -> bool {
        self.ctx.stats.active_connections() >= self.config.server.max_connections as u64
    }

    fn spawn_plain(&self, connections: &mut JoinSet<()>, socket: TcpStream, peer: SocketAddr) {
        debug!(peer = %peer, "accepted connection");
        let _ = socket.set_nodelay(true);

        if self.at_capacity() {
            warn!(peer = %peer, "connection limit reached");
            connections.spawn(reject_busy(socket));
            return;
        }

        let guard = self.ctx.stats.track();
        let ctx = self.ctx.clone();
        connections.spawn(async move {
            let _guard = guard;
            if let Err(e) = Connection::new(socket, Some(peer), ctx).run().await {
                log_connection_error(peer, &e);
            }
        });
    }

    fn spawn_secure(
        &self,
        connections: &mut JoinSet<()>,
        socket: TcpStream,
        peer: SocketAddr,
        acceptor: TlsAcceptor,
    ) {
        debug!(peer = %peer, "accepted TLS connection");
        let _ = socket.set_nodelay(true);

        if self.at_capacity() {
            warn!(peer = %peer, "connection limit reached");
            let grace = self.ctx.config.keep_alive_timeout;
            connections.spawn(async move {
                if let Ok(Ok(stream)) = tokio::time::timeout(grace, acceptor.accept(socket)).await {
                    reject_busy(stream).await;
                }
            });
            return;
        }

        let guard = self.ctx.stats.track();
        let ctx = self.ctx.clone();
        connections.spawn(async move {
            let _guard = guard;
            if let Err(e) = SecureConnection::new(socket, acceptor, Some(peer), ctx).run().await {
                log_connection_error(peer, &e);
            }
        });
    }
}

async fn accept_optional(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Answers 503 and closes.
async fn reject_busy<S: AsyncWrite + Unpin>(mut stream: S) {
    let mut response = Response::error_page(StatusCode::ServiceUnavailable, "Server is at capacity");
    response.set_keep_alive(false);
    let _ = stream.write_all(&serialize_response(&response)).await;
    let _ = stream.shutdown().await;
}

fn log_connection_error(peer: SocketAddr, err: &anyhow::Error) {
    if is_disconnect(err) {
        debug!(peer = %peer, error = %err, "client disconnected");
    } else {
        warn!(peer = %peer, error = ?err, "connection error");
    }
}
