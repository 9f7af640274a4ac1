//! HTTPS connections: a TLS handshake followed by the ordinary
//! [`Connection`] state machine over the decrypted stream.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::http::connection::{Connection, ConnectionContext};

pub struct SecureConnection<IO> {
    io: IO,
    acceptor: TlsAcceptor,
    peer: Option<SocketAddr>,
    ctx: ConnectionContext,
}

impl<IO> SecureConnection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: IO, acceptor: TlsAcceptor, peer: Option<SocketAddr>, ctx: ConnectionContext) -> Self {
        Self {
            io,
            acceptor,
            peer,
            ctx,
        }
    }

    /// Handshakes, then serves requests until the connection closes.
    ///
    /// The handshake shares the keep-alive deadline. A failed or timed out
    /// handshake drops the socket without writing anything, since there is
    /// no channel to answer on.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            io,
            acceptor,
            peer,
            ctx,
        } = self;

        let deadline = ctx.config.keep_alive_timeout;
        let stream = match tokio::time::timeout(deadline, acceptor.accept(io)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(peer = ?peer, error = %e, "TLS handshake failed");
                return Ok(());
            }
            Err(_) => {
                tracing::debug!(peer = ?peer, "TLS handshake timed out");
                return Ok(());
            }
        };

        let (_, session) = stream.get_ref();
        tracing::debug!(
            peer = ?peer,
            version = ?session.protocol_version(),
            "TLS handshake complete"
        );

        Connection::new(stream, peer, ctx).run().await
    }
}
