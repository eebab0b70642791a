//! Accept loops feeding tonic's `serve_with_incoming`.
//!
//! Each connection carries a [`ConnectionInfo`] that tonic places into the
//! request extensions, so services can see the peer certificate and whether
//! the call came over the local socket.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKLOG: usize = 64;

/// Per-connection facts exposed to request handlers.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Arrived over the local Unix socket.
    pub local_channel: bool,
    /// DER of the client's leaf certificate, if it presented one.
    pub peer_certificate: Option<Vec<u8>>,
}

impl ConnectionInfo {
    pub fn peer_fingerprint(&self) -> Option<String> {
        self.peer_certificate
            .as_deref()
            .map(opscenter_crypto::der_fingerprint)
    }

    pub fn peer_certificate_pem(&self) -> Option<String> {
        self.peer_certificate
            .as_deref()
            .map(opscenter_crypto::der_to_pem)
    }
}

/// A completed server-side TLS connection.
pub struct TlsConnection {
    inner: TlsStream<TcpStream>,
    info: ConnectionInfo,
}

impl TlsConnection {
    fn new(inner: TlsStream<TcpStream>, remote_addr: SocketAddr) -> Self {
        let peer_certificate = inner
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|leaf| leaf.as_ref().to_vec());
        Self {
            inner,
            info: ConnectionInfo {
                remote_addr: Some(remote_addr),
                local_channel: false,
                peer_certificate,
            },
        }
    }
}

impl Connected for TlsConnection {
    type ConnectInfo = ConnectionInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A connection on the local administrative socket.
pub struct LocalConnection(UnixStream);

impl Connected for LocalConnection {
    type ConnectInfo = ConnectionInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        ConnectionInfo {
            remote_addr: None,
            local_channel: true,
            peer_certificate: None,
        }
    }
}

impl AsyncRead for LocalConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl AsyncWrite for LocalConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

/// Accept TCP connections and complete TLS handshakes off the accept loop.
///
/// Failed handshakes are logged and dropped; the stream ends when
/// `shutdown` is cancelled.
pub fn tls_incoming(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> ReceiverStream<io::Result<TlsConnection>> {
    let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
    let acceptor = TlsAcceptor::from(config);

    tokio::spawn(async move {
        loop {
            let (tcp, remote_addr) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        continue;
                    }
                },
            };

            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => {
                        let _ = tx.send(Ok(TlsConnection::new(stream, remote_addr))).await;
                    }
                    Ok(Err(e)) => debug!(peer = %remote_addr, error = %e, "TLS handshake failed"),
                    Err(_) => debug!(peer = %remote_addr, "TLS handshake timed out"),
                }
            });
        }
    });

    ReceiverStream::new(rx)
}

/// Wrap a Unix listener so its connections are marked as local.
pub fn unix_incoming(listener: UnixListener) -> impl Stream<Item = io::Result<LocalConnection>> {
    UnixListenerStream::new(listener).map(|conn| conn.map(LocalConnection))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_helpers_follow_certificate() {
        let info = ConnectionInfo::default();
        assert!(info.peer_fingerprint().is_none());
        assert!(info.peer_certificate_pem().is_none());

        let info = ConnectionInfo {
            peer_certificate: Some(vec![1, 2, 3]),
            ..ConnectionInfo::default()
        };
        assert_eq!(
            info.peer_fingerprint().as_deref(),
            Some(opscenter_crypto::der_fingerprint(&[1, 2, 3]).as_str())
        );
        assert!(
            info.peer_certificate_pem()
                .is_some_and(|pem| pem.starts_with("-----BEGIN CERTIFICATE-----"))
        );
    }
}
