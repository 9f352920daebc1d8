//! Built-in [`Transport`](crate::transport::Transport) implementations:
//! plain TCP, UDP (wrapped to look like a stream to adapters), and
//! TLS-over-TCP via `openssl`/`tokio-openssl`. Registered into a
//! [`TransportFactories`] table by the bootstrap binary so a Route's
//! `<adapter>+<transport>` suffix can select one.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_openssl::SslStream;

use crate::transport::{Connection, DialSnafu, Transport, TransportError, TransportFactories};

/// Dials a plain TCP connection.
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(
        &self,
        address: &str,
        _options: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let stream = TcpStream::connect(address)
            .await
            .context(DialSnafu { address: address.to_string() })?;
        Ok(Box::new(stream))
    }
}

/// Wraps a connected [`UdpSocket`] so it reads and writes like a
/// stream, letting UDP share the same `Connection`-shaped API as TCP
/// and TLS.
struct UdpConnection {
    socket: UdpSocket,
}

impl AsyncRead for UdpConnection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpConnection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Dials a connected UDP "connection" — no handshake, just binds an
/// ephemeral local socket and connects it to the destination so
/// `send`/`recv` implicitly target it.
pub struct UdpTransport;

#[async_trait]
impl Transport for UdpTransport {
    async fn dial(
        &self,
        address: &str,
        _options: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context(DialSnafu { address: address.to_string() })?;
        socket
            .connect(address)
            .await
            .context(DialSnafu { address: address.to_string() })?;
        Ok(Box::new(UdpConnection { socket }))
    }
}

/// Dials TCP then negotiates TLS on top, via `openssl`'s client
/// connector. `options["insecure"] = "true"` skips certificate
/// verification, for talking to sinks with self-signed certificates in
/// development — the only TLS option the thin reference adapter needs.
pub struct TlsTransport;

#[async_trait]
impl Transport for TlsTransport {
    async fn dial(
        &self,
        address: &str,
        options: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let host = address.split(':').next().unwrap_or(address).to_string();

        let tcp = TcpStream::connect(address)
            .await
            .context(DialSnafu { address: address.to_string() })?;

        let mut connector = SslConnector::builder(SslMethod::tls()).map_err(|err| TransportError::Config {
            reason: format!("failed to build TLS connector: {err}"),
        })?;
        if options.get("insecure").map(String::as_str) == Some("true") {
            connector.set_verify(SslVerifyMode::NONE);
        }
        let connector = connector.build();

        let ssl = connector.configure().and_then(|c| c.into_ssl(&host)).map_err(|err| TransportError::Config {
            reason: format!("failed to configure TLS session for {host}: {err}"),
        })?;

        let mut stream = SslStream::new(ssl, tcp).map_err(|err| TransportError::Config {
            reason: format!("failed to wrap TCP stream in TLS session: {err}"),
        })?;
        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|err| TransportError::Dial {
                address: address.to_string(),
                source: io::Error::new(io::ErrorKind::Other, err),
            })?;

        Ok(Box::new(stream))
    }
}

/// Registers the three built-in transports under the suffixes a
/// Route's `<adapter>+<transport>` form names.
pub fn register_builtin(table: &TransportFactories) {
    table.register("tcp", Arc::new(TcpTransport));
    table.register("udp", Arc::new(UdpTransport));
    table.register("tls", Arc::new(TlsTransport));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket as TokioUdpSocket};

    #[test]
    fn register_builtin_names_all_three() {
        let table = TransportFactories::new();
        register_builtin(&table);
        assert_eq!(table.names(), vec!["tcp", "tls", "udp"]);
    }

    #[tokio::test]
    async fn tcp_transport_round_trips_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut conn = TcpTransport.dial(&addr.to_string(), &HashMap::new()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn udp_transport_round_trips_bytes() {
        let server = TokioUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut conn = UdpTransport.dial(&addr.to_string(), &HashMap::new()).await.unwrap();
        conn.write_all(b"hi").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
    }
}
