//! Byte transport under the listener.
//!
//! [`Transport`] is a TCP socket, optionally with TLS layered on after any
//! SOCKS5 tunnel is in place. Writes are bounded by [`SEND_TIMEOUT`];
//! receives are left unbounded because the listener drives its own
//! liveness deadline around them.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::{NetError, Result};
use crate::tls;

/// Size of one receive buffer.
pub const RECV_BUF_LEN: usize = 8192;

/// Per-address budget while connecting.
pub const CONNECT_PHASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for name resolution, the SOCKS exchange and the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Budget for a single write once connected.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[allow(clippy::large_enum_variant)]
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// A connected socket with an optional TLS session on top.
pub struct Transport {
    stream: Stream,
    peer: SocketAddr,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer", &self.peer)
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl Transport {
    /// Wrap a freshly connected TCP stream.
    pub fn tcp(stream: TcpStream) -> Result<Self> {
        if let Err(e) = Self::enable_keepalive(&stream) {
            warn!("failed to enable TCP keepalive: {}", e);
        }
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: Stream::Plain(stream),
            peer,
        })
    }

    fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
        let sock = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(120))
            .with_interval(Duration::from_secs(30));
        sock.set_tcp_keepalive(&keepalive)
    }

    /// Upgrade a plain transport to TLS.
    ///
    /// # Errors
    ///
    /// Handshake or verification failure; the socket is dropped.
    pub async fn upgrade_tls(
        self,
        connector: &TlsConnector,
        host: &str,
        budget: Duration,
    ) -> Result<Self> {
        let Transport { stream, peer } = self;
        let tcp = match stream {
            Stream::Plain(tcp) => tcp,
            tls @ Stream::Tls(_) => return Ok(Self { stream: tls, peer }),
        };

        let tls = timeout(budget, tls::handshake(connector, host, tcp))
            .await
            .map_err(|_| NetError::Timeout("performing TLS handshake"))??;

        let (_, session) = tls.get_ref();
        debug!(
            host,
            version = ?session.protocol_version(),
            suite = ?session.negotiated_cipher_suite().map(|s| s.suite()),
            "TLS established"
        );

        Ok(Self {
            stream: Stream::Tls(Box::new(tls)),
            peer,
        })
    }

    /// Returns true once a TLS session is layered on the socket.
    pub fn is_tls(&self) -> bool {
        matches!(self.stream, Stream::Tls(_))
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Borrow the raw TCP stream (for the SOCKS exchange).
    pub(crate) fn tcp_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.stream {
            Stream::Plain(tcp) => Some(tcp),
            Stream::Tls(_) => None,
        }
    }

    /// Write raw bytes under [`SEND_TIMEOUT`].
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let write = async {
            match &mut self.stream {
                Stream::Plain(s) => {
                    s.write_all(bytes).await?;
                    s.flush().await
                }
                Stream::Tls(s) => {
                    s.write_all(bytes).await?;
                    s.flush().await
                }
            }
        };
        timeout(SEND_TIMEOUT, write)
            .await
            .map_err(|_| NetError::Timeout("sending"))??;
        Ok(())
    }

    /// Write one CRLF-terminated line.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.send_raw(&buf).await
    }

    /// Read whatever is available. `Ok(0)` means the peer closed.
    ///
    /// Cancel safe: no bytes are lost if the future is dropped.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match &mut self.stream {
            Stream::Plain(s) => s.read(buf).await?,
            Stream::Tls(s) => s.read(buf).await?,
        };
        Ok(n)
    }

    /// Shut the session down: TLS close-notify first, then the socket.
    pub async fn close(self) {
        match self.stream {
            Stream::Tls(mut tls) => {
                match timeout(SEND_TIMEOUT, tls.shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("TLS shutdown: {}", e),
                    Err(_) => debug!("TLS shutdown timed out"),
                }
                drop(tls);
            }
            Stream::Plain(mut tcp) => {
                let _ = timeout(SEND_TIMEOUT, tcp.shutdown()).await;
                drop(tcp);
            }
        }
        debug!("socket closed");
    }
}

/// Connect to the first reachable address.
///
/// Each candidate gets `per_addr`; failures move on to the next one.
///
/// # Errors
///
/// [`NetError::NoAddressReachable`] when every candidate failed.
pub async fn connect_any(addrs: &[SocketAddr], per_addr: Duration) -> Result<TcpStream> {
    for addr in addrs {
        match timeout(per_addr, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Ok(Err(e)) => debug!(%addr, error = %e, "connect failed"),
            Err(_) => debug!(%addr, "connect timed out"),
        }
    }
    Err(NetError::NoAddressReachable)
}
