//! SOCKS5 CONNECT tunnelling (RFC 1928, no authentication).
//!
//! The manager resolves and connects to the proxy, then calls
//! [`handshake`] on the raw stream before any TLS is layered on top.
//!
//! # Reference
//! - RFC 1928: <https://tools.ietf.org/html/rfc1928>

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::SocksAddrType;
use crate::error::{NetError, Result};
use crate::resolver;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Address the proxy reported as bound for the tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BoundAddr {
    /// IPv4 or IPv6 socket address.
    Ip(SocketAddr),
    /// Domain name and port.
    Domain(String, u16),
}

/// Human-readable text for a SOCKS5 reply code.
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0 => "Succeeded",
        1 => "General SOCKS server failure",
        2 => "Connection not allowed by ruleset",
        3 => "Network unreachable",
        4 => "Host unreachable",
        5 => "Connection refused",
        6 => "TTL expired",
        7 => "Command not supported",
        8 => "Address type not supported",
        _ => "Unknown error",
    }
}

/// Build the CONNECT request for `host:port`.
///
/// For [`SocksAddrType::Ipv4`] and [`SocksAddrType::Ipv6`] the host is
/// resolved locally and the first address of that family is sent.
pub async fn connect_request(
    host: &str,
    port: u16,
    atyp: SocksAddrType,
    budget: Duration,
) -> Result<Vec<u8>> {
    let mut req = vec![VERSION, CMD_CONNECT, 0x00];

    match atyp {
        SocksAddrType::Domain => {
            let name = host.as_bytes();
            let len = u8::try_from(name.len())
                .map_err(|_| NetError::Socks("host name too long".to_owned()))?;
            if len == 0 {
                return Err(NetError::Socks("empty host name".to_owned()));
            }
            req.push(ATYP_DOMAIN);
            req.push(len);
            req.extend_from_slice(name);
        }
        SocksAddrType::Ipv4 | SocksAddrType::Ipv6 => {
            let want_v4 = atyp == SocksAddrType::Ipv4;
            let addrs = resolver::resolve(host, &port.to_string(), budget).await?;
            let ip = addrs
                .iter()
                .map(SocketAddr::ip)
                .find(|ip| ip.is_ipv4() == want_v4)
                .ok_or_else(|| NetError::Socks("no address of the requested type".to_owned()))?;
            match ip {
                IpAddr::V4(v4) => {
                    req.push(ATYP_IPV4);
                    req.extend_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    req.push(ATYP_IPV6);
                    req.extend_from_slice(&v6.octets());
                }
            }
        }
    }

    req.extend_from_slice(&port.to_be_bytes());
    Ok(req)
}

/// Run the method negotiation and CONNECT exchange on `stream`.
///
/// Each round trip is bounded by `budget`.
///
/// # Errors
///
/// [`NetError::Socks`] with the reply message when the proxy refuses,
/// [`NetError::Timeout`] when it stalls.
pub async fn handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    atyp: SocksAddrType,
    budget: Duration,
) -> Result<BoundAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(budget, negotiate_method(stream))
        .await
        .map_err(|_| NetError::Timeout("negotiating SOCKS method"))??;

    let request = connect_request(host, port, atyp, budget).await?;
    let bound = timeout(budget, send_connect(stream, &request))
        .await
        .map_err(|_| NetError::Timeout("waiting for SOCKS CONNECT reply"))??;

    info!(target_host = host, port, ?bound, "SOCKS tunnel established");
    Ok(bound)
}

async fn negotiate_method<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION, 0x01, METHOD_NO_AUTH]).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(NetError::Socks(format!("unexpected version {}", reply[0])));
    }
    if reply[1] != METHOD_NO_AUTH {
        return Err(NetError::Socks("no acceptable methods".to_owned()));
    }
    debug!("SOCKS method negotiated");
    Ok(())
}

async fn send_connect<S>(stream: &mut S, request: &[u8]) -> Result<BoundAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(NetError::Socks(format!("unexpected version {}", head[0])));
    }
    if head[1] != 0 {
        return Err(NetError::Socks(reply_message(head[1]).to_owned()));
    }

    let bound = match head[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            BoundAddr::Ip(SocketAddr::new(IpAddr::from(ip), port))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            BoundAddr::Ip(SocketAddr::new(IpAddr::from(ip), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = read_port(stream).await?;
            BoundAddr::Domain(String::from_utf8_lossy(&name).into_owned(), port)
        }
        other => {
            return Err(NetError::Socks(format!("unknown address type {}", other)));
        }
    };

    Ok(bound)
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}
