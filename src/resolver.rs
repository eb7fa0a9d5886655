//! Host name resolution.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{NetError, Result};

/// Resolve `host:port` into the candidate addresses to try, in order.
///
/// IP literals short-circuit the system resolver.
///
/// # Errors
///
/// [`NetError::Resolve`] if the port is not numeric or the lookup returns
/// nothing, [`NetError::Timeout`] if the lookup exceeds `budget`.
pub async fn resolve(host: &str, port: &str, budget: Duration) -> Result<Vec<SocketAddr>> {
    let resolve_err = || NetError::Resolve {
        host: host.to_owned(),
        port: port.to_owned(),
    };

    let port_num: u16 = port.trim().parse().map_err(|_| resolve_err())?;
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port_num)]);
    }

    let addrs: Vec<SocketAddr> = match timeout(budget, lookup_host((host, port_num))).await {
        Ok(Ok(iter)) => iter.collect(),
        Ok(Err(e)) => {
            debug!(host, error = %e, "lookup failed");
            return Err(resolve_err());
        }
        Err(_) => return Err(NetError::Timeout("resolving host")),
    };

    if addrs.is_empty() {
        return Err(resolve_err());
    }

    debug!(host, count = addrs.len(), "resolved");
    Ok(addrs)
}
