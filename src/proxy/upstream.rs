use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

/// Resolve the upstream and connect to the first reachable address.
pub async fn connect(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let addrs: Vec<SocketAddr> = timeout(connect_timeout, lookup_host((host, port)))
        .await
        .map_err(|_| anyhow!("resolving upstream {host}:{port} timed out"))?
        .with_context(|| format!("failed to resolve upstream {host}:{port}"))?
        .collect();

    let mut last_err = None;
    for addr in &addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(addr = %addr, error = %err, "failed to set TCP_NODELAY on upstream stream");
                }
                debug!(addr = %addr, "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(
                    anyhow::Error::new(err).context(format!("failed to connect to {addr}")),
                );
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| anyhow!("upstream {host}:{port} resolved to no addresses")))
}
