use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

use crate::util::timeout_with_context;

/// Resolves `host:port`, bounded by `resolve_timeout`.
pub async fn resolve(host: &str, port: u16, resolve_timeout: Duration) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = timeout_with_context(
        resolve_timeout,
        lookup_host((host, port)),
        format!("resolving {host}:{port}"),
    )
    .await?
    .collect();
    if addrs.is_empty() {
        bail!("{host}:{port} did not resolve to any address");
    }
    Ok(addrs)
}

/// Attempts each address in turn and returns the first stream that connects.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on origin stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to origin");
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

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for origin connect")))
}

/// Resolves the origin and connects to it; both steps share `connect_timeout`.
pub async fn connect_to_server(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let addrs = resolve(host, port, connect_timeout).await?;
    connect_to_addrs(&addrs, connect_timeout)
        .await
        .with_context(|| format!("origin {host}:{port} unreachable"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_first_reachable_address() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let open = listener.local_addr()?;
        let closed = {
            let probe = TcpListener::bind("127.0.0.1:0").await?;
            probe.local_addr()?
        };
        let (_stream, addr) = connect_to_addrs(&[closed, open], Duration::from_secs(1)).await?;
        assert_eq!(addr, open);
        Ok(())
    }

    #[tokio::test]
    async fn empty_address_list_fails() {
        let err = connect_to_addrs(&[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no addresses"));
    }

    #[tokio::test]
    async fn connect_to_server_resolves_literal_ip() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let (_stream, addr) = connect_to_server("127.0.0.1", port, Duration::from_secs(1)).await?;
        assert_eq!(addr.port(), port);
        Ok(())
    }
}
