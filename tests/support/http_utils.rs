use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const RESPONSE_TIMEOUT: StdDuration = StdDuration::from_secs(5);

pub async fn read_http_response<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    timeout(RESPONSE_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .map_err(|_| anyhow!("timed out waiting for the proxy to close the connection"))??;
    Ok(buf)
}

/// Writes `request` on a fresh connection and reads until the proxy closes it.
pub async fn send_raw(proxy: SocketAddr, request: impl AsRef<[u8]>) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(request.as_ref()).await?;
    stream.flush().await?;
    read_http_response(&mut stream).await
}

pub async fn proxy_get(proxy: SocketAddr, url: &str) -> Result<Vec<u8>> {
    let authority = url
        .strip_prefix("http://")
        .and_then(|rest| rest.split('/').next())
        .unwrap_or_default();
    let request =
        format!("GET {url} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n\r\n");
    send_raw(proxy, request).await
}

/// Splits a raw response into its status line and the remaining bytes.
pub fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let text = String::from_utf8_lossy(raw);
    match text.split_once("\r\n") {
        Some((status, rest)) => (status.to_string(), rest.as_bytes().to_vec()),
        None => (text.into_owned(), Vec::new()),
    }
}

pub async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let bytes = stream.read(&mut byte).await?;
        if bytes == 0 {
            break;
        }
        buffer.extend_from_slice(&byte);
        if buffer.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8(buffer).context("invalid UTF-8 request head")
}
