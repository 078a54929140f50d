use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::AsyncWrite;

use crate::io_util::write_all_with_timeout;

/// A bodiless response generated by the proxy itself.
pub fn status_response(status: StatusCode) -> Vec<u8> {
    build_response(status, None)
}

/// `302 Found` pointing the client at `location`.
pub fn redirect_response(location: &str) -> Vec<u8> {
    build_response(StatusCode::FOUND, Some(location))
}

fn build_response(status: StatusCode, location: Option<&str>) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let mut head = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason);
    if let Some(location) = location {
        head.push_str("Location: ");
        head.push_str(location);
        head.push_str("\r\n");
    }
    head.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
    head.into_bytes()
}

/// Writes a synthesized response and returns the number of bytes sent.
pub async fn send_response<S>(stream: &mut S, response: &[u8], timeout: Duration) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    write_all_with_timeout(stream, response, timeout, "writing response to client").await?;
    Ok(response.len())
}
