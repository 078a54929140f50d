use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::util::{find_head_end, timeout_with_context};

use super::ParseError;
use super::headers::{Headers, find_header, read_header_block, remove_header};
use super::line::LineCursor;

const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Request target as sent to a proxy, normally absolute-form.
    pub url: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Parses a complete request head plus whatever body bytes follow it.
pub fn parse_request(bytes: &[u8]) -> Result<HttpRequest, ParseError> {
    let mut cursor = LineCursor::new(bytes);
    let start = cursor.next_line()?;
    let mut parts = start.splitn(3, ' ');
    let (Some(method), Some(url), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::StartLine(start.to_string()));
    };
    if method.is_empty() || url.is_empty() || version.is_empty() {
        return Err(ParseError::StartLine(start.to_string()));
    }
    let (method, url, version) = (method.to_string(), url.to_string(), version.to_string());

    let headers = read_header_block(&mut cursor)?;
    Ok(HttpRequest {
        method,
        url,
        version,
        headers,
        body: cursor.remainder().to_vec(),
    })
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        remove_header(&mut self.headers, name)
    }

    /// Sets a header, replacing any existing field with the same name in any casing.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        remove_header(&mut self.headers, name);
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length")
            .and_then(|value| value.trim().parse().ok())
    }

    /// Target host and port, taken from the `Host` header or, failing that,
    /// from the authority of an absolute-form URL.
    pub fn host_port(&self) -> Result<(String, u16), ParseError> {
        let authority = match self.header("Host") {
            Some(host) => host,
            None => url_authority(&self.url).ok_or(ParseError::MissingHost)?,
        };
        split_host_port(authority)
    }

    /// Drops proxy hop-by-hop state so the origin closes after one response.
    pub fn prepare_for_origin(&mut self) {
        self.remove_header("Proxy-Connection");
        self.set_header("Connection", "close");
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256 + self.body.len());
        buffer.extend_from_slice(self.method.as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.url.as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.version.as_bytes());
        buffer.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            buffer.extend_from_slice(name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        buffer.extend_from_slice(b"\r\n");
        buffer.extend_from_slice(&self.body);
        buffer
    }
}

fn url_authority(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))?;
    let end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..end];
    (!authority.is_empty()).then_some(authority)
}

fn split_host_port(authority: &str) -> Result<(String, u16), ParseError> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(ParseError::MissingHost);
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::InvalidPort(authority.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, authority)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(ParseError::InvalidPort(authority.to_string())),
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port, authority)?)),
        None => Ok((authority.to_string(), DEFAULT_PORT)),
    }
}

fn parse_port(port: &str, authority: &str) -> Result<u16, ParseError> {
    port.parse()
        .map_err(|_| ParseError::InvalidPort(authority.to_string()))
}

/// Reads one request from a client stream.
///
/// Every read is bounded by `idle_timeout`; a stalled client is a hard failure.
/// Once the head is complete, reading continues until `Content-Length` body
/// bytes have arrived. Returns the request and the number of bytes read.
pub async fn read_request<S>(
    stream: &mut S,
    idle_timeout: Duration,
    max_head_bytes: usize,
    max_body_bytes: usize,
) -> Result<(HttpRequest, usize)>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 8192];

    loop {
        let read = timeout_with_context(
            idle_timeout,
            stream.read(&mut chunk),
            "receiving request from client",
        )
        .await?;
        if read == 0 {
            if buffer.is_empty() {
                bail!("client disconnected before sending a request");
            }
            return Err(ParseError::Incomplete.into());
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(head_end) = find_head_end(&buffer) {
            if head_end > max_head_bytes {
                return Err(ParseError::TooLarge(max_head_bytes).into());
            }
            break;
        }
        if buffer.len() > max_head_bytes {
            return Err(ParseError::TooLarge(max_head_bytes).into());
        }
    }

    let mut request = parse_request(&buffer)?;
    if let Some(expected) = request.content_length() {
        if expected > max_body_bytes {
            bail!("request body of {expected} bytes exceeds configured limit of {max_body_bytes}");
        }
        while request.body.len() < expected {
            let read = timeout_with_context(
                idle_timeout,
                stream.read(&mut chunk),
                "receiving request body from client",
            )
            .await?;
            if read == 0 {
                bail!(
                    "client closed after {} of {expected} body bytes",
                    request.body.len()
                );
            }
            request.body.extend_from_slice(&chunk[..read]);
            buffer.extend_from_slice(&chunk[..read]);
        }
    }

    Ok((request, buffer.len()))
}
