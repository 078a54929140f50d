use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::http_utils::read_until_double_crlf;

/// Origin server that answers connection `n` with the `n`th scripted
/// response, repeating the last one once the script runs out. Every request
/// head it receives is recorded.
pub struct TestOrigin {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn scripted(responses: Vec<Vec<u8>>) -> Result<Self> {
        Self::scripted_with_delay(responses, StdDuration::ZERO).await
    }

    /// Like [`TestOrigin::scripted`], but waits `delay` between reading a
    /// request and answering it.
    pub async fn scripted_with_delay(
        responses: Vec<Vec<u8>>,
        delay: StdDuration,
    ) -> Result<Self> {
        Self::spawn(responses, delay, StdDuration::ZERO).await
    }

    /// Sends `partial` and then holds the connection open for `hold` before
    /// closing it.
    pub async fn stalling(partial: impl Into<Vec<u8>>, hold: StdDuration) -> Result<Self> {
        Self::spawn(vec![partial.into()], StdDuration::ZERO, hold).await
    }

    async fn spawn(
        responses: Vec<Vec<u8>>,
        delay: StdDuration,
        hold: StdDuration,
    ) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let handle = tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let response = responses
                    .get(served)
                    .or_else(|| responses.last())
                    .cloned()
                    .unwrap_or_default();
                served += 1;
                let _ = answer(&mut stream, &response, &seen, delay, hold).await;
            }
        });
        Ok(Self {
            addr,
            requests,
            handle,
        })
    }

    /// Serves the same response to every connection.
    pub async fn fixed(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::scripted(vec![response.into()]).await
    }

    /// Closes every connection without sending anything.
    pub async fn silent() -> Result<Self> {
        Self::scripted(vec![Vec::new()]).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Absolute-form URL for `path` on this origin.
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port())
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn answer(
    stream: &mut TcpStream,
    response: &[u8],
    seen: &Mutex<Vec<String>>,
    delay: StdDuration,
    hold: StdDuration,
) -> Result<()> {
    let head = read_until_double_crlf(stream).await?;
    seen.lock().push(head);
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if !response.is_empty() {
        stream.write_all(response).await?;
    }
    if !hold.is_zero() {
        tokio::time::sleep(hold).await;
    }
    stream.shutdown().await.ok();
    Ok(())
}

pub fn ok_response(headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    response("200 OK", headers, body)
}

pub fn not_modified() -> Vec<u8> {
    response("304 Not Modified", &[], "")
}

pub fn response(status: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut text = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        text.push_str(&format!("{name}: {value}\r\n"));
    }
    text.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    text.into_bytes()
}
