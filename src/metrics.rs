use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::proxy::http::codec::read_request;

const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_MAX_REQUEST_BYTES: usize = 8 * 1024;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CONNECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("connections_total", "Handled connections by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register connections_total");
    vec
});

static BYTES_TO_CLIENTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("bytes_to_clients_total", "Bytes sent to clients")
        .expect("create bytes_to_clients_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register bytes_to_clients_total");
    counter
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_store_total", "Cache finalize results");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_store_total");
    vec
});

static INFLIGHT_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("inflight_connections", "Connections currently being handled")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register inflight_connections");
    gauge
});

pub fn record_connection(outcome: &str, bytes_out: u64) {
    CONNECTIONS_TOTAL.with_label_values(&[outcome]).inc();
    BYTES_TO_CLIENTS_TOTAL.inc_by(bytes_out);
}

/// `result` is one of `hit`, `miss`, `stale` or `error`.
pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store(result: &str) {
    CACHE_STORE_TOTAL.with_label_values(&[result]).inc();
}

pub fn inc_inflight() {
    INFLIGHT_CONNECTIONS.inc();
}

pub fn dec_inflight() {
    INFLIGHT_CONNECTIONS.dec();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves the registry as plain text on `GET /metrics`.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, METRICS_READ_TIMEOUT, METRICS_MAX_REQUEST_BYTES).await
            {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream<S>(mut stream: S, read_timeout: Duration, max_bytes: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (request, _) = read_request(&mut stream, read_timeout, max_bytes, 0).await?;
    let response = if request.method == "GET" && request.url == "/metrics" {
        build_response(200, TextEncoder::new().format_type(), gather())
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn records_outcomes_and_cache_results() {
        record_connection("CACHE_HIT", 42);
        record_cache_lookup("hit");
        record_cache_store("stored");
        let text = String::from_utf8(gather()).expect("utf8");
        assert!(text.contains("connections_total{outcome=\"CACHE_HIT\"}"));
        assert!(text.contains("cache_lookup_total{result=\"hit\"}"));
        assert!(text.contains("cache_store_total{result=\"stored\"}"));
    }

    #[tokio::test]
    async fn serves_metrics_path() {
        record_connection("MISS", 1);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        handle_stream(server, Duration::from_secs(1), 1024)
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200\r\n"));
        assert!(response.contains("connections_total"));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET /other HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        handle_stream(server, Duration::from_secs(1), 1024)
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404\r\n"));
    }

    #[tokio::test]
    async fn rejects_oversized_request() {
        let (mut client, server) = tokio::io::duplex(1024);
        let oversized = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(64));
        client.write_all(oversized.as_bytes()).await.unwrap();
        let err = handle_stream(server, Duration::from_secs(1), 32)
            .await
            .expect_err("oversized request should be rejected");
        assert!(
            err.to_string().contains("exceeds configured limit"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn times_out_on_slow_request() {
        let (_client, server) = tokio::io::duplex(1024);
        let err = handle_stream(server, Duration::from_millis(50), 1024)
            .await
            .expect_err("slow request should time out");
        assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
    }
}
