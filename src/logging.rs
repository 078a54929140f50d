use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// How a connection ended, as reported in the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    ClientBlocked,
    Blocked,
    Redirected,
    MethodNotAllowed,
    CacheHit,
    CacheRefresh,
    Miss,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::ClientBlocked => "CLIENT_BLOCKED",
            Outcome::Blocked => "BLOCKED",
            Outcome::Redirected => "REDIRECTED",
            Outcome::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Outcome::CacheHit => "CACHE_HIT",
            Outcome::CacheRefresh => "CACHE_REFRESH",
            Outcome::Miss => "MISS",
            Outcome::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub conn: u64,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub method: String,
    pub url: String,
    pub host: String,
    pub outcome: Outcome,
    pub status: u16,
    pub cache_key: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub upstream_addr: Option<String>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(conn: u64, peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                conn,
                client_ip: peer.ip(),
                client_port: peer.port(),
                method: String::new(),
                url: String::new(),
                host: String::new(),
                outcome: Outcome::Error,
                status: 0,
                cache_key: None,
                bytes_in: 0,
                bytes_out: 0,
                elapsed_ms: 0,
                upstream_addr: None,
                error_detail: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.event.url = url.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.event.host = host.into();
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.event.outcome = outcome;
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn status_code(mut self, status: u16) -> Self {
        self.event.status = status;
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.event.cache_key = Some(key.into());
        self
    }

    pub fn bytes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.event.bytes_in = bytes_in;
        self.event.bytes_out = bytes_out;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn upstream_addr(mut self, addr: SocketAddr) -> Self {
        self.event.upstream_addr = Some(addr.to_string());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        conn,
        client_ip,
        client_port,
        method,
        url,
        host,
        outcome,
        status,
        cache_key,
        bytes_in,
        bytes_out,
        elapsed_ms,
        upstream_addr,
        error_detail,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    tracing::info!(
        target = "access_log",
        ts,
        conn,
        client_ip = %client_ip,
        client_port,
        method,
        url,
        host,
        outcome = outcome.as_str(),
        status,
        cache_key = cache_key.as_deref(),
        bytes_in,
        bytes_out,
        elapsed_ms,
        upstream_addr = upstream_addr.as_deref(),
        error_detail = error_detail.as_deref()
    );

    crate::metrics::record_connection(outcome.as_str(), bytes_out);
}
