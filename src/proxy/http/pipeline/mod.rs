//! Per-connection request handling.
//!
//! One accepted client connection carries exactly one request. The handler
//! walks through the phases below in order and always ends in
//! [`Phase::Closed`], whether the exchange succeeded or not.

mod cache;
mod forward;
mod respond;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::logging::{AccessLogBuilder, Outcome};
use crate::policy::ServerVerdict;
use crate::proxy::cache::cache_key;
use crate::proxy::endpoint::Endpoint;
use crate::proxy::{AppContext, upstream};

use super::codec::{HttpRequest, read_request};

use cache::CacheDecision;

pub use respond::{redirect_response, send_response, status_response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Parsed,
    PolicyChecked,
    BlockedResponse,
    RedirectedResponse,
    Connecting,
    CacheDecision,
    CacheHitRelay,
    OriginRelay,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::Parsed => "parsed",
            Phase::PolicyChecked => "policy_checked",
            Phase::BlockedResponse => "blocked_response",
            Phase::RedirectedResponse => "redirected_response",
            Phase::Connecting => "connecting",
            Phase::CacheDecision => "cache_decision",
            Phase::CacheHitRelay => "cache_hit_relay",
            Phase::OriginRelay => "origin_relay",
            Phase::Closed => "closed",
        }
    }
}

/// What the access log line reports about one exchange.
#[derive(Debug, Default)]
struct Exchange {
    method: String,
    url: String,
    host: String,
    outcome: Option<Outcome>,
    status: u16,
    cache_key: Option<String>,
    bytes_in: u64,
    bytes_out: u64,
    upstream: Option<SocketAddr>,
    error: Option<String>,
}

pub struct ConnectionHandler<S> {
    app: AppContext,
    client: S,
    peer: Endpoint,
    conn: u64,
    phase: Phase,
    exchange: Exchange,
    started: Instant,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(app: AppContext, client: S, peer: SocketAddr, conn: u64) -> Self {
        Self {
            app,
            client,
            peer: Endpoint::from(peer),
            conn,
            phase: Phase::Start,
            exchange: Exchange::default(),
            started: Instant::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Handles the connection to completion. Errors end the connection
    /// without a response and are logged here; nothing is propagated.
    pub async fn run(mut self) {
        debug!(conn = self.conn, client = %self.peer, "handling connection");
        if let Err(err) = self.process().await {
            warn!(
                conn = self.conn,
                phase = self.phase.as_str(),
                client = %self.peer,
                error = %format!("{err:#}"),
                "connection failed"
            );
            self.exchange.outcome = Some(Outcome::Error);
            self.exchange.error = Some(format!("{err:#}"));
        }
        let timeout = self.client_timeout();
        if let Ok(Err(err)) = tokio::time::timeout(timeout, self.client.shutdown()).await {
            debug!(conn = self.conn, error = %err, "client shutdown failed");
        }
        self.enter(Phase::Closed);
        self.log_access();
    }

    async fn process(&mut self) -> Result<()> {
        let settings = self.app.settings.clone();
        let (mut request, bytes_in) = read_request(
            &mut self.client,
            settings.client_timeout(),
            settings.max_request_header_size,
            settings.max_request_body_size,
        )
        .await?;
        self.exchange.bytes_in = bytes_in as u64;
        self.exchange.method = request.method.clone();
        self.exchange.url = request.url.clone();
        self.enter(Phase::Parsed);

        let (host, port) = request.host_port()?;
        self.exchange.host = host.clone();

        let verdict = self.app.guard.check_server(&request.url);
        self.enter(Phase::PolicyChecked);
        match verdict {
            ServerVerdict::Blocked => {
                self.enter(Phase::BlockedResponse);
                return self
                    .respond(
                        Outcome::Blocked,
                        StatusCode::FORBIDDEN,
                        status_response(StatusCode::FORBIDDEN),
                    )
                    .await;
            }
            ServerVerdict::Redirected => {
                let target = self.app.guard.get_redirect_url(&request.url)?;
                self.enter(Phase::RedirectedResponse);
                return self
                    .respond(
                        Outcome::Redirected,
                        StatusCode::FOUND,
                        redirect_response(&target),
                    )
                    .await;
            }
            ServerVerdict::Ok => {}
        }

        if request.method != "GET" && request.method != "POST" {
            return self
                .respond(
                    Outcome::MethodNotAllowed,
                    StatusCode::METHOD_NOT_ALLOWED,
                    status_response(StatusCode::METHOD_NOT_ALLOWED),
                )
                .await;
        }

        self.enter(Phase::Connecting);
        let (mut origin, origin_addr) =
            upstream::connect_to_server(&host, port, settings.upstream_connect_timeout()).await?;
        self.exchange.upstream = Some(origin_addr);
        debug!(conn = self.conn, origin = %origin_addr, host = %host, "connected to origin");

        self.enter(Phase::CacheDecision);
        request.prepare_for_origin();
        self.serve_from_origin(&mut origin, request).await
    }

    async fn serve_from_origin(
        &mut self,
        origin: &mut TcpStream,
        mut request: HttpRequest,
    ) -> Result<()> {
        let store = match &self.app.cache {
            Some(store) if request.method == "GET" => cache_key(&request.url).map(|key| {
                self.exchange.cache_key = Some(key);
                store.clone()
            }),
            _ => None,
        };

        let _fetch_guard = match &store {
            Some(store) => Some(store.lock_url(&request.url).await?),
            None => None,
        };

        match self.check_cache_and_recv(origin, &mut request, store).await? {
            CacheDecision::Hit(store) => {
                self.enter(Phase::CacheHitRelay);
                self.relay_from_cache(&store, &request.url).await
            }
            CacheDecision::Fetch(fetch) => {
                self.enter(Phase::OriginRelay);
                self.relay_from_origin(origin, fetch, &request.url).await
            }
        }
    }

    async fn respond(
        &mut self,
        outcome: Outcome,
        status: StatusCode,
        response: Vec<u8>,
    ) -> Result<()> {
        let timeout = self.client_timeout();
        let sent = send_response(&mut self.client, &response, timeout).await?;
        self.exchange.outcome = Some(outcome);
        self.exchange.status = status.as_u16();
        self.exchange.bytes_out += sent as u64;
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        debug!(
            conn = self.conn,
            from = self.phase.as_str(),
            phase = phase.as_str(),
            "phase transition"
        );
        self.phase = phase;
    }

    fn client_timeout(&self) -> Duration {
        self.app.settings.client_timeout()
    }

    fn upstream_timeout(&self) -> Duration {
        self.app.settings.upstream_timeout()
    }

    fn log_access(&mut self) {
        let exchange = std::mem::take(&mut self.exchange);
        let mut builder = AccessLogBuilder::new(self.conn, self.peer.socket_addr())
            .method(exchange.method)
            .url(exchange.url)
            .host(exchange.host)
            .outcome(exchange.outcome.unwrap_or(Outcome::Error))
            .status_code(exchange.status)
            .bytes(exchange.bytes_in, exchange.bytes_out)
            .elapsed(self.started.elapsed());
        if let Some(key) = exchange.cache_key {
            builder = builder.cache_key(key);
        }
        if let Some(addr) = exchange.upstream {
            builder = builder.upstream_addr(addr);
        }
        if let Some(detail) = exchange.error {
            builder = builder.error_detail(detail);
        }
        builder.log();
    }
}
