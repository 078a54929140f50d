use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::io_util::{read_with_timeout, write_all_with_timeout};
use crate::proxy::cache::CacheStore;

use super::super::codec::{HttpRequest, ResponseHeadCollector};
use super::ConnectionHandler;

pub(super) enum CacheDecision {
    /// The origin confirmed the stored entry is current.
    Hit(Arc<CacheStore>),
    Fetch(Fetch),
}

/// State handed to the origin relay.
pub(super) struct Fetch {
    /// Response bytes already read from the origin, not yet sent to the client.
    pub(super) prefix: Vec<u8>,
    pub(super) collector: ResponseHeadCollector,
    /// Set when the relayed bytes should be written through to the cache.
    pub(super) store: Option<Arc<CacheStore>>,
    /// True when a stored entry is being replaced after revalidation failed.
    pub(super) refresh: bool,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Sends the request to the origin, turning it into a conditional request
    /// when a stored entry exists, and decides how the response is served.
    pub(super) async fn check_cache_and_recv(
        &mut self,
        origin: &mut TcpStream,
        request: &mut HttpRequest,
        store: Option<Arc<CacheStore>>,
    ) -> Result<CacheDecision> {
        let header_limit = self.app.settings.max_response_header_size;
        let cached = match &store {
            Some(store) => store.has(&request.url).await,
            None => false,
        };
        let store = match store {
            Some(store) if cached => store,
            store => {
                if store.is_some() {
                    crate::metrics::record_cache_lookup("miss");
                }
                send_request(origin, request, self.upstream_timeout()).await?;
                return Ok(CacheDecision::Fetch(Fetch {
                    prefix: Vec::new(),
                    collector: ResponseHeadCollector::new(header_limit),
                    store,
                    refresh: false,
                }));
            }
        };

        let last_modified = store.modified_time(&request.url)?;
        let etag = store.etag(&request.url)?;
        if !last_modified.is_empty() {
            request.set_header("If-Modified-Since", last_modified);
        }
        if !etag.is_empty() {
            request.set_header("If-None-Match", etag);
        }
        send_request(origin, request, self.upstream_timeout()).await?;

        let mut collector = ResponseHeadCollector::new(header_limit);
        let mut prefix = Vec::new();
        let mut chunk = vec![0u8; self.app.settings.relay_chunk_size];
        loop {
            let read = read_with_timeout(
                origin,
                &mut chunk,
                self.upstream_timeout(),
                "receiving revalidation response from origin",
            )
            .await?;
            if read == 0 {
                bail!("origin closed before answering the revalidation request");
            }
            prefix.extend_from_slice(&chunk[..read]);
            if collector.feed(&chunk[..read])? {
                break;
            }
        }

        let status = collector.head().and_then(|head| head.status_code());
        debug!(conn = self.conn, status = ?status, url = %request.url, "revalidation answered");
        match status {
            Some(304) => {
                crate::metrics::record_cache_lookup("hit");
                Ok(CacheDecision::Hit(store))
            }
            Some(200) => {
                crate::metrics::record_cache_lookup("stale");
                Ok(CacheDecision::Fetch(Fetch {
                    prefix,
                    collector,
                    store: Some(store),
                    refresh: true,
                }))
            }
            _ => {
                crate::metrics::record_cache_lookup("error");
                let status = collector
                    .head()
                    .map(|head| head.status.clone())
                    .unwrap_or_default();
                bail!("unexpected status '{status}' while revalidating {}", request.url)
            }
        }
    }
}

async fn send_request(
    origin: &mut TcpStream,
    request: &HttpRequest,
    timeout: std::time::Duration,
) -> Result<()> {
    write_all_with_timeout(
        origin,
        &request.to_bytes(),
        timeout,
        "sending request to origin",
    )
    .await
}
