use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::io_util::{read_with_timeout, write_all_with_timeout};
use crate::logging::Outcome;
use crate::proxy::cache::CacheStore;

use super::super::codec::HttpResponseHead;
use super::ConnectionHandler;
use super::cache::Fetch;

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Streams the stored body to the client in fixed-size chunks.
    pub(super) async fn relay_from_cache(&mut self, store: &CacheStore, url: &str) -> Result<()> {
        let mut buf = vec![0u8; self.app.settings.relay_chunk_size];
        let timeout = self.client_timeout();
        let mut offset = 0u64;
        loop {
            let read = store.read(url, offset, &mut buf).await?;
            if read == 0 {
                break;
            }
            write_all_with_timeout(
                &mut self.client,
                &buf[..read],
                timeout,
                "sending cached response to client",
            )
            .await?;
            offset += read as u64;
            self.exchange.bytes_out += read as u64;
        }
        self.exchange.outcome = Some(Outcome::CacheHit);
        self.exchange.status = 200;
        debug!(conn = self.conn, bytes = offset, url, "served from cache");
        Ok(())
    }

    /// Relays the origin response to the client chunk by chunk, writing it
    /// through to the cache when `fetch.store` is set.
    pub(super) async fn relay_from_origin(
        &mut self,
        origin: &mut TcpStream,
        mut fetch: Fetch,
        url: &str,
    ) -> Result<()> {
        let store = fetch.store.take();
        let relayed = self
            .relay_chunks(origin, &mut fetch, store.as_deref(), url)
            .await;
        if let Some(head) = fetch.collector.head() {
            self.exchange.status = head.status_code().unwrap_or_default();
        }
        self.exchange.outcome = Some(if fetch.refresh {
            Outcome::CacheRefresh
        } else {
            Outcome::Miss
        });

        let total = match relayed {
            Ok(total) => total,
            Err(err) => {
                if let Some(store) = &store
                    && let Err(remove_err) = store.remove(url).await
                {
                    warn!(conn = self.conn, error = %remove_err, "failed to drop partial cache entry");
                }
                return Err(err);
            }
        };

        if let Some(store) = &store {
            self.finalize_cache_entry(store, url, total, fetch.collector.head())
                .await?;
        }
        if total == 0 {
            bail!("origin closed without sending a response");
        }
        debug!(conn = self.conn, bytes = total, url, "relayed origin response");
        Ok(())
    }

    async fn relay_chunks(
        &mut self,
        origin: &mut TcpStream,
        fetch: &mut Fetch,
        store: Option<&CacheStore>,
        url: &str,
    ) -> Result<u64> {
        let mut created = false;
        let mut total = 0u64;
        let prefix = std::mem::take(&mut fetch.prefix);
        if !prefix.is_empty() {
            self.forward_chunk(&prefix, fetch, store, url, &mut created)
                .await?;
            total += prefix.len() as u64;
        }

        let mut chunk = vec![0u8; self.app.settings.relay_chunk_size];
        loop {
            let read = read_with_timeout(
                origin,
                &mut chunk,
                self.upstream_timeout(),
                "receiving response from origin",
            )
            .await?;
            if read == 0 {
                break;
            }
            self.forward_chunk(&chunk[..read], fetch, store, url, &mut created)
                .await?;
            total += read as u64;
        }
        Ok(total)
    }

    async fn forward_chunk(
        &mut self,
        bytes: &[u8],
        fetch: &mut Fetch,
        store: Option<&CacheStore>,
        url: &str,
        created: &mut bool,
    ) -> Result<()> {
        if let Some(store) = store {
            if !*created {
                store.create(url).await?;
                *created = true;
            }
            store.append(url, bytes).await?;
        }
        let timeout = self.client_timeout();
        write_all_with_timeout(
            &mut self.client,
            bytes,
            timeout,
            "relaying response to client",
        )
        .await?;
        self.exchange.bytes_out += bytes.len() as u64;
        let failed_before = fetch.collector.error().is_some();
        if let Err(err) = fetch.collector.feed(bytes)
            && !failed_before
        {
            debug!(conn = self.conn, error = %err, "origin response head not parsed");
        }
        Ok(())
    }

    async fn finalize_cache_entry(
        &self,
        store: &CacheStore,
        url: &str,
        total: u64,
        head: Option<&HttpResponseHead>,
    ) -> Result<()> {
        let key = self.exchange.cache_key.as_deref().unwrap_or_default();
        if total == 0 {
            store.remove(url).await?;
            crate::metrics::record_cache_store("empty");
            info!(conn = self.conn, url, key, "empty origin response; nothing cached");
            return Ok(());
        }
        let Some(head) = head.filter(|head| head.status_code() == Some(200)) else {
            store.remove(url).await?;
            crate::metrics::record_cache_store("uncacheable");
            info!(conn = self.conn, url, key, "response is not a complete 200; nothing cached");
            return Ok(());
        };
        if store
            .update_validators_from_headers(url, &head.headers)
            .await?
        {
            crate::metrics::record_cache_store("stored");
            info!(conn = self.conn, url, key, "cache entry stored");
        } else {
            crate::metrics::record_cache_store("no_validator");
            info!(
                conn = self.conn,
                url, key, "response has neither Last-Modified nor ETag; nothing cached"
            );
        }
        Ok(())
    }
}
