use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use http::StatusCode;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::logging::{AccessLogBuilder, Outcome};
use crate::policy::ClientVerdict;

use super::AppContext;
use super::http::{ConnectionHandler, send_response, status_response};
use super::pool::WorkerPool;
use super::shutdown::{NetworkRuntime, ShutdownSignal, process_interrupt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("proxy engine is already running")]
    AlreadyRunning,
}

/// Counts a connection as in flight until dropped.
struct TaskGuard {
    active: Arc<AtomicUsize>,
}

impl TaskGuard {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        crate::metrics::inc_inflight();
        Self {
            active: active.clone(),
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        crate::metrics::dec_inflight();
    }
}

/// An accepted connection that passed the client check.
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    conn: u64,
    _task: TaskGuard,
}

impl Connection {
    async fn handle(self, app: AppContext) {
        let Connection {
            stream,
            peer,
            conn,
            _task,
        } = self;
        ConnectionHandler::new(app, stream, peer, conn).run().await;
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Listener plus dispatcher for proxied connections.
pub struct ProxyEngine {
    app: AppContext,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown: ShutdownSignal,
    running: AtomicBool,
    active: Arc<AtomicUsize>,
    next_conn: AtomicU64,
    runtime: NetworkRuntime,
}

impl ProxyEngine {
    /// Binds the listening socket. Bind failures are returned to the caller.
    pub async fn bind(app: AppContext) -> Result<Self> {
        let runtime = NetworkRuntime::acquire();
        let bind_addr = app.settings.listen;
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read listener address")?;
        info!(
            instance = runtime.instance_id(),
            address = %local_addr,
            cache = app.cache.is_some(),
            "proxy listener bound"
        );
        Ok(Self {
            app,
            listener,
            local_addr,
            shutdown: process_interrupt(),
            running: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            next_conn: AtomicU64::new(0),
            runtime,
        })
    }

    /// Replaces the process-wide interrupt with the given token.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> u64 {
        self.runtime.instance_id()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Handles each connection to completion on the accept loop before
    /// accepting the next one.
    pub async fn run(&self) -> Result<()> {
        let _running = self.start_running()?;
        info!(instance = self.instance_id(), mode = "inline", "proxy engine started");
        while let Some(connection) = self.next_connection().await {
            connection.handle(self.app.clone()).await;
        }
        self.finish().await;
        Ok(())
    }

    /// Dispatches connections to a fixed pool of workers.
    pub async fn run_multithread(&self) -> Result<()> {
        let _running = self.start_running()?;
        let settings = &self.app.settings;
        let app = self.app.clone();
        let pool = WorkerPool::start(
            settings.workers,
            settings.queue_capacity,
            move |connection: Connection| connection.handle(app.clone()),
        );
        info!(
            instance = self.instance_id(),
            mode = "pool",
            workers = pool.size(),
            "proxy engine started"
        );
        while let Some(connection) = self.next_connection().await {
            if let Err(err) = pool.submit(connection).await {
                error!(error = %err, "failed to queue connection");
                break;
            }
        }
        debug!(queued = pool.queued(), "waiting for workers to drain");
        pool.shutdown().await;
        self.finish().await;
        Ok(())
    }

    fn start_running(&self) -> Result<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning.into());
        }
        Ok(RunGuard(&self.running))
    }

    /// Accepts until a connection passes the client check, or returns `None`
    /// once shutdown is requested.
    async fn next_connection(&self) -> Option<Connection> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            let accepted = tokio::select! {
                _ = self.shutdown.triggered() => return None,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY on client stream");
            }
            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(conn, peer = %peer, "accepted connection");

            match self.app.guard.check_client(peer.ip()) {
                ClientVerdict::Ok => {
                    return Some(Connection {
                        stream,
                        peer,
                        conn,
                        _task: TaskGuard::new(&self.active),
                    });
                }
                ClientVerdict::Blocked => self.reject_client(stream, peer, conn).await,
            }
        }
    }

    async fn reject_client(&self, mut stream: TcpStream, peer: SocketAddr, conn: u64) {
        let started = Instant::now();
        let timeout = self.app.settings.client_timeout();
        let sent = match send_response(&mut stream, &status_response(StatusCode::FORBIDDEN), timeout)
            .await
        {
            Ok(sent) => sent,
            Err(err) => {
                debug!(conn, peer = %peer, error = %err, "failed to send 403 to blocked client");
                0
            }
        };
        if let Ok(Err(err)) = tokio::time::timeout(timeout, stream.shutdown()).await {
            debug!(conn, peer = %peer, error = %err, "blocked client shutdown failed");
        }
        AccessLogBuilder::new(conn, peer)
            .outcome(Outcome::ClientBlocked)
            .status(StatusCode::FORBIDDEN)
            .bytes(0, sent as u64)
            .elapsed(started.elapsed())
            .log();
    }

    async fn finish(&self) {
        let active = self.active_tasks();
        if active > 0 {
            warn!(active, "engine stopped with connections still in flight");
        }
        if let Some(cache) = &self.app.cache
            && let Err(err) = cache.persist().await
        {
            warn!(error = %err, "failed to save cache index");
        }
        info!(instance = self.instance_id(), "proxy engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AccessGuard;
    use crate::settings::Settings;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn engine(guard: AccessGuard) -> Arc<ProxyEngine> {
        let settings = Settings {
            listen: "127.0.0.1:0".parse().unwrap(),
            workers: 2,
            ..Settings::default()
        };
        let app = AppContext::new(Arc::new(settings), Arc::new(guard), None);
        Arc::new(
            ProxyEngine::bind(app)
                .await
                .unwrap()
                .with_shutdown(ShutdownSignal::new()),
        )
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let engine = engine(AccessGuard::new()).await;
        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run_multithread().await }
        });
        while !engine.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = engine.run().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<EngineError>(),
            Some(&EngineError::AlreadyRunning)
        );
        engine.shutdown_signal().trigger();
        first.await.unwrap().unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn blocked_client_gets_403_and_no_task() {
        let guard = AccessGuard::new();
        guard.add_client("127.0.0.1".parse().unwrap());
        let engine = engine(guard).await;
        let runner = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });

        let mut client = TcpStream::connect(engine.local_addr()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 403 Forbidden\r\n"));
        assert_eq!(engine.active_tasks(), 0);

        engine.shutdown_signal().trigger();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn vanished_blocked_client_does_not_stop_accepting() {
        let guard = AccessGuard::new();
        guard.add_client("127.0.0.1".parse().unwrap());
        let engine = engine(guard).await;
        let runner = tokio::spawn({
            let engine = engine.clone();
            async move { engine.run().await }
        });

        drop(TcpStream::connect(engine.local_addr()).await.unwrap());
        let mut client = TcpStream::connect(engine.local_addr()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 403 Forbidden\r\n"));

        engine.shutdown_signal().trigger();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn engines_get_distinct_instance_ids() {
        let first = engine(AccessGuard::new()).await;
        let second = engine(AccessGuard::new()).await;
        assert_ne!(first.instance_id(), second.instance_id());
        assert_ne!(first.local_addr(), second.local_addr());
    }
}
