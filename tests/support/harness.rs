use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;

use relaycache::{
    cli::LogFormat,
    policy::AccessGuard,
    proxy::{AppContext, ProxyEngine, ShutdownSignal, cache::CacheStore},
    settings::{RunMode, Settings},
};

use super::dirs::TestDirs;

fn default_test_settings(dirs: &TestDirs) -> Settings {
    Settings {
        listen: "127.0.0.1:0".parse().expect("valid listen address"),
        log: LogFormat::Text,
        use_cache: true,
        cache_dir: dirs.cache_dir.clone(),
        mode: RunMode::Pool,
        workers: 4,
        queue_capacity: 16,
        client_timeout_ms: 2_000,
        upstream_timeout_ms: 2_000,
        upstream_connect_timeout: 2,
        relay_chunk_size: 1024,
        ..Settings::default()
    }
}

pub struct ProxyHarness {
    pub dirs: TestDirs,
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub engine: Arc<ProxyEngine>,
    pub guard: Arc<AccessGuard>,
    pub cache: Option<Arc<CacheStore>>,
    shutdown: ShutdownSignal,
    handle: JoinHandle<Result<()>>,
}

impl ProxyHarness {
    /// Stops accepting and waits for the run loop to return its result.
    pub async fn shutdown(self) -> Result<()> {
        self.stop().await.map(drop)
    }

    /// Like [`ProxyHarness::shutdown`], but keeps the temporary directories
    /// alive so a later harness can reopen the same cache.
    pub async fn stop(self) -> Result<TestDirs> {
        let ProxyHarness {
            dirs,
            engine,
            cache,
            shutdown,
            handle,
            ..
        } = self;
        shutdown.trigger();
        handle
            .await
            .map_err(|err| anyhow!("engine task failed: {err}"))??;
        drop(engine);
        drop(cache);
        Ok(dirs)
    }
}

pub struct ProxyHarnessBuilder {
    dirs: TestDirs,
    guard: AccessGuard,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ProxyHarnessBuilder {
    pub fn new() -> Result<Self> {
        Ok(Self::with_dirs(TestDirs::new()?))
    }

    pub fn with_dirs(dirs: TestDirs) -> Self {
        Self {
            dirs,
            guard: AccessGuard::new(),
            settings_override: None,
        }
    }

    pub fn with_guard(mut self, guard: AccessGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let mut settings = default_test_settings(&self.dirs);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        let settings = Arc::new(settings);

        let cache = if settings.use_cache {
            Some(Arc::new(CacheStore::open(settings.cache_dir.clone())?))
        } else {
            None
        };
        let guard = Arc::new(self.guard);
        let app = AppContext::new(settings.clone(), guard.clone(), cache.clone());

        let shutdown = ShutdownSignal::new();
        let engine = Arc::new(
            ProxyEngine::bind(app)
                .await?
                .with_shutdown(shutdown.clone()),
        );
        let addr = engine.local_addr();

        let handle = tokio::spawn({
            let engine = engine.clone();
            let mode = settings.mode;
            async move {
                match mode {
                    RunMode::Inline => engine.run().await,
                    RunMode::Pool => engine.run_multithread().await,
                }
            }
        });

        Ok(ProxyHarness {
            dirs: self.dirs,
            addr,
            settings,
            engine,
            guard,
            cache,
            shutdown,
            handle,
        })
    }
}
