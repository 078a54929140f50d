pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    policy::AccessGuard,
    proxy::{AppContext, ProxyEngine, cache::CacheStore},
    settings::{RunMode, Settings},
};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let guard = AccessGuard::from_settings(&settings)?;
    info!(
        blocked_clients = guard.blocked_client_count(),
        blocked_servers = guard.blocked_server_count(),
        redirects = guard.redirect_count(),
        "access rules loaded"
    );

    let cache = if settings.use_cache {
        let store = CacheStore::open(settings.cache_dir.clone()).with_context(|| {
            format!("failed to open cache in {}", settings.cache_dir.display())
        })?;
        Some(Arc::new(store))
    } else {
        None
    };

    let app = AppContext::new(settings.clone(), Arc::new(guard), cache);
    let engine = ProxyEngine::bind(app).await?;
    match settings.mode {
        RunMode::Inline => engine.run().await,
        RunMode::Pool => engine.run_multithread().await,
    }
}
