pub mod cache;
pub mod endpoint;
pub mod engine;
pub mod http;
pub mod pool;
pub mod shutdown;
pub mod upstream;

use std::sync::Arc;

use crate::{policy::AccessGuard, settings::Settings};

pub use engine::{EngineError, ProxyEngine};
pub use shutdown::ShutdownSignal;

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub guard: Arc<AccessGuard>,
    pub cache: Option<Arc<cache::CacheStore>>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        guard: Arc<AccessGuard>,
        cache: Option<Arc<cache::CacheStore>>,
    ) -> Self {
        Self {
            settings,
            guard,
            cache,
        }
    }
}
