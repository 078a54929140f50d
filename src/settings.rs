use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1920))
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_use_cache() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_mode() -> RunMode {
    RunMode::Pool
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_client_timeout_ms() -> u64 {
    1_000
}

fn default_upstream_timeout_ms() -> u64 {
    1_000
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_max_request_header_size() -> usize {
    64 * 1024
}

fn default_max_response_header_size() -> usize {
    64 * 1024
}

fn default_max_request_body_size() -> usize {
    16 * 1024 * 1024
}

fn default_relay_chunk_size() -> usize {
    65_535
}

/// How accepted connections are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Each connection is handled on the accept loop before the next accept.
    Inline,
    /// Connections are queued to a fixed set of workers.
    Pool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedirectRule {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_mode")]
    pub mode: RunMode,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_relay_chunk_size")]
    pub relay_chunk_size: usize,
    #[serde(default)]
    pub blocked_clients: Vec<String>,
    #[serde(default)]
    pub blocked_servers: Vec<String>,
    #[serde(default)]
    pub redirects: Vec<RedirectRule>,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log: default_log_format(),
            use_cache: default_use_cache(),
            cache_dir: default_cache_dir(),
            mode: default_mode(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            client_timeout_ms: default_client_timeout_ms(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            max_request_header_size: default_max_request_header_size(),
            max_response_header_size: default_max_response_header_size(),
            max_request_body_size: default_max_request_body_size(),
            relay_chunk_size: default_relay_chunk_size(),
            blocked_clients: Vec::new(),
            blocked_servers: Vec::new(),
            redirects: Vec::new(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli);

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("RELAYCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.workers > 0,
            "workers must be at least 1 (got {})",
            self.workers
        );
        ensure!(
            self.queue_capacity > 0,
            "queue_capacity must be at least 1 (got {})",
            self.queue_capacity
        );
        ensure!(
            self.client_timeout_ms > 0,
            "client_timeout_ms must be greater than 0 (got {})",
            self.client_timeout_ms
        );
        ensure!(
            self.upstream_timeout_ms > 0,
            "upstream_timeout_ms must be greater than 0 (got {})",
            self.upstream_timeout_ms
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.max_request_header_size > 0,
            "max_request_header_size must be greater than 0 (got {})",
            self.max_request_header_size
        );
        ensure!(
            self.max_response_header_size > 0,
            "max_response_header_size must be greater than 0 (got {})",
            self.max_response_header_size
        );
        ensure!(
            self.relay_chunk_size > 0,
            "relay_chunk_size must be greater than 0 (got {})",
            self.relay_chunk_size
        );
        for rule in &self.redirects {
            ensure!(
                !rule.from.is_empty() && !rule.to.is_empty(),
                "redirect rules need both 'from' and 'to'"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Some(path.to_path_buf());
    }
    default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/relaycache/relaycache.toml"),
        PathBuf::from("relaycache.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().expect("defaults validate");
        assert_eq!(settings.listen.port(), 1920);
        assert_eq!(settings.client_timeout(), Duration::from_secs(1));
        assert_eq!(settings.mode, RunMode::Pool);
    }

    #[test]
    fn rejects_zero_workers() {
        let settings = Settings {
            workers: 0,
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("workers"), "unexpected: {err}");
    }

    #[test]
    fn loads_policy_lists_from_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("relaycache.toml");
        std::fs::write(
            &path,
            r#"
listen = "127.0.0.1:8080"
mode = "inline"
cache_dir = "store"
blocked_clients = ["10.0.0.7"]
blocked_servers = ["http://jwts.example.edu/"]

[[redirects]]
from = "http://www.example.com/"
to = "http://today.example.org/"
"#,
        )?;
        let cli = Cli {
            config: Some(path.clone()),
        };
        let settings = Settings::load(&cli)?;
        assert_eq!(settings.listen.port(), 8080);
        assert_eq!(settings.mode, RunMode::Inline);
        assert_eq!(settings.cache_dir, dir.path().join("store"));
        assert_eq!(settings.blocked_clients, vec!["10.0.0.7".to_string()]);
        assert_eq!(settings.redirects.len(), 1);
        assert_eq!(settings.redirects[0].to, "http://today.example.org/");
        Ok(())
    }
}
