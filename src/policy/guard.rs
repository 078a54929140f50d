use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use anyhow::{Context, Result};
use parking_lot::RwLock;

use crate::settings::Settings;

use super::{ClientVerdict, PolicyError, ServerVerdict};

/// In-memory access policy shared by every connection.
///
/// Reads vastly outnumber writes; administrative changes take the write lock
/// only for the duration of a single insert or removal.
#[derive(Debug, Default)]
pub struct AccessGuard {
    blocked_clients: RwLock<HashSet<IpAddr>>,
    blocked_servers: RwLock<HashSet<String>>,
    redirects: RwLock<HashMap<String, String>>,
}

impl AccessGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let guard = Self::new();
        for ip in &settings.blocked_clients {
            let addr: IpAddr = ip
                .trim()
                .parse()
                .with_context(|| format!("invalid blocked client address '{ip}'"))?;
            guard.add_client(addr);
        }
        for url in &settings.blocked_servers {
            guard.add_server(url);
        }
        for rule in &settings.redirects {
            guard.add_redirect(&rule.from, &rule.to);
        }
        Ok(guard)
    }

    pub fn add_client(&self, ip: IpAddr) -> bool {
        self.blocked_clients.write().insert(normalize_ip(ip))
    }

    pub fn remove_client(&self, ip: IpAddr) -> bool {
        self.blocked_clients.write().remove(&normalize_ip(ip))
    }

    pub fn add_server(&self, url: &str) -> bool {
        self.blocked_servers.write().insert(url.to_string())
    }

    pub fn remove_server(&self, url: &str) -> bool {
        self.blocked_servers.write().remove(url)
    }

    /// Maps `url` to `target`, replacing any previous target.
    pub fn add_redirect(&self, url: &str, target: &str) -> Option<String> {
        self.redirects
            .write()
            .insert(url.to_string(), target.to_string())
    }

    pub fn remove_redirect(&self, url: &str) -> Option<String> {
        self.redirects.write().remove(url)
    }

    pub fn check_client(&self, ip: IpAddr) -> ClientVerdict {
        if self.blocked_clients.read().contains(&normalize_ip(ip)) {
            ClientVerdict::Blocked
        } else {
            ClientVerdict::Ok
        }
    }

    /// Blocking wins over redirection when a URL appears in both.
    pub fn check_server(&self, url: &str) -> ServerVerdict {
        if self.blocked_servers.read().contains(url) {
            return ServerVerdict::Blocked;
        }
        if self.redirects.read().contains_key(url) {
            return ServerVerdict::Redirected;
        }
        ServerVerdict::Ok
    }

    pub fn get_redirect_url(&self, url: &str) -> Result<String, PolicyError> {
        self.redirects
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| PolicyError::NoRedirect(url.to_string()))
    }

    pub fn blocked_client_count(&self) -> usize {
        self.blocked_clients.read().len()
    }

    pub fn blocked_server_count(&self) -> usize {
        self.blocked_servers.read().len()
    }

    pub fn redirect_count(&self) -> usize {
        self.redirects.read().len()
    }
}

fn normalize_ip(addr: IpAddr) -> IpAddr {
    if let IpAddr::V6(v6) = addr
        && let Some(mapped) = v6.to_ipv4_mapped()
    {
        return IpAddr::V4(mapped);
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RedirectRule;

    #[test]
    fn blocked_wins_over_redirect() {
        let guard = AccessGuard::new();
        guard.add_server("http://a.example/");
        guard.add_redirect("http://a.example/", "http://b.example/");
        assert_eq!(guard.check_server("http://a.example/"), ServerVerdict::Blocked);
        guard.remove_server("http://a.example/");
        assert_eq!(
            guard.check_server("http://a.example/"),
            ServerVerdict::Redirected
        );
        assert_eq!(
            guard.get_redirect_url("http://a.example/").unwrap(),
            "http://b.example/"
        );
    }

    #[test]
    fn missing_redirect_is_an_error() {
        let guard = AccessGuard::new();
        assert_eq!(guard.check_server("http://a.example/"), ServerVerdict::Ok);
        assert_eq!(
            guard.get_redirect_url("http://a.example/"),
            Err(PolicyError::NoRedirect("http://a.example/".to_string()))
        );
    }

    #[test]
    fn client_checks_normalize_mapped_addresses() {
        let guard = AccessGuard::new();
        guard.add_client("10.0.0.7".parse().unwrap());
        assert_eq!(
            guard.check_client("::ffff:10.0.0.7".parse().unwrap()),
            ClientVerdict::Blocked
        );
        assert_eq!(
            guard.check_client("10.0.0.8".parse().unwrap()),
            ClientVerdict::Ok
        );
        assert!(guard.remove_client("10.0.0.7".parse().unwrap()));
        assert_eq!(
            guard.check_client("10.0.0.7".parse().unwrap()),
            ClientVerdict::Ok
        );
    }

    #[test]
    fn builds_from_settings() {
        let settings = Settings {
            blocked_clients: vec!["192.0.2.1".to_string()],
            blocked_servers: vec!["http://jwts.example.edu/".to_string()],
            redirects: vec![RedirectRule {
                from: "http://www.example.com/".to_string(),
                to: "http://today.example.org/".to_string(),
            }],
            ..Settings::default()
        };
        let guard = AccessGuard::from_settings(&settings).unwrap();
        assert_eq!(guard.blocked_client_count(), 1);
        assert_eq!(guard.blocked_server_count(), 1);
        assert_eq!(guard.redirect_count(), 1);
        assert_eq!(
            guard.check_server("http://www.example.com/"),
            ServerVerdict::Redirected
        );
    }

    #[test]
    fn rejects_unparseable_client_address() {
        let settings = Settings {
            blocked_clients: vec!["not-an-ip".to_string()],
            ..Settings::default()
        };
        let err = AccessGuard::from_settings(&settings).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }
}
