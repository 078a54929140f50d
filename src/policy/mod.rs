//! Destination and client access policy.

mod guard;

pub use guard::AccessGuard;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVerdict {
    Ok,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerVerdict {
    Ok,
    Blocked,
    Redirected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("no redirect configured for {0}")]
    NoRedirect(String),
}
