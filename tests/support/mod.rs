#![allow(dead_code)]

pub mod dirs;
pub mod harness;
pub mod http_utils;
pub mod upstream;

pub use dirs::TestDirs;
pub use harness::{ProxyHarness, ProxyHarnessBuilder};
pub use http_utils::{proxy_get, read_http_response, send_raw, split_response};
pub use upstream::TestOrigin;
