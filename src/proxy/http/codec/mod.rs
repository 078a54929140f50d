//! HTTP/1.x message heads as seen by a forward proxy.
//!
//! Requests are parsed from a byte slice that must already contain the full
//! head; responses are only ever parsed up to the end of their head, the body
//! is relayed untouched.

mod headers;
mod line;
mod request;
mod response;

use thiserror::Error;

pub use headers::{Headers, find_header};
pub use request::{HttpRequest, parse_request, read_request};
pub use response::{HttpResponseHead, ResponseHeadCollector, parse_response_head};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("message head is not terminated by an empty line")]
    Incomplete,
    #[error("malformed start line '{0}'")]
    StartLine(String),
    #[error("malformed header line '{0}'")]
    HeaderLine(String),
    #[error("message head is not valid UTF-8")]
    Encoding,
    #[error("request carries no Host header and no absolute URL")]
    MissingHost,
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
    #[error("message head exceeds configured limit of {0} bytes")]
    TooLarge(usize),
}
