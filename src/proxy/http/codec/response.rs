use super::ParseError;
use super::headers::{Headers, find_header, read_header_block};
use super::line::LineCursor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseHead {
    pub version: String,
    /// Three-digit status code, kept textual as received.
    pub status: String,
    pub message: String,
    pub headers: Headers,
}

impl HttpResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status.parse().ok()
    }
}

/// Parses a status line and header block; any body bytes are ignored.
pub fn parse_response_head(bytes: &[u8]) -> Result<HttpResponseHead, ParseError> {
    let mut cursor = LineCursor::new(bytes);
    let start = cursor.next_line()?;
    let mut parts = start.splitn(3, ' ');
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(ParseError::StartLine(start.to_string()));
    };
    let message = parts.next().unwrap_or_default();
    if version.is_empty() || status.len() != 3 || !status.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::StartLine(start.to_string()));
    }
    let (version, status, message) = (version.to_string(), status.to_string(), message.to_string());

    let headers = read_header_block(&mut cursor)?;
    Ok(HttpResponseHead {
        version,
        status,
        message,
        headers,
    })
}

/// Accumulates the leading bytes of a response stream until its head parses.
///
/// Relayed bytes are never altered; the collector only keeps a private copy
/// of at most `limit` bytes.
#[derive(Debug)]
pub struct ResponseHeadCollector {
    buffer: Vec<u8>,
    limit: usize,
    head: Option<HttpResponseHead>,
    error: Option<ParseError>,
}

impl ResponseHeadCollector {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
            head: None,
            error: None,
        }
    }

    /// Feeds the next chunk. Returns `Ok(true)` once a full head is available.
    /// After the first failure every later call returns the same error.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<bool, ParseError> {
        if self.head.is_some() {
            return Ok(true);
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let room = self.limit.saturating_sub(self.buffer.len());
        self.buffer
            .extend_from_slice(&chunk[..chunk.len().min(room)]);
        let err = match parse_response_head(&self.buffer) {
            Ok(head) => {
                self.head = Some(head);
                self.buffer = Vec::new();
                return Ok(true);
            }
            Err(ParseError::Incomplete) if self.buffer.len() < self.limit => return Ok(false),
            Err(ParseError::Incomplete) => ParseError::TooLarge(self.limit),
            Err(err) => err,
        };
        self.buffer = Vec::new();
        self.error = Some(err.clone());
        Err(err)
    }

    pub fn head(&self) -> Option<&HttpResponseHead> {
        self.head.as_ref()
    }

    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn into_head(self) -> Option<HttpResponseHead> {
        self.head
    }
}
