use super::ParseError;

/// Walks CRLF-terminated lines of an immutable byte slice.
pub(super) struct LineCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LineCursor<'a> {
    pub(super) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the next line without its terminator. A line that is not
    /// terminated by `\n` before the buffer ends is an incomplete head.
    pub(super) fn next_line(&mut self) -> Result<&'a str, ParseError> {
        let rest = &self.buf[self.pos..];
        let newline = rest
            .iter()
            .position(|byte| *byte == b'\n')
            .ok_or(ParseError::Incomplete)?;
        self.pos += newline + 1;
        let mut line = &rest[..newline];
        if let Some((b'\r', head)) = line.split_last() {
            line = head;
        }
        std::str::from_utf8(line).map_err(|_| ParseError::Encoding)
    }

    pub(super) fn position(&self) -> usize {
        self.pos
    }

    pub(super) fn remainder(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
