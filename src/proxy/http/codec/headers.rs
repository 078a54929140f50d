use std::collections::BTreeMap;

use super::ParseError;
use super::line::LineCursor;

/// Header fields keyed by name exactly as received. Field order carries no
/// meaning; a repeated name keeps the last value.
pub type Headers = BTreeMap<String, String>;

/// Case-insensitive header lookup.
pub fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub(super) fn remove_header(headers: &mut Headers, name: &str) -> Option<String> {
    let key = headers
        .keys()
        .find(|key| key.eq_ignore_ascii_case(name))
        .cloned()?;
    headers.remove(&key)
}

/// Consumes header lines up to and including the empty line ending the head.
pub(super) fn read_header_block(cursor: &mut LineCursor<'_>) -> Result<Headers, ParseError> {
    let mut headers = Headers::new();
    loop {
        let line = cursor.next_line()?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = split_header_line(line)?;
        headers.insert(name.to_string(), value.to_string());
    }
}

fn split_header_line(line: &str) -> Result<(&str, &str), ParseError> {
    if let Some(split) = line.split_once(": ") {
        return Ok(split);
    }
    match line.split_once(':') {
        Some((name, value)) if !name.is_empty() => Ok((name, value.trim_start())),
        _ => Err(ParseError::HeaderLine(line.to_string())),
    }
}
