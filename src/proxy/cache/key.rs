const HASH_HEX_WIDTH: usize = 16;

/// Derives the on-disk key for a URL: a fixed-width hash of the
/// `scheme://host` part followed by one of the path part.
///
/// Returns `None` for anything that is not an `http://` or `https://` URL.
pub fn cache_key(url: &str) -> Option<String> {
    let rest_start = if url.starts_with("http://") {
        "http://".len()
    } else if url.starts_with("https://") {
        "https://".len()
    } else {
        return None;
    };
    let host_end = url[rest_start..]
        .find('/')
        .map(|idx| idx + rest_start)
        .unwrap_or(url.len());
    let (host, path) = url.split_at(host_end);
    let path = if path.is_empty() { "/" } else { path };

    let mut key = String::with_capacity(HASH_HEX_WIDTH * 2);
    key.push_str(&short_hash(host));
    key.push_str(&short_hash(path));
    Some(key)
}

/// True when `name` has the shape of a key produced by [`cache_key`].
pub fn is_cache_key(name: &str) -> bool {
    name.len() == HASH_HEX_WIDTH * 2
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn short_hash(part: &str) -> String {
    let hex = blake3::hash(part.as_bytes()).to_hex();
    hex.as_str()[..HASH_HEX_WIDTH].to_string()
}
