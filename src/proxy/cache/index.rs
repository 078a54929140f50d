use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Validators captured from the response that populated a cache entry.
/// An empty string means the header was absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct Validators {
    pub last_modified: String,
    pub etag: String,
}

impl Validators {
    pub(super) fn is_empty(&self) -> bool {
        self.last_modified.is_empty() && self.etag.is_empty()
    }
}

/// In-memory copy of the `cache_time_map` file: three lines per record,
/// `key`, `last-modified`, `etag`.
#[derive(Debug, Default)]
pub(super) struct ValidatorIndex {
    entries: BTreeMap<String, Validators>,
    dirty: bool,
}

impl ValidatorIndex {
    pub(super) fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut lines = text.lines();
        while let Some(key) = lines.next() {
            let last_modified = lines.next().unwrap_or_default();
            let etag = lines.next().unwrap_or_default();
            if key.is_empty() {
                continue;
            }
            entries.insert(
                key.to_string(),
                Validators {
                    last_modified: last_modified.to_string(),
                    etag: etag.to_string(),
                },
            );
        }
        Self {
            entries,
            dirty: false,
        }
    }

    pub(super) fn render(&self) -> String {
        let mut out = String::new();
        for (key, validators) in &self.entries {
            out.push_str(key);
            out.push('\n');
            out.push_str(&validators.last_modified);
            out.push('\n');
            out.push_str(&validators.etag);
            out.push('\n');
        }
        out
    }

    pub(super) fn get(&self, key: &str) -> Option<&Validators> {
        self.entries.get(key)
    }

    pub(super) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub(super) fn insert(&mut self, key: String, validators: Validators) {
        self.entries.insert(key, validators);
        self.dirty = true;
    }

    pub(super) fn remove(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.dirty |= removed;
        removed
    }

    /// Drops every record for which `keep` returns false.
    pub(super) fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| keep(key));
        let dropped = before - self.entries.len();
        self.dirty |= dropped > 0;
        dropped
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(super) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(super) fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Writes rendered index text next to `path` and renames it into place.
pub(super) fn write_index_file(path: &Path, text: &str) -> io::Result<()> {
    let temp = path.with_extension("tmp");
    let mut file = fs::File::create(&temp)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp, path)
}
