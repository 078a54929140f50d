use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

pub struct TestDirs {
    _temp: TempDir,
    pub cache_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("cache");
        Ok(Self {
            _temp: temp,
            cache_dir,
        })
    }

    pub fn cache_file(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    pub fn index_path(&self) -> PathBuf {
        self.cache_file("cache_time_map")
    }

    /// Names of the body files currently in the cache directory.
    pub fn body_files(&self) -> Result<Vec<String>> {
        list_body_files(&self.cache_dir)
    }
}

fn list_body_files(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if !name.starts_with("cache_time_map") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
