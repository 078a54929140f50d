//! Persistent per-URL response cache.
//!
//! Each entry is one body file named by its key inside the cache directory.
//! Validators for finalized entries live in the `cache_time_map` index; an
//! entry without an index row is unfinished and treated as absent.

mod index;
mod key;

use std::collections::HashMap;
use std::fs;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task;
use tracing::{debug, info, warn};

use crate::proxy::http::codec::{Headers, find_header};

use index::{ValidatorIndex, Validators, write_index_file};
pub use key::{cache_key, is_cache_key};

pub const INDEX_FILE_NAME: &str = "cache_time_map";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache entry for {0}")]
    NotFound(String),
    #[error("'{0}' is not an http:// or https:// URL")]
    InvalidUrl(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl CacheError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        CacheError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Disk-backed cache keyed by URL.
///
/// The index lock only guards in-memory updates. Body files go through
/// `tokio::fs`, and index rewrites run one at a time on the blocking pool.
/// Concurrent fetches of the same URL are kept apart through
/// [`CacheStore::lock_url`].
#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    index: Mutex<ValidatorIndex>,
    index_writer: AsyncMutex<()>,
    fetch_locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl CacheStore {
    /// Opens (creating if needed) the cache directory and drops index rows
    /// whose body file is gone.
    ///
    /// Files without an index row are left in place: bodies from an
    /// unfinished fetch read as absent and get overwritten by the next
    /// fetch of their URL, and anything else in the directory is not ours.
    pub fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            CacheError::io(format!("failed to create cache dir {}", dir.display()), err)
        })?;

        let index_path = dir.join(INDEX_FILE_NAME);
        let mut index = match fs::read_to_string(&index_path) {
            Ok(text) => ValidatorIndex::parse(&text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => ValidatorIndex::default(),
            Err(err) => {
                return Err(CacheError::io(
                    format!("failed to read {}", index_path.display()),
                    err,
                ));
            }
        };

        let missing = index.retain(|key| dir.join(key).is_file());
        let unindexed = count_unindexed_bodies(&dir, &index)?;

        let store = Self {
            dir,
            index: Mutex::new(index),
            index_writer: AsyncMutex::new(()),
            fetch_locks: Mutex::new(HashMap::new()),
        };
        store.persist_blocking()?;
        info!(
            dir = %store.dir.display(),
            entries = store.len(),
            dropped_rows = missing,
            unindexed_bodies = unindexed,
            "cache opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the URL has a finalized entry whose body file is present.
    pub async fn has(&self, url: &str) -> bool {
        let Some(key) = cache_key(url) else {
            return false;
        };
        let indexed = self.index.lock().contains(&key);
        indexed && is_file(&self.body_path(&key)).await
    }

    /// Starts a fresh, empty entry for the URL. Any previous validators are
    /// dropped, so the entry reads as absent until it is finalized.
    pub async fn create(&self, url: &str) -> CacheResult<()> {
        let key = require_key(url)?;
        let dropped_row = self.index.lock().remove(&key);
        if dropped_row {
            self.save_index().await?;
        }
        let path = self.body_path(&key);
        if let Err(err) = async_fs::File::create(&path).await {
            let _ = async_fs::remove_file(&path).await;
            return Err(CacheError::io(
                format!("failed to create cache body {}", path.display()),
                err,
            ));
        }
        debug!(key = %key, "cache entry created");
        Ok(())
    }

    /// Appends relayed bytes to an entry started by [`CacheStore::create`].
    pub async fn append(&self, url: &str, bytes: &[u8]) -> CacheResult<()> {
        let key = require_key(url)?;
        let path = self.body_path(&key);
        let written = async {
            let mut file = async_fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = written {
            let _ = async_fs::remove_file(&path).await;
            return Err(CacheError::io(
                format!("failed to append to cache body {}", path.display()),
                err,
            ));
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes of the body starting at `offset`.
    /// Zero means the end of the stored body was reached.
    pub async fn read(&self, url: &str, offset: u64, buf: &mut [u8]) -> CacheResult<usize> {
        let key = require_key(url)?;
        let path = self.body_path(&key);
        let mut file = async_fs::File::open(&path).await.map_err(|err| {
            CacheError::io(format!("failed to open cache body {}", path.display()), err)
        })?;
        let read = async {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read(buf).await
        }
        .await;
        read.map_err(|err| {
            CacheError::io(format!("failed to read cache body {}", path.display()), err)
        })
    }

    /// Deletes the body file and the index row. Returns whether anything was
    /// removed.
    pub async fn remove(&self, url: &str) -> CacheResult<bool> {
        let key = require_key(url)?;
        self.remove_key(&key).await
    }

    /// Finalizes an entry from the headers of the response that filled it.
    ///
    /// Keeps the entry and returns `true` when `Last-Modified` or `ETag` is
    /// present; otherwise the entry is deleted and `false` is returned.
    pub async fn update_validators_from_headers(
        &self,
        url: &str,
        headers: &Headers,
    ) -> CacheResult<bool> {
        let key = require_key(url)?;
        let validators = Validators {
            last_modified: find_header(headers, "Last-Modified")
                .unwrap_or_default()
                .to_string(),
            etag: find_header(headers, "ETag").unwrap_or_default().to_string(),
        };

        if validators.is_empty() {
            self.remove_key(&key).await?;
            return Ok(false);
        }
        if !is_file(&self.body_path(&key)).await {
            return Err(CacheError::NotFound(url.to_string()));
        }
        self.index.lock().insert(key, validators);
        self.save_index().await?;
        Ok(true)
    }

    pub fn modified_time(&self, url: &str) -> CacheResult<String> {
        self.validators(url).map(|v| v.last_modified)
    }

    pub fn etag(&self, url: &str) -> CacheResult<String> {
        self.validators(url).map(|v| v.etag)
    }

    /// Writes the index file if it has unsaved changes.
    pub async fn persist(&self) -> CacheResult<()> {
        self.save_index().await
    }

    /// Waits for exclusive use of the URL's entry. Two fetches holding guards
    /// for the same URL never interleave body writes.
    pub async fn lock_url(&self, url: &str) -> CacheResult<OwnedMutexGuard<()>> {
        let key = require_key(url)?;
        let lock = {
            let mut locks = self.fetch_locks.lock();
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(&key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(key, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        Ok(lock.lock_owned().await)
    }

    fn validators(&self, url: &str) -> CacheResult<Validators> {
        let key = require_key(url)?;
        self.index
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(url.to_string()))
    }

    fn body_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE_NAME)
    }

    async fn remove_key(&self, key: &str) -> CacheResult<bool> {
        let path = self.body_path(key);
        let removed_file = match async_fs::remove_file(&path).await {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => {
                return Err(CacheError::io(
                    format!("failed to remove cache body {}", path.display()),
                    err,
                ));
            }
        };
        let removed_row = self.index.lock().remove(key);
        if removed_row {
            self.save_index().await?;
        }
        debug!(key, "cache entry removed");
        Ok(removed_file || removed_row)
    }

    /// Rewrites the index file on the blocking pool. Writers queue on
    /// `index_writer` and each takes its snapshot once it holds it, so the
    /// file never goes back to an older state.
    async fn save_index(&self) -> CacheResult<()> {
        let _writer = self.index_writer.lock().await;
        let text = {
            let mut index = self.index.lock();
            if !index.is_dirty() {
                return Ok(());
            }
            index.mark_clean();
            index.render()
        };
        let path = self.index_path();
        let written = task::spawn_blocking({
            let path = path.clone();
            move || write_index_file(&path, &text)
        })
        .await
        .map_err(|err| {
            CacheError::io(
                format!("index writer for {} failed", path.display()),
                io::Error::other(err),
            )
        })
        .and_then(|result| {
            result.map_err(|err| CacheError::io(format!("failed to save {}", path.display()), err))
        });
        if written.is_err() {
            self.index.lock().mark_dirty();
        }
        written
    }

    fn persist_blocking(&self) -> CacheResult<()> {
        let mut index = self.index.lock();
        if index.is_dirty() {
            let path = self.index_path();
            write_index_file(&path, &index.render())
                .map_err(|err| CacheError::io(format!("failed to save {}", path.display()), err))?;
            index.mark_clean();
        }
        Ok(())
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if let Err(err) = self.persist_blocking() {
            warn!(error = %err, "failed to save cache index on shutdown");
        }
    }
}

fn require_key(url: &str) -> CacheResult<String> {
    cache_key(url).ok_or_else(|| CacheError::InvalidUrl(url.to_string()))
}

async fn is_file(path: &Path) -> bool {
    async_fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Counts key-named files that have no index row. Nothing is deleted.
fn count_unindexed_bodies(dir: &Path, index: &ValidatorIndex) -> CacheResult<usize> {
    let entries = fs::read_dir(dir).map_err(|err| {
        CacheError::io(format!("failed to list cache dir {}", dir.display()), err)
    })?;
    let count = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_cache_key(name) && !index.contains(name))
        .count();
    Ok(count)
}
