//! Durable key-value storage backends

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use concord_core::{ConcordError, ConcordResult};

/// Host key-value store
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value; `None` if the key was never written
    async fn read(&self, key: &str) -> ConcordResult<Option<String>>;

    /// Write a value, replacing any previous one
    async fn write(&self, key: &str, value: &str) -> ConcordResult<()>;
}

/// In-memory storage with write-failure injection
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw stored value
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Seed a raw value
    pub fn put(&self, key: &str, value: impl Into<String>) {
        self.entries.lock().insert(key.to_string(), value.into());
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> ConcordResult<Option<String>> {
        Ok(self.get(key))
    }

    async fn write(&self, key: &str, value: &str) -> ConcordResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ConcordError::Persistence(format!(
                "write to {} rejected",
                key
            )));
        }
        self.put(key, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One JSON file per key under a directory
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStorage { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// One file per key. Bytes outside `[A-Za-z0-9.-]` are written as
    /// `_xx` hex, so distinct keys never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut file = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-' {
                file.push(byte as char);
            } else {
                file.push_str(&format!("_{:02x}", byte));
            }
        }
        self.dir.join(format!("{}.json", file))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, key: &str) -> ConcordResult<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConcordError::Persistence(e.to_string())),
        }
    }

    async fn write(&self, key: &str, value: &str) -> ConcordResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ConcordError::Persistence(e.to_string()))?;
        // Write-then-rename so a crash never leaves a torn record
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| ConcordError::Persistence(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ConcordError::Persistence(e.to_string()))?;
        Ok(())
    }
}
