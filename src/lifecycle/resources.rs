//! Shared resources owned by a single worker.
//!
//! # Responsibilities
//! - Define the load/flush contract of a process-wide resource
//! - Provide a file-backed key/value cache
//!
//! # Design Decisions
//! - The set is built once at startup and handed to every worker by value;
//!   there is no global lookup
//! - Only the resource owner calls `load_all` and `flush_all`
//! - One failing resource does not stop the others from loading or flushing

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{name}: I/O error: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("{name}: invalid contents: {source}")]
    Format {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A process-wide resource with an explicit owner.
#[async_trait]
pub trait SharedResource: Send + Sync {
    fn name(&self) -> &str;

    /// Called by the owner when it starts.
    async fn load(&self) -> Result<(), ResourceError>;

    /// Called by the owner when it stops or crashes.
    async fn flush(&self) -> Result<(), ResourceError>;
}

/// The resources of one gateway.
#[derive(Clone, Default)]
pub struct SharedResources {
    items: Arc<Vec<Arc<dyn SharedResource>>>,
}

impl SharedResources {
    pub fn new(items: Vec<Arc<dyn SharedResource>>) -> Self {
        Self { items: Arc::new(items) }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Load every resource. Returns how many loaded cleanly.
    pub async fn load_all(&self) -> usize {
        let mut loaded = 0;
        for resource in self.items.iter() {
            match resource.load().await {
                Ok(()) => {
                    tracing::info!(resource = resource.name(), "Shared resource loaded");
                    loaded += 1;
                }
                Err(e) => tracing::error!(error = %e, "Shared resource failed to load"),
            }
        }
        loaded
    }

    /// Flush every resource. Returns how many flushed cleanly.
    pub async fn flush_all(&self) -> usize {
        let mut flushed = 0;
        for resource in self.items.iter() {
            match resource.flush().await {
                Ok(()) => {
                    tracing::info!(resource = resource.name(), "Shared resource flushed");
                    flushed += 1;
                }
                Err(e) => tracing::error!(error = %e, "Shared resource failed to flush"),
            }
        }
        flushed
    }
}

impl std::fmt::Debug for SharedResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|r| r.name()))
            .finish()
    }
}

/// A JSON object on disk, held in memory between load and flush.
///
/// A missing file loads as an empty cache.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    entries: DashMap<String, Value>,
}

impl FileCache {
    const NAME: &'static str = "file-cache";

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            entries: DashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn io_error(&self, source: io::Error) -> ResourceError {
        ResourceError::Io {
            name: format!("{} ({})", Self::NAME, self.path.display()),
            source,
        }
    }
}

#[async_trait]
impl SharedResource for FileCache {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn load(&self) -> Result<(), ResourceError> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.entries.clear();
                return Ok(());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let stored: BTreeMap<String, Value> =
            serde_json::from_slice(&contents).map_err(|source| ResourceError::Format {
                name: Self::NAME.to_string(),
                source,
            })?;

        self.entries.clear();
        for (key, value) in stored {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ResourceError> {
        let snapshot: BTreeMap<String, Value> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let contents = serde_json::to_vec_pretty(&snapshot).map_err(|source| ResourceError::Format {
            name: Self::NAME.to_string(),
            source,
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
        }
        tokio::fs::write(&self.path, contents).await.map_err(|e| self.io_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn flush_then_load_restores_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("cache.json");

        let cache = FileCache::new(&path);
        cache.insert("visits", json!(3));
        cache.insert("owner", json!({"id": 7}));
        cache.flush().await.unwrap();

        let restored = FileCache::new(&path);
        restored.load().await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get("owner"), Some(json!({"id": 7})));
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("absent.json"));
        cache.insert("stale", json!(true));

        cache.load().await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"[1, 2").unwrap();

        let cache = FileCache::new(&path);
        assert!(matches!(cache.load().await, Err(ResourceError::Format { .. })));
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"not json").unwrap();

        let good = Arc::new(FileCache::new(dir.path().join("good.json")));
        let resources = SharedResources::new(vec![
            Arc::new(FileCache::new(&bad)) as Arc<dyn SharedResource>,
            good.clone(),
        ]);

        assert_eq!(resources.load_all().await, 1);
        good.insert("k", json!("v"));
        assert_eq!(resources.flush_all().await, 2);
        assert!(dir.path().join("good.json").exists());
    }
}
