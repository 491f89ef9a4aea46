//! Local filesystem storage backend
//!
//! Every write lands in a hidden temp file first and is then published
//! with a rename (replace) or a hard link (create-new), so a crashed
//! writer never leaves a partially written object at the final path.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Root directory for all storage operations
    root: PathBuf,
}

impl LocalStorage {
    /// Create a backend rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn temp_sibling(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
    }

    /// Write `data` to a synced temp file next to `target`
    async fn stage(target: &Path, data: &[u8]) -> Result<PathBuf> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Error::Storage {
                message: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let temp = Self::temp_sibling(target);
        let mut file = fs::File::create(&temp).await.map_err(|e| Error::Storage {
            message: format!("Failed to create temp file {:?}: {}", temp, e),
        })?;
        file.write_all(data).await.map_err(|e| Error::Storage {
            message: format!("Failed to write data: {}", e),
        })?;
        file.sync_all().await.map_err(|e| Error::Storage {
            message: format!("Failed to sync file: {}", e),
        })?;
        Ok(temp)
    }

    fn not_found_or(path: &str, e: std::io::Error, action: &str) -> Error {
        if e.kind() == ErrorKind::NotFound {
            Error::StoragePathNotFound {
                path: path.to_string(),
            }
        } else {
            Error::Storage {
                message: format!("Failed to {} {}: {}", action, path, e),
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        fs::read(self.resolve(path))
            .await
            .map(Bytes::from)
            .map_err(|e| Self::not_found_or(path, e, "read"))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let target = self.resolve(path);
        let temp = Self::stage(&target, &data).await?;

        fs::rename(&temp, &target).await.map_err(|e| Error::Storage {
            message: format!("Failed to rename {:?} to {:?}: {}", temp, target, e),
        })?;

        debug!(?target, size = data.len(), "Object written");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write_new(&self, path: &str, data: Bytes) -> Result<u64> {
        let target = self.resolve(path);
        let temp = Self::stage(&target, &data).await?;

        // hard_link refuses to replace an existing file, which gives
        // create-new semantics on top of the atomic temp-file write
        let linked = fs::hard_link(&temp, &target).await;
        let _ = fs::remove_file(&temp).await;

        match linked {
            Ok(()) => {
                debug!(?target, size = data.len(), "Object created");
                Ok(data.len() as u64)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::StoragePathExists {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to publish {:?}: {}", target, e),
            }),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| Self::not_found_or(path, e, "delete"))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve(path)).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Storage {
                        message: format!("Failed to list {:?}: {}", dir, e),
                    })
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let entry_path = entry.path();
                if file_type.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if let Ok(relative) = entry_path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        results.push(key);
                    }
                }
            }
        }

        results.sort();
        Ok(results)
    }
}
