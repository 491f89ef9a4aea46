//! In-memory storage backend with fault injection
//!
//! Used by tests and dry runs. Writes under a configured prefix can be
//! made to fail or to stall for a while, which is how shard-write failures
//! and vote timeouts are exercised.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use runtime_core::{Error, Result};
use tracing::debug;

use crate::StorageBackend;

#[derive(Debug, Default)]
struct Faults {
    failing: Vec<String>,
    delayed: Vec<(String, Duration)>,
}

/// In-memory storage backend
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Bytes>>,
    faults: RwLock<Faults>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write whose path starts with `prefix` fail
    pub fn fail_writes_matching(&self, prefix: impl Into<String>) {
        self.faults.write().failing.push(prefix.into());
    }

    /// Delay every write whose path starts with `prefix`
    pub fn delay_writes_matching(&self, prefix: impl Into<String>, delay: Duration) {
        self.faults.write().delayed.push((prefix.into(), delay));
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        *self.faults.write() = Faults::default();
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    async fn apply_faults(&self, path: &str) -> Result<()> {
        let (fail, delay) = {
            let faults = self.faults.read();
            let fail = faults.failing.iter().any(|p| path.starts_with(p.as_str()));
            let delay = faults
                .delayed
                .iter()
                .find(|(p, _)| path.starts_with(p.as_str()))
                .map(|(_, d)| *d);
            (fail, delay)
        };

        if let Some(delay) = delay {
            debug!(path = %path, delay_ms = delay.as_millis() as u64, "Delaying write");
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Error::Storage {
                message: format!("injected write failure for {}", path),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        self.apply_faults(path).await?;
        let size = data.len() as u64;
        self.objects.write().insert(path.to_string(), data);
        Ok(size)
    }

    async fn write_new(&self, path: &str, data: Bytes) -> Result<u64> {
        self.apply_faults(path).await?;
        let size = data.len() as u64;
        let mut objects = self.objects.write();
        if objects.contains_key(path) {
            return Err(Error::StoragePathExists {
                path: path.to_string(),
            });
        }
        objects.insert(path.to_string(), data);
        Ok(size)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_list() {
        tokio_test::block_on(async {
            let storage = MemoryStorage::new();
            storage.write("a/1", Bytes::from("1")).await.unwrap();
            storage.write("a/2", Bytes::from("2")).await.unwrap();
            storage.write("b/1", Bytes::from("3")).await.unwrap();

            assert_eq!(storage.read("a/2").await.unwrap(), Bytes::from("2"));
            assert_eq!(
                storage.list("a/").await.unwrap(),
                vec!["a/1".to_string(), "a/2".to_string()]
            );
            assert_eq!(storage.len(), 3);
        });
    }

    #[test]
    fn test_write_new_once() {
        tokio_test::block_on(async {
            let storage = MemoryStorage::new();
            storage.write_new("m", Bytes::from("x")).await.unwrap();
            assert!(matches!(
                storage.write_new("m", Bytes::from("y")).await,
                Err(Error::StoragePathExists { .. })
            ));
        });
    }

    #[test]
    fn test_injected_failure() {
        tokio_test::block_on(async {
            let storage = MemoryStorage::new();
            storage.fail_writes_matching("ckpt/shards/3");

            assert!(storage.write("ckpt/shards/3-aa", Bytes::new()).await.is_err());
            assert!(storage.write("ckpt/shards/2-bb", Bytes::new()).await.is_ok());
            assert!(!storage.exists("ckpt/shards/3-aa").await.unwrap());

            storage.clear_faults();
            assert!(storage.write("ckpt/shards/3-aa", Bytes::new()).await.is_ok());
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_delay() {
        let storage = MemoryStorage::new();
        storage.delay_writes_matching("slow/", Duration::from_secs(60));

        let started = tokio::time::Instant::now();
        storage.write("slow/x", Bytes::from("x")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(60));
    }
}
