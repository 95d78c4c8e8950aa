use anyhow::{Result, Context};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::fs;
use sha2::{Digest, Sha256};
use hex;

/// Storage trait for durable node state (peer table, team data, offline queue).
///
/// Values are opaque bytes addressed by a string key. `put` replaces the whole
/// value atomically: a reader sees either the old or the new bytes.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Local filesystem-based storage implementation.
#[derive(Clone)]
pub struct LocalStorage {
    state_dir: PathBuf,
}

impl LocalStorage {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let state_dir = base_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .context("Failed to create state directory")?;

        Ok(Self { state_dir })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        // Keys are arbitrary strings (team ids come from peers), so the file
        // name is the key's SHA-256 with the first 2 chars as subdirectory.
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let id = hex::encode(hasher.finalize());
        self.state_dir.join(&id[..2]).join(&id)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(key);

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let data = fs::read(&path).await
            .with_context(|| format!("Failed to read state object {}", key))?;

        tracing::debug!("Loaded {} ({} bytes)", key, data.len());
        Ok(Some(data))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await
                .context("Failed to create state subdirectory")?;
        }

        // Write-then-rename so a crash never leaves a truncated object
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("{}.tmp", seq));
        fs::write(&tmp, data).await
            .with_context(|| format!("Failed to write state object {}", key))?;
        fs::rename(&tmp, &path).await
            .with_context(|| format!("Failed to commit state object {}", key))?;

        tracing::debug!("Stored {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete state object {}", key)),
        }
    }
}

/// In-memory storage, for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        Ok(objects.get(key).cloned())
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut objects = self.objects.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.lock().map_err(|_| anyhow::anyhow!("storage lock poisoned"))?;
        objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_storage_roundtrip() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = LocalStorage::new(temp.path().to_path_buf())?;

        storage.put("team/alpha", b"{\"items\":[]}").await?;
        assert_eq!(storage.get("team/alpha").await?, Some(b"{\"items\":[]}".to_vec()));

        let missing = storage.get("nonexistent").await?;
        assert_eq!(missing, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_put_replaces_and_survives_reopen() -> Result<()> {
        let temp = TempDir::new()?;
        {
            let storage = LocalStorage::new(temp.path().to_path_buf())?;
            storage.put("peers", b"v1").await?;
            storage.put("peers", b"v2").await?;
        }
        let reopened = LocalStorage::new(temp.path().to_path_buf())?;
        assert_eq!(reopened.get("peers").await?, Some(b"v2".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = LocalStorage::new(temp.path().to_path_buf())?;
        storage.put("offline_queue", b"[]").await?;
        storage.delete("offline_queue").await?;
        storage.delete("offline_queue").await?;
        assert_eq!(storage.get("offline_queue").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_storage() -> Result<()> {
        let storage = MemoryStorage::new();
        storage.put("k", b"v").await?;
        assert_eq!(storage.get("k").await?, Some(b"v".to_vec()));
        storage.delete("k").await?;
        assert_eq!(storage.get("k").await?, None);
        Ok(())
    }
}
