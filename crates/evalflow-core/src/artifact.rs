//! Blob storage for intermediate pipeline artifacts.
//!
//! Steps hand data to each other only through this store, keyed by the
//! layout in [`crate::keys`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("i/o error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("artifact {key} is not valid JSON: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode artifact {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError>;

    /// Create or overwrite `key`.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ArtifactError>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), ArtifactError>;
}

pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    key: &str,
) -> Result<T, ArtifactError> {
    let bytes = store.get(key).await?;
    serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Decode {
        key: key.to_string(),
        source,
    })
}

pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn ArtifactStore,
    key: &str,
    value: &T,
) -> Result<(), ArtifactError> {
    let bytes = serde_json::to_vec(value).map_err(|source| ArtifactError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.put(key, bytes).await
}

/// In-process store, used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ArtifactError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

/// Store rooted at a local directory; keys map to relative paths.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn io_error(key: &str, source: io::Error) -> ArtifactError {
        ArtifactError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(key.to_string()))
            }
            Err(e) => Err(Self::io_error(key, e)),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| ArtifactError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Self::io_error(key, e))?;

        // Write then rename so readers never observe a half-written object.
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArtifactError::InvalidKey(key.to_string()))?;
        let tmp = parent.join(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Self::io_error(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_part)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io_error(prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_error(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Self::io_error(prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn ArtifactStore) {
        store.put("evaluations/e1/chunks/chunk_0.json", b"[]".to_vec()).await.unwrap();
        store.put("evaluations/e1/chunks/chunk_1.json", b"[1]".to_vec()).await.unwrap();
        store.put("evaluations/e2/chunks/chunk_0.json", b"[2]".to_vec()).await.unwrap();

        assert_eq!(store.get("evaluations/e1/chunks/chunk_1.json").await.unwrap(), b"[1]");
        assert!(matches!(
            store.get("evaluations/e1/chunks/chunk_9.json").await,
            Err(ArtifactError::NotFound(_))
        ));

        let keys = store.list("evaluations/e1/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "evaluations/e1/chunks/chunk_0.json".to_string(),
                "evaluations/e1/chunks/chunk_1.json".to_string(),
            ]
        );
        assert!(store.list("evaluations/e3/").await.unwrap().is_empty());

        store.put("evaluations/e1/chunks/chunk_0.json", b"[0]".to_vec()).await.unwrap();
        assert_eq!(store.get("evaluations/e1/chunks/chunk_0.json").await.unwrap(), b"[0]");

        store.delete("evaluations/e1/chunks/chunk_0.json").await.unwrap();
        store.delete("evaluations/e1/chunks/chunk_0.json").await.unwrap();
        assert_eq!(store.list("evaluations/e1/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryArtifactStore::new()).await;
    }

    #[tokio::test]
    async fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsArtifactStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        assert!(matches!(
            store.put("../outside.json", vec![]).await,
            Err(ArtifactError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("/etc/passwd").await,
            Err(ArtifactError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryArtifactStore::new();
        write_json(&store, "a.json", &vec![1, 2, 3]).await.unwrap();
        let back: Vec<i32> = read_json(&store, "a.json").await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        store.put("bad.json", b"{not json".to_vec()).await.unwrap();
        let err = read_json::<Vec<i32>>(&store, "bad.json").await.unwrap_err();
        assert!(matches!(err, ArtifactError::Decode { .. }));
    }
}
