//! Blob store adapter for function and build sources

use async_trait::async_trait;
use faas_common::{Error, Result};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Key of a function's decoded source
pub fn function_source_key(workspace_id: &str, function_id: &str) -> String {
    format!("{}/{}.py", workspace_id, function_id)
}

/// Prefix holding every build source of a workspace
pub fn build_source_prefix(workspace_id: &str) -> String {
    format!("builds/{}/", workspace_id)
}

/// Key of an uploaded build source
pub fn build_source_key(workspace_id: &str, task_id: &str, filename: &str) -> String {
    format!("{}{}/{}", build_source_prefix(workspace_id), task_id, filename)
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Fails with a not-found error when the blob does not exist
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove every blob under `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Blobs stored as files below a root directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

async fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!("Wrote blob {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path(key)?).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tokio::fs::remove_file(self.path(key)?).await?;
        debug!("Deleted blob {}", key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        collect_files(&self.root, &self.root, &mut keys).await?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// Blobs kept in memory, for tests and the `memory` backend
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keys() {
        assert_eq!(function_source_key("ws-1", "fn-1"), "ws-1/fn-1.py");
        assert_eq!(
            build_source_key("ws-1", "task-1", "main.py"),
            "builds/ws-1/task-1/main.py"
        );
        assert!(!build_source_key("ws-10", "t", "a.py").starts_with(&build_source_prefix("ws-1")));
    }

    #[test]
    fn test_validate_key_rejects_traversal() {
        assert!(validate_key("ws-1/fn-1.py").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("ws-1/../../x").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip_and_prefix_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());

        store.put("ws-1/fn-1.py", b"print(1)".to_vec()).await.unwrap();
        store
            .put("builds/ws-1/t-1/main.py", b"print(2)".to_vec())
            .await
            .unwrap();
        store
            .put("builds/ws-1/t-2/main.py", b"print(3)".to_vec())
            .await
            .unwrap();

        assert_eq!(store.get("ws-1/fn-1.py").await.unwrap(), b"print(1)");
        assert_eq!(
            store.list("builds/ws-1/").await.unwrap(),
            vec!["builds/ws-1/t-1/main.py", "builds/ws-1/t-2/main.py"]
        );

        assert_eq!(store.delete_prefix("builds/").await.unwrap(), 2);
        assert!(store.list("builds/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = FsBlobStore::new(dir.path());
        let memory = InMemoryBlobStore::new();

        assert!(fs.delete("ws-1/missing.py").await.unwrap_err().is_not_found());
        assert!(memory.delete("ws-1/missing.py").await.unwrap_err().is_not_found());
        assert!(memory.get("ws-1/missing.py").await.unwrap_err().is_not_found());
    }
}
