//! Per-cluster namespaces
//!
//! A namespace is the operator-side home of a cluster: a directory under
//! `<work-dir>/namespaces/<cluster>` that mirrors the rendered cloud-configs.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use clusterflow_cloud::{CloudError, ResourceKind};
use std::path::{Path, PathBuf};

#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Create the namespace. Returns `false` when it already existed.
    async fn create(&self, cluster_id: &str) -> Result<bool>;

    /// Delete the namespace and its content; NotFound when absent
    async fn delete(&self, cluster_id: &str) -> Result<()>;

    /// Write `content` to `file_name` inside the namespace
    async fn write_file(&self, cluster_id: &str, file_name: &str, content: &[u8]) -> Result<()>;
}

pub struct DirNamespaceStore {
    root: PathBuf,
}

impl DirNamespaceStore {
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            root: work_dir.as_ref().join("namespaces"),
        }
    }

    pub fn path(&self, cluster_id: &str) -> PathBuf {
        self.root.join(cluster_id)
    }

    fn not_found(cluster_id: &str) -> OperatorError {
        CloudError::not_found(ResourceKind::Namespace, cluster_id).into()
    }
}

#[async_trait]
impl NamespaceStore for DirNamespaceStore {
    async fn create(&self, cluster_id: &str) -> Result<bool> {
        let path = self.path(cluster_id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(true)
    }

    async fn delete(&self, cluster_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.path(cluster_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Self::not_found(cluster_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, cluster_id: &str, file_name: &str, content: &[u8]) -> Result<()> {
        let dir = self.path(cluster_id);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(Self::not_found(cluster_id));
        }
        tokio::fs::write(dir.join(file_name), content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = DirNamespaceStore::new(temp_dir.path());

        assert!(store.create("c1").await.unwrap());
        assert!(!store.create("c1").await.unwrap());

        store.write_file("c1", "master.yaml", b"#cloud-config").await.unwrap();
        let written = std::fs::read(store.path("c1").join("master.yaml")).unwrap();
        assert_eq!(written, b"#cloud-config");

        store.delete("c1").await.unwrap();
        assert!(store.delete("c1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_write_requires_namespace() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = DirNamespaceStore::new(temp_dir.path());
        let err = store.write_file("c1", "x", b"").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
