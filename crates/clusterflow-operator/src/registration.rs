//! Registration of the watched cluster type
//!
//! Runs once at process start, before the event loop. Registering an
//! already registered type is not an error.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fully qualified name of the watched type
pub const CLUSTER_TYPE_NAME: &str = "cluster.clusterflow.io";
pub const CLUSTER_TYPE_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    pub registered_at: String,
}

impl TypeDescriptor {
    pub fn cluster() -> Self {
        Self {
            name: CLUSTER_TYPE_NAME.to_string(),
            version: CLUSTER_TYPE_VERSION.to_string(),
            description: "Managed AWS cluster".to_string(),
            registered_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[async_trait]
pub trait TypeRegistrar: Send + Sync {
    /// Register the cluster type. Returns `false` when it already was.
    async fn register(&self) -> Result<bool>;
}

/// Writes the type descriptor to `<work-dir>/types/<name>.json`
pub struct FileRegistrar {
    path: PathBuf,
}

impl FileRegistrar {
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            path: work_dir
                .as_ref()
                .join("types")
                .join(format!("{}.json", CLUSTER_TYPE_NAME)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TypeRegistrar for FileRegistrar {
    async fn register(&self) -> Result<bool> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let content = serde_json::to_vec_pretty(&TypeDescriptor::cluster())?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;

        match file {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(&content).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(OperatorError::Registration(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// Register the cluster type unless `already_done`.
///
/// Returns whether registration ran.
pub async fn ensure_registered(registrar: &dyn TypeRegistrar, already_done: bool) -> Result<bool> {
    if already_done {
        tracing::debug!("cluster type registration skipped");
        return Ok(false);
    }
    if registrar.register().await? {
        tracing::info!(type_name = CLUSTER_TYPE_NAME, "cluster type registered");
    } else {
        tracing::info!(type_name = CLUSTER_TYPE_NAME, "cluster type already registered");
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRegistrar(AtomicUsize);

    #[async_trait]
    impl TypeRegistrar for CountingRegistrar {
        async fn register(&self) -> Result<bool> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) == 0)
        }
    }

    #[tokio::test]
    async fn test_file_registrar_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let registrar = FileRegistrar::new(temp_dir.path());

        assert!(registrar.register().await.unwrap());
        assert!(!registrar.register().await.unwrap());

        let content = std::fs::read_to_string(registrar.path()).unwrap();
        let descriptor: TypeDescriptor = serde_json::from_str(&content).unwrap();
        assert_eq!(descriptor.name, CLUSTER_TYPE_NAME);
    }

    #[tokio::test]
    async fn test_already_done_flag_skips() {
        let registrar = CountingRegistrar(AtomicUsize::new(0));
        assert!(ensure_registered(&registrar, false).await.unwrap());
        assert!(!ensure_registered(&registrar, true).await.unwrap());
        assert_eq!(registrar.0.load(Ordering::SeqCst), 1);
    }
}
