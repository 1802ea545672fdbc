//! S3 bucket and object provisioners

use crate::api::S3Api;
use async_trait::async_trait;
use clusterflow_cloud::{CloudError, HasName, Resource, ResourceKind, Result, Reusable, require};
use std::sync::Arc;

/// Key prefix of the rendered machine configurations
pub const CLOUDCONFIG_PREFIX: &str = "cloudconfig/";

/// Bucket holding a cluster's rendered cloud-configs
pub fn bucket_name(cluster_id: &str) -> String {
    format!("{}-cloudconfig", cluster_id)
}

/// Object key for one machine role, so repeated uploads overwrite
pub fn object_key(role: &str) -> String {
    format!("{}{}", CLOUDCONFIG_PREFIX, role)
}

pub struct Bucket {
    pub name: String,
    pub region: String,
    client: Arc<dyn S3Api>,
}

impl Bucket {
    pub fn new(client: Arc<dyn S3Api>, name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            client,
        }
    }

    async fn exists(&self) -> Result<bool> {
        match self.client.head_bucket(&self.name).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(CloudError::provider(self.kind(), &self.name, "head", e)),
        }
    }

    /// Remove every object under `prefix`, returning the deleted keys
    pub async fn delete_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = self
            .client
            .list_objects(&self.name, prefix)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "list objects", e))?;

        for key in &keys {
            self.client
                .delete_object(&self.name, key)
                .await
                .map_err(|e| CloudError::api(ResourceKind::Object, key, "delete", e))?;
        }
        Ok(keys)
    }
}

#[async_trait]
impl Resource for Bucket {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Bucket
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        self.client
            .create_bucket(&self.name, &self.region)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))
    }

    async fn delete(&mut self) -> Result<()> {
        self.client
            .delete_bucket(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))
    }
}

#[async_trait]
impl Reusable for Bucket {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        if self.exists().await? {
            return Ok(false);
        }
        match self.create_or_fail().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl HasName for Bucket {
    fn name(&self) -> &str {
        &self.name
    }
}

/// One uploaded object. Creation is an overwrite, so it is always reusable.
pub struct Object {
    pub bucket: String,
    pub key: String,
    pub body: Vec<u8>,
    client: Arc<dyn S3Api>,
}

impl Object {
    pub fn new(
        client: Arc<dyn S3Api>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            body,
            client,
        }
    }
}

#[async_trait]
impl Resource for Object {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Object
    }

    fn label(&self) -> &str {
        &self.key
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let bucket = require(&self.bucket, "bucket name")?;
        self.client
            .put_object(bucket, &self.key, self.body.clone())
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.key, "put", e))
    }

    async fn delete(&mut self) -> Result<()> {
        self.client
            .delete_object(&self.bucket, &self.key)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.key, "delete", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(bucket_name("c1"), "c1-cloudconfig");
        assert_eq!(object_key("master"), "cloudconfig/master");
    }
}

#[cfg(all(test, feature = "memory"))]
mod memory_tests {
    use super::*;
    use crate::memory::MemoryCloud;

    #[tokio::test]
    async fn test_bucket_idempotent_and_objects_overwrite() {
        let cloud = MemoryCloud::new("eu-west-1");
        let mut bucket = Bucket::new(cloud.s3(), bucket_name("c1"), "eu-west-1");
        assert!(bucket.create_if_not_exists().await.unwrap());
        assert!(!bucket.create_if_not_exists().await.unwrap());

        for body in [b"v1".to_vec(), b"v2".to_vec()] {
            Object::new(cloud.s3(), "c1-cloudconfig", object_key("master"), body)
                .create_or_fail()
                .await
                .unwrap();
        }
        assert_eq!(
            cloud.object("c1-cloudconfig", "cloudconfig/master"),
            Some(b"v2".to_vec())
        );

        let deleted = bucket.delete_objects(CLOUDCONFIG_PREFIX).await.unwrap();
        assert_eq!(deleted, vec!["cloudconfig/master".to_string()]);
        bucket.delete().await.unwrap();
    }
}
