//! SSH key pair provisioner

use crate::api::{Ec2Api, KeyPairInfo};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, Fetchable, HasId, HasName, Resource, ResourceKind, Result, Reusable,
};
use std::sync::Arc;

pub struct KeyPair {
    pub name: String,
    /// OpenSSH public key to import; the provider generates one when absent
    pub public_key: Option<String>,
    id: String,
    fingerprint: String,
    client: Arc<dyn Ec2Api>,
}

impl KeyPair {
    pub fn new(client: Arc<dyn Ec2Api>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_key: None,
            id: String::new(),
            fingerprint: String::new(),
            client,
        }
    }

    pub fn with_public_key(mut self, public_key: Option<String>) -> Self {
        self.public_key = public_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn remember(&mut self, info: KeyPairInfo) {
        self.id = info.key_pair_id;
        self.fingerprint = info.fingerprint;
    }

    async fn find_existing(&self) -> Result<KeyPairInfo> {
        let pairs = self
            .client
            .describe_key_pairs(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "describe", e))?;

        pairs
            .into_iter()
            .find(|p| p.key_name == self.name)
            .ok_or_else(|| CloudError::not_found(self.kind(), &self.name))
    }
}

#[async_trait]
impl Resource for KeyPair {
    fn kind(&self) -> ResourceKind {
        ResourceKind::KeyPair
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let info = match &self.public_key {
            Some(key) => self
                .client
                .import_key_pair(&self.name, key)
                .await
                .map_err(|e| CloudError::api(self.kind(), &self.name, "import", e))?,
            None => self
                .client
                .create_key_pair(&self.name)
                .await
                .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?,
        };
        self.remember(info);
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.find_existing().await?;
        self.client
            .delete_key_pair(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))?;
        self.id.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for KeyPair {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(info) => {
                self.remember(info);
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.create_or_fail().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => {
                self.get().await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl HasName for KeyPair {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Fetchable for KeyPair {
    async fn get(&mut self) -> Result<()> {
        let info = self.find_existing().await?;
        self.remember(info);
        Ok(())
    }
}

impl HasId for KeyPair {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::memory::MemoryCloud;

    #[tokio::test]
    async fn test_import_when_public_key_given() {
        let cloud = MemoryCloud::new("eu-west-1");
        let mut kp = KeyPair::new(cloud.ec2(), "c1-key")
            .with_public_key(Some("ssh-ed25519 AAAAC3Nz test@host".into()));

        assert!(kp.create_if_not_exists().await.unwrap());
        assert_eq!(cloud.count("ImportKeyPair"), 1);
        assert_eq!(cloud.count("CreateKeyPair"), 0);
        assert!(!kp.fingerprint().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_is_reuse() {
        let cloud = MemoryCloud::new("eu-west-1");
        let mut first = KeyPair::new(cloud.ec2(), "c1-key");
        let mut second = KeyPair::new(cloud.ec2(), "c1-key").with_public_key(Some(" ".into()));

        assert!(first.create_if_not_exists().await.unwrap());
        assert!(!second.create_if_not_exists().await.unwrap());
        assert_eq!(first.id(), second.id());
        assert_eq!(cloud.count("CreateKeyPair"), 1);
    }
}
