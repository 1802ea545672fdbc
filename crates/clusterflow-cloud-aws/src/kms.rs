//! KMS key provisioner
//!
//! Key material is never deduplicated: every creation provisions a fresh key
//! and points the cluster alias at it. Deletion removes the alias and
//! schedules destruction of the key, since KMS forbids immediate deletion.

use crate::api::{KeyMetadata, KmsApi};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, HasArn, Resource, ResourceKind, Result, Reusable, require,
};
use std::sync::Arc;

/// Waiting period before scheduled key material is destroyed
pub const PENDING_WINDOW_DAYS: i32 = 7;

pub struct KmsKey {
    /// Alias name without the `alias/` prefix
    pub name: String,
    arn: String,
    key_id: String,
    client: Arc<dyn KmsApi>,
}

impl KmsKey {
    pub fn new(client: Arc<dyn KmsApi>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arn: String::new(),
            key_id: String::new(),
            client,
        }
    }

    pub fn alias(&self) -> String {
        format!("alias/{}", self.name)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn remember(&mut self, metadata: KeyMetadata) {
        self.key_id = metadata.key_id;
        self.arn = metadata.arn;
    }

    /// Look up the key the alias currently points at
    pub async fn resolve(&mut self) -> Result<()> {
        let metadata = self
            .client
            .describe_key(&self.alias())
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "describe", e))?;
        self.remember(metadata);
        Ok(())
    }

    /// Encrypt `plaintext` under this key
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key_id = require(&self.key_id, "KMS key id")?;
        self.client
            .encrypt(key_id, plaintext)
            .await
            .map_err(|e| CloudError::provider(self.kind(), &self.name, "encrypt", e))
    }
}

#[async_trait]
impl Resource for KmsKey {
    fn kind(&self) -> ResourceKind {
        ResourceKind::KmsKey
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let description = format!("Key for cluster {}", self.name);
        let metadata = self
            .client
            .create_key(&description)
            .await
            .map_err(|e| CloudError::provider(self.kind(), &self.name, "create", e))?;

        if let Err(e) = self.client.create_alias(&self.alias(), &metadata.key_id).await {
            // Unaliased keys are unreachable by `delete`, so retire this one now
            match self
                .client
                .schedule_key_deletion(&metadata.key_id, PENDING_WINDOW_DAYS)
                .await
            {
                Ok(()) => tracing::info!(
                    alias = %self.alias(),
                    key_id = %metadata.key_id,
                    days = PENDING_WINDOW_DAYS,
                    "alias not created, key deletion scheduled"
                ),
                Err(schedule) => tracing::error!(
                    key_id = %metadata.key_id,
                    error = %schedule,
                    "failed to schedule deletion of unaliased key"
                ),
            }
            return Err(CloudError::api(self.kind(), self.alias(), "create alias", e));
        }

        self.remember(metadata);
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.resolve().await?;

        self.client
            .delete_alias(&self.alias())
            .await
            .map_err(|e| CloudError::api(self.kind(), self.alias(), "delete alias", e))?;

        self.client
            .schedule_key_deletion(&self.key_id, PENDING_WINDOW_DAYS)
            .await
            .map_err(|e| CloudError::provider(self.kind(), &self.name, "schedule deletion", e))?;

        tracing::info!(
            alias = %self.alias(),
            key_id = %self.key_id,
            days = PENDING_WINDOW_DAYS,
            "key deletion scheduled"
        );
        Ok(())
    }
}

#[async_trait]
impl Reusable for KmsKey {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        Err(CloudError::NotReusable { kind: self.kind() })
    }
}

impl HasArn for KmsKey {
    fn arn(&self) -> &str {
        &self.arn
    }
}
