use super::{missing, sdk_error};
use crate::api::{KeyMetadata, KmsApi};
use async_trait::async_trait;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types;
use clusterflow_cloud::ApiResult;

pub struct SdkKms {
    client: aws_sdk_kms::Client,
}

impl SdkKms {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_kms::Client::new(config),
        }
    }
}

fn to_metadata(metadata: &types::KeyMetadata) -> KeyMetadata {
    KeyMetadata {
        key_id: metadata.key_id().to_string(),
        arn: metadata.arn().unwrap_or_default().to_string(),
        state: metadata
            .key_state()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl KmsApi for SdkKms {
    async fn create_key(&self, description: &str) -> ApiResult<KeyMetadata> {
        let out = self
            .client
            .create_key()
            .description(description)
            .send()
            .await
            .map_err(sdk_error)?;
        out.key_metadata()
            .map(to_metadata)
            .ok_or_else(|| missing("key metadata"))
    }

    async fn create_alias(&self, alias_name: &str, target_key_id: &str) -> ApiResult<()> {
        self.client
            .create_alias()
            .alias_name(alias_name)
            .target_key_id(target_key_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn describe_key(&self, key: &str) -> ApiResult<KeyMetadata> {
        let out = self
            .client
            .describe_key()
            .key_id(key)
            .send()
            .await
            .map_err(sdk_error)?;
        out.key_metadata()
            .map(to_metadata)
            .ok_or_else(|| missing("key metadata"))
    }

    async fn delete_alias(&self, alias_name: &str) -> ApiResult<()> {
        self.client
            .delete_alias()
            .alias_name(alias_name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn schedule_key_deletion(
        &self,
        key_id: &str,
        pending_window_days: i32,
    ) -> ApiResult<()> {
        self.client
            .schedule_key_deletion()
            .key_id(key_id)
            .pending_window_in_days(pending_window_days)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> ApiResult<Vec<u8>> {
        let out = self
            .client
            .encrypt()
            .key_id(key)
            .plaintext(Blob::new(plaintext))
            .send()
            .await
            .map_err(sdk_error)?;
        out.ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| missing("ciphertext"))
    }
}
