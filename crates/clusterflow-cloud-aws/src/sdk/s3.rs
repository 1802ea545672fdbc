use super::sdk_error;
use crate::api::{S3Api, api_error};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use clusterflow_cloud::ApiResult;

/// Region that rejects an explicit location constraint
const DEFAULT_REGION: &str = "us-east-1";

pub struct SdkS3 {
    client: aws_sdk_s3::Client,
    region: String,
}

impl SdkS3 {
    pub fn new(config: &aws_config::SdkConfig, region: &str) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(config),
            region: region.to_string(),
        }
    }
}

#[async_trait]
impl S3Api for SdkS3 {
    async fn head_bucket(&self, bucket: &str) -> ApiResult<()> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            // HEAD responses carry no error body, so the code is missing
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Err(
                api_error("NotFound", format!("bucket {} does not exist", bucket)),
            ),
            Err(err) => Err(sdk_error(err)),
        }
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> ApiResult<()> {
        let region = if region.is_empty() { &self.region } else { region };
        let mut request = self.client.create_bucket().bucket(bucket);
        if region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request.send().await.map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> ApiResult<()> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> ApiResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> ApiResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let out = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(sdk_error)?;
            keys.extend(
                out.contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );
            match (out.is_truncated(), out.next_continuation_token()) {
                (Some(true), Some(next)) => token = Some(next.to_string()),
                _ => return Ok(keys),
            }
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> ApiResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}
