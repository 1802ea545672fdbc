//! Provider client construction
//!
//! Every event builds its own clients for the cluster's region, so in-flight
//! events never share a provider session.

use crate::error::Result;
#[cfg(not(feature = "sdk"))]
use crate::error::OperatorError;
use async_trait::async_trait;
use clusterflow_cloud_aws::AwsClients;

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn clients(&self, region: &str) -> Result<AwsClients>;
}

/// Clients backed by the AWS SDK
#[derive(Debug, Clone, Default)]
pub struct SdkClientFactory;

#[async_trait]
impl ClientFactory for SdkClientFactory {
    async fn clients(&self, region: &str) -> Result<AwsClients> {
        #[cfg(feature = "sdk")]
        {
            Ok(clusterflow_cloud_aws::sdk::connect(region).await)
        }
        #[cfg(not(feature = "sdk"))]
        {
            tracing::error!(region, "built without the `sdk` feature");
            Err(OperatorError::ProviderUnavailable("sdk"))
        }
    }
}

/// Hands out clients of one shared in-memory cloud, whatever the region
#[cfg(feature = "memory")]
#[derive(Clone)]
pub struct MemoryClientFactory {
    cloud: clusterflow_cloud_aws::memory::MemoryCloud,
}

#[cfg(feature = "memory")]
impl MemoryClientFactory {
    pub fn new(cloud: clusterflow_cloud_aws::memory::MemoryCloud) -> Self {
        Self { cloud }
    }

    pub fn cloud(&self) -> &clusterflow_cloud_aws::memory::MemoryCloud {
        &self.cloud
    }
}

#[cfg(feature = "memory")]
#[async_trait]
impl ClientFactory for MemoryClientFactory {
    async fn clients(&self, region: &str) -> Result<AwsClients> {
        tracing::debug!(region, "using in-memory provider");
        Ok(self.cloud.clients())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "sdk"))]
    #[tokio::test]
    async fn test_sdk_unavailable_without_feature() {
        let err = SdkClientFactory.clients("eu-west-1").await.unwrap_err();
        assert!(matches!(err, OperatorError::ProviderUnavailable("sdk")));
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_memory_clients_share_state() {
        let factory = MemoryClientFactory::new(
            clusterflow_cloud_aws::memory::MemoryCloud::new("eu-west-1"),
        );
        let a = factory.clients("eu-west-1").await.unwrap();
        let _ = a.s3.create_bucket("c1-cloudconfig", "eu-west-1").await;
        assert!(factory.cloud().has_bucket("c1-cloudconfig"));
    }
}
