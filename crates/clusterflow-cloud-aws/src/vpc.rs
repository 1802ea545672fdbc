//! VPC provisioner

use crate::api::{Ec2Api, Filter, VpcAttribute, VpcInfo, resource_tags};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, Fetchable, HasId, HasName, Resource, ResourceKind, Result, RetryConfig, Reusable,
    require, wait_until,
};
use std::sync::Arc;

const STATE_AVAILABLE: &str = "available";

pub struct Vpc {
    pub name: String,
    pub cluster_id: String,
    pub cidr_block: String,
    id: String,
    retry: RetryConfig,
    client: Arc<dyn Ec2Api>,
}

impl Vpc {
    pub fn new(
        client: Arc<dyn Ec2Api>,
        name: impl Into<String>,
        cluster_id: impl Into<String>,
        cidr_block: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cluster_id: cluster_id.into(),
            cidr_block: cidr_block.into(),
            id: String::new(),
            retry: RetryConfig::default(),
            client,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn find_existing(&self) -> Result<VpcInfo> {
        let vpcs = self
            .client
            .describe_vpcs(&Filter::named(&self.name, &self.cluster_id))
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "describe", e))?;

        vpcs.into_iter()
            .next()
            .ok_or_else(|| CloudError::not_found(self.kind(), &self.name))
    }

    async fn wait_available(&self, vpc_id: &str) -> Result<()> {
        let client = self.client.clone();
        let filters = [Filter::new("vpc-id", vpc_id)];
        wait_until(&self.retry, self.kind(), &self.name, "available", || {
            let client = client.clone();
            let filters = filters.clone();
            async move {
                let vpcs = client.describe_vpcs(&filters).await?;
                Ok(vpcs.iter().any(|v| v.state == STATE_AVAILABLE))
            }
        })
        .await
    }
}

#[async_trait]
impl Resource for Vpc {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Network
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let vpc = self
            .client
            .create_vpc(&self.cidr_block)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?;

        if vpc.state != STATE_AVAILABLE {
            self.wait_available(&vpc.vpc_id).await?;
        }

        let ids = [vpc.vpc_id.clone()];
        self.client
            .create_tags(&ids, &resource_tags(&self.name, &self.cluster_id))
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "tag", e))?;

        // Private hosted zones need both
        for attribute in [VpcAttribute::EnableDnsHostnames, VpcAttribute::EnableDnsSupport] {
            self.client
                .modify_vpc_attribute(&vpc.vpc_id, attribute, true)
                .await
                .map_err(|e| CloudError::provider(self.kind(), &self.name, "modify attribute", e))?;
        }

        self.id = vpc.vpc_id;
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        let vpc = self.find_existing().await?;
        self.client
            .delete_vpc(&vpc.vpc_id)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))?;
        self.id.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for Vpc {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(vpc) => {
                self.id = vpc.vpc_id;
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                self.create_or_fail().await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

impl HasName for Vpc {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Fetchable for Vpc {
    async fn get(&mut self) -> Result<()> {
        let vpc = self.find_existing().await?;
        self.id = vpc.vpc_id;
        Ok(())
    }
}

impl HasId for Vpc {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Id of a resolved VPC, or `DependencyUnresolved`
pub fn vpc_id(vpc: &Vpc) -> Result<&str> {
    require(vpc.id(), "VPC id")
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::memory::MemoryCloud;

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_and_enables_dns() {
        let cloud = MemoryCloud::new("eu-west-1");
        let mut vpc = Vpc::new(cloud.ec2(), "c1-vpc", "c1", "10.0.0.0/16");

        assert!(vpc.create_if_not_exists().await.unwrap());
        assert!(vpc.id().starts_with("vpc-"));
        assert_eq!(cloud.count("ModifyVpcAttribute"), 2);
        assert!(cloud.count("DescribeVpcs") >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_reuses() {
        let cloud = MemoryCloud::new("eu-west-1");
        let mut first = Vpc::new(cloud.ec2(), "c1-vpc", "c1", "10.0.0.0/16");
        let mut second = Vpc::new(cloud.ec2(), "c1-vpc", "c1", "10.0.0.0/16");

        assert!(first.create_if_not_exists().await.unwrap());
        assert!(!second.create_if_not_exists().await.unwrap());
        assert_eq!(first.id(), second.id());
        assert_eq!(cloud.count("CreateVpc"), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let cloud = MemoryCloud::new("eu-west-1");
        let mut vpc = Vpc::new(cloud.ec2(), "c1-vpc", "c1", "10.0.0.0/16");
        assert!(vpc.delete().await.unwrap_err().is_not_found());
        assert!(vpc_id(&vpc).is_err());
    }
}
