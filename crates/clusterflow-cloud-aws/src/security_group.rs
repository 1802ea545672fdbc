//! Security group provisioner

use crate::api::{Ec2Api, Filter, IngressRule, SecurityGroupInfo, resource_tags};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, Fetchable, HasId, HasName, Resource, ResourceKind, Result, RetryConfig, Reusable,
    require, retry_until,
};
use std::sync::Arc;

pub struct SecurityGroup {
    pub name: String,
    pub cluster_id: String,
    pub vpc_id: String,
    pub description: String,
    /// TCP ports opened to the world on creation
    pub ingress_ports: Vec<i32>,
    id: String,
    retry: RetryConfig,
    client: Arc<dyn Ec2Api>,
}

impl SecurityGroup {
    pub fn new(
        client: Arc<dyn Ec2Api>,
        name: impl Into<String>,
        cluster_id: impl Into<String>,
        vpc_id: impl Into<String>,
    ) -> Self {
        let cluster_id = cluster_id.into();
        Self {
            name: name.into(),
            description: format!("Security group for cluster {}", cluster_id),
            cluster_id,
            vpc_id: vpc_id.into(),
            ingress_ports: vec![22, 443],
            id: String::new(),
            retry: RetryConfig::default(),
            client,
        }
    }

    pub fn with_ingress_ports(mut self, ports: impl IntoIterator<Item = i32>) -> Self {
        self.ingress_ports = ports.into_iter().collect();
        self.ingress_ports.dedup();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn find_existing(&self) -> Result<SecurityGroupInfo> {
        let vpc_id = require(&self.vpc_id, "VPC id")?;
        let filters = [
            Filter::new("group-name", &self.name),
            Filter::new("vpc-id", vpc_id),
        ];
        let groups = self
            .client
            .describe_security_groups(&filters)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "describe", e))?;

        groups
            .into_iter()
            .find(|g| g.group_name == self.name)
            .ok_or_else(|| CloudError::not_found(self.kind(), &self.name))
    }
}

#[async_trait]
impl Resource for SecurityGroup {
    fn kind(&self) -> ResourceKind {
        ResourceKind::SecurityGroup
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let vpc_id = require(&self.vpc_id, "VPC id")?.to_string();

        let group_id = self
            .client
            .create_security_group(&self.name, &self.description, &vpc_id)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?;

        let rules: Vec<IngressRule> = self
            .ingress_ports
            .iter()
            .map(|port| IngressRule::anywhere(*port))
            .collect();
        self.client
            .authorize_ingress(&group_id, &rules)
            .await
            .map_err(|e| CloudError::provider(self.kind(), &self.name, "authorize ingress", e))?;

        let ids = [group_id.clone()];
        self.client
            .create_tags(&ids, &resource_tags(&self.name, &self.cluster_id))
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "tag", e))?;

        self.id = group_id;
        Ok(())
    }

    /// Instances that are still shutting down keep the group in use, so
    /// `DependencyViolation` is retried until the deadline.
    async fn delete(&mut self) -> Result<()> {
        let group = self.find_existing().await?;
        let client = self.client.clone();
        retry_until(&self.retry, self.kind(), &self.name, "delete", || {
            let client = client.clone();
            let group_id = group.group_id.clone();
            async move { client.delete_security_group(&group_id).await }
        })
        .await?;
        self.id.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for SecurityGroup {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(group) => {
                self.id = group.group_id;
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.create_or_fail().await {
            Ok(()) => Ok(true),
            // Lost a race with another creator
            Err(e) if e.is_already_exists() => {
                self.get().await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl HasName for SecurityGroup {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Fetchable for SecurityGroup {
    async fn get(&mut self) -> Result<()> {
        let group = self.find_existing().await?;
        self.id = group.group_id;
        Ok(())
    }
}

impl HasId for SecurityGroup {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::memory::MemoryCloud;

    #[tokio::test]
    async fn test_opens_requested_ports() {
        let cloud = MemoryCloud::new("eu-west-1");
        let vpc_id = cloud.seed_vpc("c1-vpc", "c1", "10.0.0.0/16");

        let mut sg = SecurityGroup::new(cloud.ec2(), "c1-sg", "c1", &vpc_id)
            .with_ingress_ports([22, 443, 6443]);
        assert!(sg.create_if_not_exists().await.unwrap());
        assert_eq!(cloud.ingress_ports(sg.id()), vec![22, 443, 6443]);
    }

    #[tokio::test]
    async fn test_duplicate_on_create_is_reuse() {
        let cloud = MemoryCloud::new("eu-west-1");
        let vpc_id = cloud.seed_vpc("c1-vpc", "c1", "10.0.0.0/16");

        let mut first = SecurityGroup::new(cloud.ec2(), "c1-sg", "c1", &vpc_id);
        assert!(first.create_if_not_exists().await.unwrap());

        // The racing creator's lookup missed the group
        cloud.fail_once("DescribeSecurityGroups", "InvalidGroup.NotFound", "not visible yet");
        let mut second = SecurityGroup::new(cloud.ec2(), "c1-sg", "c1", &vpc_id);
        assert!(!second.create_if_not_exists().await.unwrap());
        assert_eq!(first.id(), second.id());
    }
}
