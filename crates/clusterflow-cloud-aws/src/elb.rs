//! Classic load balancer provisioner

use crate::api::{ElbApi, Listener, LoadBalancerInfo};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, Fetchable, HasDnsName, HasName, Resource, ResourceKind, Result, Reusable, require,
};
use std::sync::Arc;

pub struct LoadBalancer {
    pub name: String,
    pub availability_zone: String,
    pub security_group_id: String,
    pub listener: Listener,
    dns_name: String,
    hosted_zone_id: String,
    client: Arc<dyn ElbApi>,
}

impl LoadBalancer {
    pub fn new(
        client: Arc<dyn ElbApi>,
        name: impl Into<String>,
        availability_zone: impl Into<String>,
        security_group_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            availability_zone: availability_zone.into(),
            security_group_id: security_group_id.into(),
            listener: Listener::default(),
            dns_name: String::new(),
            hosted_zone_id: String::new(),
            client,
        }
    }

    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.listener = listener;
        self
    }

    fn remember(&mut self, info: LoadBalancerInfo) {
        self.dns_name = info.dns_name;
        self.hosted_zone_id = info.canonical_hosted_zone_id;
    }

    async fn find_existing(&self) -> Result<LoadBalancerInfo> {
        self.client
            .describe_load_balancer(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "describe", e))
    }

    /// Register instances behind the load balancer. Instances are never
    /// registered at creation time.
    pub async fn register_instances(&self, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        self.client
            .register_instances(&self.name, instance_ids)
            .await
            .map_err(|e| CloudError::provider(self.kind(), &self.name, "register instances", e))?;
        tracing::info!(lb = %self.name, count = instance_ids.len(), "instances registered");
        Ok(())
    }
}

#[async_trait]
impl Resource for LoadBalancer {
    fn kind(&self) -> ResourceKind {
        ResourceKind::LoadBalancer
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let security_group_id = require(&self.security_group_id, "security group id")?;
        self.client
            .create_load_balancer(
                &self.name,
                &self.listener,
                &self.availability_zone,
                security_group_id,
            )
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?;

        let info = self.find_existing().await?;
        self.remember(info);
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.find_existing().await?;
        self.client
            .delete_load_balancer(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))?;
        self.dns_name.clear();
        self.hosted_zone_id.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for LoadBalancer {
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
                let info = self.find_existing().await?;
                self.remember(info);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl HasName for LoadBalancer {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Fetchable for LoadBalancer {
    async fn get(&mut self) -> Result<()> {
        let info = self.find_existing().await?;
        self.remember(info);
        Ok(())
    }
}

impl HasDnsName for LoadBalancer {
    fn dns_name(&self) -> &str {
        &self.dns_name
    }

    fn hosted_zone_id(&self) -> &str {
        &self.hosted_zone_id
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::memory::MemoryCloud;

    #[tokio::test]
    async fn test_create_exposes_dns_then_registers() {
        let cloud = MemoryCloud::new("eu-west-1");
        let vpc_id = cloud.seed_vpc("c1-vpc", "c1", "10.0.0.0/16");
        let sg = cloud.seed_security_group("c1-sg", &vpc_id);

        let mut lb = LoadBalancer::new(cloud.elb(), "c1-api", "eu-west-1a", sg);
        assert!(lb.create_if_not_exists().await.unwrap());
        assert!(lb.dns_name().starts_with("c1-api-"));
        assert!(!lb.hosted_zone_id().is_empty());
        assert!(cloud.lb_instances("c1-api").is_empty());

        let mut again = LoadBalancer::new(cloud.elb(), "c1-api", "eu-west-1a", "sg-other");
        assert!(!again.create_if_not_exists().await.unwrap());
        assert_eq!(again.dns_name(), lb.dns_name());

        let mut fetched = LoadBalancer::new(cloud.elb(), "c1-api", "", "");
        fetched.get().await.unwrap();
        assert_eq!(fetched.hosted_zone_id(), lb.hosted_zone_id());
    }

    #[tokio::test]
    async fn test_missing_security_group_is_unresolved() {
        let cloud = MemoryCloud::new("eu-west-1");
        let mut lb = LoadBalancer::new(cloud.elb(), "c1-api", "eu-west-1a", "");
        let err = lb.create_if_not_exists().await.unwrap_err();
        assert_eq!(err.kind(), clusterflow_cloud::ErrorKind::DependencyUnresolved);
    }
}
