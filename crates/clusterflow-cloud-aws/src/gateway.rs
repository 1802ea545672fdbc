//! Internet gateway provisioner

use crate::api::{Ec2Api, Filter, GatewayInfo, resource_tags};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, Fetchable, HasId, HasName, Resource, ResourceKind, Result, Reusable, require,
};
use std::sync::Arc;

pub struct Gateway {
    pub name: String,
    pub cluster_id: String,
    /// Network the gateway is attached to
    pub vpc_id: String,
    id: String,
    client: Arc<dyn Ec2Api>,
}

impl Gateway {
    pub fn new(
        client: Arc<dyn Ec2Api>,
        name: impl Into<String>,
        cluster_id: impl Into<String>,
        vpc_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cluster_id: cluster_id.into(),
            vpc_id: vpc_id.into(),
            id: String::new(),
            client,
        }
    }

    /// Tag lookup. "No gateway with this tag" is the only `NotFound`;
    /// everything else is a provider failure.
    async fn find_existing(&self) -> Result<GatewayInfo> {
        let gateways = self
            .client
            .describe_internet_gateways(&Filter::named(&self.name, &self.cluster_id))
            .await
            .map_err(|e| CloudError::provider(self.kind(), &self.name, "describe", e))?;

        gateways
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::not_found(self.kind(), &self.name))
    }
}

#[async_trait]
impl Resource for Gateway {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Gateway
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let vpc_id = require(&self.vpc_id, "VPC id")?.to_string();

        let gateway = self
            .client
            .create_internet_gateway()
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?;

        self.client
            .attach_internet_gateway(&gateway.gateway_id, &vpc_id)
            .await
            .map_err(|e| CloudError::provider(self.kind(), &self.name, "attach", e))?;

        let ids = [gateway.gateway_id.clone()];
        self.client
            .create_tags(&ids, &resource_tags(&self.name, &self.cluster_id))
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "tag", e))?;

        self.id = gateway.gateway_id;
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        let gateway = self.find_existing().await?;

        for vpc_id in &gateway.attached_vpcs {
            self.client
                .detach_internet_gateway(&gateway.gateway_id, vpc_id)
                .await
                .map_err(|e| CloudError::provider(self.kind(), &self.name, "detach", e))?;
        }

        self.client
            .delete_internet_gateway(&gateway.gateway_id)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))?;
        self.id.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for Gateway {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(gateway) => {
                self.id = gateway.gateway_id;
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

impl HasName for Gateway {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Fetchable for Gateway {
    async fn get(&mut self) -> Result<()> {
        let gateway = self.find_existing().await?;
        self.id = gateway.gateway_id;
        Ok(())
    }
}

impl HasId for Gateway {
    fn id(&self) -> &str {
        &self.id
    }
}
