//! EC2 instance provisioner
//!
//! An instance exists when a non-terminated instance carries both the `Name`
//! and `Cluster` tags. A terminated instance never blocks recreation.

use crate::api::{
    Ec2Api, Filter, InstanceInfo, InstanceState, RunInstanceRequest, TAG_CLUSTER, TAG_NAME,
    resource_tags,
};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, Fetchable, HasId, HasName, Resource, ResourceKind, Result, RetryConfig, Reusable,
    require, retry_until,
};
use std::sync::Arc;

/// Launch parameters of one machine
#[derive(Debug, Clone, Default)]
pub struct InstanceConfig {
    pub image_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub security_group_id: String,
    pub instance_profile_name: String,
    pub key_name: Option<String>,
    /// Base64 encoded user data
    pub user_data: String,
}

pub struct Instance {
    pub name: String,
    pub cluster_id: String,
    pub config: InstanceConfig,
    id: String,
    state: Option<InstanceState>,
    retry: RetryConfig,
    client: Arc<dyn Ec2Api>,
}

impl Instance {
    pub fn new(
        client: Arc<dyn Ec2Api>,
        name: impl Into<String>,
        cluster_id: impl Into<String>,
        config: InstanceConfig,
    ) -> Self {
        Self {
            name: name.into(),
            cluster_id: cluster_id.into(),
            config,
            id: String::new(),
            state: None,
            retry: RetryConfig::default(),
            client,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> Option<&InstanceState> {
        self.state.as_ref()
    }

    fn remember(&mut self, info: InstanceInfo) {
        self.id = info.instance_id;
        self.state = Some(info.state);
    }

    async fn find_existing(&self) -> Result<InstanceInfo> {
        let instances = self
            .client
            .describe_instances(&Filter::named(&self.name, &self.cluster_id))
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "describe", e))?;

        instances
            .into_iter()
            .find(|i| !i.state.is_terminated())
            .ok_or_else(|| CloudError::not_found(self.kind(), &self.name))
    }

    fn request(&self) -> Result<RunInstanceRequest> {
        let config = &self.config;
        Ok(RunInstanceRequest {
            image_id: require(&config.image_id, "image id")?.to_string(),
            instance_type: require(&config.instance_type, "instance type")?.to_string(),
            availability_zone: config.availability_zone.clone(),
            security_group_ids: vec![
                require(&config.security_group_id, "security group id")?.to_string(),
            ],
            instance_profile_name: require(&config.instance_profile_name, "instance profile")?
                .to_string(),
            key_name: config.key_name.clone(),
            user_data: config.user_data.clone(),
        })
    }
}

#[async_trait]
impl Resource for Instance {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Instance
    }

    fn label(&self) -> &str {
        &self.name
    }

    /// The launch is retried while the freshly created instance profile is
    /// not yet usable by EC2.
    async fn create_or_fail(&mut self) -> Result<()> {
        let request = self.request()?;
        let client = self.client.clone();
        let info = retry_until(&self.retry, self.kind(), &self.name, "run", || {
            let client = client.clone();
            let request = request.clone();
            async move { client.run_instance(&request).await }
        })
        .await?;
        tracing::info!(instance = %self.name, id = %info.instance_id, "instance reserved");

        let ids = [info.instance_id.clone()];
        self.client
            .create_tags(&ids, &resource_tags(&self.name, &self.cluster_id))
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "tag", e))?;

        self.remember(info);
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        let info = self.find_existing().await?;
        self.client
            .terminate_instances(&[info.instance_id.clone()])
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "terminate", e))?;
        self.id.clear();
        self.state = None;
        Ok(())
    }
}

#[async_trait]
impl Reusable for Instance {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(info) => {
                self.remember(info);
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

impl HasName for Instance {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Fetchable for Instance {
    async fn get(&mut self) -> Result<()> {
        let info = self.find_existing().await?;
        self.remember(info);
        Ok(())
    }
}

impl HasId for Instance {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Terminate every live instance of `cluster_id` whose name starts with
/// `prefix`. Returns the names of the terminated instances.
pub async fn terminate_by_pattern(
    client: &dyn Ec2Api,
    cluster_id: &str,
    prefix: &str,
) -> Result<Vec<String>> {
    let instances = client
        .describe_instances(&[Filter::tag(TAG_CLUSTER, cluster_id)])
        .await
        .map_err(|e| CloudError::api(ResourceKind::Instance, prefix, "describe", e))?;

    let (ids, names): (Vec<String>, Vec<String>) = instances
        .into_iter()
        .filter(|i| !i.state.is_terminated())
        .filter_map(|i| {
            let name = i.tag(TAG_NAME)?.to_string();
            name.starts_with(prefix).then_some((i.instance_id, name))
        })
        .unzip();

    if ids.is_empty() {
        tracing::debug!(cluster = cluster_id, prefix, "no instances to terminate");
        return Ok(names);
    }

    client
        .terminate_instances(&ids)
        .await
        .map_err(|e| CloudError::api(ResourceKind::Instance, prefix, "terminate", e))?;
    tracing::info!(cluster = cluster_id, prefix, count = ids.len(), "instances terminated");
    Ok(names)
}
