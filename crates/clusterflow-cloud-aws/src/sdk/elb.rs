use super::{build_error, missing, sdk_error};
use crate::api::{ElbApi, Listener, LoadBalancerInfo};
use async_trait::async_trait;
use aws_sdk_elasticloadbalancing::types;
use clusterflow_cloud::ApiResult;

pub struct SdkElb {
    client: aws_sdk_elasticloadbalancing::Client,
}

impl SdkElb {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_elasticloadbalancing::Client::new(config),
        }
    }
}

#[async_trait]
impl ElbApi for SdkElb {
    async fn create_load_balancer(
        &self,
        name: &str,
        listener: &Listener,
        availability_zone: &str,
        security_group_id: &str,
    ) -> ApiResult<String> {
        let listener = types::Listener::builder()
            .protocol(&listener.protocol)
            .load_balancer_port(listener.load_balancer_port)
            .instance_protocol(&listener.protocol)
            .instance_port(listener.instance_port)
            .build()
            .map_err(build_error)?;

        let out = self
            .client
            .create_load_balancer()
            .load_balancer_name(name)
            .listeners(listener)
            .availability_zones(availability_zone)
            .security_groups(security_group_id)
            .send()
            .await
            .map_err(sdk_error)?;
        out.dns_name()
            .map(str::to_string)
            .ok_or_else(|| missing("DNS name"))
    }

    async fn describe_load_balancer(&self, name: &str) -> ApiResult<LoadBalancerInfo> {
        let out = self
            .client
            .describe_load_balancers()
            .load_balancer_names(name)
            .send()
            .await
            .map_err(sdk_error)?;
        let lb = out
            .load_balancer_descriptions()
            .first()
            .ok_or_else(|| missing("load balancer description"))?;
        Ok(LoadBalancerInfo {
            name: lb.load_balancer_name().unwrap_or(name).to_string(),
            dns_name: lb.dns_name().unwrap_or_default().to_string(),
            canonical_hosted_zone_id: lb
                .canonical_hosted_zone_name_id()
                .unwrap_or_default()
                .to_string(),
            instances: lb
                .instances()
                .iter()
                .filter_map(|i| i.instance_id().map(str::to_string))
                .collect(),
        })
    }

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> ApiResult<()> {
        let instances = instance_ids
            .iter()
            .map(|id| types::Instance::builder().instance_id(id).build())
            .collect();
        self.client
            .register_instances_with_load_balancer()
            .load_balancer_name(name)
            .set_instances(Some(instances))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_load_balancer(&self, name: &str) -> ApiResult<()> {
        self.client
            .delete_load_balancer()
            .load_balancer_name(name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}
