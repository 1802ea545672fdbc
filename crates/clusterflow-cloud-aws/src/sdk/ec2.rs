use super::{missing, sdk_error};
use crate::api::{
    Ec2Api, Filter, GatewayInfo, IngressRule, InstanceInfo, InstanceState, KeyPairInfo,
    RunInstanceRequest, SecurityGroupInfo, Tag, VpcAttribute, VpcInfo,
};
use async_trait::async_trait;
use aws_sdk_ec2::primitives::Blob;
use aws_sdk_ec2::types;
use clusterflow_cloud::ApiResult;

pub struct SdkEc2 {
    client: aws_sdk_ec2::Client,
}

impl SdkEc2 {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ec2::Client::new(config),
        }
    }
}

fn to_filters(filters: &[Filter]) -> Vec<types::Filter> {
    filters
        .iter()
        .map(|f| {
            types::Filter::builder()
                .name(&f.name)
                .set_values(Some(f.values.clone()))
                .build()
        })
        .collect()
}

fn from_tags(tags: &[types::Tag]) -> Vec<Tag> {
    tags.iter()
        .filter_map(|t| Some(Tag::new(t.key()?, t.value().unwrap_or_default())))
        .collect()
}

fn to_vpc(vpc: &types::Vpc) -> VpcInfo {
    VpcInfo {
        vpc_id: vpc.vpc_id().unwrap_or_default().to_string(),
        cidr_block: vpc.cidr_block().unwrap_or_default().to_string(),
        state: vpc
            .state()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        tags: from_tags(vpc.tags()),
    }
}

fn to_gateway(gateway: &types::InternetGateway) -> GatewayInfo {
    GatewayInfo {
        gateway_id: gateway
            .internet_gateway_id()
            .unwrap_or_default()
            .to_string(),
        attached_vpcs: gateway
            .attachments()
            .iter()
            .filter_map(|a| a.vpc_id().map(str::to_string))
            .collect(),
        tags: from_tags(gateway.tags()),
    }
}

fn to_instance(instance: &types::Instance) -> InstanceInfo {
    let state = instance.state();
    InstanceInfo {
        instance_id: instance.instance_id().unwrap_or_default().to_string(),
        state: InstanceState {
            code: state.and_then(|s| s.code()).unwrap_or_default(),
            name: state
                .and_then(|s| s.name())
                .map(|n| n.as_str().to_string())
                .unwrap_or_default(),
        },
        tags: from_tags(instance.tags()),
    }
}

fn key_pair(name: Option<&str>, id: Option<&str>, fingerprint: Option<&str>) -> KeyPairInfo {
    KeyPairInfo {
        key_name: name.unwrap_or_default().to_string(),
        key_pair_id: id.unwrap_or_default().to_string(),
        fingerprint: fingerprint.unwrap_or_default().to_string(),
    }
}

#[async_trait]
impl Ec2Api for SdkEc2 {
    async fn describe_vpcs(&self, filters: &[Filter]) -> ApiResult<Vec<VpcInfo>> {
        let out = self
            .client
            .describe_vpcs()
            .set_filters(Some(to_filters(filters)))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out.vpcs().iter().map(to_vpc).collect())
    }

    async fn create_vpc(&self, cidr_block: &str) -> ApiResult<VpcInfo> {
        let out = self
            .client
            .create_vpc()
            .cidr_block(cidr_block)
            .send()
            .await
            .map_err(sdk_error)?;
        out.vpc().map(to_vpc).ok_or_else(|| missing("vpc"))
    }

    async fn modify_vpc_attribute(
        &self,
        vpc_id: &str,
        attribute: VpcAttribute,
        value: bool,
    ) -> ApiResult<()> {
        let value = types::AttributeBooleanValue::builder().value(value).build();
        let request = self.client.modify_vpc_attribute().vpc_id(vpc_id);
        let request = match attribute {
            VpcAttribute::EnableDnsHostnames => request.enable_dns_hostnames(value),
            VpcAttribute::EnableDnsSupport => request.enable_dns_support(value),
        };
        request.send().await.map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> ApiResult<()> {
        self.client
            .delete_vpc()
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn describe_internet_gateways(&self, filters: &[Filter]) -> ApiResult<Vec<GatewayInfo>> {
        let out = self
            .client
            .describe_internet_gateways()
            .set_filters(Some(to_filters(filters)))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out.internet_gateways().iter().map(to_gateway).collect())
    }

    async fn create_internet_gateway(&self) -> ApiResult<GatewayInfo> {
        let out = self
            .client
            .create_internet_gateway()
            .send()
            .await
            .map_err(sdk_error)?;
        out.internet_gateway()
            .map(to_gateway)
            .ok_or_else(|| missing("internet gateway"))
    }

    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ApiResult<()> {
        self.client
            .attach_internet_gateway()
            .internet_gateway_id(gateway_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn detach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ApiResult<()> {
        self.client
            .detach_internet_gateway()
            .internet_gateway_id(gateway_id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_internet_gateway(&self, gateway_id: &str) -> ApiResult<()> {
        self.client
            .delete_internet_gateway()
            .internet_gateway_id(gateway_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> ApiResult<Vec<SecurityGroupInfo>> {
        let out = self
            .client
            .describe_security_groups()
            .set_filters(Some(to_filters(filters)))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .security_groups()
            .iter()
            .map(|g| SecurityGroupInfo {
                group_id: g.group_id().unwrap_or_default().to_string(),
                group_name: g.group_name().unwrap_or_default().to_string(),
                vpc_id: g.vpc_id().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn create_security_group(
        &self,
        group_name: &str,
        description: &str,
        vpc_id: &str,
    ) -> ApiResult<String> {
        let out = self
            .client
            .create_security_group()
            .group_name(group_name)
            .description(description)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)?;
        out.group_id()
            .map(str::to_string)
            .ok_or_else(|| missing("group id"))
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> ApiResult<()> {
        let permissions = rules
            .iter()
            .map(|rule| {
                types::IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(rule.port)
                    .to_port(rule.port)
                    .ip_ranges(types::IpRange::builder().cidr_ip(&rule.cidr).build())
                    .build()
            })
            .collect();
        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(permissions))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> ApiResult<()> {
        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn describe_key_pairs(&self, key_name: &str) -> ApiResult<Vec<KeyPairInfo>> {
        let out = self
            .client
            .describe_key_pairs()
            .key_names(key_name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .key_pairs()
            .iter()
            .map(|k| key_pair(k.key_name(), k.key_pair_id(), k.key_fingerprint()))
            .collect())
    }

    async fn create_key_pair(&self, key_name: &str) -> ApiResult<KeyPairInfo> {
        let out = self
            .client
            .create_key_pair()
            .key_name(key_name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(key_pair(out.key_name(), out.key_pair_id(), out.key_fingerprint()))
    }

    async fn import_key_pair(&self, key_name: &str, public_key: &str) -> ApiResult<KeyPairInfo> {
        let out = self
            .client
            .import_key_pair()
            .key_name(key_name)
            .public_key_material(Blob::new(public_key.as_bytes()))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(key_pair(out.key_name(), out.key_pair_id(), out.key_fingerprint()))
    }

    async fn delete_key_pair(&self, key_name: &str) -> ApiResult<()> {
        self.client
            .delete_key_pair()
            .key_name(key_name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn describe_instances(&self, filters: &[Filter]) -> ApiResult<Vec<InstanceInfo>> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let out = self
                .client
                .describe_instances()
                .set_filters(Some(to_filters(filters)))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(sdk_error)?;
            for reservation in out.reservations() {
                instances.extend(reservation.instances().iter().map(to_instance));
            }
            match out.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => return Ok(instances),
            }
        }
    }

    async fn run_instance(&self, request: &RunInstanceRequest) -> ApiResult<InstanceInfo> {
        let mut builder = self
            .client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(types::InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .set_security_group_ids(Some(request.security_group_ids.clone()))
            .iam_instance_profile(
                types::IamInstanceProfileSpecification::builder()
                    .name(&request.instance_profile_name)
                    .build(),
            )
            .set_key_name(request.key_name.clone());
        if !request.availability_zone.is_empty() {
            builder = builder.placement(
                types::Placement::builder()
                    .availability_zone(&request.availability_zone)
                    .build(),
            );
        }
        if !request.user_data.is_empty() {
            builder = builder.user_data(&request.user_data);
        }

        let out = builder.send().await.map_err(sdk_error)?;
        out.instances()
            .first()
            .map(to_instance)
            .ok_or_else(|| missing("instance"))
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> ApiResult<()> {
        self.client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> ApiResult<()> {
        let tags = tags
            .iter()
            .map(|t| types::Tag::builder().key(&t.key).value(&t.value).build())
            .collect();
        self.client
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}
