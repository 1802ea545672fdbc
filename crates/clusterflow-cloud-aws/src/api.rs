//! Provider API surface consumed by the provisioners
//!
//! One async trait per AWS service, carrying only the calls the provisioners
//! need. Every call returns an [`ApiError`] whose kind was derived from the
//! provider error code by [`classify_code`], so the provisioners never look at
//! raw codes.

use async_trait::async_trait;
use clusterflow_cloud::{ApiError, ApiErrorKind, ApiResult};
use std::sync::Arc;

/// Tag carrying a resource's idempotency key
pub const TAG_NAME: &str = "Name";
/// Tag carrying the owning cluster id
pub const TAG_CLUSTER: &str = "Cluster";

/// EC2 instance state code for `terminated`
pub const TERMINATED_STATE_CODE: i32 = 48;

/// Map a provider error code to its class.
pub fn classify_code(code: &str) -> ApiErrorKind {
    match code {
        "InvalidGroup.Duplicate"
        | "InvalidKeyPair.Duplicate"
        | "EntityAlreadyExists"
        | "AlreadyExistsException"
        | "BucketAlreadyOwnedByYou"
        | "DuplicateLoadBalancerName"
        | "HostedZoneAlreadyExists" => ApiErrorKind::AlreadyExists,
        "NoSuchEntity"
        | "NotFoundException"
        | "NoSuchBucket"
        | "NoSuchKey"
        | "NotFound"
        | "LoadBalancerNotFound"
        | "NoSuchHostedZone" => ApiErrorKind::NotFound,
        // IAM propagation lag and instances still shutting down
        "InvalidParameterValue" | "DependencyViolation" => ApiErrorKind::NotReady,
        c if c.ends_with(".NotFound") => ApiErrorKind::NotFound,
        _ => ApiErrorKind::Other,
    }
}

/// Build an [`ApiError`] classified from its code
pub fn api_error(code: impl Into<String>, message: impl Into<String>) -> ApiError {
    let code = code.into();
    ApiError::new(classify_code(&code), code, message)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Value of `key` in a tag list
pub fn tag_value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.key == key)
        .map(|t| t.value.as_str())
}

/// `Name` and `Cluster` tags for a resource
pub fn resource_tags(name: &str, cluster_id: &str) -> Vec<Tag> {
    vec![Tag::new(TAG_NAME, name), Tag::new(TAG_CLUSTER, cluster_id)]
}

/// EC2 describe filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }

    /// `tag:<key>` filter
    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("tag:{}", key), value)
    }

    /// Filters matching both the `Name` and `Cluster` tags
    pub fn named(name: &str, cluster_id: &str) -> Vec<Filter> {
        vec![Filter::tag(TAG_NAME, name), Filter::tag(TAG_CLUSTER, cluster_id)]
    }
}

// ============================================================================
// EC2
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcInfo {
    pub vpc_id: String,
    pub cidr_block: String,
    /// `pending` or `available`
    pub state: String,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpcAttribute {
    EnableDnsHostnames,
    EnableDnsSupport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub gateway_id: String,
    pub attached_vpcs: Vec<String>,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupInfo {
    pub group_id: String,
    pub group_name: String,
    pub vpc_id: String,
}

/// TCP ingress rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub port: i32,
    pub cidr: String,
}

impl IngressRule {
    pub fn anywhere(port: i32) -> Self {
        Self {
            port,
            cidr: "0.0.0.0/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairInfo {
    pub key_name: String,
    pub key_pair_id: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub code: i32,
    pub name: String,
}

impl InstanceState {
    pub fn is_terminated(&self) -> bool {
        self.code == TERMINATED_STATE_CODE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub tags: Vec<Tag>,
}

impl InstanceInfo {
    pub fn tag(&self, key: &str) -> Option<&str> {
        tag_value(&self.tags, key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInstanceRequest {
    pub image_id: String,
    pub instance_type: String,
    pub availability_zone: String,
    pub security_group_ids: Vec<String>,
    pub instance_profile_name: String,
    pub key_name: Option<String>,
    /// Base64 encoded user data
    pub user_data: String,
}

#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn describe_vpcs(&self, filters: &[Filter]) -> ApiResult<Vec<VpcInfo>>;
    async fn create_vpc(&self, cidr_block: &str) -> ApiResult<VpcInfo>;
    async fn modify_vpc_attribute(
        &self,
        vpc_id: &str,
        attribute: VpcAttribute,
        value: bool,
    ) -> ApiResult<()>;
    async fn delete_vpc(&self, vpc_id: &str) -> ApiResult<()>;

    async fn describe_internet_gateways(&self, filters: &[Filter]) -> ApiResult<Vec<GatewayInfo>>;
    async fn create_internet_gateway(&self) -> ApiResult<GatewayInfo>;
    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ApiResult<()>;
    async fn detach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ApiResult<()>;
    async fn delete_internet_gateway(&self, gateway_id: &str) -> ApiResult<()>;

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> ApiResult<Vec<SecurityGroupInfo>>;
    /// Returns the new group id
    async fn create_security_group(
        &self,
        group_name: &str,
        description: &str,
        vpc_id: &str,
    ) -> ApiResult<String>;
    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> ApiResult<()>;
    async fn delete_security_group(&self, group_id: &str) -> ApiResult<()>;

    async fn describe_key_pairs(&self, key_name: &str) -> ApiResult<Vec<KeyPairInfo>>;
    async fn create_key_pair(&self, key_name: &str) -> ApiResult<KeyPairInfo>;
    async fn import_key_pair(&self, key_name: &str, public_key: &str) -> ApiResult<KeyPairInfo>;
    async fn delete_key_pair(&self, key_name: &str) -> ApiResult<()>;

    async fn describe_instances(&self, filters: &[Filter]) -> ApiResult<Vec<InstanceInfo>>;
    async fn run_instance(&self, request: &RunInstanceRequest) -> ApiResult<InstanceInfo>;
    async fn terminate_instances(&self, instance_ids: &[String]) -> ApiResult<()>;

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> ApiResult<()>;
}

// ============================================================================
// IAM
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleInfo {
    pub role_name: String,
    pub role_id: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInfo {
    pub policy_name: String,
    pub arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfileInfo {
    pub name: String,
    pub arn: String,
    pub roles: Vec<String>,
}

#[async_trait]
pub trait IamApi: Send + Sync {
    async fn create_role(&self, role_name: &str, assume_role_policy: &str) -> ApiResult<RoleInfo>;
    async fn get_role(&self, role_name: &str) -> ApiResult<RoleInfo>;
    async fn delete_role(&self, role_name: &str) -> ApiResult<()>;

    async fn create_policy(&self, policy_name: &str, document: &str) -> ApiResult<PolicyInfo>;
    /// Customer managed policies
    async fn list_policies(&self) -> ApiResult<Vec<PolicyInfo>>;
    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()>;
    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()>;
    async fn delete_policy(&self, policy_arn: &str) -> ApiResult<()>;

    async fn create_instance_profile(&self, name: &str) -> ApiResult<InstanceProfileInfo>;
    async fn get_instance_profile(&self, name: &str) -> ApiResult<InstanceProfileInfo>;
    async fn add_role_to_instance_profile(&self, profile_name: &str, role_name: &str)
    -> ApiResult<()>;
    async fn remove_role_from_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ApiResult<()>;
    async fn delete_instance_profile(&self, name: &str) -> ApiResult<()>;
}

// ============================================================================
// KMS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMetadata {
    pub key_id: String,
    pub arn: String,
    /// `Enabled`, `PendingDeletion`, ...
    pub state: String,
}

#[async_trait]
pub trait KmsApi: Send + Sync {
    async fn create_key(&self, description: &str) -> ApiResult<KeyMetadata>;
    async fn create_alias(&self, alias_name: &str, target_key_id: &str) -> ApiResult<()>;
    /// Accepts a key id, key arn or `alias/<name>`
    async fn describe_key(&self, key: &str) -> ApiResult<KeyMetadata>;
    async fn delete_alias(&self, alias_name: &str) -> ApiResult<()>;
    async fn schedule_key_deletion(&self, key_id: &str, pending_window_days: i32)
    -> ApiResult<()>;
    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> ApiResult<Vec<u8>>;
}

// ============================================================================
// S3
// ============================================================================

#[async_trait]
pub trait S3Api: Send + Sync {
    async fn head_bucket(&self, bucket: &str) -> ApiResult<()>;
    async fn create_bucket(&self, bucket: &str, region: &str) -> ApiResult<()>;
    async fn delete_bucket(&self, bucket: &str) -> ApiResult<()>;
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> ApiResult<()>;
    /// Keys under `prefix`
    async fn list_objects(&self, bucket: &str, prefix: &str) -> ApiResult<Vec<String>>;
    async fn delete_object(&self, bucket: &str, key: &str) -> ApiResult<()>;
}

// ============================================================================
// ELB
// ============================================================================

/// Load balancer listener mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub protocol: String,
    pub load_balancer_port: i32,
    pub instance_port: i32,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            protocol: "TCP".to_string(),
            load_balancer_port: 443,
            instance_port: 6443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerInfo {
    pub name: String,
    pub dns_name: String,
    pub canonical_hosted_zone_id: String,
    pub instances: Vec<String>,
}

#[async_trait]
pub trait ElbApi: Send + Sync {
    /// Returns the DNS name of the new load balancer
    async fn create_load_balancer(
        &self,
        name: &str,
        listener: &Listener,
        availability_zone: &str,
        security_group_id: &str,
    ) -> ApiResult<String>;
    async fn describe_load_balancer(&self, name: &str) -> ApiResult<LoadBalancerInfo>;
    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> ApiResult<()>;
    async fn delete_load_balancer(&self, name: &str) -> ApiResult<()>;
}

// ============================================================================
// Route53
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedZoneInfo {
    pub id: String,
    /// Fully qualified, with the trailing dot
    pub name: String,
    pub comment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Upsert,
    Delete,
}

/// Alias A record pointing at another AWS endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasRecord {
    pub name: String,
    pub target_dns_name: String,
    pub target_hosted_zone_id: String,
}

#[async_trait]
pub trait Route53Api: Send + Sync {
    /// Zones ordered by name, starting at `dns_name`; may return zones that do not match
    async fn list_hosted_zones_by_name(
        &self,
        dns_name: &str,
        max_items: i32,
    ) -> ApiResult<Vec<HostedZoneInfo>>;
    async fn create_hosted_zone(
        &self,
        name: &str,
        caller_reference: &str,
        comment: &str,
    ) -> ApiResult<HostedZoneInfo>;
    async fn delete_hosted_zone(&self, id: &str) -> ApiResult<()>;
    async fn change_record_set(
        &self,
        hosted_zone_id: &str,
        action: ChangeAction,
        record: &AliasRecord,
    ) -> ApiResult<()>;
}

/// Service clients for one region
#[derive(Clone)]
pub struct AwsClients {
    pub region: String,
    pub ec2: Arc<dyn Ec2Api>,
    pub iam: Arc<dyn IamApi>,
    pub kms: Arc<dyn KmsApi>,
    pub s3: Arc<dyn S3Api>,
    pub elb: Arc<dyn ElbApi>,
    pub route53: Arc<dyn Route53Api>,
}

impl std::fmt::Debug for AwsClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsClients")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_code() {
        assert_eq!(
            classify_code("InvalidGroup.Duplicate"),
            ApiErrorKind::AlreadyExists
        );
        assert_eq!(
            classify_code("EntityAlreadyExists"),
            ApiErrorKind::AlreadyExists
        );
        assert_eq!(classify_code("InvalidVpcID.NotFound"), ApiErrorKind::NotFound);
        assert_eq!(classify_code("NoSuchEntity"), ApiErrorKind::NotFound);
        assert_eq!(
            classify_code("InvalidParameterValue"),
            ApiErrorKind::NotReady
        );
        assert_eq!(classify_code("UnauthorizedOperation"), ApiErrorKind::Other);
    }

    #[test]
    fn test_named_filters() {
        let filters = Filter::named("c1-master-0", "c1");
        assert_eq!(filters[0].name, "tag:Name");
        assert_eq!(filters[0].values, vec!["c1-master-0".to_string()]);
        assert_eq!(filters[1].name, "tag:Cluster");
    }

    #[test]
    fn test_terminated_state() {
        let state = InstanceState {
            code: TERMINATED_STATE_CODE,
            name: "terminated".into(),
        };
        assert!(state.is_terminated());
    }
}
