//! In-memory provider
//!
//! Implements every provider API trait against process-local state with the
//! same error codes AWS answers with, so provisioners and the reconciler can
//! be exercised without an account. Every call is recorded by operation name
//! (`CreateVpc`, `RunInstances`, ...) and failures can be injected per
//! operation.

use crate::api::*;
use async_trait::async_trait;
use clusterflow_cloud::{ApiError, ApiResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

const ACCOUNT_ID: &str = "000000000000";
/// Canonical hosted zone id of classic load balancers in the memory region
pub const ELB_HOSTED_ZONE_ID: &str = "Z32O12XQLNTSW2";

const RUNNING: (i32, &str) = (16, "running");

struct MemInstance {
    info: InstanceInfo,
    security_group_ids: Vec<String>,
}

struct MemProfile {
    info: InstanceProfileInfo,
    /// Launch attempts that still fail before the profile is usable
    pending_attempts: u32,
}

struct MemKey {
    metadata: KeyMetadata,
    pending_window: Option<i32>,
}

struct MemZone {
    info: HostedZoneInfo,
    records: BTreeMap<String, AliasRecord>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    calls: Vec<String>,
    fail_once: HashMap<String, VecDeque<ApiError>>,
    fail_always: HashMap<String, ApiError>,

    tags: HashMap<String, Vec<Tag>>,
    vpcs: BTreeMap<String, VpcInfo>,
    gateways: BTreeMap<String, GatewayInfo>,
    groups: BTreeMap<String, SecurityGroupInfo>,
    ingress: HashMap<String, Vec<IngressRule>>,
    key_pairs: BTreeMap<String, KeyPairInfo>,
    instances: BTreeMap<String, MemInstance>,

    roles: BTreeMap<String, RoleInfo>,
    policies: BTreeMap<String, PolicyInfo>,
    attachments: BTreeSet<(String, String)>,
    profiles: BTreeMap<String, MemProfile>,
    propagation_attempts: u32,

    keys: BTreeMap<String, MemKey>,
    aliases: BTreeMap<String, String>,

    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    load_balancers: BTreeMap<String, LoadBalancerInfo>,
    zones: BTreeMap<String, MemZone>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ec2_id(&mut self, prefix: &str) -> String {
        format!("{}-{:017x}", prefix, self.next_id())
    }

    fn tags_of(&self, id: &str) -> Vec<Tag> {
        self.tags.get(id).cloned().unwrap_or_default()
    }

    fn resolve_key(&self, key: &str) -> Option<String> {
        let id = self.aliases.get(key).cloned().unwrap_or_else(|| key.to_string());
        self.keys
            .iter()
            .find(|(key_id, k)| **key_id == id || k.metadata.arn == id)
            .map(|(key_id, _)| key_id.clone())
    }

    fn live_instance(&self, id: &str) -> bool {
        self.instances
            .get(id)
            .is_some_and(|i| !i.info.state.is_terminated())
    }
}

/// `true` when every filter matches either an attribute or a tag
fn matches(filters: &[Filter], attrs: &[(&str, &str)], tags: &[Tag]) -> bool {
    filters.iter().all(|filter| {
        let values = &filter.values;
        match filter.name.strip_prefix("tag:") {
            Some(key) => tag_value(tags, key).is_some_and(|v| values.iter().any(|x| x == v)),
            None => attrs
                .iter()
                .filter(|(name, _)| *name == filter.name)
                .any(|(_, v)| values.iter().any(|x| x == v)),
        }
    })
}

fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

/// Shared in-memory cloud. Clones share state.
#[derive(Clone)]
pub struct MemoryCloud {
    region: String,
    state: Arc<Mutex<State>>,
}

impl MemoryCloud {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn clients(&self) -> AwsClients {
        AwsClients {
            region: self.region.clone(),
            ec2: self.ec2(),
            iam: self.iam(),
            kms: self.kms(),
            s3: self.s3(),
            elb: self.elb(),
            route53: self.route53(),
        }
    }

    pub fn ec2(&self) -> Arc<dyn Ec2Api> {
        Arc::new(self.clone())
    }

    pub fn iam(&self) -> Arc<dyn IamApi> {
        Arc::new(self.clone())
    }

    pub fn kms(&self) -> Arc<dyn KmsApi> {
        Arc::new(self.clone())
    }

    pub fn s3(&self) -> Arc<dyn S3Api> {
        Arc::new(self.clone())
    }

    pub fn elb(&self) -> Arc<dyn ElbApi> {
        Arc::new(self.clone())
    }

    pub fn route53(&self) -> Arc<dyn Route53Api> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and apply injected failures
    fn enter(&self, operation: &str) -> ApiResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if let Some(err) = state
            .fail_once
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        if let Some(err) = state.fail_always.get(operation) {
            return Err(err.clone());
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Test controls
    // ------------------------------------------------------------------

    /// Every recorded operation, in call order
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == operation).count()
    }

    /// Fail the next call of `operation`
    pub fn fail_once(&self, operation: &str, code: &str, message: &str) {
        self.lock()
            .fail_once
            .entry(operation.to_string())
            .or_default()
            .push_back(api_error(code, message));
    }

    /// Fail every call of `operation` until [`clear_failures`](Self::clear_failures)
    pub fn fail_always(&self, operation: &str, code: &str, message: &str) {
        self.lock()
            .fail_always
            .insert(operation.to_string(), api_error(code, message));
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_once.clear();
        state.fail_always.clear();
    }

    /// Launch attempts rejected after a role was added to a profile
    pub fn set_profile_propagation_attempts(&self, attempts: u32) {
        self.lock().propagation_attempts = attempts;
    }

    /// Restart the propagation window of an existing profile
    pub fn touch_instance_profile(&self, name: &str) {
        let mut state = self.lock();
        let attempts = state.propagation_attempts;
        if let Some(profile) = state.profiles.get_mut(name) {
            profile.pending_attempts = attempts;
        }
    }

    /// Available, tagged VPC. Returns its id.
    pub fn seed_vpc(&self, name: &str, cluster_id: &str, cidr_block: &str) -> String {
        let mut state = self.lock();
        let id = state.ec2_id("vpc");
        state.vpcs.insert(
            id.clone(),
            VpcInfo {
                vpc_id: id.clone(),
                cidr_block: cidr_block.to_string(),
                state: "available".into(),
                tags: Vec::new(),
            },
        );
        state.tags.insert(id.clone(), resource_tags(name, cluster_id));
        id
    }

    /// Security group in `vpc_id`. Returns its id.
    pub fn seed_security_group(&self, name: &str, vpc_id: &str) -> String {
        let mut state = self.lock();
        let id = state.ec2_id("sg");
        state.groups.insert(
            id.clone(),
            SecurityGroupInfo {
                group_id: id.clone(),
                group_name: name.to_string(),
                vpc_id: vpc_id.to_string(),
            },
        );
        id
    }

    /// Usable instance profile without a role. Returns its name.
    pub fn seed_instance_profile(&self, name: &str) -> String {
        let mut state = self.lock();
        state.profiles.insert(
            name.to_string(),
            MemProfile {
                info: InstanceProfileInfo {
                    name: name.to_string(),
                    arn: format!("arn:aws:iam::{}:instance-profile/{}", ACCOUNT_ID, name),
                    roles: Vec::new(),
                },
                pending_attempts: 0,
            },
        );
        name.to_string()
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Ports opened on a security group
    pub fn ingress_ports(&self, group_id: &str) -> Vec<i32> {
        self.lock()
            .ingress
            .get(group_id)
            .map(|rules| rules.iter().map(|r| r.port).collect())
            .unwrap_or_default()
    }

    /// Non-terminated instances tagged with `cluster_id`
    pub fn live_instances(&self, cluster_id: &str) -> Vec<InstanceInfo> {
        let state = self.lock();
        state
            .instances
            .values()
            .filter(|i| !i.info.state.is_terminated())
            .map(|i| InstanceInfo {
                tags: state.tags_of(&i.info.instance_id),
                ..i.info.clone()
            })
            .filter(|i| i.tag(TAG_CLUSTER) == Some(cluster_id))
            .collect()
    }

    /// VPCs carrying the `Cluster` tag
    pub fn vpc_count(&self, cluster_id: &str) -> usize {
        let state = self.lock();
        state
            .vpcs
            .keys()
            .filter(|id| tag_value(&state.tags_of(id), TAG_CLUSTER) == Some(cluster_id))
            .count()
    }

    pub fn has_gateway_for(&self, vpc_id: &str) -> bool {
        self.lock()
            .gateways
            .values()
            .any(|g| g.attached_vpcs.iter().any(|v| v == vpc_id))
    }

    pub fn has_security_group(&self, name: &str) -> bool {
        self.lock().groups.values().any(|g| g.group_name == name)
    }

    pub fn has_key_pair(&self, name: &str) -> bool {
        self.lock().key_pairs.contains_key(name)
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.lock().roles.contains_key(name)
    }

    pub fn has_policy(&self, name: &str) -> bool {
        self.lock().policies.values().any(|p| p.policy_name == name)
    }

    pub fn has_instance_profile(&self, name: &str) -> bool {
        self.lock().profiles.contains_key(name)
    }

    /// Key id behind an `alias/<name>`
    pub fn alias_target(&self, alias: &str) -> Option<String> {
        self.lock().aliases.get(alias).cloned()
    }

    pub fn key_state(&self, key_id: &str) -> Option<String> {
        self.lock()
            .keys
            .get(key_id)
            .map(|k| k.metadata.state.clone())
    }

    pub fn pending_window(&self, key_id: &str) -> Option<i32> {
        self.lock().keys.get(key_id).and_then(|k| k.pending_window)
    }

    /// Ids of keys that are neither aliased away nor scheduled for deletion
    pub fn enabled_keys(&self) -> Vec<String> {
        self.lock()
            .keys
            .values()
            .filter(|k| k.metadata.state == "Enabled")
            .map(|k| k.metadata.key_id.clone())
            .collect()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.lock().buckets.contains_key(bucket)
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key).cloned())
    }

    pub fn has_load_balancer(&self, name: &str) -> bool {
        self.lock().load_balancers.contains_key(name)
    }

    /// Instance ids registered with a load balancer
    pub fn lb_instances(&self, name: &str) -> Vec<String> {
        self.lock()
            .load_balancers
            .get(name)
            .map(|lb| lb.instances.clone())
            .unwrap_or_default()
    }

    /// Record names in a hosted zone
    pub fn records(&self, zone_id: &str) -> Vec<String> {
        self.lock()
            .zones
            .get(zone_id)
            .map(|z| z.records.keys().cloned().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// EC2
// ============================================================================

#[async_trait]
impl Ec2Api for MemoryCloud {
    async fn describe_vpcs(&self, filters: &[Filter]) -> ApiResult<Vec<VpcInfo>> {
        let mut state = self.enter("DescribeVpcs")?;
        let mut found = Vec::new();
        for vpc in state.vpcs.values() {
            let tags = state.tags_of(&vpc.vpc_id);
            let attrs = [("vpc-id", vpc.vpc_id.as_str()), ("state", vpc.state.as_str())];
            if matches(filters, &attrs, &tags) {
                found.push(VpcInfo {
                    tags,
                    ..vpc.clone()
                });
            }
        }
        // A pending VPC becomes available once it has been observed
        for vpc in &found {
            if let Some(stored) = state.vpcs.get_mut(&vpc.vpc_id) {
                stored.state = "available".into();
            }
        }
        Ok(found)
    }

    async fn create_vpc(&self, cidr_block: &str) -> ApiResult<VpcInfo> {
        let mut state = self.enter("CreateVpc")?;
        if cidr_block.parse::<CidrCheck>().is_err() {
            return Err(api_error(
                "InvalidVpc.Range",
                format!("The CIDR '{}' is invalid.", cidr_block),
            ));
        }
        let id = state.ec2_id("vpc");
        let vpc = VpcInfo {
            vpc_id: id.clone(),
            cidr_block: cidr_block.to_string(),
            state: "pending".into(),
            tags: Vec::new(),
        };
        state.vpcs.insert(id, vpc.clone());
        Ok(vpc)
    }

    async fn modify_vpc_attribute(
        &self,
        vpc_id: &str,
        _attribute: VpcAttribute,
        _value: bool,
    ) -> ApiResult<()> {
        let state = self.enter("ModifyVpcAttribute")?;
        if !state.vpcs.contains_key(vpc_id) {
            return Err(not_found_vpc(vpc_id));
        }
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteVpc")?;
        if !state.vpcs.contains_key(vpc_id) {
            return Err(not_found_vpc(vpc_id));
        }
        let in_use = state
            .gateways
            .values()
            .any(|g| g.attached_vpcs.iter().any(|v| v == vpc_id))
            || state.groups.values().any(|g| g.vpc_id == vpc_id);
        if in_use {
            return Err(api_error(
                "DependencyViolation",
                format!("The vpc '{}' has dependencies and cannot be deleted.", vpc_id),
            ));
        }
        state.vpcs.remove(vpc_id);
        state.tags.remove(vpc_id);
        Ok(())
    }

    async fn describe_internet_gateways(&self, filters: &[Filter]) -> ApiResult<Vec<GatewayInfo>> {
        let state = self.enter("DescribeInternetGateways")?;
        let mut found = Vec::new();
        for gateway in state.gateways.values() {
            let tags = state.tags_of(&gateway.gateway_id);
            let mut attrs = vec![("internet-gateway-id", gateway.gateway_id.as_str())];
            attrs.extend(
                gateway
                    .attached_vpcs
                    .iter()
                    .map(|v| ("attachment.vpc-id", v.as_str())),
            );
            if matches(filters, &attrs, &tags) {
                found.push(GatewayInfo {
                    tags,
                    ..gateway.clone()
                });
            }
        }
        Ok(found)
    }

    async fn create_internet_gateway(&self) -> ApiResult<GatewayInfo> {
        let mut state = self.enter("CreateInternetGateway")?;
        let id = state.ec2_id("igw");
        let gateway = GatewayInfo {
            gateway_id: id.clone(),
            attached_vpcs: Vec::new(),
            tags: Vec::new(),
        };
        state.gateways.insert(id, gateway.clone());
        Ok(gateway)
    }

    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ApiResult<()> {
        let mut state = self.enter("AttachInternetGateway")?;
        if !state.vpcs.contains_key(vpc_id) {
            return Err(not_found_vpc(vpc_id));
        }
        let gateway = state
            .gateways
            .get_mut(gateway_id)
            .ok_or_else(|| not_found_gateway(gateway_id))?;
        if !gateway.attached_vpcs.is_empty() {
            return Err(api_error(
                "Resource.AlreadyAssociated",
                format!("resource {} is already attached", gateway_id),
            ));
        }
        gateway.attached_vpcs.push(vpc_id.to_string());
        Ok(())
    }

    async fn detach_internet_gateway(&self, gateway_id: &str, vpc_id: &str) -> ApiResult<()> {
        let mut state = self.enter("DetachInternetGateway")?;
        let gateway = state
            .gateways
            .get_mut(gateway_id)
            .ok_or_else(|| not_found_gateway(gateway_id))?;
        let before = gateway.attached_vpcs.len();
        gateway.attached_vpcs.retain(|v| v != vpc_id);
        if gateway.attached_vpcs.len() == before {
            return Err(api_error(
                "Gateway.NotAttached",
                format!("resource {} is not attached to network {}", gateway_id, vpc_id),
            ));
        }
        Ok(())
    }

    async fn delete_internet_gateway(&self, gateway_id: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteInternetGateway")?;
        let gateway = state
            .gateways
            .get(gateway_id)
            .ok_or_else(|| not_found_gateway(gateway_id))?;
        if !gateway.attached_vpcs.is_empty() {
            return Err(api_error(
                "DependencyViolation",
                format!("The internetGateway '{}' has dependencies.", gateway_id),
            ));
        }
        state.gateways.remove(gateway_id);
        state.tags.remove(gateway_id);
        Ok(())
    }

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> ApiResult<Vec<SecurityGroupInfo>> {
        let state = self.enter("DescribeSecurityGroups")?;
        Ok(state
            .groups
            .values()
            .filter(|g| {
                let attrs = [
                    ("group-id", g.group_id.as_str()),
                    ("group-name", g.group_name.as_str()),
                    ("vpc-id", g.vpc_id.as_str()),
                ];
                matches(filters, &attrs, &state.tags_of(&g.group_id))
            })
            .cloned()
            .collect())
    }

    async fn create_security_group(
        &self,
        group_name: &str,
        _description: &str,
        vpc_id: &str,
    ) -> ApiResult<String> {
        let mut state = self.enter("CreateSecurityGroup")?;
        if !state.vpcs.contains_key(vpc_id) {
            return Err(not_found_vpc(vpc_id));
        }
        if state
            .groups
            .values()
            .any(|g| g.group_name == group_name && g.vpc_id == vpc_id)
        {
            return Err(api_error(
                "InvalidGroup.Duplicate",
                format!("The security group '{}' already exists for VPC '{}'", group_name, vpc_id),
            ));
        }
        let id = state.ec2_id("sg");
        state.groups.insert(
            id.clone(),
            SecurityGroupInfo {
                group_id: id.clone(),
                group_name: group_name.to_string(),
                vpc_id: vpc_id.to_string(),
            },
        );
        Ok(id)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> ApiResult<()> {
        let mut state = self.enter("AuthorizeSecurityGroupIngress")?;
        if !state.groups.contains_key(group_id) {
            return Err(not_found_group(group_id));
        }
        let existing = state.ingress.entry(group_id.to_string()).or_default();
        for rule in rules {
            if existing.contains(rule) {
                return Err(api_error(
                    "InvalidPermission.Duplicate",
                    format!("the specified rule for port {} already exists", rule.port),
                ));
            }
            existing.push(rule.clone());
        }
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteSecurityGroup")?;
        if !state.groups.contains_key(group_id) {
            return Err(not_found_group(group_id));
        }
        let in_use = state.instances.values().any(|i| {
            !i.info.state.is_terminated() && i.security_group_ids.iter().any(|g| g == group_id)
        });
        if in_use {
            return Err(api_error(
                "DependencyViolation",
                format!("resource {} has a dependent object", group_id),
            ));
        }
        state.groups.remove(group_id);
        state.ingress.remove(group_id);
        state.tags.remove(group_id);
        Ok(())
    }

    async fn describe_key_pairs(&self, key_name: &str) -> ApiResult<Vec<KeyPairInfo>> {
        let state = self.enter("DescribeKeyPairs")?;
        match state.key_pairs.get(key_name) {
            Some(info) => Ok(vec![info.clone()]),
            None => Err(api_error(
                "InvalidKeyPair.NotFound",
                format!("The key pair '{}' does not exist", key_name),
            )),
        }
    }

    async fn create_key_pair(&self, key_name: &str) -> ApiResult<KeyPairInfo> {
        let mut state = self.enter("CreateKeyPair")?;
        insert_key_pair(&mut state, key_name)
    }

    async fn import_key_pair(&self, key_name: &str, public_key: &str) -> ApiResult<KeyPairInfo> {
        let mut state = self.enter("ImportKeyPair")?;
        if !public_key.starts_with("ssh-") && !public_key.starts_with("ecdsa-") {
            return Err(api_error(
                "InvalidKey.Format",
                "Key is not in valid OpenSSH public key format",
            ));
        }
        insert_key_pair(&mut state, key_name)
    }

    async fn delete_key_pair(&self, key_name: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteKeyPair")?;
        // EC2 answers success for unknown key names
        state.key_pairs.remove(key_name);
        Ok(())
    }

    async fn describe_instances(&self, filters: &[Filter]) -> ApiResult<Vec<InstanceInfo>> {
        let state = self.enter("DescribeInstances")?;
        let mut found = Vec::new();
        for instance in state.instances.values() {
            let info = &instance.info;
            let tags = state.tags_of(&info.instance_id);
            let attrs = [
                ("instance-id", info.instance_id.as_str()),
                ("instance-state-name", info.state.name.as_str()),
            ];
            if matches(filters, &attrs, &tags) {
                found.push(InstanceInfo {
                    tags,
                    ..info.clone()
                });
            }
        }
        Ok(found)
    }

    async fn run_instance(&self, request: &RunInstanceRequest) -> ApiResult<InstanceInfo> {
        let mut state = self.enter("RunInstances")?;

        if let Some(missing) = request
            .security_group_ids
            .iter()
            .find(|id| !state.groups.contains_key(id.as_str()))
        {
            return Err(not_found_group(missing));
        }
        if let Some(key_name) = &request.key_name {
            if !state.key_pairs.contains_key(key_name) {
                return Err(api_error(
                    "InvalidKeyPair.NotFound",
                    format!("The key pair '{}' does not exist", key_name),
                ));
            }
        }

        let invalid_profile = || {
            api_error(
                "InvalidParameterValue",
                format!(
                    "Value ({}) for parameter iamInstanceProfile.name is invalid. Invalid IAM Instance Profile name",
                    request.instance_profile_name
                ),
            )
        };
        let profile = state
            .profiles
            .get_mut(&request.instance_profile_name)
            .ok_or_else(invalid_profile)?;
        if profile.pending_attempts > 0 {
            profile.pending_attempts -= 1;
            return Err(invalid_profile());
        }

        let id = state.ec2_id("i");
        let info = InstanceInfo {
            instance_id: id.clone(),
            state: InstanceState {
                code: RUNNING.0,
                name: RUNNING.1.to_string(),
            },
            tags: Vec::new(),
        };
        state.instances.insert(
            id,
            MemInstance {
                info: info.clone(),
                security_group_ids: request.security_group_ids.clone(),
            },
        );
        Ok(info)
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> ApiResult<()> {
        let mut state = self.enter("TerminateInstances")?;
        if let Some(missing) = instance_ids
            .iter()
            .find(|id| !state.instances.contains_key(id.as_str()))
        {
            return Err(api_error(
                "InvalidInstanceID.NotFound",
                format!("The instance ID '{}' does not exist", missing),
            ));
        }
        for id in instance_ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.info.state = InstanceState {
                    code: TERMINATED_STATE_CODE,
                    name: "terminated".into(),
                };
            }
        }
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> ApiResult<()> {
        let mut state = self.enter("CreateTags")?;
        for id in resource_ids {
            let existing = state.tags.entry(id.clone()).or_default();
            for tag in tags {
                existing.retain(|t| t.key != tag.key);
                existing.push(tag.clone());
            }
        }
        Ok(())
    }
}

/// Minimal `a.b.c.d/n` shape check
struct CidrCheck;

impl std::str::FromStr for CidrCheck {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or(())?;
        let prefix: u8 = prefix.parse().map_err(|_| ())?;
        addr.parse::<std::net::Ipv4Addr>().map_err(|_| ())?;
        if prefix > 32 {
            return Err(());
        }
        Ok(CidrCheck)
    }
}

fn not_found_vpc(id: &str) -> ApiError {
    api_error("InvalidVpcID.NotFound", format!("The vpc ID '{}' does not exist", id))
}

fn not_found_gateway(id: &str) -> ApiError {
    api_error(
        "InvalidInternetGatewayID.NotFound",
        format!("The internetGateway ID '{}' does not exist", id),
    )
}

fn not_found_group(id: &str) -> ApiError {
    api_error("InvalidGroup.NotFound", format!("The security group '{}' does not exist", id))
}

fn insert_key_pair(state: &mut State, key_name: &str) -> ApiResult<KeyPairInfo> {
    if state.key_pairs.contains_key(key_name) {
        return Err(api_error(
            "InvalidKeyPair.Duplicate",
            format!("The keypair '{}' already exists.", key_name),
        ));
    }
    let n = state.next_id();
    let info = KeyPairInfo {
        key_name: key_name.to_string(),
        key_pair_id: format!("key-{:017x}", n),
        fingerprint: format!("{:02x}:{:02x}:{:02x}:{:02x}", n, n * 3 % 256, n * 7 % 256, n * 11 % 256),
    };
    state.key_pairs.insert(key_name.to_string(), info.clone());
    Ok(info)
}

// ============================================================================
// IAM
// ============================================================================

fn no_such_entity(what: &str, name: &str) -> ApiError {
    api_error(
        "NoSuchEntity",
        format!("The {} with name {} cannot be found.", what, name),
    )
}

fn delete_conflict(message: String) -> ApiError {
    api_error("DeleteConflict", message)
}

#[async_trait]
impl IamApi for MemoryCloud {
    async fn create_role(&self, role_name: &str, _assume_role_policy: &str) -> ApiResult<RoleInfo> {
        let mut state = self.enter("CreateRole")?;
        if state.roles.contains_key(role_name) {
            return Err(api_error(
                "EntityAlreadyExists",
                format!("Role with name {} already exists.", role_name),
            ));
        }
        let n = state.next_id();
        let role = RoleInfo {
            role_name: role_name.to_string(),
            role_id: format!("AROA{:016X}", n),
            arn: format!("arn:aws:iam::{}:role/{}", ACCOUNT_ID, role_name),
        };
        state.roles.insert(role_name.to_string(), role.clone());
        Ok(role)
    }

    async fn get_role(&self, role_name: &str) -> ApiResult<RoleInfo> {
        let state = self.enter("GetRole")?;
        state
            .roles
            .get(role_name)
            .cloned()
            .ok_or_else(|| no_such_entity("role", role_name))
    }

    async fn delete_role(&self, role_name: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteRole")?;
        if !state.roles.contains_key(role_name) {
            return Err(no_such_entity("role", role_name));
        }
        if state.attachments.iter().any(|(role, _)| role == role_name) {
            return Err(delete_conflict(
                "Cannot delete entity, must detach all policies first.".into(),
            ));
        }
        if state
            .profiles
            .values()
            .any(|p| p.info.roles.iter().any(|r| r == role_name))
        {
            return Err(delete_conflict(
                "Cannot delete entity, must remove roles from instance profile first.".into(),
            ));
        }
        state.roles.remove(role_name);
        Ok(())
    }

    async fn create_policy(&self, policy_name: &str, document: &str) -> ApiResult<PolicyInfo> {
        let mut state = self.enter("CreatePolicy")?;
        if serde_json::from_str::<serde_json::Value>(document).is_err() {
            return Err(api_error(
                "MalformedPolicyDocument",
                "Syntax errors in policy.",
            ));
        }
        if state.policies.values().any(|p| p.policy_name == policy_name) {
            return Err(api_error(
                "EntityAlreadyExists",
                format!("A policy called {} already exists.", policy_name),
            ));
        }
        let policy = PolicyInfo {
            policy_name: policy_name.to_string(),
            arn: format!("arn:aws:iam::{}:policy/{}", ACCOUNT_ID, policy_name),
        };
        state.policies.insert(policy.arn.clone(), policy.clone());
        Ok(policy)
    }

    async fn list_policies(&self) -> ApiResult<Vec<PolicyInfo>> {
        let state = self.enter("ListPolicies")?;
        Ok(state.policies.values().cloned().collect())
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()> {
        let mut state = self.enter("AttachRolePolicy")?;
        if !state.roles.contains_key(role_name) {
            return Err(no_such_entity("role", role_name));
        }
        if !state.policies.contains_key(policy_arn) {
            return Err(no_such_entity("policy", policy_arn));
        }
        state
            .attachments
            .insert((role_name.to_string(), policy_arn.to_string()));
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()> {
        let mut state = self.enter("DetachRolePolicy")?;
        if !state
            .attachments
            .remove(&(role_name.to_string(), policy_arn.to_string()))
        {
            return Err(api_error(
                "NoSuchEntity",
                format!("Policy {} was not found attached to role {}.", policy_arn, role_name),
            ));
        }
        Ok(())
    }

    async fn delete_policy(&self, policy_arn: &str) -> ApiResult<()> {
        let mut state = self.enter("DeletePolicy")?;
        if !state.policies.contains_key(policy_arn) {
            return Err(no_such_entity("policy", policy_arn));
        }
        if state.attachments.iter().any(|(_, arn)| arn == policy_arn) {
            return Err(delete_conflict(
                "Cannot delete a policy attached to entities.".into(),
            ));
        }
        state.policies.remove(policy_arn);
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str) -> ApiResult<InstanceProfileInfo> {
        let mut state = self.enter("CreateInstanceProfile")?;
        if state.profiles.contains_key(name) {
            return Err(api_error(
                "EntityAlreadyExists",
                format!("Instance Profile {} already exists.", name),
            ));
        }
        let info = InstanceProfileInfo {
            name: name.to_string(),
            arn: format!("arn:aws:iam::{}:instance-profile/{}", ACCOUNT_ID, name),
            roles: Vec::new(),
        };
        state.profiles.insert(
            name.to_string(),
            MemProfile {
                info: info.clone(),
                pending_attempts: 0,
            },
        );
        Ok(info)
    }

    async fn get_instance_profile(&self, name: &str) -> ApiResult<InstanceProfileInfo> {
        let state = self.enter("GetInstanceProfile")?;
        state
            .profiles
            .get(name)
            .map(|p| p.info.clone())
            .ok_or_else(|| no_such_entity("instance profile", name))
    }

    async fn add_role_to_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ApiResult<()> {
        let mut state = self.enter("AddRoleToInstanceProfile")?;
        if !state.roles.contains_key(role_name) {
            return Err(no_such_entity("role", role_name));
        }
        let attempts = state.propagation_attempts;
        let profile = state
            .profiles
            .get_mut(profile_name)
            .ok_or_else(|| no_such_entity("instance profile", profile_name))?;
        if !profile.info.roles.is_empty() {
            return Err(api_error(
                "LimitExceeded",
                "Cannot exceed quota for InstanceSessionsPerInstanceProfile: 1",
            ));
        }
        profile.info.roles.push(role_name.to_string());
        profile.pending_attempts = attempts;
        Ok(())
    }

    async fn remove_role_from_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ApiResult<()> {
        let mut state = self.enter("RemoveRoleFromInstanceProfile")?;
        let profile = state
            .profiles
            .get_mut(profile_name)
            .ok_or_else(|| no_such_entity("instance profile", profile_name))?;
        let before = profile.info.roles.len();
        profile.info.roles.retain(|r| r != role_name);
        if profile.info.roles.len() == before {
            return Err(no_such_entity("role", role_name));
        }
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteInstanceProfile")?;
        let profile = state
            .profiles
            .get(name)
            .ok_or_else(|| no_such_entity("instance profile", name))?;
        if !profile.info.roles.is_empty() {
            return Err(delete_conflict(
                "Cannot delete entity, must remove roles from instance profile first.".into(),
            ));
        }
        state.profiles.remove(name);
        Ok(())
    }
}

// ============================================================================
// KMS
// ============================================================================

fn kms_not_found(key: &str) -> ApiError {
    api_error("NotFoundException", format!("Key '{}' does not exist", key))
}

#[async_trait]
impl KmsApi for MemoryCloud {
    async fn create_key(&self, _description: &str) -> ApiResult<KeyMetadata> {
        let mut state = self.enter("CreateKey")?;
        let n = state.next_id();
        let key_id = format!("{:08x}-0000-4000-8000-{:012x}", n, n);
        let metadata = KeyMetadata {
            arn: format!("arn:aws:kms:{}:{}:key/{}", self.region, ACCOUNT_ID, key_id),
            key_id: key_id.clone(),
            state: "Enabled".into(),
        };
        state.keys.insert(
            key_id,
            MemKey {
                metadata: metadata.clone(),
                pending_window: None,
            },
        );
        Ok(metadata)
    }

    async fn create_alias(&self, alias_name: &str, target_key_id: &str) -> ApiResult<()> {
        let mut state = self.enter("CreateAlias")?;
        if !alias_name.starts_with("alias/") {
            return Err(api_error(
                "ValidationException",
                "Alias must start with the prefix \"alias/\"",
            ));
        }
        if state.aliases.contains_key(alias_name) {
            return Err(api_error(
                "AlreadyExistsException",
                format!("An alias with the name {} already exists", alias_name),
            ));
        }
        let key_id = state
            .resolve_key(target_key_id)
            .ok_or_else(|| kms_not_found(target_key_id))?;
        state.aliases.insert(alias_name.to_string(), key_id);
        Ok(())
    }

    async fn describe_key(&self, key: &str) -> ApiResult<KeyMetadata> {
        let state = self.enter("DescribeKey")?;
        state
            .resolve_key(key)
            .and_then(|id| state.keys.get(&id))
            .map(|k| k.metadata.clone())
            .ok_or_else(|| kms_not_found(key))
    }

    async fn delete_alias(&self, alias_name: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteAlias")?;
        state
            .aliases
            .remove(alias_name)
            .map(|_| ())
            .ok_or_else(|| kms_not_found(alias_name))
    }

    async fn schedule_key_deletion(
        &self,
        key_id: &str,
        pending_window_days: i32,
    ) -> ApiResult<()> {
        let mut state = self.enter("ScheduleKeyDeletion")?;
        if !(7..=30).contains(&pending_window_days) {
            return Err(api_error(
                "ValidationException",
                "PendingWindowInDays must be between 7 and 30",
            ));
        }
        let id = state.resolve_key(key_id).ok_or_else(|| kms_not_found(key_id))?;
        if let Some(key) = state.keys.get_mut(&id) {
            key.metadata.state = "PendingDeletion".into();
            key.pending_window = Some(pending_window_days);
        }
        Ok(())
    }

    async fn encrypt(&self, key: &str, plaintext: &[u8]) -> ApiResult<Vec<u8>> {
        let state = self.enter("Encrypt")?;
        let id = state.resolve_key(key).ok_or_else(|| kms_not_found(key))?;
        let metadata = state
            .keys
            .get(&id)
            .map(|k| k.metadata.clone())
            .ok_or_else(|| kms_not_found(key))?;
        if metadata.state != "Enabled" {
            return Err(api_error(
                "KMSInvalidStateException",
                format!("{} is pending deletion.", metadata.arn),
            ));
        }
        let mut ciphertext = format!("{}:", id).into_bytes();
        ciphertext.extend(plaintext.iter().map(|b| b ^ 0x5a));
        Ok(ciphertext)
    }
}

// ============================================================================
// S3
// ============================================================================

fn no_such_bucket(bucket: &str) -> ApiError {
    api_error(
        "NoSuchBucket",
        format!("The specified bucket {} does not exist", bucket),
    )
}

#[async_trait]
impl S3Api for MemoryCloud {
    async fn head_bucket(&self, bucket: &str) -> ApiResult<()> {
        let state = self.enter("HeadBucket")?;
        if state.buckets.contains_key(bucket) {
            Ok(())
        } else {
            Err(api_error("NotFound", "Not Found"))
        }
    }

    async fn create_bucket(&self, bucket: &str, _region: &str) -> ApiResult<()> {
        let mut state = self.enter("CreateBucket")?;
        if state.buckets.contains_key(bucket) {
            return Err(api_error(
                "BucketAlreadyOwnedByYou",
                "Your previous request to create the named bucket succeeded and you already own it.",
            ));
        }
        state.buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteBucket")?;
        let objects = state
            .buckets
            .get(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?;
        if !objects.is_empty() {
            return Err(api_error(
                "BucketNotEmpty",
                "The bucket you tried to delete is not empty",
            ));
        }
        state.buckets.remove(bucket);
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> ApiResult<()> {
        let mut state = self.enter("PutObject")?;
        state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> ApiResult<Vec<String>> {
        let state = self.enter("ListObjects")?;
        Ok(state
            .buckets
            .get(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteObject")?;
        state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?
            .remove(key);
        Ok(())
    }
}

// ============================================================================
// ELB
// ============================================================================

fn lb_not_found(name: &str) -> ApiError {
    api_error(
        "LoadBalancerNotFound",
        format!("There is no ACTIVE Load Balancer named '{}'", name),
    )
}

#[async_trait]
impl ElbApi for MemoryCloud {
    async fn create_load_balancer(
        &self,
        name: &str,
        _listener: &Listener,
        _availability_zone: &str,
        _security_group_id: &str,
    ) -> ApiResult<String> {
        let mut state = self.enter("CreateLoadBalancer")?;
        if state.load_balancers.contains_key(name) {
            return Err(api_error(
                "DuplicateLoadBalancerName",
                format!("Load Balancer named '{}' already exists", name),
            ));
        }
        let n = state.next_id();
        let dns_name = format!("{}-{}.{}.elb.amazonaws.com", name, n, self.region);
        state.load_balancers.insert(
            name.to_string(),
            LoadBalancerInfo {
                name: name.to_string(),
                dns_name: dns_name.clone(),
                canonical_hosted_zone_id: ELB_HOSTED_ZONE_ID.to_string(),
                instances: Vec::new(),
            },
        );
        Ok(dns_name)
    }

    async fn describe_load_balancer(&self, name: &str) -> ApiResult<LoadBalancerInfo> {
        let state = self.enter("DescribeLoadBalancers")?;
        state
            .load_balancers
            .get(name)
            .cloned()
            .ok_or_else(|| lb_not_found(name))
    }

    async fn register_instances(&self, name: &str, instance_ids: &[String]) -> ApiResult<()> {
        let mut state = self.enter("RegisterInstancesWithLoadBalancer")?;
        if let Some(bad) = instance_ids.iter().find(|id| !state.live_instance(id)) {
            return Err(api_error(
                "InvalidInstance",
                format!("The requested instance {} is not valid", bad),
            ));
        }
        let lb = state
            .load_balancers
            .get_mut(name)
            .ok_or_else(|| lb_not_found(name))?;
        for id in instance_ids {
            if !lb.instances.contains(id) {
                lb.instances.push(id.clone());
            }
        }
        Ok(())
    }

    async fn delete_load_balancer(&self, name: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteLoadBalancer")?;
        state.load_balancers.remove(name);
        Ok(())
    }
}

// ============================================================================
// Route53
// ============================================================================

fn no_such_zone(id: &str) -> ApiError {
    api_error("NoSuchHostedZone", format!("No hosted zone found with ID: {}", id))
}

#[async_trait]
impl Route53Api for MemoryCloud {
    async fn list_hosted_zones_by_name(
        &self,
        dns_name: &str,
        max_items: i32,
    ) -> ApiResult<Vec<HostedZoneInfo>> {
        let state = self.enter("ListHostedZonesByName")?;
        let start = fqdn(dns_name);
        let mut zones: Vec<HostedZoneInfo> = state
            .zones
            .values()
            .map(|z| z.info.clone())
            .filter(|z| z.name >= start)
            .collect();
        zones.sort_by(|a, b| a.name.cmp(&b.name));
        zones.truncate(max_items.max(0) as usize);
        Ok(zones)
    }

    async fn create_hosted_zone(
        &self,
        name: &str,
        _caller_reference: &str,
        comment: &str,
    ) -> ApiResult<HostedZoneInfo> {
        let mut state = self.enter("CreateHostedZone")?;
        let name = fqdn(name);
        if state.zones.values().any(|z| z.info.name == name) {
            return Err(api_error(
                "HostedZoneAlreadyExists",
                format!("A hosted zone {} already exists", name),
            ));
        }
        let n = state.next_id();
        let info = HostedZoneInfo {
            id: format!("/hostedzone/Z{:012X}", n),
            name,
            comment: comment.to_string(),
        };
        state.zones.insert(
            info.id.clone(),
            MemZone {
                info: info.clone(),
                records: BTreeMap::new(),
            },
        );
        Ok(info)
    }

    async fn delete_hosted_zone(&self, id: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteHostedZone")?;
        let zone = state.zones.get(id).ok_or_else(|| no_such_zone(id))?;
        if !zone.records.is_empty() {
            return Err(api_error(
                "HostedZoneNotEmpty",
                "The specified hosted zone contains non-required resource record sets",
            ));
        }
        state.zones.remove(id);
        Ok(())
    }

    async fn change_record_set(
        &self,
        hosted_zone_id: &str,
        action: ChangeAction,
        record: &AliasRecord,
    ) -> ApiResult<()> {
        let mut state = self.enter("ChangeResourceRecordSets")?;
        let zone = state
            .zones
            .get_mut(hosted_zone_id)
            .ok_or_else(|| no_such_zone(hosted_zone_id))?;
        let key = record.name.trim_end_matches('.').to_string();
        match action {
            ChangeAction::Upsert => {
                zone.records.insert(key, record.clone());
            }
            ChangeAction::Delete => {
                if zone.records.remove(&key).is_none() {
                    return Err(api_error(
                        "InvalidChangeBatch",
                        format!(
                            "Tried to delete resource record set [name='{}', type='A'] but it was not found",
                            key
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let tags = resource_tags("c1-vpc", "c1");
        assert!(matches(&Filter::named("c1-vpc", "c1"), &[], &tags));
        assert!(!matches(&Filter::named("c1-vpc", "c2"), &[], &tags));
        assert!(matches(
            &[Filter::new("vpc-id", "vpc-1")],
            &[("vpc-id", "vpc-1")],
            &[]
        ));
        assert!(!matches(&[Filter::new("unknown", "x")], &[], &tags));
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let cloud = MemoryCloud::new("eu-west-1");
        cloud.fail_once("CreateBucket", "AccessDenied", "denied");

        let s3 = cloud.s3();
        let err = s3.create_bucket("b", "eu-west-1").await.unwrap_err();
        assert_eq!(err.code, "AccessDenied");
        s3.create_bucket("b", "eu-west-1").await.unwrap();
        assert_eq!(cloud.count("CreateBucket"), 2);
    }

    #[tokio::test]
    async fn test_hosted_zone_listing_starts_at_query() {
        let cloud = MemoryCloud::new("eu-west-1");
        let r53 = cloud.route53();
        r53.create_hosted_zone("b.example.io", "ref", "").await.unwrap();
        r53.create_hosted_zone("c.example.io.", "ref", "").await.unwrap();

        let zones = r53.list_hosted_zones_by_name("a.example.io", 1).await.unwrap();
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].name, "b.example.io.");

        let err = r53
            .create_hosted_zone("c.example.io", "ref", "")
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_invalid_cidr_rejected() {
        let cloud = MemoryCloud::new("eu-west-1");
        let err = cloud.ec2().create_vpc("10.0.0.0/40").await.unwrap_err();
        assert_eq!(err.code, "InvalidVpc.Range");
    }
}
