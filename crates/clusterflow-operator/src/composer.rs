//! Dependency composer
//!
//! Builds every provisioner of one cluster with its derived name. Inputs
//! produced by earlier stages (ids, arns, user data) are passed in
//! explicitly and an empty one is rejected with `DependencyUnresolved`
//! before any provider call is made.

use crate::naming::{ClusterNames, MachineRole};
use crate::spec::{ClusterSpec, MachineSpec};
use clusterflow_cloud::{Result, RetryConfig, require};
use clusterflow_cloud_aws::{
    AwsClients, Bucket, Gateway, HostedZone, Instance, InstanceConfig, InstanceProfile, KeyPair,
    KmsKey, Listener, LoadBalancer, Object, Policy, RecordSet, Role, SecurityGroup, Vpc,
    hosted_zone_name, s3,
};

/// SSH access from anywhere
const SSH_PORT: i32 = 22;

pub struct Composer<'a> {
    clients: AwsClients,
    spec: &'a ClusterSpec,
    names: ClusterNames,
    retry: RetryConfig,
    listener: Listener,
}

impl<'a> Composer<'a> {
    pub fn new(
        clients: AwsClients,
        spec: &'a ClusterSpec,
        retry: RetryConfig,
        listener: Listener,
    ) -> Self {
        Self {
            names: ClusterNames::new(&spec.cluster_id),
            clients,
            spec,
            retry,
            listener,
        }
    }

    pub fn clients(&self) -> &AwsClients {
        &self.clients
    }

    pub fn spec(&self) -> &'a ClusterSpec {
        self.spec
    }

    pub fn names(&self) -> &ClusterNames {
        &self.names
    }

    fn cluster_id(&self) -> &str {
        &self.spec.cluster_id
    }

    // ------------------------------------------------------------------
    // Network boundary
    // ------------------------------------------------------------------

    pub fn vpc(&self) -> Vpc {
        Vpc::new(
            self.clients.ec2.clone(),
            self.names.vpc(),
            self.cluster_id(),
            &self.spec.network.vpc_cidr,
        )
        .with_retry(self.retry.clone())
    }

    pub fn gateway(&self, vpc_id: &str) -> Result<Gateway> {
        let vpc_id = require(vpc_id, "VPC id")?;
        Ok(Gateway::new(
            self.clients.ec2.clone(),
            self.names.gateway(),
            self.cluster_id(),
            vpc_id,
        ))
    }

    /// Gateway located by its tags only, for teardown
    pub fn existing_gateway(&self) -> Gateway {
        Gateway::new(
            self.clients.ec2.clone(),
            self.names.gateway(),
            self.cluster_id(),
            "",
        )
    }

    /// Opens SSH, the load balancer port and the API instance port
    pub fn security_group(&self, vpc_id: &str) -> Result<SecurityGroup> {
        let vpc_id = require(vpc_id, "VPC id")?;
        Ok(SecurityGroup::new(
            self.clients.ec2.clone(),
            self.names.security_group(),
            self.cluster_id(),
            vpc_id,
        )
        .with_ingress_ports([
            SSH_PORT,
            self.listener.load_balancer_port,
            self.listener.instance_port,
        ])
        .with_retry(self.retry.clone()))
    }

    // ------------------------------------------------------------------
    // Keys and identity
    // ------------------------------------------------------------------

    pub fn key_pair(&self) -> KeyPair {
        KeyPair::new(self.clients.ec2.clone(), self.names.key_pair())
            .with_public_key(self.spec.ssh_public_key.clone())
    }

    pub fn kms_key(&self) -> KmsKey {
        KmsKey::new(self.clients.kms.clone(), self.names.kms_key())
    }

    pub fn role(&self) -> Role {
        Role::new(self.clients.iam.clone(), self.names.role())
    }

    /// Policy granting decryption under `key_arn` and reads from the bucket
    pub fn policy(&self, key_arn: &str) -> Result<Policy> {
        let key_arn = require(key_arn, "KMS key arn")?;
        Ok(Policy::new(
            self.clients.iam.clone(),
            self.names.policy(),
            self.names.role(),
            key_arn,
            self.names.bucket(),
        ))
    }

    /// Policy located by name, for teardown
    pub fn existing_policy(&self) -> Policy {
        Policy::new(
            self.clients.iam.clone(),
            self.names.policy(),
            self.names.role(),
            "",
            self.names.bucket(),
        )
    }

    pub fn instance_profile(&self) -> InstanceProfile {
        InstanceProfile::new(
            self.clients.iam.clone(),
            self.names.instance_profile(),
            self.names.role(),
        )
    }

    // ------------------------------------------------------------------
    // Object store
    // ------------------------------------------------------------------

    pub fn bucket(&self) -> Bucket {
        Bucket::new(
            self.clients.s3.clone(),
            self.names.bucket(),
            &self.clients.region,
        )
    }

    /// Rendered cloud-config of `role`
    pub fn cloud_config(&self, role: MachineRole, content: String) -> Object {
        Object::new(
            self.clients.s3.clone(),
            self.names.bucket(),
            s3::object_key(role.as_str()),
            content.into_bytes(),
        )
    }

    // ------------------------------------------------------------------
    // Compute
    // ------------------------------------------------------------------

    /// Machine `index` of `role`. `user_data` is the base64 bootstrap script.
    pub fn instance(
        &self,
        role: MachineRole,
        index: usize,
        machine: &MachineSpec,
        security_group_id: &str,
        user_data: &str,
    ) -> Result<Instance> {
        let config = InstanceConfig {
            image_id: machine.image_id.clone(),
            instance_type: machine.instance_type.clone(),
            availability_zone: self.spec.availability_zone(),
            security_group_id: require(security_group_id, "security group id")?.to_string(),
            instance_profile_name: self.names.instance_profile(),
            key_name: Some(self.names.key_pair()),
            user_data: require(user_data, "user data")?.to_string(),
        };
        Ok(Instance::new(
            self.clients.ec2.clone(),
            self.names.machine(role, index),
            self.cluster_id(),
            config,
        )
        .with_retry(self.retry.clone()))
    }

    // ------------------------------------------------------------------
    // Load balancer and DNS
    // ------------------------------------------------------------------

    pub fn load_balancer(&self, security_group_id: &str) -> Result<LoadBalancer> {
        let security_group_id = require(security_group_id, "security group id")?;
        Ok(self.lb(security_group_id))
    }

    /// Load balancer located by name, for teardown
    pub fn existing_load_balancer(&self) -> LoadBalancer {
        self.lb("")
    }

    fn lb(&self, security_group_id: &str) -> LoadBalancer {
        LoadBalancer::new(
            self.clients.elb.clone(),
            self.names.load_balancer(),
            self.spec.availability_zone(),
            security_group_id,
        )
        .with_listener(self.listener.clone())
    }

    /// Hosted zone serving `domain`
    pub fn hosted_zone(&self, domain: &str) -> Result<HostedZone> {
        Ok(HostedZone::new(
            self.clients.route53.clone(),
            hosted_zone_name(domain)?,
            format!("Hosted zone for cluster {}", self.cluster_id()),
        ))
    }

    /// Resolve the zone of `domain` without creating it, for teardown
    pub async fn existing_hosted_zone(&self, domain: &str) -> Result<HostedZone> {
        HostedZone::from_existing(self.clients.route53.clone(), hosted_zone_name(domain)?).await
    }

    /// Alias record of `domain` pointing at the load balancer
    pub fn record_set(
        &self,
        domain: &str,
        hosted_zone_id: &str,
        target_dns_name: &str,
        target_hosted_zone_id: &str,
    ) -> Result<RecordSet> {
        let hosted_zone_id = require(hosted_zone_id, "hosted zone id")?;
        Ok(RecordSet::new(
            self.clients.route53.clone(),
            domain,
            hosted_zone_id,
            target_dns_name,
            target_hosted_zone_id,
        ))
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::spec::fixtures::spec;
    use clusterflow_cloud::{ErrorKind, HasName};
    use clusterflow_cloud_aws::memory::MemoryCloud;

    fn composer<'a>(cloud: &MemoryCloud, spec: &'a ClusterSpec) -> Composer<'a> {
        Composer::new(
            cloud.clients(),
            spec,
            RetryConfig::default(),
            Listener::default(),
        )
    }

    #[test]
    fn test_derived_names() {
        let cloud = MemoryCloud::new("eu-west-1");
        let spec = spec("c1", 1, 1);
        let composer = composer(&cloud, &spec);

        assert_eq!(composer.vpc().name(), "c1-vpc");
        assert_eq!(composer.gateway("vpc-1").unwrap().name(), "c1-gateway");
        assert_eq!(composer.role().name(), "c1-role");
        assert_eq!(composer.instance_profile().name(), "c1-profile");
        assert_eq!(composer.bucket().name(), "c1-cloudconfig");
        assert_eq!(composer.kms_key().alias(), "alias/c1-tls");
        assert_eq!(
            composer.cloud_config(MachineRole::Worker, String::new()).key,
            "cloudconfig/worker"
        );

        let machine = &spec.workers[0];
        let instance = composer
            .instance(MachineRole::Worker, 0, machine, "sg-1", "IyEvYmluL2Jhc2g=")
            .unwrap();
        assert_eq!(instance.name(), "c1-worker-0");
        assert_eq!(instance.config.availability_zone, "eu-west-1a");
        assert_eq!(instance.config.key_name.as_deref(), Some("c1-key"));
    }

    #[test]
    fn test_security_group_ports_follow_listener() {
        let cloud = MemoryCloud::new("eu-west-1");
        let spec = spec("c1", 1, 0);
        let composer = Composer::new(
            cloud.clients(),
            &spec,
            RetryConfig::default(),
            Listener {
                protocol: "TCP".into(),
                load_balancer_port: 8443,
                instance_port: 6443,
            },
        );
        let sg = composer.security_group("vpc-1").unwrap();
        assert_eq!(sg.ingress_ports, vec![22, 8443, 6443]);
    }

    #[test]
    fn test_empty_inputs_are_unresolved() {
        let cloud = MemoryCloud::new("eu-west-1");
        let spec = spec("c1", 1, 0);
        let composer = composer(&cloud, &spec);
        let machine = &spec.masters[0];

        let unresolved = |r: Result<()>| r.unwrap_err().kind() == ErrorKind::DependencyUnresolved;
        assert!(unresolved(composer.gateway("").map(|_| ())));
        assert!(unresolved(composer.security_group("").map(|_| ())));
        assert!(unresolved(composer.policy("").map(|_| ())));
        assert!(unresolved(composer.load_balancer("").map(|_| ())));
        assert!(unresolved(
            composer
                .instance(MachineRole::Master, 0, machine, "", "data")
                .map(|_| ())
        ));
        assert!(unresolved(
            composer
                .instance(MachineRole::Master, 0, machine, "sg-1", "")
                .map(|_| ())
        ));
        assert!(unresolved(composer.record_set("api.a.b.c.d.e", "", "lb", "Z1").map(|_| ())));
    }

    #[test]
    fn test_hosted_zone_from_domain() {
        let cloud = MemoryCloud::new("eu-west-1");
        let spec = spec("c1", 1, 0);
        let composer = composer(&cloud, &spec);

        let zone = composer
            .hosted_zone("etcd.pbmva.g8s.eu-west-1.adidas.aws.giantswarm.io")
            .unwrap();
        assert_eq!(zone.name(), "aws.giantswarm.io");
        assert_eq!(zone.comment, "Hosted zone for cluster c1");

        let err = composer.hosted_zone("api.c1.example.com").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
}
