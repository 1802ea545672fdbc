//! Delete sequence
//!
//! Best-effort teardown: every stage runs whatever happened before it, and
//! within a stage every resource is attempted. Each stage keeps its first
//! error in the report.

use super::{Reconciler, delete_tracked, elapsed_ms};
use crate::composer::Composer;
use crate::error::{OperatorError, Result};
use crate::naming::MachineRole;
use crate::stage::{DeleteReport, DeleteStage};
use clusterflow_cloud::{ActionType, ApplyResult, Fetchable, HasDnsName, HasId, HasName, ResourceKind};
use clusterflow_cloud_aws::{LoadBalancer, s3, terminate_by_pattern};
use std::time::Instant;

/// Teardown order. Instances go first so nothing uses the identity
/// artifacts, keys or network afterwards.
const TEARDOWN: [DeleteStage; 9] = [
    DeleteStage::Namespace,
    DeleteStage::MasterInstances,
    DeleteStage::WorkerInstances,
    DeleteStage::ObjectStoreObjects,
    DeleteStage::LoadBalancer,
    DeleteStage::IdentityPolicy,
    DeleteStage::KeyMaterial,
    DeleteStage::KeyPair,
    DeleteStage::Network,
];

/// Remember the first error of a stage and carry on
fn keep(first: &mut Option<OperatorError>, outcome: Result<()>) {
    if let Err(e) = outcome {
        first.get_or_insert(e);
    }
}

fn first_error(first: Option<OperatorError>) -> Result<()> {
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl Reconciler {
    pub(super) async fn delete(&self, composer: &Composer<'_>) -> DeleteReport {
        let mut report = DeleteReport::new(&composer.spec().cluster_id);

        for stage in TEARDOWN {
            let mut result = ApplyResult::new();
            let started = Instant::now();
            let outcome = match stage {
                DeleteStage::Namespace => self.delete_namespace(composer, &mut result).await,
                DeleteStage::MasterInstances => {
                    terminate(composer, MachineRole::Master, &mut result).await
                }
                DeleteStage::WorkerInstances => {
                    terminate(composer, MachineRole::Worker, &mut result).await
                }
                DeleteStage::ObjectStoreObjects => delete_objects(composer, &mut result).await,
                DeleteStage::LoadBalancer => delete_load_balancer(composer, &mut result).await,
                DeleteStage::IdentityPolicy => delete_identity(composer, &mut result).await,
                DeleteStage::KeyMaterial => {
                    delete_tracked(&mut composer.kms_key(), &mut result).await
                }
                DeleteStage::KeyPair => {
                    delete_tracked(&mut composer.key_pair(), &mut result).await
                }
                DeleteStage::Network => delete_network(composer, &mut result).await,
                DeleteStage::Done => Ok(()),
            };
            result.duration_ms = elapsed_ms(started);
            report.push(stage, result, outcome.err().map(|e| e.to_string()));
        }

        report.push(DeleteStage::Done, ApplyResult::new(), None);
        report
    }

    async fn delete_namespace(&self, composer: &Composer<'_>, result: &mut ApplyResult) -> Result<()> {
        let cluster_id = &composer.spec().cluster_id;
        match self.namespaces.delete(cluster_id).await {
            Ok(()) => {
                result.add_success(ResourceKind::Namespace, cluster_id, ActionType::Delete);
                Ok(())
            }
            Err(e) => {
                result.add_failure(ResourceKind::Namespace, cluster_id, ActionType::Delete, &e);
                Err(e)
            }
        }
    }
}

/// Terminate every live machine of `role`, found by tag and name prefix
async fn terminate(composer: &Composer<'_>, role: MachineRole, result: &mut ApplyResult) -> Result<()> {
    let cluster_id = &composer.spec().cluster_id;
    let prefix = composer.names().machine_prefix(role);
    match terminate_by_pattern(composer.clients().ec2.as_ref(), cluster_id, &prefix).await {
        Ok(names) => {
            for name in names {
                result.add_success(ResourceKind::Instance, name, ActionType::Delete);
            }
            Ok(())
        }
        Err(e) => {
            result.add_failure(ResourceKind::Instance, prefix, ActionType::Delete, &e);
            Err(e.into())
        }
    }
}

/// Rendered cloud-configs, then their bucket
async fn delete_objects(composer: &Composer<'_>, result: &mut ApplyResult) -> Result<()> {
    let mut first = None;
    let mut bucket = composer.bucket();

    match bucket.delete_objects(s3::CLOUDCONFIG_PREFIX).await {
        Ok(keys) => {
            for key in keys {
                result.add_success(ResourceKind::Object, key, ActionType::Delete);
            }
        }
        Err(e) => {
            result.add_failure(
                ResourceKind::Object,
                s3::CLOUDCONFIG_PREFIX,
                ActionType::Delete,
                &e,
            );
            keep(&mut first, Err(e.into()));
        }
    }

    keep(&mut first, delete_tracked(&mut bucket, result).await);
    first_error(first)
}

/// DNS records first, since they point at the load balancer
async fn delete_load_balancer(composer: &Composer<'_>, result: &mut ApplyResult) -> Result<()> {
    let mut lb = composer.existing_load_balancer();
    if let Err(e) = lb.get().await {
        result.add_failure(ResourceKind::LoadBalancer, lb.name(), ActionType::Delete, &e);
        return Err(e.into());
    }

    let mut first = None;
    if let Some(domains) = &composer.spec().domains {
        for domain in domains.all() {
            keep(&mut first, delete_record(composer, domain, &lb, result).await);
        }
    }
    keep(&mut first, delete_tracked(&mut lb, result).await);
    first_error(first)
}

async fn delete_record(
    composer: &Composer<'_>,
    domain: &str,
    lb: &LoadBalancer,
    result: &mut ApplyResult,
) -> Result<()> {
    let zone = match composer.existing_hosted_zone(domain).await {
        Ok(zone) => zone,
        Err(e) => {
            result.add_failure(ResourceKind::RecordSet, domain, ActionType::Delete, &e);
            return Err(e.into());
        }
    };
    let mut record = composer.record_set(domain, zone.id(), lb.dns_name(), lb.hosted_zone_id())?;
    delete_tracked(&mut record, result).await
}

/// Policy (detach, delete), role out of the profile, role, profile
async fn delete_identity(composer: &Composer<'_>, result: &mut ApplyResult) -> Result<()> {
    let mut first = None;

    keep(&mut first, delete_tracked(&mut composer.existing_policy(), result).await);

    let mut profile = composer.instance_profile();
    match profile.remove_role().await {
        Ok(()) => result.add_success(ResourceKind::InstanceProfile, profile.name(), ActionType::Update),
        Err(e) => {
            result.add_failure(
                ResourceKind::InstanceProfile,
                profile.name(),
                ActionType::Update,
                &e,
            );
            keep(&mut first, Err(e.into()));
        }
    }

    keep(&mut first, delete_tracked(&mut composer.role(), result).await);
    keep(&mut first, delete_tracked(&mut profile, result).await);
    first_error(first)
}

/// Security group, gateway, then the VPC itself
async fn delete_network(composer: &Composer<'_>, result: &mut ApplyResult) -> Result<()> {
    let mut first = None;

    let mut vpc = composer.vpc();
    if let Err(e) = vpc.get().await {
        result.add_failure(ResourceKind::Network, vpc.name(), ActionType::Delete, &e);
        keep(&mut first, Err(e.into()));
    }

    match composer.security_group(vpc.id()) {
        Ok(mut group) => keep(&mut first, delete_tracked(&mut group, result).await),
        Err(e) => {
            result.add_failure(
                ResourceKind::SecurityGroup,
                composer.names().security_group(),
                ActionType::Delete,
                &e,
            );
            keep(&mut first, Err(e.into()));
        }
    }

    keep(&mut first, delete_tracked(&mut composer.existing_gateway(), result).await);

    if !vpc.id().is_empty() {
        keep(&mut first, delete_tracked(&mut vpc, result).await);
    }
    first_error(first)
}
