//! Resource capability traits
//!
//! Every provisionable entity implements the subset of capabilities its kind
//! supports. A resource's existence is always decided by a name-based lookup
//! against the provider, never by an in-memory reference kept across runs.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of a provisionable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Namespace,
    Network,
    Gateway,
    SecurityGroup,
    KeyPair,
    KmsKey,
    Role,
    Policy,
    InstanceProfile,
    Bucket,
    Object,
    Instance,
    LoadBalancer,
    HostedZone,
    RecordSet,
    TlsAsset,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::Network => "network",
            ResourceKind::Gateway => "gateway",
            ResourceKind::SecurityGroup => "security group",
            ResourceKind::KeyPair => "key pair",
            ResourceKind::KmsKey => "KMS key",
            ResourceKind::Role => "role",
            ResourceKind::Policy => "policy",
            ResourceKind::InstanceProfile => "instance profile",
            ResourceKind::Bucket => "bucket",
            ResourceKind::Object => "object",
            ResourceKind::Instance => "instance",
            ResourceKind::LoadBalancer => "load balancer",
            ResourceKind::HostedZone => "hosted zone",
            ResourceKind::RecordSet => "record set",
            ResourceKind::TlsAsset => "TLS asset",
        };
        write!(f, "{}", s)
    }
}

/// Base capability: unconditional create and delete
#[async_trait]
pub trait Resource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Identifying label used in logs and errors (usually the idempotency key)
    fn label(&self) -> &str;

    /// Create the resource, failing if the provider rejects the call
    async fn create_or_fail(&mut self) -> Result<()>;

    /// Delete the resource, re-resolving it by name first
    async fn delete(&mut self) -> Result<()>;
}

/// Idempotent creation
#[async_trait]
pub trait Reusable: Resource {
    /// Creates the resource unless it is already there.
    ///
    /// Returns `true` when this call created it and `false` when an existing
    /// resource was found and reused.
    async fn create_if_not_exists(&mut self) -> Result<bool>;
}

/// Resources addressed by a provider ARN
pub trait HasArn: Resource {
    fn arn(&self) -> &str;
}

/// Resources whose idempotency key is exposed
pub trait HasName: Reusable {
    fn name(&self) -> &str;
}

/// Resources that can populate their provider fields from a lookup
#[async_trait]
pub trait Fetchable: Reusable {
    /// Resolve the resource by name, failing with `NotFound` if absent
    async fn get(&mut self) -> Result<()>;
}

/// Resources with a provider-assigned id
pub trait HasId: Fetchable {
    /// Empty until the resource was created or fetched
    fn id(&self) -> &str;
}

/// Resources reachable through a DNS name
pub trait HasDnsName: Resource {
    fn dns_name(&self) -> &str;
    fn hosted_zone_id(&self) -> &str;
}

/// Create-if-absent with the created/reused outcome logged.
pub async fn ensure<R: Reusable + ?Sized>(resource: &mut R) -> Result<bool> {
    let created = resource.create_if_not_exists().await?;
    if created {
        tracing::info!(kind = %resource.kind(), name = resource.label(), "created");
    } else {
        tracing::debug!(
            kind = %resource.kind(),
            name = resource.label(),
            "already exists, reusing"
        );
    }
    Ok(created)
}
