//! AWS provisioners for ClusterFlow
//!
//! One provisioner per resource kind. Each follows the same algorithm:
//! look the resource up by its idempotency key (a tag, or a provider name),
//! reuse it when found, otherwise create it, wait for it to become usable,
//! and tag it. A creation call that reports "already exists" lost a race
//! with another creator and is treated as reuse.
//!
//! | Provisioner | Capabilities |
//! |-------------|--------------|
//! | [`Vpc`], [`Gateway`], [`SecurityGroup`], [`KeyPair`], [`Instance`], [`HostedZone`] | `Reusable`, `HasName`, `Fetchable`, `HasId` |
//! | [`Role`], [`Policy`], [`InstanceProfile`] | `Reusable`, `HasName`, `HasArn` |
//! | [`KmsKey`] | `HasArn` (never reusable) |
//! | [`Bucket`] | `Reusable`, `HasName` |
//! | [`LoadBalancer`] | `Reusable`, `HasName`, `Fetchable`, `HasDnsName` |
//! | [`Object`], [`RecordSet`] | `Resource` |
//!
//! # Features
//!
//! - `memory`: [`memory::MemoryCloud`], an in-memory provider
//! - `sdk`: [`sdk::connect`], clients backed by the AWS SDK

pub mod api;
pub mod elb;
pub mod gateway;
pub mod iam;
pub mod instance;
pub mod key_pair;
pub mod kms;
pub mod route53;
pub mod s3;
pub mod security_group;
pub mod vpc;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sdk")]
pub mod sdk;

pub use api::{AwsClients, Listener, TAG_CLUSTER, TAG_NAME, classify_code};
pub use elb::LoadBalancer;
pub use gateway::Gateway;
pub use iam::{InstanceProfile, Policy, Role};
pub use instance::{Instance, InstanceConfig, terminate_by_pattern};
pub use key_pair::KeyPair;
pub use kms::KmsKey;
pub use route53::{HostedZone, RecordSet, hosted_zone_name};
pub use s3::{Bucket, Object};
pub use security_group::SecurityGroup;
pub use vpc::Vpc;
