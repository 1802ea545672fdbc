//! IAM role, policy and instance profile provisioners
//!
//! IAM rejects deleting a role that still has policies attached or sits in an
//! instance profile, so teardown runs in this order:
//!
//! 1. [`Policy::delete`] (detach from the role, then delete)
//! 2. [`InstanceProfile::remove_role`]
//! 3. [`Role::delete`]
//! 4. [`InstanceProfile::delete`]

use crate::api::{IamApi, InstanceProfileInfo, PolicyInfo, RoleInfo};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, HasArn, HasName, Resource, ResourceKind, Result, Reusable, require,
};
use serde_json::json;
use std::sync::Arc;

/// Trust document letting EC2 instances assume the role
pub fn assume_role_document() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "ec2.amazonaws.com" },
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

/// Permissions a cluster machine needs at boot: decrypt its TLS assets and
/// fetch its cloud-config from the bucket.
pub fn cluster_policy_document(key_arn: &str, bucket: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": "kms:Decrypt",
                "Resource": key_arn
            },
            {
                "Effect": "Allow",
                "Action": "s3:GetObject",
                "Resource": format!("arn:aws:s3:::{}/*", bucket)
            }
        ]
    })
    .to_string()
}

// ============================================================================
// Role
// ============================================================================

pub struct Role {
    pub name: String,
    arn: String,
    client: Arc<dyn IamApi>,
}

impl Role {
    pub fn new(client: Arc<dyn IamApi>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arn: String::new(),
            client,
        }
    }

    async fn find_existing(&self) -> Result<RoleInfo> {
        self.client
            .get_role(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "get", e))
    }
}

#[async_trait]
impl Resource for Role {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Role
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let role = self
            .client
            .create_role(&self.name, &assume_role_document())
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?;
        self.arn = role.arn;
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.client
            .delete_role(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))?;
        self.arn.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for Role {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(role) => {
                self.arn = role.arn;
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.create_or_fail().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => {
                tracing::info!(role = %self.name, "role already exists, reusing");
                self.arn = self.find_existing().await?.arn;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl HasArn for Role {
    fn arn(&self) -> &str {
        &self.arn
    }
}

impl HasName for Role {
    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Customer managed policy attached to the cluster role
pub struct Policy {
    pub name: String,
    pub role_name: String,
    pub key_arn: String,
    pub bucket: String,
    arn: String,
    client: Arc<dyn IamApi>,
}

impl Policy {
    pub fn new(
        client: Arc<dyn IamApi>,
        name: impl Into<String>,
        role_name: impl Into<String>,
        key_arn: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role_name: role_name.into(),
            key_arn: key_arn.into(),
            bucket: bucket.into(),
            arn: String::new(),
            client,
        }
    }

    async fn find_existing(&self) -> Result<PolicyInfo> {
        let policies = self
            .client
            .list_policies()
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "list", e))?;

        policies
            .into_iter()
            .find(|p| p.policy_name == self.name)
            .ok_or_else(|| CloudError::not_found(self.kind(), &self.name))
    }

    /// Attaching an already attached policy is a no-op on the provider side.
    async fn attach(&self) -> Result<()> {
        let role_name = require(&self.role_name, "role name")?;
        self.client
            .attach_role_policy(role_name, &self.arn)
            .await
            .map_err(|e| CloudError::provider(self.kind(), &self.name, "attach", e))
    }
}

#[async_trait]
impl Resource for Policy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Policy
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let key_arn = require(&self.key_arn, "KMS key arn")?;
        let bucket = require(&self.bucket, "bucket name")?;
        let document = cluster_policy_document(key_arn, bucket);

        let policy = self
            .client
            .create_policy(&self.name, &document)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?;
        self.arn = policy.arn;
        self.attach().await
    }

    async fn delete(&mut self) -> Result<()> {
        let policy = self.find_existing().await?;

        match self
            .client
            .detach_role_policy(&self.role_name, &policy.arn)
            .await
        {
            Ok(()) => {}
            // Already detached, or the role is gone
            Err(e) if e.is_not_found() => {
                tracing::debug!(policy = %self.name, role = %self.role_name, "policy not attached");
            }
            Err(e) => return Err(CloudError::provider(self.kind(), &self.name, "detach", e)),
        }

        self.client
            .delete_policy(&policy.arn)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))?;
        self.arn.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for Policy {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(policy) => {
                self.arn = policy.arn;
                self.attach().await?;
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.create_or_fail().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => {
                tracing::info!(policy = %self.name, "policy already exists, reusing");
                self.arn = self.find_existing().await?.arn;
                self.attach().await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl HasArn for Policy {
    fn arn(&self) -> &str {
        &self.arn
    }
}

impl HasName for Policy {
    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// InstanceProfile
// ============================================================================

pub struct InstanceProfile {
    pub name: String,
    pub role_name: String,
    arn: String,
    client: Arc<dyn IamApi>,
}

impl InstanceProfile {
    pub fn new(
        client: Arc<dyn IamApi>,
        name: impl Into<String>,
        role_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role_name: role_name.into(),
            arn: String::new(),
            client,
        }
    }

    async fn find_existing(&self) -> Result<InstanceProfileInfo> {
        self.client
            .get_instance_profile(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "get", e))
    }

    async fn add_role(&self, profile: &InstanceProfileInfo) -> Result<()> {
        if profile.roles.iter().any(|r| r == &self.role_name) {
            return Ok(());
        }
        let role_name = require(&self.role_name, "role name")?;
        match self
            .client
            .add_role_to_instance_profile(&self.name, role_name)
            .await
        {
            Ok(()) => Ok(()),
            // A profile holds at most one role
            Err(e) if e.code == "LimitExceeded" => {
                tracing::warn!(profile = %self.name, "instance profile already holds a role");
                Ok(())
            }
            Err(e) => Err(CloudError::provider(self.kind(), &self.name, "add role", e)),
        }
    }

    /// Detach the role so it can be deleted
    pub async fn remove_role(&mut self) -> Result<()> {
        self.client
            .remove_role_from_instance_profile(&self.name, &self.role_name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "remove role", e))
    }
}

#[async_trait]
impl Resource for InstanceProfile {
    fn kind(&self) -> ResourceKind {
        ResourceKind::InstanceProfile
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let profile = self
            .client
            .create_instance_profile(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?;
        self.add_role(&profile).await?;
        self.arn = profile.arn;
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        self.client
            .delete_instance_profile(&self.name)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))?;
        self.arn.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for InstanceProfile {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(profile) => {
                self.add_role(&profile).await?;
                self.arn = profile.arn;
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.create_or_fail().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => {
                tracing::info!(profile = %self.name, "instance profile already exists, reusing");
                let profile = self.find_existing().await?;
                self.add_role(&profile).await?;
                self.arn = profile.arn;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl HasArn for InstanceProfile {
    fn arn(&self) -> &str {
        &self.arn
    }
}

impl HasName for InstanceProfile {
    fn name(&self) -> &str {
        &self.name
    }
}


#[cfg(all(test, feature = "memory"))]
mod memory_tests {
    use super::*;
    use crate::memory::MemoryCloud;
    use clusterflow_cloud::ErrorKind;

    async fn provision(cloud: &MemoryCloud) -> (Role, Policy, InstanceProfile) {
        let mut role = Role::new(cloud.iam(), "c1-role");
        let mut policy = Policy::new(
            cloud.iam(),
            "c1-policy",
            "c1-role",
            "arn:aws:kms:eu-west-1:000000000000:key/k1",
            "c1-cloudconfig",
        );
        let mut profile = InstanceProfile::new(cloud.iam(), "c1-profile", "c1-role");
        role.create_if_not_exists().await.unwrap();
        policy.create_if_not_exists().await.unwrap();
        profile.create_if_not_exists().await.unwrap();
        (role, policy, profile)
    }

    #[tokio::test]
    async fn test_reuse_keeps_arns() {
        let cloud = MemoryCloud::new("eu-west-1");
        let (role, policy, profile) = provision(&cloud).await;
        let (role2, policy2, profile2) = provision(&cloud).await;

        assert_eq!(role.arn(), role2.arn());
        assert_eq!(policy.arn(), policy2.arn());
        assert_eq!(profile.arn(), profile2.arn());
        assert_eq!(cloud.count("CreateRole"), 1);
        assert_eq!(cloud.count("CreatePolicy"), 1);
        assert_eq!(cloud.count("CreateInstanceProfile"), 1);
    }

    #[tokio::test]
    async fn test_policy_requires_key_arn() {
        let cloud = MemoryCloud::new("eu-west-1");
        let mut policy = Policy::new(cloud.iam(), "c1-policy", "c1-role", "", "c1-cloudconfig");
        let err = policy.create_if_not_exists().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyUnresolved);
    }

    #[tokio::test]
    async fn test_role_delete_rejected_while_attached() {
        let cloud = MemoryCloud::new("eu-west-1");
        let (mut role, mut policy, mut profile) = provision(&cloud).await;

        assert!(role.delete().await.is_err());

        policy.delete().await.unwrap();
        profile.remove_role().await.unwrap();
        role.delete().await.unwrap();
        profile.delete().await.unwrap();
        assert!(role.create_if_not_exists().await.unwrap());
    }
}
