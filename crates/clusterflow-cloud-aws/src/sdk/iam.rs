use super::{missing, sdk_error};
use crate::api::{IamApi, InstanceProfileInfo, PolicyInfo, RoleInfo};
use async_trait::async_trait;
use aws_sdk_iam::types::{self, PolicyScopeType};
use clusterflow_cloud::ApiResult;

pub struct SdkIam {
    client: aws_sdk_iam::Client,
}

impl SdkIam {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_iam::Client::new(config),
        }
    }
}

fn to_role(role: &types::Role) -> RoleInfo {
    RoleInfo {
        role_name: role.role_name().to_string(),
        role_id: role.role_id().to_string(),
        arn: role.arn().to_string(),
    }
}

fn to_policy(policy: &types::Policy) -> PolicyInfo {
    PolicyInfo {
        policy_name: policy.policy_name().unwrap_or_default().to_string(),
        arn: policy.arn().unwrap_or_default().to_string(),
    }
}

fn to_profile(profile: &types::InstanceProfile) -> InstanceProfileInfo {
    InstanceProfileInfo {
        name: profile.instance_profile_name().to_string(),
        arn: profile.arn().to_string(),
        roles: profile
            .roles()
            .iter()
            .map(|r| r.role_name().to_string())
            .collect(),
    }
}

#[async_trait]
impl IamApi for SdkIam {
    async fn create_role(&self, role_name: &str, assume_role_policy: &str) -> ApiResult<RoleInfo> {
        let out = self
            .client
            .create_role()
            .role_name(role_name)
            .assume_role_policy_document(assume_role_policy)
            .send()
            .await
            .map_err(sdk_error)?;
        out.role().map(to_role).ok_or_else(|| missing("role"))
    }

    async fn get_role(&self, role_name: &str) -> ApiResult<RoleInfo> {
        let out = self
            .client
            .get_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk_error)?;
        out.role().map(to_role).ok_or_else(|| missing("role"))
    }

    async fn delete_role(&self, role_name: &str) -> ApiResult<()> {
        self.client
            .delete_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn create_policy(&self, policy_name: &str, document: &str) -> ApiResult<PolicyInfo> {
        let out = self
            .client
            .create_policy()
            .policy_name(policy_name)
            .policy_document(document)
            .send()
            .await
            .map_err(sdk_error)?;
        out.policy().map(to_policy).ok_or_else(|| missing("policy"))
    }

    async fn list_policies(&self) -> ApiResult<Vec<PolicyInfo>> {
        let mut policies = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let out = self
                .client
                .list_policies()
                .scope(PolicyScopeType::Local)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(sdk_error)?;
            policies.extend(out.policies().iter().map(to_policy));
            match (out.is_truncated(), out.marker()) {
                (true, Some(next)) => marker = Some(next.to_string()),
                _ => return Ok(policies),
            }
        }
    }

    async fn attach_role_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()> {
        self.client
            .attach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn detach_role_policy(&self, role_name: &str, policy_arn: &str) -> ApiResult<()> {
        self.client
            .detach_role_policy()
            .role_name(role_name)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_policy(&self, policy_arn: &str) -> ApiResult<()> {
        self.client
            .delete_policy()
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn create_instance_profile(&self, name: &str) -> ApiResult<InstanceProfileInfo> {
        let out = self
            .client
            .create_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(sdk_error)?;
        out.instance_profile()
            .map(to_profile)
            .ok_or_else(|| missing("instance profile"))
    }

    async fn get_instance_profile(&self, name: &str) -> ApiResult<InstanceProfileInfo> {
        let out = self
            .client
            .get_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(sdk_error)?;
        out.instance_profile()
            .map(to_profile)
            .ok_or_else(|| missing("instance profile"))
    }

    async fn add_role_to_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ApiResult<()> {
        self.client
            .add_role_to_instance_profile()
            .instance_profile_name(profile_name)
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn remove_role_from_instance_profile(
        &self,
        profile_name: &str,
        role_name: &str,
    ) -> ApiResult<()> {
        self.client
            .remove_role_from_instance_profile()
            .instance_profile_name(profile_name)
            .role_name(role_name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_instance_profile(&self, name: &str) -> ApiResult<()> {
        self.client
            .delete_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}
