use super::{build_error, missing, sdk_error};
use crate::api::{AliasRecord, ChangeAction, HostedZoneInfo, Route53Api};
use async_trait::async_trait;
use aws_sdk_route53::types::{
    self, AliasTarget, Change, ChangeBatch, HostedZoneConfig, ResourceRecordSet, RrType,
};
use clusterflow_cloud::ApiResult;

pub struct SdkRoute53 {
    client: aws_sdk_route53::Client,
}

impl SdkRoute53 {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_route53::Client::new(config),
        }
    }
}

fn to_zone(zone: &types::HostedZone) -> HostedZoneInfo {
    HostedZoneInfo {
        id: zone.id().to_string(),
        name: zone.name().to_string(),
        comment: zone
            .config()
            .and_then(|c| c.comment())
            .unwrap_or_default()
            .to_string(),
    }
}

fn change_batch(action: ChangeAction, record: &AliasRecord) -> ApiResult<ChangeBatch> {
    let alias = AliasTarget::builder()
        .hosted_zone_id(&record.target_hosted_zone_id)
        .dns_name(&record.target_dns_name)
        .evaluate_target_health(false)
        .build()
        .map_err(build_error)?;
    let record_set = ResourceRecordSet::builder()
        .name(&record.name)
        .r#type(RrType::A)
        .alias_target(alias)
        .build()
        .map_err(build_error)?;
    let action = match action {
        ChangeAction::Upsert => types::ChangeAction::Upsert,
        ChangeAction::Delete => types::ChangeAction::Delete,
    };
    let change = Change::builder()
        .action(action)
        .resource_record_set(record_set)
        .build()
        .map_err(build_error)?;
    ChangeBatch::builder()
        .changes(change)
        .build()
        .map_err(build_error)
}

#[async_trait]
impl Route53Api for SdkRoute53 {
    async fn list_hosted_zones_by_name(
        &self,
        dns_name: &str,
        max_items: i32,
    ) -> ApiResult<Vec<HostedZoneInfo>> {
        let out = self
            .client
            .list_hosted_zones_by_name()
            .dns_name(dns_name)
            .max_items(max_items)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out.hosted_zones().iter().map(to_zone).collect())
    }

    async fn create_hosted_zone(
        &self,
        name: &str,
        caller_reference: &str,
        comment: &str,
    ) -> ApiResult<HostedZoneInfo> {
        let out = self
            .client
            .create_hosted_zone()
            .name(name)
            .caller_reference(caller_reference)
            .hosted_zone_config(
                HostedZoneConfig::builder()
                    .comment(comment)
                    .private_zone(false)
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)?;
        out.hosted_zone()
            .map(to_zone)
            .ok_or_else(|| missing("hosted zone"))
    }

    async fn delete_hosted_zone(&self, id: &str) -> ApiResult<()> {
        self.client
            .delete_hosted_zone()
            .id(id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn change_record_set(
        &self,
        hosted_zone_id: &str,
        action: ChangeAction,
        record: &AliasRecord,
    ) -> ApiResult<()> {
        self.client
            .change_resource_record_sets()
            .hosted_zone_id(hosted_zone_id)
            .change_batch(change_batch(action, record)?)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}
