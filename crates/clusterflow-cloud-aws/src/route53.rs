//! Route53 hosted zone and record set provisioners

use crate::api::{AliasRecord, ChangeAction, HostedZoneInfo, Route53Api};
use async_trait::async_trait;
use clusterflow_cloud::{
    CloudError, Fetchable, HasId, HasName, Resource, ResourceKind, Result, Reusable, require,
};
use std::sync::Arc;

/// Number of leading labels in a machine domain before the zone name
const ZONE_LABEL_OFFSET: usize = 5;

/// Hosted zone name for a machine or service domain.
///
/// The domain is split on the first five dots and the remainder is kept as
/// one string, so `etcd.pbmva.g8s.eu-west-1.adidas.aws.giantswarm.io` becomes
/// `aws.giantswarm.io`. Domains with fewer than six labels are malformed.
pub fn hosted_zone_name(domain: &str) -> Result<String> {
    let parts: Vec<&str> = domain.splitn(ZONE_LABEL_OFFSET + 1, '.').collect();
    match parts.get(ZONE_LABEL_OFFSET) {
        Some(zone) => Ok((*zone).to_string()),
        None => Err(CloudError::MalformedKey(format!(
            "domain '{}' has fewer than {} labels",
            domain,
            ZONE_LABEL_OFFSET + 1
        ))),
    }
}

fn normalize(name: &str) -> &str {
    name.trim_end_matches('.')
}

pub struct HostedZone {
    pub name: String,
    pub comment: String,
    id: String,
    client: Arc<dyn Route53Api>,
}

impl HostedZone {
    pub fn new(
        client: Arc<dyn Route53Api>,
        name: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            comment: comment.into(),
            id: String::new(),
            client,
        }
    }

    /// Resolve an existing zone without creating anything.
    pub async fn from_existing(client: Arc<dyn Route53Api>, name: impl Into<String>) -> Result<Self> {
        let mut zone = Self::new(client, name, "");
        zone.get().await?;
        Ok(zone)
    }

    /// The list call returns zones in name order starting at the query, even
    /// when none matches, so only an exact match after trimming the trailing
    /// dot counts.
    async fn find_existing(&self) -> Result<HostedZoneInfo> {
        let zones = self
            .client
            .list_hosted_zones_by_name(&self.name, 1)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "list", e))?;

        zones
            .into_iter()
            .next()
            .filter(|z| normalize(&z.name) == normalize(&self.name))
            .ok_or_else(|| CloudError::not_found(self.kind(), &self.name))
    }
}

#[async_trait]
impl Resource for HostedZone {
    fn kind(&self) -> ResourceKind {
        ResourceKind::HostedZone
    }

    fn label(&self) -> &str {
        &self.name
    }

    async fn create_or_fail(&mut self) -> Result<()> {
        let caller_reference = chrono::Utc::now().to_rfc3339();
        let zone = self
            .client
            .create_hosted_zone(&self.name, &caller_reference, &self.comment)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "create", e))?;
        self.id = zone.id;
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        let zone = self.find_existing().await?;
        self.client
            .delete_hosted_zone(&zone.id)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.name, "delete", e))?;
        self.id.clear();
        Ok(())
    }
}

#[async_trait]
impl Reusable for HostedZone {
    async fn create_if_not_exists(&mut self) -> Result<bool> {
        match self.find_existing().await {
            Ok(zone) => {
                self.id = zone.id;
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.create_or_fail().await {
            Ok(()) => Ok(true),
            Err(e) if e.is_already_exists() => {
                self.get().await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl HasName for HostedZone {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Fetchable for HostedZone {
    async fn get(&mut self) -> Result<()> {
        let zone = self.find_existing().await?;
        self.id = zone.id;
        Ok(())
    }
}

impl HasId for HostedZone {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Alias A record pointing a domain at a load balancer
pub struct RecordSet {
    pub domain: String,
    pub hosted_zone_id: String,
    pub target_dns_name: String,
    pub target_hosted_zone_id: String,
    client: Arc<dyn Route53Api>,
}

impl RecordSet {
    /// `hosted_zone_id` must come from an already resolved zone.
    pub fn new(
        client: Arc<dyn Route53Api>,
        domain: impl Into<String>,
        hosted_zone_id: impl Into<String>,
        target_dns_name: impl Into<String>,
        target_hosted_zone_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            hosted_zone_id: hosted_zone_id.into(),
            target_dns_name: target_dns_name.into(),
            target_hosted_zone_id: target_hosted_zone_id.into(),
            client,
        }
    }

    fn record(&self) -> Result<AliasRecord> {
        Ok(AliasRecord {
            name: self.domain.clone(),
            target_dns_name: require(&self.target_dns_name, "load balancer DNS name")?
                .to_string(),
            target_hosted_zone_id: require(
                &self.target_hosted_zone_id,
                "load balancer hosted zone id",
            )?
            .to_string(),
        })
    }

    async fn change(&self, action: ChangeAction, operation: &'static str) -> Result<()> {
        let zone_id = require(&self.hosted_zone_id, "hosted zone id")?;
        let record = self.record()?;
        self.client
            .change_record_set(zone_id, action, &record)
            .await
            .map_err(|e| CloudError::api(self.kind(), &self.domain, operation, e))
    }
}

#[async_trait]
impl Resource for RecordSet {
    fn kind(&self) -> ResourceKind {
        ResourceKind::RecordSet
    }

    fn label(&self) -> &str {
        &self.domain
    }

    /// UPSERT, so a repeated create leaves a single record
    async fn create_or_fail(&mut self) -> Result<()> {
        self.change(ChangeAction::Upsert, "upsert").await
    }

    async fn delete(&mut self) -> Result<()> {
        self.change(ChangeAction::Delete, "delete").await
    }
}
