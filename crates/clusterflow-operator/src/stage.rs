//! Reconciliation stages and their reports

use clusterflow_cloud::{ApplyResult, ApplySummary, ResourceKind};
use serde::Serialize;
use std::fmt;

/// Stages of cluster creation, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreateStage {
    /// Namespace plus the network boundary (VPC, gateway, security group)
    Namespace,
    KeyPair,
    Certificates,
    KeyMaterial,
    EncryptedAssets,
    IdentityPolicy,
    ObjectStore,
    MasterInstances { count: usize },
    LoadBalancer,
    WorkerInstances { count: usize },
    ConsistencyCheck { passed: bool },
    Done,
}

impl fmt::Display for CreateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateStage::Namespace => write!(f, "Namespace"),
            CreateStage::KeyPair => write!(f, "KeyPair"),
            CreateStage::Certificates => write!(f, "Certificates"),
            CreateStage::KeyMaterial => write!(f, "KeyMaterial"),
            CreateStage::EncryptedAssets => write!(f, "EncryptedAssets"),
            CreateStage::IdentityPolicy => write!(f, "IdentityPolicy"),
            CreateStage::ObjectStore => write!(f, "ObjectStore"),
            CreateStage::MasterInstances { count } => write!(f, "MasterInstances({})", count),
            CreateStage::LoadBalancer => write!(f, "LoadBalancer"),
            CreateStage::WorkerInstances { count } => write!(f, "WorkerInstances({})", count),
            CreateStage::ConsistencyCheck { passed } => {
                write!(f, "ConsistencyCheck({})", if *passed { "pass" } else { "fail" })
            }
            CreateStage::Done => write!(f, "Done"),
        }
    }
}

impl CreateStage {
    /// Stages whose failure is recorded without aborting the run.
    ///
    /// On a redundant event the key alias and the identity artifacts
    /// legitimately exist already; the consistency check decides whether
    /// such a failure matters.
    pub fn is_tolerated(&self) -> bool {
        matches!(self, CreateStage::KeyMaterial | CreateStage::IdentityPolicy)
    }
}

/// Stages of cluster deletion, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteStage {
    Namespace,
    MasterInstances,
    WorkerInstances,
    ObjectStoreObjects,
    /// Record sets, then the load balancer
    LoadBalancer,
    IdentityPolicy,
    KeyMaterial,
    KeyPair,
    /// Security group, gateway, VPC
    Network,
    Done,
}

impl fmt::Display for DeleteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeleteStage::Namespace => "Namespace",
            DeleteStage::MasterInstances => "MasterInstances",
            DeleteStage::WorkerInstances => "WorkerInstances",
            DeleteStage::ObjectStoreObjects => "ObjectStoreObjects",
            DeleteStage::LoadBalancer => "LoadBalancer",
            DeleteStage::IdentityPolicy => "IdentityPolicy",
            DeleteStage::KeyMaterial => "KeyMaterial",
            DeleteStage::KeyPair => "KeyPair",
            DeleteStage::Network => "Network",
            DeleteStage::Done => "Done",
        };
        f.write_str(s)
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageReport<S> {
    pub stage: S,
    pub result: ApplyResult,
    /// First error of the stage
    pub error: Option<String>,
}

impl<S> StageReport<S> {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.result.is_success()
    }
}

/// Stage-by-stage record of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport<S> {
    pub cluster_id: String,
    pub stages: Vec<StageReport<S>>,
}

pub type CreateReport = RunReport<CreateStage>;
pub type DeleteReport = RunReport<DeleteStage>;

impl<S: Copy + PartialEq + fmt::Display> RunReport<S> {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, stage: S, result: ApplyResult, error: Option<String>) {
        match &error {
            Some(error) => tracing::error!(cluster = %self.cluster_id, %stage, %error, "stage failed"),
            None => tracing::debug!(
                cluster = %self.cluster_id,
                %stage,
                summary = %result.summary(),
                "stage completed"
            ),
        }
        self.stages.push(StageReport {
            stage,
            result,
            error,
        });
    }

    /// Stages in the order they ran
    pub fn sequence(&self) -> Vec<S> {
        self.stages.iter().map(|s| s.stage).collect()
    }

    pub fn stage(&self, stage: S) -> Option<&StageReport<S>> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn failed_stages(&self) -> Vec<S> {
        self.stages
            .iter()
            .filter(|s| !s.is_success())
            .map(|s| s.stage)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.stages.iter().all(StageReport::is_success)
    }

    /// Resources of `kind` created over the whole run
    pub fn created(&self, kind: ResourceKind) -> usize {
        self.stages.iter().map(|s| s.result.created(kind)).sum()
    }

    /// Counts over every stage
    pub fn summary(&self) -> ApplySummary {
        let mut all = ApplyResult::new();
        for stage in &self.stages {
            all.extend(stage.result.clone());
        }
        all.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterflow_cloud::ActionType;

    #[test]
    fn test_stage_display() {
        let rendered: Vec<String> = [
            CreateStage::MasterInstances { count: 1 },
            CreateStage::WorkerInstances { count: 3 },
            CreateStage::ConsistencyCheck { passed: true },
            CreateStage::ConsistencyCheck { passed: false },
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(
            rendered,
            [
                "MasterInstances(1)",
                "WorkerInstances(3)",
                "ConsistencyCheck(pass)",
                "ConsistencyCheck(fail)"
            ]
        );
        assert_eq!(DeleteStage::ObjectStoreObjects.to_string(), "ObjectStoreObjects");
    }

    #[test]
    fn test_report_aggregation() {
        let mut report = CreateReport::new("c1");

        let mut masters = ApplyResult::new();
        masters.add_success(ResourceKind::Instance, "c1-master-0", ActionType::Create);
        report.push(CreateStage::MasterInstances { count: 1 }, masters, None);

        let mut keys = ApplyResult::new();
        keys.add_failure(ResourceKind::KmsKey, "c1-tls", ActionType::Create, "alias exists");
        report.push(CreateStage::KeyMaterial, keys, Some("alias exists".into()));

        assert_eq!(report.created(ResourceKind::Instance), 1);
        assert_eq!(report.failed_stages(), vec![CreateStage::KeyMaterial]);
        assert!(!report.is_success());
        assert_eq!(report.summary().failed, 1);
        assert!(report.stage(CreateStage::LoadBalancer).is_none());
    }

    #[test]
    fn test_tolerated_stages() {
        assert!(CreateStage::KeyMaterial.is_tolerated());
        assert!(CreateStage::IdentityPolicy.is_tolerated());
        assert!(!CreateStage::ObjectStore.is_tolerated());
        assert!(!CreateStage::MasterInstances { count: 1 }.is_tolerated());
    }
}
