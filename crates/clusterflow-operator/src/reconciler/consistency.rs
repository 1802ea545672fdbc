//! Consistency check of a creation run
//!
//! A run that created machines while the key material or identity policy
//! stage failed leaves instances whose prerequisites could not be verified.
//! That state needs an operator: it is never retried or torn down
//! automatically.

use crate::stage::{CreateReport, CreateStage};
use clusterflow_cloud::ResourceKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consistency {
    Consistent,
    Inconsistent { reason: String },
}

impl Consistency {
    pub fn is_consistent(&self) -> bool {
        matches!(self, Consistency::Consistent)
    }
}

pub fn check(report: &CreateReport) -> Consistency {
    let created = report.created(ResourceKind::Instance);
    if created == 0 {
        return Consistency::Consistent;
    }

    let failed: Vec<String> = [CreateStage::KeyMaterial, CreateStage::IdentityPolicy]
        .into_iter()
        .filter_map(|stage| report.stage(stage))
        .filter(|s| !s.is_success())
        .map(|s| match &s.error {
            Some(error) => format!("{}: {}", s.stage, error),
            None => s.stage.to_string(),
        })
        .collect();

    if failed.is_empty() {
        Consistency::Consistent
    } else {
        Consistency::Inconsistent {
            reason: format!(
                "{} instance(s) created without verified prerequisites ({})",
                created,
                failed.join("; ")
            ),
        }
    }
}
