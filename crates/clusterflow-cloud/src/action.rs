//! Per-resource action results

use crate::resource::ResourceKind;
use serde::{Deserialize, Serialize};

/// What happened to a resource during a reconcile step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// The resource was created by this run
    Create,
    /// An existing resource was found and reused
    Reuse,
    /// The resource was deleted (or its deletion scheduled)
    Delete,
    /// A follow-up call on an existing resource (attach, register, upload)
    Update,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Reuse => write!(f, "reuse"),
            ActionType::Delete => write!(f, "delete"),
            ActionType::Update => write!(f, "update"),
        }
    }
}

impl ActionType {
    /// Outcome of a `create_if_not_exists` call
    pub fn from_created(created: bool) -> Self {
        if created {
            ActionType::Create
        } else {
            ActionType::Reuse
        }
    }
}

/// Result of a single action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub kind: ResourceKind,

    /// Resource label (idempotency key, alias, domain...)
    pub name: String,

    pub action_type: ActionType,

    /// Whether the action succeeded
    pub success: bool,

    /// Error message if failed
    pub error: Option<String>,
}

/// Results of the actions taken within one stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Successfully applied actions
    pub succeeded: Vec<ActionResult>,

    /// Failed actions
    pub failed: Vec<ActionResult>,

    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl ApplyResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn add_success(&mut self, kind: ResourceKind, name: impl Into<String>, action: ActionType) {
        self.succeeded.push(ActionResult {
            kind,
            name: name.into(),
            action_type: action,
            success: true,
            error: None,
        });
    }

    pub fn add_failure(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        action: ActionType,
        error: impl ToString,
    ) {
        self.failed.push(ActionResult {
            kind,
            name: name.into(),
            action_type: action,
            success: false,
            error: Some(error.to_string()),
        });
    }

    /// Number of resources of `kind` this stage created
    pub fn created(&self, kind: ResourceKind) -> usize {
        self.succeeded
            .iter()
            .filter(|a| a.kind == kind && a.action_type == ActionType::Create)
            .count()
    }

    /// Merge another result into this one
    pub fn extend(&mut self, other: ApplyResult) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.duration_ms += other.duration_ms;
    }

    pub fn summary(&self) -> ApplySummary {
        let count = |t: ActionType| self.succeeded.iter().filter(|a| a.action_type == t).count();
        ApplySummary {
            created: count(ActionType::Create),
            reused: count(ActionType::Reuse),
            deleted: count(ActionType::Delete),
            updated: count(ActionType::Update),
            failed: self.failed.len(),
        }
    }
}

/// Summary of applied actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub reused: usize,
    pub deleted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl std::fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} reused, {} deleted, {} updated, {} failed",
            self.created, self.reused, self.deleted, self.updated, self.failed
        )
    }
}
