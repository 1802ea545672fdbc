//! Cluster reconciler
//!
//! Entry point invoked once per cluster event. It owns the whole create or
//! delete sequence and turns it into a single [`ReconcileOutcome`]. Nothing
//! is kept between events: every run re-resolves its resources by name.

mod consistency;
mod create;
mod delete;

pub use consistency::{Consistency, check as check_consistency};

use crate::clients::ClientFactory;
use crate::composer::Composer;
use crate::error::{OperatorError, Result};
use crate::event::ClusterEvent;
use crate::namespace::{DirNamespaceStore, NamespaceStore};
use crate::render::{CloudConfigRenderer, TeraRenderer};
use crate::stage::{CreateReport, CreateStage, DeleteReport};
use clusterflow_cloud::{
    ActionType, ApplyResult, ErrorKind, Resource, RetryConfig, Reusable, ensure,
};
use clusterflow_cloud_aws::Listener;
use clusterflow_config::OperatorConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// Operator-wide knobs shared by every run
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub certs_dir: PathBuf,
    pub retry: RetryConfig,
    pub listener: Listener,
    /// Launch the machines of one role concurrently
    pub parallel_launch: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from_config(&OperatorConfig::default())
    }
}

impl ReconcilerSettings {
    pub fn from_config(config: &OperatorConfig) -> Self {
        let retry = &config.retry;
        let lb = &config.load_balancer;
        Self {
            certs_dir: config.operator.certs_dir.clone(),
            retry: RetryConfig {
                initial_delay: retry.initial_delay(),
                max_delay: retry.max_delay(),
                backoff_multiplier: retry.multiplier,
                deadline: retry.deadline(),
            },
            listener: Listener {
                protocol: lb.protocol.clone(),
                load_balancer_port: i32::from(lb.port),
                instance_port: i32::from(lb.instance_port),
            },
            parallel_launch: config.operator.parallel_launch,
        }
    }
}

/// Final result of one event
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Every create stage succeeded and the cluster is consistent
    Created(CreateReport),
    /// A create stage failed; the remaining stages did not run
    Failed {
        report: CreateReport,
        stage: CreateStage,
        error: OperatorError,
    },
    /// Instances exist without verified prerequisites
    Inconsistent { report: CreateReport, reason: String },
    /// Teardown ran to the end; individual stages may have failed
    Deleted(DeleteReport),
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            ReconcileOutcome::Created(_) => true,
            ReconcileOutcome::Deleted(report) => report.is_success(),
            ReconcileOutcome::Failed { .. } | ReconcileOutcome::Inconsistent { .. } => false,
        }
    }

    /// Error class of an unsuccessful creation
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ReconcileOutcome::Failed { error, .. } => Some(error.kind()),
            ReconcileOutcome::Inconsistent { .. } => Some(ErrorKind::Inconsistent),
            ReconcileOutcome::Created(_) | ReconcileOutcome::Deleted(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created(_) => "created",
            ReconcileOutcome::Failed { .. } => "failed",
            ReconcileOutcome::Inconsistent { .. } => "inconsistent",
            ReconcileOutcome::Deleted(_) => "deleted",
        }
    }
}

pub struct Reconciler {
    factory: Arc<dyn ClientFactory>,
    namespaces: Arc<dyn NamespaceStore>,
    renderer: Arc<dyn CloudConfigRenderer>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        namespaces: Arc<dyn NamespaceStore>,
        renderer: Arc<dyn CloudConfigRenderer>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            factory,
            namespaces,
            renderer,
            settings,
        }
    }

    /// Reconciler with the directory namespace store and the configured
    /// templates
    pub fn from_config(config: &OperatorConfig, factory: Arc<dyn ClientFactory>) -> Result<Self> {
        let renderer = TeraRenderer::from_paths(&config.operator.templates)?;
        Ok(Self::new(
            factory,
            Arc::new(DirNamespaceStore::new(&config.operator.work_dir)),
            Arc::new(renderer),
            ReconcilerSettings::from_config(config),
        ))
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Handle one event.
    ///
    /// `Err` is returned only when the run could not start (invalid spec,
    /// no provider clients); stage failures are part of the outcome.
    #[tracing::instrument(skip_all, fields(cluster = %event.cluster_id(), action = event.action()))]
    pub async fn handle(&self, event: ClusterEvent) -> Result<ReconcileOutcome> {
        let spec = event.spec();
        spec.validate()?;

        let clients = self.factory.clients(&spec.region).await?;
        let composer = Composer::new(
            clients,
            spec,
            self.settings.retry.clone(),
            self.settings.listener.clone(),
        );

        let outcome = match &event {
            ClusterEvent::Add(_) => self.create(&composer).await,
            ClusterEvent::Delete(_) => ReconcileOutcome::Deleted(self.delete(&composer).await),
        };

        match &outcome {
            ReconcileOutcome::Created(report) => {
                tracing::info!(summary = %report.summary(), "cluster created");
            }
            ReconcileOutcome::Failed { stage, error, .. } => {
                tracing::error!(%stage, %error, "cluster creation failed");
            }
            ReconcileOutcome::Inconsistent { reason, .. } => {
                tracing::error!(%reason, "cluster is inconsistent, manual intervention required");
            }
            ReconcileOutcome::Deleted(report) => {
                let failed = report.failed_stages();
                if failed.is_empty() {
                    tracing::info!(summary = %report.summary(), "cluster deleted");
                } else {
                    tracing::warn!(
                        summary = %report.summary(),
                        failed = ?failed,
                        "cluster deleted with failures"
                    );
                }
            }
        }
        Ok(outcome)
    }
}

/// Elapsed milliseconds since `start`
fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// `ensure` with the outcome recorded in `result`
async fn ensure_tracked<R: Reusable + ?Sized>(
    resource: &mut R,
    result: &mut ApplyResult,
) -> Result<bool> {
    match ensure(resource).await {
        Ok(created) => {
            result.add_success(
                resource.kind(),
                resource.label(),
                ActionType::from_created(created),
            );
            Ok(created)
        }
        Err(e) => {
            result.add_failure(resource.kind(), resource.label(), ActionType::Create, &e);
            Err(e.into())
        }
    }
}

/// `create_or_fail` with the outcome recorded in `result`
async fn create_tracked<R: Resource + ?Sized>(
    resource: &mut R,
    action: ActionType,
    result: &mut ApplyResult,
) -> Result<()> {
    match resource.create_or_fail().await {
        Ok(()) => {
            result.add_success(resource.kind(), resource.label(), action);
            Ok(())
        }
        Err(e) => {
            result.add_failure(resource.kind(), resource.label(), action, &e);
            Err(e.into())
        }
    }
}

/// `delete` with the outcome recorded in `result`
async fn delete_tracked<R: Resource + ?Sized>(
    resource: &mut R,
    result: &mut ApplyResult,
) -> Result<()> {
    match resource.delete().await {
        Ok(()) => {
            tracing::info!(kind = %resource.kind(), name = resource.label(), "deleted");
            result.add_success(resource.kind(), resource.label(), ActionType::Delete);
            Ok(())
        }
        Err(e) => {
            result.add_failure(resource.kind(), resource.label(), ActionType::Delete, &e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterflow_config::parse_config_str;

    #[test]
    fn test_settings_from_config() {
        let config = parse_config_str(
            r#"
            operator {
                certs-dir "/tmp/certs"
                parallel-launch #true
            }
            retry {
                initial-delay-ms 100
                deadline-secs 30
            }
            load-balancer {
                port 8443
                protocol "SSL"
            }
            "#,
        )
        .unwrap();

        let settings = ReconcilerSettings::from_config(&config);
        assert_eq!(settings.certs_dir, PathBuf::from("/tmp/certs"));
        assert!(settings.parallel_launch);
        assert_eq!(settings.retry.initial_delay.as_millis(), 100);
        assert_eq!(settings.retry.deadline.as_secs(), 30);
        assert_eq!(settings.listener.load_balancer_port, 8443);
        assert_eq!(settings.listener.instance_port, 6443);
        assert_eq!(settings.listener.protocol, "SSL");
    }

    #[test]
    fn test_default_settings_match_default_config() {
        let settings = ReconcilerSettings::default();
        assert_eq!(settings.retry, RetryConfig::default());
        assert_eq!(settings.listener, Listener::default());
        assert!(!settings.parallel_launch);
    }
}
