//! Create sequence
//!
//! Stages run strictly in order and each one's outputs are handed to the
//! next explicitly. A failing stage aborts the run, except for the key
//! material and identity policy stages whose failures are only recorded.

use super::consistency::{self, Consistency};
use super::{ReconcileOutcome, Reconciler, create_tracked, elapsed_ms, ensure_tracked};
use crate::composer::Composer;
use crate::error::{OperatorError, Result};
use crate::naming::MachineRole;
use crate::render::bootstrap_script;
use crate::spec::MachineSpec;
use crate::stage::{CreateReport, CreateStage};
use crate::tls::{CompactTlsAssets, RawTlsAssets, TlsAsset};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clusterflow_cloud::{
    ActionType, ApplyResult, HasArn, HasDnsName, HasId, HasName, ResourceKind, ensure,
};
use clusterflow_cloud_aws::{Instance, KmsKey};
use futures_util::future::join_all;
use std::time::Instant;

/// Network boundary created in the namespace stage
struct Network {
    vpc_id: String,
    security_group_id: String,
}

/// Base64 bootstrap scripts per role
struct UserData {
    master: String,
    worker: String,
}

impl UserData {
    fn for_role(&self, role: MachineRole) -> &str {
        match role {
            MachineRole::Master => &self.master,
            MachineRole::Worker => &self.worker,
        }
    }
}

/// A stage that aborted the run
struct Abort(CreateStage, OperatorError);

type StageResult<T> = std::result::Result<T, Abort>;

struct CreateRun<'r, 'c> {
    reconciler: &'r Reconciler,
    composer: &'r Composer<'c>,
    report: CreateReport,
}

impl Reconciler {
    pub(super) async fn create(&self, composer: &Composer<'_>) -> ReconcileOutcome {
        let mut run = CreateRun {
            reconciler: self,
            composer,
            report: CreateReport::new(&composer.spec().cluster_id),
        };
        let aborted = run.execute().await.err();
        let mut report = run.report;

        // Runs after an abort too: instances launched before the failing
        // stage still count.
        let consistency = consistency::check(&report);
        let error = match &consistency {
            Consistency::Consistent => None,
            Consistency::Inconsistent { reason } => Some(reason.clone()),
        };
        report.push(
            CreateStage::ConsistencyCheck {
                passed: consistency.is_consistent(),
            },
            ApplyResult::new(),
            error,
        );

        match (consistency, aborted) {
            (Consistency::Inconsistent { reason }, _) => {
                ReconcileOutcome::Inconsistent { report, reason }
            }
            (Consistency::Consistent, Some(Abort(stage, error))) => ReconcileOutcome::Failed {
                report,
                stage,
                error,
            },
            (Consistency::Consistent, None) => {
                report.push(CreateStage::Done, ApplyResult::new(), None);
                ReconcileOutcome::Created(report)
            }
        }
    }
}

impl CreateRun<'_, '_> {
    fn cluster_id(&self) -> &str {
        &self.composer.spec().cluster_id
    }

    /// Record a stage and abort on error
    fn finish<T>(
        &mut self,
        stage: CreateStage,
        mut result: ApplyResult,
        started: Instant,
        outcome: Result<T>,
    ) -> StageResult<T> {
        result.duration_ms = elapsed_ms(started);
        match outcome {
            Ok(value) => {
                self.report.push(stage, result, None);
                Ok(value)
            }
            Err(e) => {
                self.report.push(stage, result, Some(e.to_string()));
                Err(Abort(stage, e))
            }
        }
    }

    /// Record a stage that produced its value but may carry an error.
    ///
    /// The error aborts the run unless the stage is tolerated.
    fn record(
        &mut self,
        stage: CreateStage,
        mut result: ApplyResult,
        started: Instant,
        error: Option<OperatorError>,
    ) -> StageResult<()> {
        result.duration_ms = elapsed_ms(started);
        match error {
            None => {
                self.report.push(stage, result, None);
                Ok(())
            }
            Some(e) if stage.is_tolerated() => {
                tracing::warn!(cluster = %self.cluster_id(), %stage, error = %e, "continuing after stage failure");
                self.report.push(stage, result, Some(e.to_string()));
                Ok(())
            }
            Some(e) => {
                self.report.push(stage, result, Some(e.to_string()));
                Err(Abort(stage, e))
            }
        }
    }

    async fn execute(&mut self) -> StageResult<()> {
        let spec = self.composer.spec();

        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self.namespace(&mut result).await;
        let network = self.finish(CreateStage::Namespace, result, started, outcome)?;

        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self.key_pair(&mut result).await;
        self.finish(CreateStage::KeyPair, result, started, outcome)?;

        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self.certificates(&mut result).await;
        let raw = self.finish(CreateStage::Certificates, result, started, outcome)?;

        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let kms = match self.key_material(&mut result).await {
            Ok((kms, tolerated)) => {
                self.record(CreateStage::KeyMaterial, result, started, tolerated)?;
                kms
            }
            Err(e) => return self.finish(CreateStage::KeyMaterial, result, started, Err(e)),
        };

        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self.encrypt_assets(&raw, &kms, &mut result).await;
        let tls = self.finish(CreateStage::EncryptedAssets, result, started, outcome)?;

        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self.identity(kms.arn(), &mut result).await;
        self.record(CreateStage::IdentityPolicy, result, started, outcome.err())?;

        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self.object_store(&tls, &mut result).await;
        let user_data = self.finish(CreateStage::ObjectStore, result, started, outcome)?;

        let stage = CreateStage::MasterInstances {
            count: spec.masters.len(),
        };
        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self
            .launch(MachineRole::Master, &spec.masters, &network, &user_data, &mut result)
            .await;
        let master_ids = self.finish(stage, result, started, outcome)?;

        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self
            .load_balancer(&network.security_group_id, &master_ids, &mut result)
            .await;
        self.finish(CreateStage::LoadBalancer, result, started, outcome)?;

        let stage = CreateStage::WorkerInstances {
            count: spec.workers.len(),
        };
        let (mut result, started) = (ApplyResult::new(), Instant::now());
        let outcome = self
            .launch(MachineRole::Worker, &spec.workers, &network, &user_data, &mut result)
            .await;
        self.finish(stage, result, started, outcome)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    async fn namespace(&self, result: &mut ApplyResult) -> Result<Network> {
        let cluster_id = self.cluster_id();
        match self.reconciler.namespaces.create(cluster_id).await {
            Ok(created) => {
                result.add_success(
                    ResourceKind::Namespace,
                    cluster_id,
                    ActionType::from_created(created),
                );
            }
            Err(e) => {
                result.add_failure(ResourceKind::Namespace, cluster_id, ActionType::Create, &e);
                return Err(e);
            }
        }

        let mut vpc = self.composer.vpc();
        ensure_tracked(&mut vpc, result).await?;

        let mut gateway = self.composer.gateway(vpc.id())?;
        ensure_tracked(&mut gateway, result).await?;

        let mut group = self.composer.security_group(vpc.id())?;
        ensure_tracked(&mut group, result).await?;

        Ok(Network {
            vpc_id: vpc.id().to_string(),
            security_group_id: group.id().to_string(),
        })
    }

    async fn key_pair(&self, result: &mut ApplyResult) -> Result<()> {
        let mut key_pair = self.composer.key_pair();
        ensure_tracked(&mut key_pair, result).await?;
        Ok(())
    }

    async fn certificates(&self, result: &mut ApplyResult) -> Result<RawTlsAssets> {
        let certs_dir = &self.reconciler.settings.certs_dir;
        match RawTlsAssets::read(certs_dir).await {
            Ok(raw) => {
                for asset in &raw.assets {
                    result.add_success(
                        ResourceKind::TlsAsset,
                        TlsAsset::file_name(asset.component, asset.asset_type),
                        ActionType::Reuse,
                    );
                }
                tracing::debug!(certs_dir = %certs_dir.display(), count = raw.len(), "TLS assets loaded");
                Ok(raw)
            }
            Err(e) => {
                result.add_failure(
                    ResourceKind::TlsAsset,
                    certs_dir.display().to_string(),
                    ActionType::Reuse,
                    &e,
                );
                Err(e)
            }
        }
    }

    /// A fresh key is created on every run. When that fails (the alias
    /// already points at the key of an earlier run) the failure is kept for
    /// the consistency check and the key is re-resolved by alias.
    async fn key_material(
        &self,
        result: &mut ApplyResult,
    ) -> Result<(KmsKey, Option<OperatorError>)> {
        let mut kms = self.composer.kms_key();
        match create_tracked(&mut kms, ActionType::Create, result).await {
            Ok(()) => Ok((kms, None)),
            Err(e) => {
                tracing::warn!(alias = %kms.alias(), error = %e, "key creation failed, resolving alias");
                kms.resolve().await?;
                Ok((kms, Some(e)))
            }
        }
    }

    async fn encrypt_assets(
        &self,
        raw: &RawTlsAssets,
        kms: &KmsKey,
        result: &mut ApplyResult,
    ) -> Result<CompactTlsAssets> {
        let encrypted = match raw.encrypt(kms).await {
            Ok(encrypted) => encrypted,
            Err(e) => {
                result.add_failure(ResourceKind::TlsAsset, kms.alias(), ActionType::Update, &e);
                return Err(e);
            }
        };
        for asset in &encrypted.assets {
            result.add_success(ResourceKind::TlsAsset, asset.key(), ActionType::Update);
        }
        Ok(encrypted.compact())
    }

    async fn identity(&self, key_arn: &str, result: &mut ApplyResult) -> Result<()> {
        let mut role = self.composer.role();
        ensure_tracked(&mut role, result).await?;

        let mut policy = self.composer.policy(key_arn)?;
        ensure_tracked(&mut policy, result).await?;

        let mut profile = self.composer.instance_profile();
        ensure_tracked(&mut profile, result).await?;
        Ok(())
    }

    /// Render, upload and mirror the cloud-config of every role
    async fn object_store(
        &self,
        tls: &CompactTlsAssets,
        result: &mut ApplyResult,
    ) -> Result<UserData> {
        let composer = self.composer;
        let mut bucket = composer.bucket();
        ensure_tracked(&mut bucket, result).await?;

        let mut scripts = Vec::with_capacity(MachineRole::ALL.len());
        for role in MachineRole::ALL {
            let content = match self.reconciler.renderer.render(role, composer.spec(), tls) {
                Ok(content) => content,
                Err(e) => {
                    result.add_failure(ResourceKind::Object, role.as_str(), ActionType::Update, &e);
                    return Err(e);
                }
            };

            let mut object = composer.cloud_config(role, content);
            create_tracked(&mut object, ActionType::Update, result).await?;
            self.reconciler
                .namespaces
                .write_file(
                    self.cluster_id(),
                    &format!("cloudconfig-{}.yaml", role),
                    &object.body,
                )
                .await?;

            let script = bootstrap_script(&composer.clients().region, bucket.name(), &object.key);
            scripts.push(STANDARD.encode(script));
        }

        let worker = scripts.pop().unwrap_or_default();
        let master = scripts.pop().unwrap_or_default();
        Ok(UserData { master, worker })
    }

    /// Launch the machines of one role, returning their instance ids in
    /// index order
    async fn launch(
        &self,
        role: MachineRole,
        machines: &[MachineSpec],
        network: &Network,
        user_data: &UserData,
        result: &mut ApplyResult,
    ) -> Result<Vec<String>> {
        let mut instances = machines
            .iter()
            .enumerate()
            .map(|(index, machine)| {
                self.composer.instance(
                    role,
                    index,
                    machine,
                    &network.security_group_id,
                    user_data.for_role(role),
                )
            })
            .collect::<clusterflow_cloud::Result<Vec<Instance>>>()?;

        if self.reconciler.settings.parallel_launch && instances.len() > 1 {
            tracing::debug!(%role, count = instances.len(), vpc = %network.vpc_id, "launching in parallel");
            let outcomes = join_all(instances.iter_mut().map(|instance| ensure(instance))).await;

            let mut first_error = None;
            for (instance, outcome) in instances.iter().zip(outcomes) {
                match outcome {
                    Ok(created) => result.add_success(
                        ResourceKind::Instance,
                        instance.name(),
                        ActionType::from_created(created),
                    ),
                    Err(e) => {
                        result.add_failure(
                            ResourceKind::Instance,
                            instance.name(),
                            ActionType::Create,
                            &e,
                        );
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e.into());
            }
        } else {
            for instance in instances.iter_mut() {
                ensure_tracked(instance, result).await?;
            }
        }

        Ok(instances.iter().map(|i| i.id().to_string()).collect())
    }

    /// Load balancer in front of the masters, plus the DNS records of the
    /// declared domains
    async fn load_balancer(
        &self,
        security_group_id: &str,
        master_ids: &[String],
        result: &mut ApplyResult,
    ) -> Result<()> {
        let composer = self.composer;
        let mut lb = composer.load_balancer(security_group_id)?;
        ensure_tracked(&mut lb, result).await?;

        match lb.register_instances(master_ids).await {
            Ok(()) => result.add_success(ResourceKind::LoadBalancer, lb.name(), ActionType::Update),
            Err(e) => {
                result.add_failure(ResourceKind::LoadBalancer, lb.name(), ActionType::Update, &e);
                return Err(e.into());
            }
        }

        if let Some(domains) = &composer.spec().domains {
            for domain in domains.all() {
                let mut zone = composer.hosted_zone(domain)?;
                ensure_tracked(&mut zone, result).await?;

                let mut record =
                    composer.record_set(domain, zone.id(), lb.dns_name(), lb.hosted_zone_id())?;
                create_tracked(&mut record, ActionType::Update, result).await?;
            }
        }
        Ok(())
    }
}
