use clusterflow_cloud::RetryConfig;
use clusterflow_cloud_aws::memory::MemoryCloud;
use clusterflow_operator::{
    ClusterEvent, ClusterSpec, DirNamespaceStore, DomainSpec, MachineSpec, MemoryClientFactory,
    NetworkSpec, ReconcileOutcome, Reconciler, ReconcilerSettings, TeraRenderer, TlsAsset,
    TlsAssetType, TlsComponent,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A reconciler wired to an in-memory cloud, a temporary work directory
/// and a complete set of fake certificates
pub struct TestOperator {
    pub cloud: MemoryCloud,
    pub reconciler: Reconciler,
    pub root: TempDir,
}

impl TestOperator {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(adjust: impl FnOnce(&mut ReconcilerSettings)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let certs_dir = root.path().join("certs");
        write_certs(&certs_dir);

        let mut settings = ReconcilerSettings {
            certs_dir,
            retry: RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
                deadline: Duration::from_millis(200),
            },
            ..ReconcilerSettings::default()
        };
        adjust(&mut settings);

        let cloud = MemoryCloud::new("eu-west-1");
        let reconciler = Reconciler::new(
            Arc::new(MemoryClientFactory::new(cloud.clone())),
            Arc::new(DirNamespaceStore::new(root.path().join("work"))),
            Arc::new(TeraRenderer::builtin().unwrap()),
            settings,
        );
        Self {
            cloud,
            reconciler,
            root,
        }
    }

    pub async fn create(&self, spec: &ClusterSpec) -> ReconcileOutcome {
        self.reconciler
            .handle(ClusterEvent::Add(spec.clone()))
            .await
            .unwrap()
    }

    pub async fn delete(&self, spec: &ClusterSpec) -> ReconcileOutcome {
        self.reconciler
            .handle(ClusterEvent::Delete(spec.clone()))
            .await
            .unwrap()
    }

    #[allow(dead_code)]
    pub fn namespace_dir(&self, cluster_id: &str) -> PathBuf {
        DirNamespaceStore::new(self.root.path().join("work")).path(cluster_id)
    }
}

pub fn spec(cluster_id: &str, masters: usize, workers: usize) -> ClusterSpec {
    let machine = MachineSpec {
        image_id: "ami-0a1b2c3d".into(),
        instance_type: "m5.large".into(),
    };
    ClusterSpec {
        cluster_id: cluster_id.into(),
        region: "eu-west-1".into(),
        availability_zone: String::new(),
        network: NetworkSpec {
            vpc_cidr: "10.0.0.0/16".into(),
        },
        masters: vec![machine.clone(); masters],
        workers: vec![machine; workers],
        domains: None,
        ssh_public_key: None,
    }
}

#[allow(dead_code)]
pub fn with_domains(mut spec: ClusterSpec) -> ClusterSpec {
    let id = spec.cluster_id.clone();
    spec.domains = Some(DomainSpec {
        api: format!("api.{}.g8s.eu-west-1.acme.aws.example.io", id),
        etcd: format!("etcd.{}.g8s.eu-west-1.acme.aws.example.io", id),
    });
    spec
}

fn write_certs(dir: &Path) {
    for component in TlsComponent::ALL {
        for asset_type in TlsAssetType::ALL {
            let path = dir.join(TlsAsset::file_name(component, asset_type));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(
                path,
                format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n", component.key_prefix()),
            )
            .unwrap();
        }
    }
}
