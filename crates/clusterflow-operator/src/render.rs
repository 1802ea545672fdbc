//! Cloud-config rendering
//!
//! Master and worker machines boot from a rendered cloud-config that carries
//! the encrypted TLS assets of their role. The rendered content is uploaded
//! to the cluster bucket; the instance user data is only a small bootstrap
//! script that fetches it.

use crate::error::Result;
use crate::naming::{ClusterNames, MachineRole};
use crate::spec::{ClusterSpec, MachineSpec};
use crate::tls::{CompactTlsAssets, TlsAssetType, TlsComponent};
use clusterflow_config::TemplatePaths;
use serde::Serialize;
use std::path::Path;
use tera::{Context, Tera};

const MASTER_TEMPLATE: &str = "master.yaml";
const WORKER_TEMPLATE: &str = "worker.yaml";

const BUILTIN_MASTER: &str = include_str!("../templates/master.yaml.tera");
const BUILTIN_WORKER: &str = include_str!("../templates/worker.yaml.tera");

/// Directory the decrypt unit scans on the machine
pub const SSL_DIR: &str = "/etc/kubernetes/ssl";

/// Renders the boot configuration of one machine role
pub trait CloudConfigRenderer: Send + Sync {
    fn render(
        &self,
        role: MachineRole,
        spec: &ClusterSpec,
        tls: &CompactTlsAssets,
    ) -> Result<String>;
}

/// An encrypted file written onto the machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsFile {
    pub path: String,
    pub content: String,
}

#[derive(Serialize)]
struct MachineContext<'a> {
    name: String,
    #[serde(flatten)]
    spec: &'a MachineSpec,
}

/// Encrypted assets a role needs, with their on-machine paths.
///
/// Workers talk to etcd as clients, so the etcd server assets are placed
/// under the client name there.
pub fn role_files(role: MachineRole, tls: &CompactTlsAssets) -> Vec<TlsFile> {
    let placements: &[(TlsComponent, &str)] = match role {
        MachineRole::Master => &[
            (TlsComponent::ApiServer, "apiserver"),
            (TlsComponent::ServiceAccount, "service-account"),
            (TlsComponent::CalicoClient, "calico/client"),
            (TlsComponent::EtcdServer, "etcd/server"),
        ],
        MachineRole::Worker => &[
            (TlsComponent::Worker, "worker"),
            (TlsComponent::CalicoClient, "calico/client"),
            (TlsComponent::EtcdServer, "etcd/client"),
        ],
    };

    let mut files = Vec::new();
    for (component, prefix) in placements {
        for asset_type in TlsAssetType::ALL {
            if let Some(content) = tls.get(*component, asset_type) {
                files.push(TlsFile {
                    path: format!("{}/{}-{}.pem.enc", SSL_DIR, prefix, asset_type.as_str()),
                    content: content.to_string(),
                });
            }
        }
    }
    files
}

/// Tera backed renderer with one template per role.
///
/// Templates see `cluster`, `role`, `domains`, `machines`, `tls` and the
/// role's `files`.
pub struct TeraRenderer {
    tera: Tera,
}

impl TeraRenderer {
    /// Renderer using the templates shipped with the operator
    pub fn builtin() -> Result<Self> {
        Self::from_sources(BUILTIN_MASTER, BUILTIN_WORKER)
    }

    /// Renderer using the configured template files, falling back to the
    /// built-in template for a role without one.
    pub fn from_paths(paths: &TemplatePaths) -> Result<Self> {
        let master = read_or(paths.master.as_deref(), BUILTIN_MASTER)?;
        let worker = read_or(paths.worker.as_deref(), BUILTIN_WORKER)?;
        Self::from_sources(&master, &worker)
    }

    fn from_sources(master: &str, worker: &str) -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(MASTER_TEMPLATE, master)?;
        tera.add_raw_template(WORKER_TEMPLATE, worker)?;
        Ok(Self { tera })
    }

    fn template_name(role: MachineRole) -> &'static str {
        match role {
            MachineRole::Master => MASTER_TEMPLATE,
            MachineRole::Worker => WORKER_TEMPLATE,
        }
    }
}

fn read_or(path: Option<&Path>, builtin: &str) -> Result<String> {
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading cloud-config template");
            Ok(std::fs::read_to_string(path)?)
        }
        None => Ok(builtin.to_string()),
    }
}

impl CloudConfigRenderer for TeraRenderer {
    fn render(
        &self,
        role: MachineRole,
        spec: &ClusterSpec,
        tls: &CompactTlsAssets,
    ) -> Result<String> {
        let names = ClusterNames::new(&spec.cluster_id);
        let machines = match role {
            MachineRole::Master => &spec.masters,
            MachineRole::Worker => &spec.workers,
        };
        let machines: Vec<MachineContext<'_>> = machines
            .iter()
            .enumerate()
            .map(|(index, machine)| MachineContext {
                name: names.machine(role, index),
                spec: machine,
            })
            .collect();

        let mut context = Context::new();
        context.insert("cluster", spec);
        context.insert("role", &role);
        context.insert("domains", &spec.domains);
        context.insert("machines", &machines);
        context.insert("tls", tls);
        context.insert("files", &role_files(role, tls));

        Ok(self.tera.render(Self::template_name(role), &context)?)
    }
}

/// Instance user data: fetch the role's cloud-config from the bucket and
/// hand it to the machine's cloud-init.
pub fn bootstrap_script(region: &str, bucket: &str, key: &str) -> String {
    format!(
        "#!/bin/bash -e\n\
         USERDATA_FILE=/var/run/coreos/cloudconfig.yaml\n\
         mkdir -p $(dirname $USERDATA_FILE)\n\
         /usr/bin/rkt run --net=host --volume=dns,kind=host,source=/etc/resolv.conf \
         --mount volume=dns,target=/etc/resolv.conf --volume=userdata,kind=host,source=$(dirname $USERDATA_FILE) \
         --mount volume=userdata,target=$(dirname $USERDATA_FILE) --trust-keys-from-https quay.io/coreos/awscli:025a357f05242fdad6a81e8a6b520098aa65a600 \
         -- aws s3 --region {region} cp s3://{bucket}/{key} $USERDATA_FILE\n\
         exec /usr/bin/coreos-cloudinit --from-file $USERDATA_FILE\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::DomainSpec;
    use crate::spec::fixtures::spec;

    fn tls() -> CompactTlsAssets {
        let mut map = std::collections::BTreeMap::new();
        for component in TlsComponent::ALL {
            for asset_type in TlsAssetType::ALL {
                map.insert(
                    format!("{}_{}", component.key_prefix(), asset_type.as_str()),
                    format!("enc-{}-{}", component.key_prefix(), asset_type.as_str()),
                );
            }
        }
        CompactTlsAssets(map)
    }

    #[test]
    fn test_role_files() {
        let tls = tls();
        let master = role_files(MachineRole::Master, &tls);
        assert_eq!(master.len(), 12);
        assert!(master.iter().any(|f| f.path == "/etc/kubernetes/ssl/apiserver-key.pem.enc"));
        assert!(!master.iter().any(|f| f.path.contains("worker")));

        let worker = role_files(MachineRole::Worker, &tls);
        assert_eq!(worker.len(), 9);
        let etcd = worker
            .iter()
            .find(|f| f.path == "/etc/kubernetes/ssl/etcd/client-crt.pem.enc")
            .unwrap();
        assert_eq!(etcd.content, "enc-etcd_server-crt");
        assert!(!worker.iter().any(|f| f.path.contains("apiserver")));
    }

    #[test]
    fn test_builtin_templates_render() {
        let renderer = TeraRenderer::builtin().unwrap();
        let mut spec = spec("c1", 1, 2);
        spec.domains = Some(DomainSpec {
            api: "api.c1.g8s.eu-west-1.acme.example.com".into(),
            etcd: "etcd.c1.g8s.eu-west-1.acme.example.com".into(),
        });

        let master = renderer.render(MachineRole::Master, &spec, &tls()).unwrap();
        assert!(master.starts_with("#cloud-config"));
        assert!(master.contains("content: enc-apiserver-crt"));
        assert!(master.contains("API_DOMAIN=api.c1.g8s.eu-west-1.acme.example.com"));
        assert!(master.contains("MASTER_COUNT=1"));

        let worker = renderer.render(MachineRole::Worker, &spec, &tls()).unwrap();
        assert!(worker.contains("/etc/kubernetes/ssl/etcd/client-key.pem.enc"));
        assert!(worker.contains("REGION=eu-west-1"));
        assert!(!worker.contains("apiserver-crt.pem.enc"));
    }

    #[test]
    fn test_custom_template_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.tmpl");
        std::fs::write(
            &path,
            "{% for m in machines %}{{ m.name }}={{ m.instanceType }}\n{% endfor %}",
        )
        .unwrap();

        let renderer = TeraRenderer::from_paths(&TemplatePaths {
            master: None,
            worker: Some(path),
        })
        .unwrap();
        let out = renderer
            .render(MachineRole::Worker, &spec("c1", 1, 2), &tls())
            .unwrap();
        assert_eq!(out, "c1-worker-0=m5.large\nc1-worker-1=m5.large\n");
    }

    #[test]
    fn test_bad_template_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.tmpl");
        std::fs::write(&path, "{% if %}").unwrap();
        let result = TeraRenderer::from_paths(&TemplatePaths {
            master: Some(path),
            worker: None,
        });
        assert!(matches!(result, Err(crate::OperatorError::Template(_))));
    }

    #[test]
    fn test_bootstrap_script() {
        let script = bootstrap_script("eu-west-1", "c1-cloudconfig", "cloudconfig/master");
        assert!(script.starts_with("#!/bin/bash -e\n"));
        assert!(script.contains("aws s3 --region eu-west-1 cp s3://c1-cloudconfig/cloudconfig/master"));
    }
}
