//! Deterministic resource names
//!
//! Every name derives from the cluster id, so deletion locates resources
//! without remembering provider ids between events.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    Master,
    Worker,
}

impl MachineRole {
    pub const ALL: [MachineRole; 2] = [MachineRole::Master, MachineRole::Worker];

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineRole::Master => "master",
            MachineRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for MachineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    cluster_id: String,
}

impl ClusterNames {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    fn suffixed(&self, suffix: &str) -> String {
        format!("{}-{}", self.cluster_id, suffix)
    }

    pub fn vpc(&self) -> String {
        self.suffixed("vpc")
    }

    pub fn gateway(&self) -> String {
        self.suffixed("gateway")
    }

    pub fn security_group(&self) -> String {
        self.suffixed("sg")
    }

    pub fn key_pair(&self) -> String {
        self.suffixed("key")
    }

    /// KMS alias name, without the `alias/` prefix
    pub fn kms_key(&self) -> String {
        self.suffixed("tls")
    }

    pub fn role(&self) -> String {
        self.suffixed("role")
    }

    pub fn policy(&self) -> String {
        self.suffixed("policy")
    }

    pub fn instance_profile(&self) -> String {
        self.suffixed("profile")
    }

    pub fn bucket(&self) -> String {
        clusterflow_cloud_aws::s3::bucket_name(&self.cluster_id)
    }

    pub fn load_balancer(&self) -> String {
        self.suffixed("api")
    }

    /// `<cluster>-<role>-<index>`
    pub fn machine(&self, role: MachineRole, index: usize) -> String {
        format!("{}{}", self.machine_prefix(role), index)
    }

    /// Name prefix shared by every machine of `role`
    pub fn machine_prefix(&self, role: MachineRole) -> String {
        format!("{}-{}-", self.cluster_id, role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_names() {
        let names = ClusterNames::new("pbmva");
        assert_eq!(names.machine(MachineRole::Master, 0), "pbmva-master-0");
        assert_eq!(names.machine(MachineRole::Worker, 3), "pbmva-worker-3");
        assert!(
            names
                .machine(MachineRole::Worker, 12)
                .starts_with(&names.machine_prefix(MachineRole::Worker))
        );
        assert!(
            !names
                .machine(MachineRole::Worker, 0)
                .starts_with(&names.machine_prefix(MachineRole::Master))
        );
    }

    #[test]
    fn test_resource_names() {
        let names = ClusterNames::new("c1");
        assert_eq!(names.bucket(), "c1-cloudconfig");
        assert_eq!(names.load_balancer(), "c1-api");
        assert_eq!(names.kms_key(), "c1-tls");
    }
}
