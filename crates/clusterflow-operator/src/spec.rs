//! Cluster specification
//!
//! Immutable input of one reconciliation run, decoded from the watched
//! cluster object.

use crate::error::{OperatorError, Result};
use clusterflow_cloud_aws::hosted_zone_name;
use serde::{Deserialize, Serialize};

/// Longest cluster id that still fits the derived load balancer name
pub const MAX_CLUSTER_ID_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Filled from the object's metadata name when absent
    #[serde(default)]
    pub cluster_id: String,
    pub region: String,
    /// Defaults to the region's `a` zone
    #[serde(default)]
    pub availability_zone: String,
    pub network: NetworkSpec,
    pub masters: Vec<MachineSpec>,
    #[serde(default)]
    pub workers: Vec<MachineSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<DomainSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub vpc_cidr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub image_id: String,
    pub instance_type: String,
}

/// DNS names served through the master load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub api: String,
    pub etcd: String,
}

impl DomainSpec {
    pub fn all(&self) -> [&str; 2] {
        [&self.api, &self.etcd]
    }
}

impl ClusterSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn availability_zone(&self) -> String {
        if self.availability_zone.is_empty() {
            format!("{}a", self.region)
        } else {
            self.availability_zone.clone()
        }
    }

    /// Reject specs that cannot be provisioned
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OperatorError::InvalidSpec(msg));

        if self.cluster_id.is_empty() {
            return invalid("clusterId must not be empty".into());
        }
        // The id ends up in bucket, load balancer and tag names
        if self.cluster_id.len() > MAX_CLUSTER_ID_LEN
            || !self
                .cluster_id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.cluster_id.starts_with('-')
            || self.cluster_id.ends_with('-')
        {
            return invalid(format!(
                "clusterId '{}' must be 1-{} lowercase letters, digits or inner hyphens",
                self.cluster_id, MAX_CLUSTER_ID_LEN
            ));
        }
        if self.region.is_empty() {
            return invalid("region must not be empty".into());
        }
        if self.network.vpc_cidr.is_empty() {
            return invalid("network.vpcCidr must not be empty".into());
        }
        if self.masters.is_empty() {
            return invalid("at least one master is required".into());
        }
        for (role, machines) in [("masters", &self.masters), ("workers", &self.workers)] {
            for (index, machine) in machines.iter().enumerate() {
                if machine.image_id.is_empty() || machine.instance_type.is_empty() {
                    return invalid(format!(
                        "{}[{}] needs imageId and instanceType",
                        role, index
                    ));
                }
            }
        }
        if let Some(domains) = &self.domains {
            for domain in domains.all() {
                if let Err(e) = hosted_zone_name(domain) {
                    return invalid(e.to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

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
}

#[cfg(test)]
mod tests {
    use super::fixtures::spec;
    use super::*;

    #[test]
    fn test_decode_camel_case() {
        let json = r#"{
            "clusterId": "pbmva",
            "region": "eu-west-1",
            "network": { "vpcCidr": "10.1.0.0/16" },
            "masters": [{ "imageId": "ami-1", "instanceType": "m5.large" }],
            "domains": {
                "api": "api.pbmva.g8s.eu-west-1.adidas.aws.giantswarm.io",
                "etcd": "etcd.pbmva.g8s.eu-west-1.adidas.aws.giantswarm.io"
            },
            "sshPublicKey": "ssh-ed25519 AAAA"
        }"#;
        let spec = ClusterSpec::from_json(json).unwrap();
        assert_eq!(spec.cluster_id, "pbmva");
        assert_eq!(spec.availability_zone(), "eu-west-1a");
        assert!(spec.workers.is_empty());
        assert_eq!(spec.ssh_public_key.as_deref(), Some("ssh-ed25519 AAAA"));
        spec.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_specs() {
        let mut no_masters = spec("c1", 0, 1);
        assert!(no_masters.validate().is_err());
        no_masters.masters.push(no_masters.workers[0].clone());
        assert!(no_masters.validate().is_ok());

        let mut bad_id = spec("C1_prod", 1, 0);
        assert!(bad_id.validate().is_err());
        bad_id.cluster_id = String::new();
        assert!(bad_id.validate().is_err());

        let mut bad_machine = spec("c1", 1, 1);
        bad_machine.workers[0].image_id.clear();
        assert!(bad_machine.validate().is_err());

        let mut bad_domain = spec("c1", 1, 0);
        bad_domain.domains = Some(DomainSpec {
            api: "api.c1.example.com".into(),
            etcd: "etcd.c1.g8s.eu-west-1.acme.example.com".into(),
        });
        let err = bad_domain.validate().unwrap_err();
        assert!(matches!(err, OperatorError::InvalidSpec(_)));
    }

    #[test]
    fn test_explicit_availability_zone() {
        let mut s = spec("c1", 1, 0);
        s.availability_zone = "eu-west-1c".into();
        assert_eq!(s.availability_zone(), "eu-west-1c");
    }
}
