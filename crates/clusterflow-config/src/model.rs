//! Operator configuration model

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Listener protocols accepted by a classic load balancer
pub const LISTENER_PROTOCOLS: &[&str] = &["TCP", "SSL", "HTTP", "HTTPS"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperatorConfig {
    pub operator: OperatorSettings,
    pub retry: RetrySettings,
    pub load_balancer: LoadBalancerSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperatorSettings {
    /// Root of namespace directories and the type descriptor
    pub work_dir: PathBuf,
    /// Directory holding the cluster PEM assets
    pub certs_dir: PathBuf,
    pub templates: TemplatePaths,
    pub max_concurrent_events: usize,
    /// Launch the machines of one role concurrently
    pub parallel_launch: bool,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/clusterflow"),
            certs_dir: PathBuf::from("/etc/clusterflow/certs"),
            templates: TemplatePaths::default(),
            max_concurrent_events: 4,
            parallel_launch: false,
        }
    }
}

/// Cloud-config templates. `None` selects the built-in template.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TemplatePaths {
    pub master: Option<PathBuf>,
    pub worker: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrySettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub deadline_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            deadline_secs: 120,
        }
    }
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoadBalancerSettings {
    pub port: u16,
    pub instance_port: u16,
    pub protocol: String,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            port: 443,
            instance_port: 6443,
            protocol: "TCP".to_string(),
        }
    }
}
