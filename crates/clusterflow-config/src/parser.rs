//! KDL parser for `clusterflow.kdl`

use crate::error::{ConfigError, Result};
use crate::model::{
    LISTENER_PROTOCOLS, LoadBalancerSettings, OperatorConfig, OperatorSettings, RetrySettings,
};
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::fs;
use std::path::{Path, PathBuf};

/// Parse and validate a config file
pub fn parse_config_file<P: AsRef<Path>>(path: P) -> Result<OperatorConfig> {
    let content = fs::read_to_string(path.as_ref())?;
    parse_config_str(&content)
}

/// Parse and validate config text. Unknown nodes are ignored.
pub fn parse_config_str(content: &str) -> Result<OperatorConfig> {
    let doc: KdlDocument = content.parse()?;
    let mut config = OperatorConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "operator" => parse_operator(node, &mut config.operator)?,
            "retry" => parse_retry(node, &mut config.retry)?,
            "load-balancer" => parse_load_balancer(node, &mut config.load_balancer)?,
            _ => {}
        }
    }

    validate(&config)?;
    Ok(config)
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn first_value(node: &KdlNode) -> Option<&KdlValue> {
    node.entries().first().map(|e| e.value())
}

fn string_arg(node: &KdlNode) -> Result<String> {
    first_value(node)
        .and_then(|v| v.as_string())
        .map(str::to_string)
        .ok_or_else(|| invalid(node, "expects a string"))
}

fn unsigned_arg(node: &KdlNode) -> Result<u64> {
    first_value(node)
        .and_then(|v| v.as_integer())
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| invalid(node, "expects a non-negative integer"))
}

fn port_arg(node: &KdlNode) -> Result<u16> {
    let value = unsigned_arg(node)?;
    u16::try_from(value).map_err(|_| invalid(node, "expects a port number"))
}

fn invalid(node: &KdlNode, message: &str) -> ConfigError {
    ConfigError::InvalidConfig(format!("{} {}", node.name().value(), message))
}

fn parse_operator(node: &KdlNode, settings: &mut OperatorSettings) -> Result<()> {
    for child in children(node) {
        match child.name().value() {
            "work-dir" => settings.work_dir = PathBuf::from(string_arg(child)?),
            "certs-dir" => settings.certs_dir = PathBuf::from(string_arg(child)?),
            "templates" => {
                // templates master="..." worker="..."
                if let Some(master) = child.get("master").and_then(|v| v.as_string()) {
                    settings.templates.master = Some(PathBuf::from(master));
                }
                if let Some(worker) = child.get("worker").and_then(|v| v.as_string()) {
                    settings.templates.worker = Some(PathBuf::from(worker));
                }
            }
            "max-concurrent-events" => {
                settings.max_concurrent_events = unsigned_arg(child)? as usize;
            }
            "parallel-launch" => {
                settings.parallel_launch = first_value(child)
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| invalid(child, "expects #true or #false"))?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_retry(node: &KdlNode, settings: &mut RetrySettings) -> Result<()> {
    for child in children(node) {
        match child.name().value() {
            "initial-delay-ms" => settings.initial_delay_ms = unsigned_arg(child)?,
            "max-delay-ms" => settings.max_delay_ms = unsigned_arg(child)?,
            "deadline-secs" => settings.deadline_secs = unsigned_arg(child)?,
            "multiplier" => {
                // integers are accepted too
                let value = first_value(child);
                settings.multiplier = value
                    .and_then(|v| v.as_float())
                    .or_else(|| value.and_then(|v| v.as_integer()).map(|v| v as f64))
                    .ok_or_else(|| invalid(child, "expects a number"))?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_load_balancer(node: &KdlNode, settings: &mut LoadBalancerSettings) -> Result<()> {
    for child in children(node) {
        match child.name().value() {
            "port" => settings.port = port_arg(child)?,
            "instance-port" => settings.instance_port = port_arg(child)?,
            "protocol" => settings.protocol = string_arg(child)?.to_uppercase(),
            _ => {}
        }
    }
    Ok(())
}

fn validate(config: &OperatorConfig) -> Result<()> {
    let err = |msg: String| Err(ConfigError::InvalidConfig(msg));

    if config.operator.max_concurrent_events == 0 {
        return err("max-concurrent-events must be at least 1".into());
    }
    let retry = &config.retry;
    if retry.multiplier < 1.0 {
        return err(format!("multiplier must be >= 1.0, got {}", retry.multiplier));
    }
    if retry.initial_delay_ms > retry.max_delay_ms {
        return err(format!(
            "initial-delay-ms ({}) exceeds max-delay-ms ({})",
            retry.initial_delay_ms, retry.max_delay_ms
        ));
    }
    if retry.deadline_secs == 0 {
        return err("deadline-secs must be positive".into());
    }
    let lb = &config.load_balancer;
    if lb.port == 0 || lb.instance_port == 0 {
        return err("load balancer ports must be non-zero".into());
    }
    if !LISTENER_PROTOCOLS.contains(&lb.protocol.as_str()) {
        return err(format!("unsupported listener protocol '{}'", lb.protocol));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config_str("").unwrap();
        assert_eq!(config, OperatorConfig::default());
    }

    #[test]
    fn test_full_document() {
        let kdl = r#"
operator {
    work-dir "/tmp/cf"
    certs-dir "/tmp/cf/certs"
    templates master="/tmp/master.tmpl" worker="/tmp/worker.tmpl"
    max-concurrent-events 8
    parallel-launch #true
}
retry {
    initial-delay-ms 100
    max-delay-ms 2000
    multiplier 1.5
    deadline-secs 30
}
load-balancer {
    port 8443
    instance-port 443
    protocol "ssl"
}
"#;
        let config = parse_config_str(kdl).unwrap();
        assert_eq!(config.operator.work_dir, PathBuf::from("/tmp/cf"));
        assert_eq!(
            config.operator.templates.master,
            Some(PathBuf::from("/tmp/master.tmpl"))
        );
        assert_eq!(config.operator.max_concurrent_events, 8);
        assert!(config.operator.parallel_launch);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.retry.multiplier, 1.5);
        assert_eq!(config.retry.deadline().as_secs(), 30);
        assert_eq!(config.load_balancer.port, 8443);
        assert_eq!(config.load_balancer.protocol, "SSL");
    }

    #[test]
    fn test_integer_multiplier() {
        let config = parse_config_str("retry {\n    multiplier 3\n}").unwrap();
        assert_eq!(config.retry.multiplier, 3.0);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = parse_config_str("load-balancer {\n    port 8443\n}").unwrap();
        assert_eq!(config.load_balancer.port, 8443);
        assert_eq!(config.load_balancer.instance_port, 6443);
        assert_eq!(config.retry, RetrySettings::default());
    }

    #[test]
    fn test_invalid_values() {
        for kdl in [
            "operator {\n    max-concurrent-events 0\n}",
            "operator {\n    work-dir 5\n}",
            "retry {\n    initial-delay-ms -1\n}",
            "retry {\n    multiplier 0.5\n}",
            "retry {\n    initial-delay-ms 5000\n    max-delay-ms 100\n}",
            "load-balancer {\n    port 70000\n}",
            "load-balancer {\n    protocol \"UDP\"\n}",
        ] {
            let err = parse_config_str(kdl).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidConfig(_)),
                "{kdl}: {err:?}"
            );
        }
    }

    #[test]
    fn test_syntax_error() {
        let err = parse_config_str("operator {").unwrap_err();
        assert!(matches!(err, ConfigError::KdlParse(_)));
    }
}
