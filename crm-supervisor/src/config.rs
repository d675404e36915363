//! The YAML config schema (spec.md §5/§6): `policy.Active`,
//! `policy.ReservedResources.CPU`, `policy.<name>.*`, `logger.*`, `dump.*`,
//! `instrumentation.*`. Config arrives two ways — a `--config`/`--force-config`
//! file (already nested YAML) and the agent-intake `SetConfig` RPC (a flat
//! `map<string,string>` of dotted keys) — so both are normalized into the
//! same `serde_yaml::Value` tree before extraction.

use std::collections::BTreeMap;

use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub policy_active: String,
    pub reserved_cpus: Vec<u32>,
    /// The `policy.<active-name>` subtree, re-serialized, ready to hand to
    /// `Policy::reconfigure` verbatim.
    pub policy_yaml: Option<String>,
    pub logger_debug: bool,
    pub logger_enable: bool,
    pub dump_config: bool,
    pub dump_file: Option<String>,
    pub jaeger_agent: Option<String>,
    pub jaeger_collector: Option<String>,
    pub prometheus_endpoint: Option<String>,
}

pub fn load_file(path: &std::path::Path) -> Result<ResolvedConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
    let value: Value = serde_yaml::from_str(&text)?;
    Ok(resolve(&value))
}

/// Builds the same `Value` tree a config file would parse to, from a flat
/// `map<string,string>` of dotted keys (`policy.Active`, `policy.balloons.Foo`).
pub fn nest_dotted(flat: &BTreeMap<String, String>) -> Value {
    let mut root = Value::Mapping(serde_yaml::Mapping::new());
    for (dotted_key, raw_value) in flat {
        insert_dotted(&mut root, dotted_key, raw_value);
    }
    root
}

fn insert_dotted(root: &mut Value, dotted_key: &str, raw_value: &str) {
    let Value::Mapping(map) = root else { return };
    let mut parts = dotted_key.split('.');
    let Some(first) = parts.next() else { return };
    let rest: Vec<&str> = parts.collect();

    let leaf_value: Value = serde_yaml::from_str(raw_value).unwrap_or(Value::String(raw_value.to_string()));

    if rest.is_empty() {
        map.insert(Value::String(first.to_string()), leaf_value);
        return;
    }

    let entry = map
        .entry(Value::String(first.to_string()))
        .or_insert_with(|| Value::Mapping(serde_yaml::Mapping::new()));
    if !matches!(entry, Value::Mapping(_)) {
        *entry = Value::Mapping(serde_yaml::Mapping::new());
    }
    insert_dotted(entry, &rest.join("."), raw_value);
}

pub fn resolve(value: &Value) -> ResolvedConfig {
    let policy = value.get("policy");
    let policy_active = policy
        .and_then(|p| p.get("Active"))
        .and_then(Value::as_str)
        .unwrap_or("topology-aware")
        .to_string();

    let reserved_cpus = policy
        .and_then(|p| p.get("ReservedResources"))
        .and_then(|r| r.get("CPU"))
        .and_then(Value::as_str)
        .map(|s| s.split(',').filter_map(|t| t.trim().parse::<u32>().ok()).collect())
        .unwrap_or_default();

    let policy_yaml = policy
        .and_then(|p| p.get(&policy_active))
        .and_then(|sub| serde_yaml::to_string(sub).ok());

    let logger = value.get("logger");
    let logger_debug = logger.and_then(|l| l.get("Debug")).and_then(Value::as_bool).unwrap_or(false);
    let logger_enable = logger.and_then(|l| l.get("Enable")).and_then(Value::as_bool).unwrap_or(true);

    let dump = value.get("dump");
    let dump_config = dump.and_then(|d| d.get("Config")).and_then(Value::as_bool).unwrap_or(false);
    let dump_file = dump
        .and_then(|d| d.get("File"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let instrumentation = value.get("instrumentation");
    let jaeger_agent = instrumentation
        .and_then(|i| i.get("JaegerAgent"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let jaeger_collector = instrumentation
        .and_then(|i| i.get("JaegerCollector"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let prometheus_endpoint = instrumentation
        .and_then(|i| i.get("PrometheusExport"))
        .and_then(Value::as_str)
        .map(str::to_string);

    ResolvedConfig {
        policy_active,
        reserved_cpus,
        policy_yaml,
        logger_debug,
        logger_enable,
        dump_config,
        dump_file,
        jaeger_agent,
        jaeger_collector,
        prometheus_endpoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_keys_nest_into_a_tree() {
        let mut flat = BTreeMap::new();
        flat.insert("policy.Active".to_string(), "topology-aware".to_string());
        flat.insert("policy.ReservedResources.CPU".to_string(), "0,1".to_string());
        flat.insert("logger.Debug".to_string(), "true".to_string());

        let value = nest_dotted(&flat);
        let resolved = resolve(&value);
        assert_eq!(resolved.policy_active, "topology-aware");
        assert_eq!(resolved.reserved_cpus, vec![0, 1]);
        assert!(resolved.logger_debug);
    }

    #[test]
    fn active_policy_subtree_is_extracted_as_yaml() {
        let text = r#"
policy:
  Active: balloons
  balloons:
    PoolSize: 4
"#;
        let value: Value = serde_yaml::from_str(text).unwrap();
        let resolved = resolve(&value);
        assert_eq!(resolved.policy_active, "balloons");
        assert!(resolved.policy_yaml.unwrap().contains("PoolSize"));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let value: Value = serde_yaml::from_str("{}").unwrap();
        let resolved = resolve(&value);
        assert_eq!(resolved.policy_active, "topology-aware");
        assert!(resolved.logger_enable);
    }
}
