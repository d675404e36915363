//! Bridges the agent-intake RPCs (C8) into the live policy core: `SetConfig`
//! reconfigures the active policy, `SetAdjustment` applies a batch of
//! per-container CPU/memory changes through `Policy::adjust`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crm_agent_intake::ConfigSink;
use crm_cache::{ContainerKey, WorkloadCache};
use crm_policy::{Adjustment, Policy};

use crate::config::{nest_dotted, resolve};

/// One entry of a `SetAdjustment` batch. Field names match the CRI-facing
/// `ContainerKey` triple so the node agent can address a container the same
/// way the cache does.
#[derive(Debug, Deserialize)]
struct AdjustmentSpec {
    namespace: String,
    pod_name: String,
    container_name: String,
    #[serde(default)]
    shared_cpus: Option<Vec<u32>>,
    #[serde(default)]
    exclusive_cpus: Option<Vec<u32>>,
    #[serde(default)]
    memory_zone_mask: Option<Vec<u32>>,
}

pub struct PolicySink {
    cache: Arc<WorkloadCache>,
    policy: Arc<dyn Policy>,
    disable_policy_switch: bool,
}

impl PolicySink {
    pub fn new(cache: Arc<WorkloadCache>, policy: Arc<dyn Policy>, disable_policy_switch: bool) -> Self {
        Self {
            cache,
            policy,
            disable_policy_switch,
        }
    }
}

impl ConfigSink for PolicySink {
    fn apply_config(&self, node_name: &str, config: &BTreeMap<String, String>) -> Result<(), String> {
        if self.disable_policy_switch && config.contains_key("policy.Active") {
            return Err("policy switching is disabled on this node".to_string());
        }
        let value = nest_dotted(config);
        let resolved = resolve(&value);
        let Some(yaml) = resolved.policy_yaml else {
            tracing::debug!(node = node_name, "config update carried no policy subtree, ignoring");
            return Ok(());
        };
        self.policy.reconfigure(&yaml).map_err(|e| e.to_string())
    }

    fn apply_adjustment(&self, node_name: &str, adjustment_json: &str) -> BTreeMap<String, String> {
        let mut errors = BTreeMap::new();
        let specs: Vec<AdjustmentSpec> = match serde_json::from_str(adjustment_json) {
            Ok(s) => s,
            Err(e) => {
                errors.insert("*".to_string(), format!("invalid adjustment payload: {e}"));
                return errors;
            }
        };

        for spec in specs {
            let key = ContainerKey {
                namespace: spec.namespace,
                pod_name: spec.pod_name,
                container_name: spec.container_name,
            };
            let label = format!("{}/{}/{}", key.namespace, key.pod_name, key.container_name);
            let adjustment = Adjustment {
                key: key.clone(),
                shared_cpus: spec.shared_cpus,
                exclusive_cpus: spec.exclusive_cpus,
                memory_zone_mask: spec.memory_zone_mask,
            };
            match self.policy.adjust(adjustment) {
                Ok(_decision) => {
                    tracing::debug!(node = node_name, container = %label, "adjustment applied");
                }
                Err(e) => {
                    errors.insert(label, e.to_string());
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NoopPolicy;
    impl Policy for NoopPolicy {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn description(&self) -> &'static str {
            "test stub"
        }
        fn allocate(&self, _pod: &crm_cache::Pod, _container: &crm_cache::Container) -> Result<crm_policy::Decision, crm_policy::PolicyError> {
            unimplemented!()
        }
        fn release(&self, _container: &crm_cache::Container) -> Result<(), crm_policy::PolicyError> {
            unimplemented!()
        }
        fn reconfigure(&self, _yaml: &str) -> Result<(), crm_policy::PolicyError> {
            Ok(())
        }
        fn adjust(&self, _adjustment: Adjustment) -> Result<crm_policy::Decision, crm_policy::PolicyError> {
            Err(crm_policy::PolicyError::NoActivePlacement(ContainerKey {
                namespace: "ns".into(),
                pod_name: "pod".into(),
                container_name: "c".into(),
            }))
        }
        fn rebalance(&self) -> Vec<(ContainerKey, Vec<u32>)> {
            Vec::new()
        }
    }

    fn test_cache() -> Arc<WorkloadCache> {
        Arc::new(WorkloadCache::new(std::env::temp_dir().join("crm-sink-test.json"), Duration::from_secs(60)))
    }

    #[test]
    fn malformed_adjustment_json_reports_a_single_error() {
        let sink = PolicySink::new(test_cache(), Arc::new(NoopPolicy), false);
        let errors = sink.apply_adjustment("node-1", "not json");
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key("*"));
    }

    #[test]
    fn adjustment_failures_are_reported_per_container() {
        let sink = PolicySink::new(test_cache(), Arc::new(NoopPolicy), false);
        let payload = r#"[{"namespace":"ns","pod_name":"pod","container_name":"c"}]"#;
        let errors = sink.apply_adjustment("node-1", payload);
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key("ns/pod/c"));
    }

    #[test]
    fn disabled_policy_switch_rejects_active_policy_changes() {
        let sink = PolicySink::new(test_cache(), Arc::new(NoopPolicy), true);
        let mut config = BTreeMap::new();
        config.insert("policy.Active".to_string(), "balloons".to_string());
        let result = sink.apply_config("node-1", &config);
        assert!(result.is_err());
    }
}
