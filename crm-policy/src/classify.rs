//! Container classification (spec.md §4.4.1).
//!
//! Generalizes the teacher's per-VM resource bookkeeping
//! (`zerovisor_core::numa_optimizer::VmInfo`) into a classifier that reads a
//! pod/container pair the way `crm-expr`'s rule language expects: rules in
//! `PolicyParams::classification_rules` are tried in order and the first
//! match wins, falling back to the QoS/CPU-size default.

use std::collections::BTreeMap;

use crm_cache::{Container, Pod, QosClass};
use crm_expr::{Evaluable, Expression};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    KubeSystem,
    LowPriority,
    SubCore,
    Mixed,
    MultiCore,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::KubeSystem => "kube-system",
            Classification::LowPriority => "low-priority",
            Classification::SubCore => "sub-core",
            Classification::Mixed => "mixed",
            Classification::MultiCore => "multi-core",
        }
    }
}

/// Adapts a pod/container pair to [`crm_expr::Evaluable`], exposing the key
/// namespace the rule language is written against: `name`, `namespace`,
/// `pod/name`, `pod/namespace`, `pod/qosclass`, and `labels/<k>` /
/// `annotations/<k>` (also reachable as `pod/labels/<k>` /
/// `pod/annotations/<k>`, since labels and annotations live on the pod).
pub struct ReqView<'a> {
    pub pod: &'a Pod,
    pub container: &'a Container,
}

impl<'a> Evaluable for ReqView<'a> {
    fn eval_string(&self, key: &str) -> (String, bool) {
        let lookup = |map: &BTreeMap<String, String>, rest: &str| -> (String, bool) {
            match map.get(rest) {
                Some(v) => (v.clone(), true),
                None => (String::new(), false),
            }
        };
        match key {
            "name" => (self.container.key.container_name.clone(), true),
            "namespace" => (self.container.key.namespace.clone(), true),
            "pod/name" => (self.pod.name.clone(), true),
            "pod/namespace" => (self.pod.namespace.clone(), true),
            "pod/qosclass" => (format!("{:?}", self.pod.qos_class), true),
            _ => {
                if let Some(rest) = key.strip_prefix("labels/").or_else(|| key.strip_prefix("pod/labels/")) {
                    lookup(&self.pod.labels, rest)
                } else if let Some(rest) = key
                    .strip_prefix("annotations/")
                    .or_else(|| key.strip_prefix("pod/annotations/"))
                {
                    lookup(&self.pod.annotations, rest)
                } else {
                    (String::new(), false)
                }
            }
        }
    }
}

/// A named classification rule: the first whose expression matches the
/// pod/container pair wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub expr: Expression,
    pub classification: Classification,
}

pub fn classify(
    pod: &Pod,
    container: &Container,
    rules: &[ClassificationRule],
    system_namespaces: &[String],
) -> Classification {
    let view = ReqView { pod, container };
    for rule in rules {
        if rule.expr.eval(&view) {
            return rule.classification;
        }
    }
    if system_namespaces.iter().any(|ns| ns == &container.key.namespace) {
        return Classification::KubeSystem;
    }
    match pod.qos_class {
        QosClass::Burstable | QosClass::BestEffort => Classification::LowPriority,
        QosClass::Guaranteed => {
            if container.requested_millicpu < 1000 {
                Classification::SubCore
            } else if container.requested_millicpu < 2000 {
                Classification::Mixed
            } else {
                Classification::MultiCore
            }
        }
    }
}

const ANNOTATION_NAMESPACE: &str = "cri-resource-manager.intel.com";

/// Resolves a pod-annotation `key` under the §6 namespace and scoping
/// scheme: a `.container.<name>` suffix wins over a `.pod` suffix, which
/// wins over the legacy bare aggregate key.
fn resolve_annotation<'a>(pod: &'a Pod, key: &str, container_name: &str) -> Option<&'a String> {
    pod.annotations
        .get(&format!("{ANNOTATION_NAMESPACE}/{key}.container.{container_name}"))
        .or_else(|| pod.annotations.get(&format!("{ANNOTATION_NAMESPACE}/{key}.pod")))
        .or_else(|| pod.annotations.get(&format!("{ANNOTATION_NAMESPACE}/{key}")))
        .or_else(|| pod.annotations.get(key))
}

fn annotation_bool(pod: &Pod, key: &str, container_name: &str) -> Option<bool> {
    resolve_annotation(pod, key, container_name).and_then(|v| v.parse::<bool>().ok())
}

/// Whether `container`, already classified, is eligible for exclusive
/// (whole-CPU) allocation. An explicit `prefer-isolated-cpus` annotation
/// always wins; otherwise kube-system and low-priority containers never get
/// exclusive CPUs, and a fractional multi-core request needs the opt-in
/// annotation to get them (spec.md §4.4.3).
pub fn eligible_for_exclusive(pod: &Pod, container: &Container, classification: Classification) -> bool {
    let name = &container.key.container_name;
    if let Some(explicit) = annotation_bool(pod, "prefer-isolated-cpus", name) {
        return explicit;
    }
    if annotation_bool(pod, "prefer-shared-cpus", name) == Some(true) {
        return false;
    }
    match classification {
        Classification::Mixed => true,
        Classification::MultiCore => container.requested_millicpu % 1000 == 0,
        Classification::SubCore | Classification::LowPriority | Classification::KubeSystem => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_cache::{ContainerKey, ContainerState};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn pod(namespace: &str, qos: QosClass) -> Pod {
        Pod {
            uid: "u1".into(),
            name: "p1".into(),
            namespace: namespace.into(),
            qos_class: qos,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            cgroup_parent: String::new(),
            containers: Vec::new(),
            lingering_since: None,
        }
    }

    fn container(millicpu: u64) -> Container {
        Container {
            key: ContainerKey {
                namespace: "default".into(),
                pod_name: "p1".into(),
                container_name: "c1".into(),
            },
            id: None,
            pod_uid: "u1".into(),
            requested_millicpu: millicpu,
            limit_millicpu: millicpu,
            requested_memory_bytes: 0,
            limit_memory_bytes: 0,
            shared_cpus: Vec::new(),
            exclusive_cpus: Vec::new(),
            memory_zone_mask: Vec::new(),
            memory_type_pref: Vec::new(),
            rdt_class: None,
            blockio_class: None,
            cold_start: None,
            owning_pool: None,
            state: ContainerState::Creating,
            lingering_since: None,
            created_at_unix: now(),
        }
    }

    #[test]
    fn kube_system_namespace_wins_over_qos() {
        let p = pod("kube-system", QosClass::Guaranteed);
        let c = container(500);
        let class = classify(&p, &c, &[], &["kube-system".to_string()]);
        assert_eq!(class, Classification::KubeSystem);
    }

    #[test]
    fn default_sizing_buckets() {
        let p = pod("default", QosClass::Guaranteed);
        assert_eq!(classify(&p, &container(500), &[], &[]), Classification::SubCore);
        assert_eq!(classify(&p, &container(1500), &[], &[]), Classification::Mixed);
        assert_eq!(classify(&p, &container(3000), &[], &[]), Classification::MultiCore);
        let burstable = pod("default", QosClass::Burstable);
        assert_eq!(classify(&burstable, &container(500), &[], &[]), Classification::LowPriority);
    }

    #[test]
    fn fractional_multicore_needs_opt_in() {
        let p = pod("default", QosClass::Guaranteed);
        let c = container(2500);
        assert!(!eligible_for_exclusive(&p, &c, Classification::MultiCore));
        let mut p2 = p.clone();
        p2.annotations.insert("prefer-isolated-cpus".into(), "true".into());
        assert!(eligible_for_exclusive(&p2, &c, Classification::MultiCore));
    }

    #[test]
    fn container_scoped_annotation_wins_over_pod_scoped_and_legacy() {
        let mut p = pod("default", QosClass::Guaranteed);
        p.annotations.insert(
            "cri-resource-manager.intel.com/prefer-isolated-cpus.pod".into(),
            "false".into(),
        );
        p.annotations.insert(
            "cri-resource-manager.intel.com/prefer-isolated-cpus.container.c1".into(),
            "true".into(),
        );
        let c = container(2500);
        assert!(eligible_for_exclusive(&p, &c, Classification::MultiCore));

        let mut other = c.clone();
        other.key.container_name = "other".into();
        assert!(!eligible_for_exclusive(&p, &other, Classification::MultiCore));
    }

    #[test]
    fn explicit_annotation_overrides_class_default() {
        let mut p = pod("default", QosClass::Guaranteed);
        p.annotations.insert("prefer-shared-cpus".into(), "true".into());
        let c = container(3000);
        let class = classify(&p, &c, &[], &[]);
        assert_eq!(class, Classification::MultiCore);
        assert!(!eligible_for_exclusive(&p, &c, class));
    }
}
