//! Translation between CRI wire messages and cache/policy domain types.

use std::collections::BTreeMap;
use std::time::Duration;

use crm_cache::MemoryTierPref;
use serde::Deserialize;

pub fn to_btree(map: std::collections::HashMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter().collect()
}

const ANNOTATION_NAMESPACE: &str = "cri-resource-manager.intel.com";

/// Resolves a pod-annotation `key` under the §6 namespace and scoping
/// scheme: a `.container.<name>` suffix wins over a `.pod` suffix, which
/// wins over the legacy bare aggregate key (kept for existing callers that
/// never adopted the namespace).
fn resolve_annotation<'a>(annotations: &'a BTreeMap<String, String>, key: &str, container_name: &str) -> Option<&'a String> {
    annotations
        .get(&format!("{ANNOTATION_NAMESPACE}/{key}.container.{container_name}"))
        .or_else(|| annotations.get(&format!("{ANNOTATION_NAMESPACE}/{key}.pod")))
        .or_else(|| annotations.get(&format!("{ANNOTATION_NAMESPACE}/{key}")))
        .or_else(|| annotations.get(key))
}

pub fn parse_memory_pref(annotations: &BTreeMap<String, String>, container_name: &str) -> Vec<MemoryTierPref> {
    let Some(raw) = resolve_annotation(annotations, "memory-type", container_name) else {
        return Vec::new();
    };
    raw.split(',')
        .filter_map(|tok| match tok.trim() {
            "dram" => Some(MemoryTierPref::Dram),
            "pmem" => Some(MemoryTierPref::Pmem),
            "hbm" => Some(MemoryTierPref::Hbm),
            _ => None,
        })
        .collect()
}

#[derive(Deserialize)]
struct ColdStartSpec {
    duration: String,
}

pub fn parse_cold_start(annotations: &BTreeMap<String, String>, container_name: &str) -> Option<Duration> {
    let raw = resolve_annotation(annotations, "cold-start", container_name)?;
    let spec: ColdStartSpec = serde_yaml::from_str(raw).ok()?;
    parse_go_duration(&spec.duration)
}

/// Parses a small subset of Go's `time.Duration` string syntax: an integer
/// or decimal magnitude followed by `ns`, `us`, `ms`, `s`, `m`, or `h`.
pub fn parse_go_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split_at = raw.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (magnitude, unit) = raw.split_at(split_at);
    let value: f64 = magnitude.parse().ok()?;
    let secs = match unit {
        "ns" => value / 1_000_000_000.0,
        "us" | "\u{b5}s" => value / 1_000_000.0,
        "ms" => value / 1_000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs.max(0.0)))
}

pub fn join_cpus(cpus: &[u32]) -> String {
    cpus.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

pub fn parse_cpu_list(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter_map(|tok| tok.trim().parse::<u32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_duration_parses_seconds_and_minutes() {
        assert_eq!(parse_go_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_go_duration("1.5m"), Some(Duration::from_secs(90)));
    }

    #[test]
    fn memory_pref_reads_comma_list() {
        let mut ann = BTreeMap::new();
        ann.insert("memory-type".to_string(), "dram,pmem".to_string());
        assert_eq!(parse_memory_pref(&ann, "c1"), vec![MemoryTierPref::Dram, MemoryTierPref::Pmem]);
    }

    #[test]
    fn memory_pref_prefers_container_scoped_over_pod_scoped_annotation() {
        let mut ann = BTreeMap::new();
        ann.insert(
            "cri-resource-manager.intel.com/memory-type.pod".to_string(),
            "dram".to_string(),
        );
        ann.insert(
            "cri-resource-manager.intel.com/memory-type.container.c1".to_string(),
            "pmem".to_string(),
        );
        assert_eq!(parse_memory_pref(&ann, "c1"), vec![MemoryTierPref::Pmem]);
        assert_eq!(parse_memory_pref(&ann, "c2"), vec![MemoryTierPref::Dram]);
    }

    #[test]
    fn cold_start_resolves_the_namespaced_container_scoped_form() {
        let mut ann = BTreeMap::new();
        ann.insert(
            "cri-resource-manager.intel.com/cold-start.container.c1".to_string(),
            "{duration: 60s}".to_string(),
        );
        assert_eq!(parse_cold_start(&ann, "c1"), Some(Duration::from_secs(60)));
        assert_eq!(parse_cold_start(&ann, "c2"), None);
    }

    #[test]
    fn cpu_list_round_trips_through_join() {
        let cpus = vec![0, 1, 4];
        assert_eq!(parse_cpu_list(&join_cpus(&cpus)), cpus);
    }
}
