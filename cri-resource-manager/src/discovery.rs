//! Best-effort hardware topology discovery from sysfs. The shape it
//! produces (`crm_topology::DiscoveryInput`) is the only thing the rest of
//! the system depends on; swapping this for a richer prober (ACPI SLIT
//! distances, real device NUMA affinity) never touches `crm-topology` or
//! `crm-policy`.

use std::collections::BTreeMap;
use std::path::Path;

use crm_topology::{CpuInfo, DiscoveryInput, MemoryTier, MemoryZone, NumaNodeInfo};

const CPU_ROOT: &str = "/sys/devices/system/cpu";
const NODE_ROOT: &str = "/sys/devices/system/node";

pub fn discover_topology() -> DiscoveryInput {
    let isolated = read_cpu_list(&format!("{CPU_ROOT}/isolated"));
    let cpus = discover_cpus(&isolated);
    let numa_nodes = discover_numa_nodes(&cpus);
    DiscoveryInput {
        cpus,
        numa_nodes,
        devices: Vec::new(),
    }
}

fn discover_cpus(isolated: &[u32]) -> Vec<CpuInfo> {
    let online = read_cpu_list(&format!("{CPU_ROOT}/online"));
    if online.is_empty() {
        return vec![CpuInfo {
            id: 0,
            numa_node: 0,
            socket: 0,
            die: 0,
            isolated: false,
        }];
    }

    online
        .into_iter()
        .map(|id| {
            let topo = format!("{CPU_ROOT}/cpu{id}/topology");
            let socket = read_u32(&format!("{topo}/physical_package_id")).unwrap_or(0);
            let die = read_u32(&format!("{topo}/die_id")).unwrap_or(0);
            let numa_node = numa_node_of(id).unwrap_or(0);
            CpuInfo {
                id,
                numa_node,
                socket,
                die,
                isolated: isolated.contains(&id),
            }
        })
        .collect()
}

fn discover_numa_nodes(cpus: &[CpuInfo]) -> Vec<NumaNodeInfo> {
    let mut by_node: BTreeMap<u32, ()> = BTreeMap::new();
    for cpu in cpus {
        by_node.insert(cpu.numa_node, ());
    }
    if by_node.is_empty() {
        by_node.insert(0, ());
    }

    by_node
        .into_keys()
        .map(|id| NumaNodeInfo {
            id,
            zones: vec![MemoryZone {
                id,
                tier: memory_tier_of(id),
                capacity_bytes: read_meminfo_bytes(id).unwrap_or(0),
            }],
        })
        .collect()
}

fn numa_node_of(cpu_id: u32) -> Option<u32> {
    let dir = format!("{NODE_ROOT}");
    let entries = std::fs::read_dir(&dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_str()?;
        let Some(node_id) = name.strip_prefix("node") else { continue };
        let Ok(node_id) = node_id.parse::<u32>() else { continue };
        let cpulist_path = entry.path().join("cpulist");
        if read_cpu_list(cpulist_path.to_str()?).contains(&cpu_id) {
            return Some(node_id);
        }
    }
    None
}

/// `DRAM` unless the node directory carries no `cpulist` at all (a
/// CPU-less node, the common signature of a PMEM-only NUMA node).
fn memory_tier_of(node_id: u32) -> MemoryTier {
    let cpulist = read_cpu_list(&format!("{NODE_ROOT}/node{node_id}/cpulist"));
    if cpulist.is_empty() {
        MemoryTier::Pmem
    } else {
        MemoryTier::Dram
    }
}

fn read_meminfo_bytes(node_id: u32) -> Option<u64> {
    let text = std::fs::read_to_string(format!("{NODE_ROOT}/node{node_id}/meminfo")).ok()?;
    for line in text.lines() {
        if line.contains("MemTotal:") {
            let kb: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

fn read_u32(path: &str) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Parses a Linux CPU-list string (`0-3,7,9-11`) as used by every sysfs
/// `cpulist`/`isolated`/`online` file.
fn read_cpu_list(path: &str) -> Vec<u32> {
    let Ok(text) = std::fs::read_to_string(Path::new(path)) else {
        return Vec::new();
    };
    parse_cpu_list(text.trim())
}

fn parse_cpu_list(text: &str) -> Vec<u32> {
    let mut out = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                out.extend(start..=end);
            }
        } else if let Ok(id) = part.parse::<u32>() {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_list_parses_ranges_and_singletons() {
        assert_eq!(parse_cpu_list("0-3,7,9-11"), vec![0, 1, 2, 3, 7, 9, 10, 11]);
    }

    #[test]
    fn cpu_list_handles_empty_input() {
        assert_eq!(parse_cpu_list(""), Vec::<u32>::new());
    }

    #[test]
    fn single_core_fallback_has_one_cpu() {
        let cpus = discover_cpus(&[]);
        assert!(!cpus.is_empty());
    }
}
