//! Immutable pool tree derived from hardware topology discovery (C1).
//!
//! Generalizes the teacher's flat NUMA-node list (`zerovisor-hal::numa::Topology`,
//! `zerovisor-core::numa_optimizer::NumaTopology`) into the full NUMA/die/socket/root
//! tree the data model calls for, stored as an arena of integer-keyed pool
//! descriptors (parent/child links by id) per DESIGN NOTES §9, so the tree has
//! no cyclic ownership graph and can be read lock-free once built.

use std::collections::BTreeMap;

/// Small integer id into the topology arena.
pub type PoolId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryTier {
    Dram,
    Pmem,
    Hbm,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryZone {
    pub id: u32,
    pub tier: MemoryTier,
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub preferred_leaf: PoolId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Root,
    Socket,
    Die,
    Numa,
}

/// A single node in the topology tree. Immutable once the tree is built.
#[derive(Debug, Clone)]
pub struct Pool {
    pub id: PoolId,
    pub kind: PoolKind,
    pub depth: u32,
    pub parent: Option<PoolId>,
    pub children: Vec<PoolId>,
    /// CPU set exclusive to this subtree; equals the disjoint union of
    /// children's CPU sets for non-leaf pools.
    pub cpus: Vec<u32>,
    /// Subset of `cpus` that the kernel excludes from general scheduling.
    pub isolated_cpus: Vec<u32>,
    /// Memory zones with smallest access distance to this subtree's CPUs
    /// (for leaves); union of children's zones for intermediate pools.
    pub memory_zones: Vec<MemoryZone>,
    pub devices: Vec<Device>,
}

impl Pool {
    pub fn total_millicpu(&self) -> u64 {
        self.cpus.len() as u64 * 1000
    }

    pub fn zone_ids(&self) -> Vec<u32> {
        self.memory_zones.iter().map(|z| z.id).collect()
    }
}

/// Raw input from hardware discovery (an external collaborator per spec.md
/// §1; only the shape of its output is in scope here).
#[derive(Debug, Clone)]
pub struct CpuInfo {
    pub id: u32,
    pub numa_node: u32,
    pub socket: u32,
    pub die: u32,
    pub isolated: bool,
}

#[derive(Debug, Clone)]
pub struct NumaNodeInfo {
    pub id: u32,
    pub zones: Vec<MemoryZone>,
}

#[derive(Debug, Clone)]
pub struct DeviceHint {
    pub id: String,
    pub preferred_numa_node: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryInput {
    pub cpus: Vec<CpuInfo>,
    pub numa_nodes: Vec<NumaNodeInfo>,
    pub devices: Vec<DeviceHint>,
}

/// Hardware discovery is an external collaborator; this trait is the seam
/// the supervisor injects a real implementation (or a mock, for tests) at.
pub trait TopologyDiscovery: Send + Sync {
    fn discover(&self) -> DiscoveryInput;
}

/// Discovery source backed by a fixed, caller-supplied snapshot. Useful for
/// tests and for environments where discovery already ran out-of-process.
pub struct StaticDiscovery(pub DiscoveryInput);

impl TopologyDiscovery for StaticDiscovery {
    fn discover(&self) -> DiscoveryInput {
        self.0.clone()
    }
}

/// The immutable topology tree: one leaf per NUMA node, intermediate nodes
/// for dies and sockets, a single root. Built once at process start; every
/// subsequent read is lock-free.
#[derive(Debug, Clone)]
pub struct Topology {
    arena: Vec<Pool>,
    root: PoolId,
}

impl Topology {
    pub fn build(input: DiscoveryInput) -> Self {
        let mut arena: Vec<Pool> = Vec::new();

        // Leaves: one per NUMA node.
        let mut numa_ids: Vec<u32> = input.cpus.iter().map(|c| c.numa_node).collect();
        numa_ids.sort_unstable();
        numa_ids.dedup();
        if numa_ids.is_empty() {
            numa_ids.push(0);
        }

        let mut numa_pool_of: BTreeMap<u32, PoolId> = BTreeMap::new();
        for numa in &numa_ids {
            let id = arena.len() as PoolId;
            let cpus: Vec<u32> = input
                .cpus
                .iter()
                .filter(|c| c.numa_node == *numa)
                .map(|c| c.id)
                .collect();
            let isolated_cpus: Vec<u32> = input
                .cpus
                .iter()
                .filter(|c| c.numa_node == *numa && c.isolated)
                .map(|c| c.id)
                .collect();
            let memory_zones = input
                .numa_nodes
                .iter()
                .find(|n| n.id == *numa)
                .map(|n| n.zones.clone())
                .unwrap_or_default();
            arena.push(Pool {
                id,
                kind: PoolKind::Numa,
                depth: 0, // patched once full depth is known
                parent: None,
                children: Vec::new(),
                cpus,
                isolated_cpus,
                memory_zones,
                devices: Vec::new(),
            });
            numa_pool_of.insert(*numa, id);
        }

        // Dies: group NUMA leaves sharing (socket, die).
        let die_key_of = |numa: u32| -> (u32, u32) {
            input
                .cpus
                .iter()
                .find(|c| c.numa_node == numa)
                .map(|c| (c.socket, c.die))
                .unwrap_or((0, 0))
        };
        let mut die_groups: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();
        for numa in &numa_ids {
            die_groups.entry(die_key_of(*numa)).or_default().push(*numa);
        }

        let mut die_pool_of: BTreeMap<(u32, u32), PoolId> = BTreeMap::new();
        for (key, numas) in &die_groups {
            let id = arena.len() as PoolId;
            let children: Vec<PoolId> = numas.iter().map(|n| numa_pool_of[n]).collect();
            let (cpus, isolated_cpus, memory_zones) = union_children(&arena, &children);
            arena.push(Pool {
                id,
                kind: PoolKind::Die,
                depth: 1,
                parent: None,
                children: children.clone(),
                cpus,
                isolated_cpus,
                memory_zones,
                devices: Vec::new(),
            });
            for &c in &children {
                arena[c as usize].parent = Some(id);
            }
            die_pool_of.insert(*key, id);
        }

        // Sockets: group dies sharing socket id.
        let mut socket_groups: BTreeMap<u32, Vec<(u32, u32)>> = BTreeMap::new();
        for key in die_groups.keys() {
            socket_groups.entry(key.0).or_default().push(*key);
        }
        let mut socket_pool_of: BTreeMap<u32, PoolId> = BTreeMap::new();
        for (socket, dies) in &socket_groups {
            let id = arena.len() as PoolId;
            let children: Vec<PoolId> = dies.iter().map(|d| die_pool_of[d]).collect();
            let (cpus, isolated_cpus, memory_zones) = union_children(&arena, &children);
            arena.push(Pool {
                id,
                kind: PoolKind::Socket,
                depth: 2,
                parent: None,
                children: children.clone(),
                cpus,
                isolated_cpus,
                memory_zones,
                devices: Vec::new(),
            });
            for &c in &children {
                arena[c as usize].parent = Some(id);
            }
            socket_pool_of.insert(*socket, id);
        }

        // Root: union of all sockets.
        let root_children: Vec<PoolId> = socket_pool_of.values().copied().collect();
        let root_id = arena.len() as PoolId;
        let (cpus, isolated_cpus, memory_zones) = union_children(&arena, &root_children);
        arena.push(Pool {
            id: root_id,
            kind: PoolKind::Root,
            depth: 3,
            parent: None,
            children: root_children.clone(),
            cpus,
            isolated_cpus,
            memory_zones,
            devices: Vec::new(),
        });
        for &c in &root_children {
            arena[c as usize].parent = Some(root_id);
        }

        // Fix up depths bottom-up from the root (root depth 0, leaves deepest).
        fixup_depths(&mut arena, root_id, 0);

        // Attach device hints to the leaf closest to their preferred NUMA node.
        for dev in &input.devices {
            if let Some(&leaf) = numa_pool_of.get(&dev.preferred_numa_node) {
                arena[leaf as usize].devices.push(Device {
                    id: dev.id.clone(),
                    preferred_leaf: leaf,
                });
            }
        }

        Topology { arena, root: root_id }
    }

    pub fn root(&self) -> PoolId {
        self.root
    }

    pub fn pool(&self, id: PoolId) -> &Pool {
        &self.arena[id as usize]
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.arena.iter()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Pool> {
        self.arena.iter().filter(|p| p.kind == PoolKind::Numa)
    }

    /// Ancestors of `pool`, nearest first, including `pool` itself.
    pub fn ancestors(&self, pool: PoolId) -> Vec<PoolId> {
        let mut out = vec![pool];
        let mut cur = pool;
        while let Some(parent) = self.arena[cur as usize].parent {
            out.push(parent);
            cur = parent;
        }
        out
    }

    /// Depth of the lowest common ancestor of `a` and `b`.
    pub fn distance(&self, a: PoolId, b: PoolId) -> u32 {
        let anc_a = self.ancestors(a);
        let anc_b: std::collections::HashSet<PoolId> = self.ancestors(b).into_iter().collect();
        for cand in anc_a {
            if anc_b.contains(&cand) {
                return self.arena[cand as usize].depth;
            }
        }
        self.arena[self.root as usize].depth
    }

    /// Tree-edge distance between two pools (steps up to the LCA, then down).
    fn edge_distance(&self, a: PoolId, b: PoolId) -> u32 {
        let anc_a = self.ancestors(a);
        let anc_b = self.ancestors(b);
        let set_b: std::collections::HashSet<PoolId> = anc_b.iter().copied().collect();
        let mut up_a = 0u32;
        let mut lca = self.root;
        for (i, cand) in anc_a.iter().enumerate() {
            if set_b.contains(cand) {
                up_a = i as u32;
                lca = *cand;
                break;
            }
        }
        let up_b = anc_b.iter().position(|&p| p == lca).unwrap_or(0) as u32;
        up_a + up_b
    }

    /// Sum of inverse tree-edge-distances from `pool` to each device's
    /// preferred leaf, for the devices named in `device_ids`. Devices not
    /// present in the topology contribute zero.
    pub fn alignment_score(&self, pool: PoolId, device_ids: &[String]) -> f64 {
        let mut score = 0.0;
        for dev_id in device_ids {
            if let Some(leaf) = self
                .pools()
                .flat_map(|p| p.devices.iter())
                .find(|d| &d.id == dev_id)
                .map(|d| d.preferred_leaf)
            {
                let dist = self.edge_distance(pool, leaf);
                score += 1.0 / (1.0 + dist as f64);
            }
        }
        score
    }
}

fn union_children(arena: &[Pool], children: &[PoolId]) -> (Vec<u32>, Vec<u32>, Vec<MemoryZone>) {
    let mut cpus = Vec::new();
    let mut isolated_cpus = Vec::new();
    let mut zones: BTreeMap<u32, MemoryZone> = BTreeMap::new();
    for &c in children {
        let p = &arena[c as usize];
        cpus.extend(p.cpus.iter().copied());
        isolated_cpus.extend(p.isolated_cpus.iter().copied());
        for z in &p.memory_zones {
            zones.entry(z.id).or_insert(*z);
        }
    }
    cpus.sort_unstable();
    isolated_cpus.sort_unstable();
    (cpus, isolated_cpus, zones.into_values().collect())
}

fn fixup_depths(arena: &mut [Pool], root: PoolId, depth: u32) {
    arena[root as usize].depth = depth;
    let children = arena[root as usize].children.clone();
    for c in children {
        fixup_depths(arena, c, depth + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_numa_input() -> DiscoveryInput {
        let mut cpus = Vec::new();
        for node in 0..2u32 {
            for cpu in 0..8u32 {
                let id = node * 8 + cpu;
                cpus.push(CpuInfo {
                    id,
                    numa_node: node,
                    socket: node,
                    die: node,
                    isolated: cpu == 0,
                });
            }
        }
        let numa_nodes = (0..2u32)
            .map(|n| NumaNodeInfo {
                id: n,
                zones: vec![MemoryZone {
                    id: n,
                    tier: MemoryTier::Dram,
                    capacity_bytes: 4 * 1024 * 1024 * 1024,
                }],
            })
            .collect();
        DiscoveryInput {
            cpus,
            numa_nodes,
            devices: Vec::new(),
        }
    }

    #[test]
    fn builds_two_numa_tree_with_isolated_cpus() {
        let topo = Topology::build(two_numa_input());
        let leaves: Vec<_> = topo.leaves().collect();
        assert_eq!(leaves.len(), 2);
        for leaf in &leaves {
            assert_eq!(leaf.cpus.len(), 8);
            assert_eq!(leaf.isolated_cpus.len(), 1);
        }
        let root = topo.pool(topo.root());
        assert_eq!(root.cpus.len(), 16);
    }

    #[test]
    fn cpu_sets_are_disjoint_union_of_children() {
        let topo = Topology::build(two_numa_input());
        let root = topo.pool(topo.root());
        let mut child_cpus: Vec<u32> = root
            .children
            .iter()
            .flat_map(|c| topo.pool(*c).cpus.clone())
            .collect();
        child_cpus.sort_unstable();
        assert_eq!(child_cpus, root.cpus);
    }

    #[test]
    fn distance_between_siblings_is_parent_depth() {
        let topo = Topology::build(two_numa_input());
        let leaves: Vec<_> = topo.leaves().map(|p| p.id).collect();
        let d = topo.distance(leaves[0], leaves[1]);
        // Two single-node sockets: their LCA is the root (depth 0).
        assert_eq!(d, 0);
    }

    #[test]
    fn alignment_score_prefers_closer_pool() {
        let mut input = two_numa_input();
        input.devices.push(DeviceHint {
            id: "gpu0".into(),
            preferred_numa_node: 0,
        });
        let topo = Topology::build(input);
        let leaves: Vec<_> = topo.leaves().map(|p| p.id).collect();
        let near = topo.alignment_score(leaves[0], &["gpu0".to_string()]);
        let far = topo.alignment_score(leaves[1], &["gpu0".to_string()]);
        assert!(near > far);
    }
}
