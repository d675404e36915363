//! The `topology-aware` policy: the fully-built implementation of spec.md
//! §4.4. `balloons` below is a deliberate stub — see DESIGN.md for why only
//! one of the two named policies is load-bearing.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use crm_cache::{Container, ContainerKey, MemoryTierPref, Pod};
use crm_topology::{DiscoveryInput, PoolId, Topology};
use serde::{Deserialize, Serialize};

use crate::classify::{classify, eligible_for_exclusive, ClassificationRule, Classification};
use crate::select::{select_pool, PoolLedger, ScoreWeights};
use crate::state::PlacementPhase;
use crate::{Adjustment, Decision, Policy, PolicyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyParams {
    pub weights: ScoreWeights,
    pub classification_rules: Vec<ClassificationRule>,
    pub system_namespaces: Vec<String>,
    pub colocate_pods: bool,
    pub colocate_namespaces: bool,
    /// CPUs reserved cluster-wide for kube-system containers, cut from the
    /// root pool rather than tracked against any one leaf's free capacity.
    pub reserved_cpus: Vec<u32>,
    pub cold_start_widen_after: Duration,
    /// Overrides the default `rm.<classification>` RDT/BlockIO class names.
    pub rdt_classes: BTreeMap<String, String>,
    pub blockio_classes: BTreeMap<String, String>,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            classification_rules: Vec::new(),
            system_namespaces: vec!["kube-system".to_string()],
            colocate_pods: true,
            colocate_namespaces: false,
            reserved_cpus: Vec::new(),
            cold_start_widen_after: Duration::from_secs(30),
            rdt_classes: BTreeMap::new(),
            blockio_classes: BTreeMap::new(),
        }
    }
}

struct Placement {
    pool: PoolId,
    classification: Classification,
    exclusive_cpus: Vec<u32>,
    last_shared_cpus: Vec<u32>,
}

struct ColdStartEntry {
    full_mask: Vec<u32>,
}

pub struct TopologyAwarePolicy {
    topology: Topology,
    ledger: PoolLedger,
    params: RwLock<PolicyParams>,
    placements: RwLock<BTreeMap<ContainerKey, Placement>>,
    cold_start: RwLock<BTreeMap<ContainerKey, ColdStartEntry>>,
    phase: RwLock<BTreeMap<ContainerKey, PlacementPhase>>,
}

impl TopologyAwarePolicy {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            ledger: PoolLedger::new(),
            params: RwLock::new(PolicyParams::default()),
            placements: RwLock::new(BTreeMap::new()),
            cold_start: RwLock::new(BTreeMap::new()),
            phase: RwLock::new(BTreeMap::new()),
        }
    }

    /// A single-node placeholder instance, good enough for `--print-config`
    /// and `--list-policies` introspection where no real hardware discovery
    /// has run.
    pub fn disabled() -> Self {
        Self::new(Topology::build(DiscoveryInput::default()))
    }

    fn transition_to(&self, key: &ContainerKey, to: PlacementPhase) -> Result<(), PolicyError> {
        let mut phases = self.phase.write().unwrap();
        let from = phases.get(key).copied().unwrap_or(PlacementPhase::New);
        if from == to {
            return Ok(());
        }
        if !from.can_transition(to) {
            return Err(PolicyError::InvalidTransition { key: key.clone(), from, to });
        }
        phases.insert(key.clone(), to);
        Ok(())
    }

    fn class_name(map: &BTreeMap<String, String>, classification: Classification) -> String {
        map.get(classification.as_str())
            .cloned()
            .unwrap_or_else(|| format!("rm.{}", classification.as_str()))
    }

    fn resolve_memory(
        &self,
        key: &ContainerKey,
        pool: PoolId,
        pref: &[MemoryTierPref],
        cold_start: Option<Duration>,
        candidate_mask: Vec<u32>,
    ) -> (Vec<u32>, bool) {
        let wants_both = pref.contains(&MemoryTierPref::Dram) && pref.contains(&MemoryTierPref::Pmem);
        if !wants_both || cold_start.is_none() {
            return (candidate_mask, false);
        }
        let pmem_only: Vec<u32> = self
            .topology
            .pool(pool)
            .memory_zones
            .iter()
            .filter(|z| z.tier == crm_topology::MemoryTier::Pmem)
            .map(|z| z.id)
            .collect();
        if pmem_only.is_empty() {
            return (candidate_mask, false);
        }
        self.cold_start
            .write()
            .unwrap()
            .insert(key.clone(), ColdStartEntry { full_mask: candidate_mask });
        (pmem_only, true)
    }

    fn device_hints(pod: &Pod) -> Vec<String> {
        pod.annotations
            .get("devices")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

impl Policy for TopologyAwarePolicy {
    fn name(&self) -> &'static str {
        "topology-aware"
    }

    fn description(&self) -> &'static str {
        "NUMA/die/socket-aware CPU and memory-tier placement with exclusive-CPU isolation"
    }

    fn allocate(&self, pod: &Pod, container: &Container) -> Result<Decision, PolicyError> {
        let params = self.params.read().unwrap().clone();
        let key = container.key.clone();
        let classification = classify(pod, container, &params.classification_rules, &params.system_namespaces);

        self.transition_to(&key, PlacementPhase::Classified)?;

        if classification == Classification::KubeSystem && !params.reserved_cpus.is_empty() {
            let root = self.topology.root();
            self.placements.write().unwrap().insert(
                key.clone(),
                Placement {
                    pool: root,
                    classification,
                    exclusive_cpus: Vec::new(),
                    last_shared_cpus: params.reserved_cpus.clone(),
                },
            );
            self.transition_to(&key, PlacementPhase::Placed)?;
            return Ok(Decision {
                pool: root,
                classification,
                shared_cpus: params.reserved_cpus.clone(),
                exclusive_cpus: Vec::new(),
                memory_zone_mask: self.topology.pool(root).zone_ids(),
                rdt_class: Self::class_name(&params.rdt_classes, classification),
                blockio_class: Self::class_name(&params.blockio_classes, classification),
                cold_start_pending: false,
            });
        }

        tracing::debug!(container = ?key, classification = classification.as_str(), "classified container");

        let exclusive_eligible = eligible_for_exclusive(pod, container, classification);
        let exclusive_count = if exclusive_eligible {
            (container.requested_millicpu / 1000) as usize
        } else {
            0
        };
        let needed = if exclusive_count > 0 { exclusive_count as u64 * 1000 } else { container.requested_millicpu };

        let device_hints = Self::device_hints(pod);
        let candidate = select_pool(
            &self.topology,
            &self.ledger,
            &params.weights,
            &key,
            needed,
            &container.memory_type_pref,
            &device_hints,
            params.colocate_pods,
            params.colocate_namespaces,
        )?;

        let (exclusive_cpus, shared_cpus) = if exclusive_count > 0 {
            let cpus = self.ledger.reserve_exclusive(&self.topology, candidate.pool, &key, exclusive_count)?;
            (cpus, Vec::new())
        } else {
            self.ledger.note_shared_placement(candidate.pool);
            (Vec::new(), self.ledger.shared_subset(&self.topology, candidate.pool))
        };

        let (zone_mask, cold_start_pending) = self.resolve_memory(
            &key,
            candidate.pool,
            &container.memory_type_pref,
            container.cold_start,
            candidate.memory_zone_mask,
        );

        self.placements.write().unwrap().insert(
            key.clone(),
            Placement {
                pool: candidate.pool,
                classification,
                exclusive_cpus: exclusive_cpus.clone(),
                last_shared_cpus: shared_cpus.clone(),
            },
        );
        self.transition_to(&key, PlacementPhase::Placed)?;
        tracing::info!(
            container = ?key,
            pool = candidate.pool,
            exclusive = exclusive_count,
            "placed container"
        );

        Ok(Decision {
            pool: candidate.pool,
            classification,
            shared_cpus,
            exclusive_cpus,
            memory_zone_mask: zone_mask,
            rdt_class: Self::class_name(&params.rdt_classes, classification),
            blockio_class: Self::class_name(&params.blockio_classes, classification),
            cold_start_pending,
        })
    }

    fn release(&self, container: &Container) -> Result<(), PolicyError> {
        let key = container.key.clone();
        tracing::debug!(container = ?key, "releasing container");
        if let Some(p) = self.placements.write().unwrap().remove(&key) {
            if p.exclusive_cpus.is_empty() {
                self.ledger.note_release(p.pool);
            } else {
                self.ledger.release_exclusive(p.pool, &p.exclusive_cpus);
            }
        }
        self.cold_start.write().unwrap().remove(&key);
        let mut phases = self.phase.write().unwrap();
        let from = phases.get(&key).copied().unwrap_or(PlacementPhase::New);
        if from.can_transition(PlacementPhase::Released) {
            phases.insert(key, PlacementPhase::Released);
        }
        Ok(())
    }

    fn reconfigure(&self, yaml: &str) -> Result<(), PolicyError> {
        let parsed: PolicyParams = serde_yaml::from_str(yaml).map_err(|e| PolicyError::Config(e.to_string()))?;
        *self.params.write().unwrap() = parsed;
        Ok(())
    }

    /// Reject-on-overlap: an adjustment whose requested exclusive CPUs are
    /// already owned by a different container is an error, never a silent
    /// reassignment (the Open Question spec.md leaves unresolved; this
    /// crate decides in favor of safety over opportunistic stealing).
    fn adjust(&self, adjustment: Adjustment) -> Result<Decision, PolicyError> {
        let key = adjustment.key.clone();
        let params = self.params.read().unwrap().clone();

        // Validate the phase transition before touching the ledger or the
        // placement record: a rejected adjustment must leave no trace.
        {
            let phases = self.phase.read().unwrap();
            let from = phases.get(&key).copied().unwrap_or(PlacementPhase::New);
            if from != PlacementPhase::Adjusted && !from.can_transition(PlacementPhase::Adjusted) {
                return Err(PolicyError::InvalidTransition { key: key.clone(), from, to: PlacementPhase::Adjusted });
            }
        }

        let mut placements = self.placements.write().unwrap();
        let placement = placements
            .get_mut(&key)
            .ok_or_else(|| PolicyError::NoActivePlacement(key.clone()))?;

        let classification = placement.classification;

        if let Some(new_excl) = &adjustment.exclusive_cpus {
            if let Some(owner) = self.ledger.owned_by_others(placement.pool, &key, new_excl) {
                return Err(PolicyError::AdjustmentOverlap { key, owner });
            }
            self.ledger.release_exclusive(placement.pool, &placement.exclusive_cpus);
            self.ledger.force_reserve(placement.pool, &key, new_excl);
            placement.exclusive_cpus = new_excl.clone();
        }
        if let Some(new_shared) = &adjustment.shared_cpus {
            placement.last_shared_cpus = new_shared.clone();
        }

        let decision = Decision {
            pool: placement.pool,
            classification,
            shared_cpus: placement.last_shared_cpus.clone(),
            exclusive_cpus: placement.exclusive_cpus.clone(),
            memory_zone_mask: adjustment
                .memory_zone_mask
                .clone()
                .unwrap_or_else(|| self.topology.pool(placement.pool).zone_ids()),
            rdt_class: Self::class_name(&params.rdt_classes, classification),
            blockio_class: Self::class_name(&params.blockio_classes, classification),
            cold_start_pending: false,
        };
        drop(placements);
        self.transition_to(&key, PlacementPhase::Adjusted)?;
        Ok(decision)
    }

    /// Recomputes every shared-CPU container's effective CPU set (the
    /// pool's current shared subset, which shrinks and grows as exclusive
    /// reservations in the same pool come and go) and reports which ones
    /// changed since the last call.
    fn rebalance(&self) -> Vec<(ContainerKey, Vec<u32>)> {
        let mut changed = Vec::new();
        let mut placements = self.placements.write().unwrap();
        for (key, placement) in placements.iter_mut() {
            if placement.exclusive_cpus.is_empty() {
                let new_set = self.ledger.shared_subset(&self.topology, placement.pool);
                if new_set != placement.last_shared_cpus {
                    placement.last_shared_cpus = new_set.clone();
                    changed.push((key.clone(), new_set));
                }
            }
        }
        changed
    }

    /// Advances a container's phase `Placed -> Enforced -> Live` once the
    /// effector has enforced its initial placement. A no-op if the
    /// container is already `Live` or `Adjusted`, so a retried
    /// `StartContainer` stays idempotent.
    fn mark_live(&self, key: &ContainerKey) -> Result<(), PolicyError> {
        let mut phases = self.phase.write().unwrap();
        let from = phases.get(key).copied().unwrap_or(PlacementPhase::New);
        if matches!(from, PlacementPhase::Live | PlacementPhase::Adjusted) {
            return Ok(());
        }
        let mut current = from;
        if current.can_transition(PlacementPhase::Enforced) {
            current = PlacementPhase::Enforced;
        }
        if current.can_transition(PlacementPhase::Live) {
            current = PlacementPhase::Live;
        }
        if current == from {
            return Err(PolicyError::InvalidTransition { key: key.clone(), from, to: PlacementPhase::Live });
        }
        phases.insert(key.clone(), current);
        Ok(())
    }

    /// Returns the full (previously narrowed) memory zone mask for a
    /// container whose cold-start timer just elapsed, if one was pending.
    fn widen_cold_start(&self, key: &ContainerKey) -> Option<Vec<u32>> {
        self.cold_start.write().unwrap().remove(key).map(|e| e.full_mask)
    }
}

/// Fixed-size CPU/memory "balloon" pools grouped by workload class, the way
/// the original `cri-resource-manager` offers as an alternative to
/// topology-aware placement. Registered so `--list-policies` and
/// `--print-config` can describe it, but allocation is not implemented —
/// selecting it at startup is rejected by the supervisor (spec.md's
/// Non-goals exclude alternate-policy parity; this keeps the name
/// discoverable without pretending it works).
pub struct BalloonsPolicy;

impl BalloonsPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BalloonsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for BalloonsPolicy {
    fn name(&self) -> &'static str {
        "balloons"
    }

    fn description(&self) -> &'static str {
        "Fixed-size CPU/memory pool (\"balloon\") placement grouped by workload class"
    }

    fn allocate(&self, _pod: &Pod, _container: &Container) -> Result<Decision, PolicyError> {
        Err(PolicyError::NotImplemented("balloons"))
    }

    fn release(&self, _container: &Container) -> Result<(), PolicyError> {
        Err(PolicyError::NotImplemented("balloons"))
    }

    fn reconfigure(&self, _yaml: &str) -> Result<(), PolicyError> {
        Err(PolicyError::NotImplemented("balloons"))
    }

    fn adjust(&self, _adjustment: Adjustment) -> Result<Decision, PolicyError> {
        Err(PolicyError::NotImplemented("balloons"))
    }

    fn rebalance(&self) -> Vec<(ContainerKey, Vec<u32>)> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_cache::{ContainerState, QosClass};
    use crm_topology::{CpuInfo, MemoryTier, MemoryZone, NumaNodeInfo};
    use std::collections::BTreeMap as Map;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn two_numa_topology() -> Topology {
        let mut cpus = Vec::new();
        for node in 0..2u32 {
            for cpu in 0..4u32 {
                cpus.push(CpuInfo {
                    id: node * 4 + cpu,
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
                zones: vec![MemoryZone { id: n, tier: MemoryTier::Dram, capacity_bytes: 4 << 30 }],
            })
            .collect();
        Topology::build(DiscoveryInput { cpus, numa_nodes, devices: Vec::new() })
    }

    fn pod(namespace: &str, qos: QosClass) -> Pod {
        Pod {
            uid: "u1".into(),
            name: "p1".into(),
            namespace: namespace.into(),
            qos_class: qos,
            labels: Map::new(),
            annotations: Map::new(),
            cgroup_parent: String::new(),
            containers: Vec::new(),
            lingering_since: None,
        }
    }

    fn container(name: &str, millicpu: u64) -> Container {
        Container {
            key: ContainerKey { namespace: "default".into(), pod_name: "p1".into(), container_name: name.into() },
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
    fn guaranteed_whole_cpu_gets_exclusive_allocation() {
        let policy = TopologyAwarePolicy::new(two_numa_topology());
        let p = pod("default", QosClass::Guaranteed);
        let c = container("c1", 2000);
        let decision = policy.allocate(&p, &c).unwrap();
        assert_eq!(decision.classification, Classification::MultiCore);
        assert_eq!(decision.exclusive_cpus.len(), 2);
        assert!(decision.shared_cpus.is_empty());
    }

    #[test]
    fn kube_system_gets_reserved_cpus_regardless_of_pool_capacity() {
        let policy = TopologyAwarePolicy::new(two_numa_topology());
        policy
            .reconfigure("reserved_cpus: [0, 4]\nsystem_namespaces: [\"kube-system\"]\n")
            .unwrap();
        let p = pod("kube-system", QosClass::Burstable);
        let c = container("c1", 100);
        let decision = policy.allocate(&p, &c).unwrap();
        assert_eq!(decision.classification, Classification::KubeSystem);
        assert_eq!(decision.shared_cpus, vec![0, 4]);
    }

    #[test]
    fn exhausting_exclusive_capacity_fails_over_rather_than_oversubscribe() {
        let policy = TopologyAwarePolicy::new(two_numa_topology());
        let p = pod("default", QosClass::Guaranteed);
        for i in 0..2 {
            let c = container(&format!("big{i}"), 4000);
            assert!(policy.allocate(&p, &c).is_ok());
        }
        let c = container("one-too-many", 4000);
        assert!(policy.allocate(&p, &c).is_err());
    }

    #[test]
    fn release_frees_exclusive_cpus_for_reuse() {
        let policy = TopologyAwarePolicy::new(two_numa_topology());
        let p = pod("default", QosClass::Guaranteed);
        let c = container("c1", 4000);
        policy.allocate(&p, &c).unwrap();
        policy.release(&c).unwrap();
        let c2 = container("c2", 4000);
        assert!(policy.allocate(&p, &c2).is_ok());
    }

    #[test]
    fn adjustment_overlapping_another_containers_exclusive_cpus_is_rejected() {
        let policy = TopologyAwarePolicy::new(two_numa_topology());
        let p = pod("default", QosClass::Guaranteed);
        let c1 = container("c1", 1000);
        let c2 = container("c2", 1000);
        let d1 = policy.allocate(&p, &c1).unwrap();
        policy.allocate(&p, &c2).unwrap();

        let bad = Adjustment {
            key: c2.key.clone(),
            exclusive_cpus: Some(d1.exclusive_cpus.clone()),
            shared_cpus: None,
            memory_zone_mask: None,
        };
        let err = policy.adjust(bad).unwrap_err();
        assert!(matches!(err, PolicyError::AdjustmentOverlap { .. }));
    }

    #[test]
    fn adjust_succeeds_right_after_allocate_without_an_intervening_start() {
        // `allocate` only ever reaches `Placed`; nothing in this test drives
        // the container to `Enforced`/`Live` first, matching a CRI
        // `UpdateContainerResources` or agent `SetAdjustment` that arrives
        // before `StartContainer` enforces the initial placement.
        let policy = TopologyAwarePolicy::new(two_numa_topology());
        let p = pod("default", QosClass::Guaranteed);
        let c = container("c1", 1000);
        policy.allocate(&p, &c).unwrap();

        let adjustment = Adjustment {
            key: c.key.clone(),
            exclusive_cpus: None,
            shared_cpus: Some(vec![0, 1]),
            memory_zone_mask: None,
        };
        assert!(policy.adjust(adjustment).is_ok());
    }

    #[test]
    fn rejected_adjustment_leaves_the_ledger_untouched() {
        let policy = TopologyAwarePolicy::new(two_numa_topology());
        let p = pod("default", QosClass::Guaranteed);
        let c1 = container("c1", 1000);
        let c2 = container("c2", 1000);
        let d1 = policy.allocate(&p, &c1).unwrap();
        policy.allocate(&p, &c2).unwrap();

        let bad = Adjustment {
            key: c2.key.clone(),
            exclusive_cpus: Some(d1.exclusive_cpus.clone()),
            shared_cpus: None,
            memory_zone_mask: None,
        };
        assert!(policy.adjust(bad).is_err());

        // c1's exclusive CPUs must still be reserved to c1, not released by
        // the rejected adjustment against c2.
        let reclaim = Adjustment {
            key: c1.key.clone(),
            exclusive_cpus: Some(d1.exclusive_cpus.clone()),
            shared_cpus: None,
            memory_zone_mask: None,
        };
        assert!(policy.adjust(reclaim).is_ok());
    }

    #[test]
    fn mark_live_advances_placed_to_live_and_is_idempotent() {
        let policy = TopologyAwarePolicy::new(two_numa_topology());
        let p = pod("default", QosClass::Guaranteed);
        let c = container("c1", 1000);
        policy.allocate(&p, &c).unwrap();
        assert!(policy.mark_live(&c.key).is_ok());
        assert!(policy.mark_live(&c.key).is_ok());
    }

    #[test]
    fn balloons_is_registered_but_not_functional() {
        let policy = BalloonsPolicy::new();
        let p = pod("default", QosClass::Guaranteed);
        let c = container("c1", 1000);
        assert!(policy.allocate(&p, &c).is_err());
    }
}
