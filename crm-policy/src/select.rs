//! Pool scoring and selection (spec.md §4.4.2).
//!
//! Generalizes the teacher's single-metric NUMA scoring
//! (`zerovisor_core::numa_optimizer::NumaOptimizer::optimize_vm_placement`,
//! which scores free memory against a per-hop distance penalty) into the
//! four-term score spec.md calls for, plus the memory-alignment relaxation
//! walk up the tree.

use std::collections::BTreeMap;

use crm_cache::{ContainerKey, MemoryTierPref};
use crm_topology::{MemoryTier, PoolId, Topology};
use serde::{Deserialize, Serialize};

use crate::PolicyError;

/// In-memory ledger of what each pool currently holds. Owned by the policy,
/// not by the cache: it tracks CPU ownership and container counts, which the
/// cache has no need to know about. Guarded by a plain `RwLock` (not
/// `tokio::sync::RwLock`) since every access here is pure, non-blocking
/// bookkeeping, mirroring the teacher's `spin::Mutex`-guarded affinity maps.
#[derive(Debug, Default)]
pub struct PoolLedger {
    pools: std::sync::RwLock<BTreeMap<PoolId, PoolState>>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolState {
    pub container_count: u32,
    /// CPU id -> owning container, for CPUs currently held exclusively.
    pub exclusive_owned: BTreeMap<u32, ContainerKey>,
}

impl PoolLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, pool: PoolId, f: impl FnOnce(&PoolState) -> R) -> R {
        let guard = self.pools.read().unwrap();
        match guard.get(&pool) {
            Some(st) => f(st),
            None => f(&PoolState::default()),
        }
    }

    fn with_state_mut<R>(&self, pool: PoolId, f: impl FnOnce(&mut PoolState) -> R) -> R {
        let mut guard = self.pools.write().unwrap();
        f(guard.entry(pool).or_default())
    }

    pub fn free_millicpu(&self, topology: &Topology, pool: PoolId) -> u64 {
        let total = topology.pool(pool).total_millicpu();
        self.with_state(pool, |st| total.saturating_sub(st.exclusive_owned.len() as u64 * 1000))
    }

    pub fn shared_subset(&self, topology: &Topology, pool: PoolId) -> Vec<u32> {
        let cpus = &topology.pool(pool).cpus;
        self.with_state(pool, |st| {
            cpus.iter().copied().filter(|c| !st.exclusive_owned.contains_key(c)).collect()
        })
    }

    pub fn container_count(&self, pool: PoolId) -> u32 {
        self.with_state(pool, |st| st.container_count)
    }

    pub fn has_colocated(&self, pool: PoolId, key: &ContainerKey, same_pod: bool) -> bool {
        self.with_state(pool, |st| {
            st.exclusive_owned.values().any(|owner| {
                if same_pod {
                    owner.pod_name == key.pod_name && owner.namespace == key.namespace
                } else {
                    owner.namespace == key.namespace
                }
            })
        })
    }

    /// Slices `count` whole CPUs out of `pool`'s shared subset, preferring
    /// isolated CPUs first, and records the new owner. Errors if the pool no
    /// longer has enough free CPUs (the caller should have checked, but a
    /// concurrent reservation may have landed first).
    pub fn reserve_exclusive(
        &self,
        topology: &Topology,
        pool: PoolId,
        key: &ContainerKey,
        count: usize,
    ) -> Result<Vec<u32>, PolicyError> {
        let p = topology.pool(pool);
        self.with_state_mut(pool, |st| {
            let mut candidates: Vec<u32> = p
                .isolated_cpus
                .iter()
                .copied()
                .filter(|c| !st.exclusive_owned.contains_key(c))
                .collect();
            let mut rest: Vec<u32> = p
                .cpus
                .iter()
                .copied()
                .filter(|c| !st.exclusive_owned.contains_key(c) && !candidates.contains(c))
                .collect();
            candidates.append(&mut rest);
            if candidates.len() < count {
                return Err(PolicyError::NoFeasiblePool);
            }
            let chosen: Vec<u32> = candidates.into_iter().take(count).collect();
            for c in &chosen {
                st.exclusive_owned.insert(*c, key.clone());
            }
            st.container_count += 1;
            Ok(chosen)
        })
    }

    /// Returns the owner of any of `cpus` already held exclusively in `pool`
    /// by a container other than `key`, if any.
    pub fn owned_by_others(&self, pool: PoolId, key: &ContainerKey, cpus: &[u32]) -> Option<ContainerKey> {
        self.with_state(pool, |st| {
            cpus.iter()
                .find_map(|c| st.exclusive_owned.get(c).filter(|owner| *owner != key).cloned())
        })
    }

    /// Unconditionally records `key` as owning `cpus`. Callers must have
    /// already checked [`owned_by_others`] — this is the reject-on-overlap
    /// policy's enforcement point, not its decision point.
    pub fn force_reserve(&self, pool: PoolId, key: &ContainerKey, cpus: &[u32]) {
        self.with_state_mut(pool, |st| {
            for c in cpus {
                st.exclusive_owned.insert(*c, key.clone());
            }
        });
    }

    pub fn release_exclusive(&self, pool: PoolId, cpus: &[u32]) {
        self.with_state_mut(pool, |st| {
            for c in cpus {
                st.exclusive_owned.remove(c);
            }
            st.container_count = st.container_count.saturating_sub(1);
        });
    }

    pub fn note_shared_placement(&self, pool: PoolId) {
        self.with_state_mut(pool, |st| st.container_count += 1);
    }

    pub fn note_release(&self, pool: PoolId) {
        self.with_state_mut(pool, |st| st.container_count = st.container_count.saturating_sub(1));
    }
}

/// Score weights, α/β/γ/δ in spec.md §4.4.2, plus a fixed colocation bonus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub alpha_depth: f64,
    pub beta_free_cpu: f64,
    pub gamma_device_alignment: f64,
    pub delta_empty_pool: f64,
    pub colocate_bonus: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            alpha_depth: 1.0,
            beta_free_cpu: 1.0,
            gamma_device_alignment: 1.0,
            delta_empty_pool: 1.0,
            colocate_bonus: 10.0,
        }
    }
}

pub struct Candidate {
    pub pool: PoolId,
    pub memory_zone_mask: Vec<u32>,
    pub relaxation_steps: u32,
}

/// Filters leaves with enough free CPU, relaxes memory-zone coverage by
/// walking up the tree from each candidate leaf until the preferred tier is
/// present (or falls back to whatever the leaf itself offers), scores the
/// survivors, and returns the winner.
#[allow(clippy::too_many_arguments)]
pub fn select_pool(
    topology: &Topology,
    ledger: &PoolLedger,
    weights: &ScoreWeights,
    key: &ContainerKey,
    needed_millicpu: u64,
    memory_tier_pref: &[MemoryTierPref],
    device_hints: &[String],
    colocate_pods: bool,
    colocate_namespaces: bool,
) -> Result<Candidate, PolicyError> {
    let mut best: Option<(f64, Candidate)> = None;

    for leaf in topology.leaves() {
        if ledger.free_millicpu(topology, leaf.id) < needed_millicpu {
            continue;
        }

        let (zone_mask, relax_steps) = relax_memory(topology, leaf.id, memory_tier_pref);

        let free_frac = ledger.free_millicpu(topology, leaf.id) as f64 / leaf.total_millicpu().max(1) as f64;
        let alignment = topology.alignment_score(leaf.id, device_hints);
        let empty_bonus = if ledger.container_count(leaf.id) == 0 { 1.0 } else { 0.0 };
        let mut score = weights.alpha_depth * -(leaf.depth as f64)
            + weights.beta_free_cpu * free_frac
            + weights.gamma_device_alignment * alignment
            + weights.delta_empty_pool * empty_bonus;

        if colocate_pods && ledger.has_colocated(leaf.id, key, true) {
            score += weights.colocate_bonus;
        } else if colocate_namespaces && ledger.has_colocated(leaf.id, key, false) {
            score += weights.colocate_bonus;
        }

        let candidate = Candidate {
            pool: leaf.id,
            memory_zone_mask: zone_mask,
            relaxation_steps: relax_steps,
        };

        let replace = match &best {
            None => true,
            Some((best_score, best_candidate)) => {
                if score > *best_score {
                    true
                } else if (score - *best_score).abs() < f64::EPSILON {
                    // Tie-break: fewer containers, then smaller leaf id for determinism.
                    let this_count = ledger.container_count(leaf.id);
                    let best_count = ledger.container_count(best_candidate.pool);
                    this_count < best_count || (this_count == best_count && leaf.id < best_candidate.pool)
                } else {
                    false
                }
            }
        };
        if replace {
            best = Some((score, candidate));
        }
    }

    best.map(|(_, c)| c).ok_or(PolicyError::NoFeasiblePool)
}

/// Walks from `leaf` up through its ancestors, returning the zone ids of the
/// first ancestor (including the leaf itself) whose memory zones cover at
/// least one of the preferred tiers, and how many steps up that took. Falls
/// back to the leaf's own zones if no ancestor (including the root) has a
/// preferred tier — the caller still gets *a* memory mask, just not the
/// preferred one.
fn relax_memory(topology: &Topology, leaf: PoolId, pref: &[MemoryTierPref]) -> (Vec<u32>, u32) {
    if pref.is_empty() {
        return (topology.pool(leaf).zone_ids(), 0);
    }
    for (step, ancestor) in topology.ancestors(leaf).into_iter().enumerate() {
        let p = topology.pool(ancestor);
        if p.memory_zones.iter().any(|z| tier_matches(pref, z.tier)) {
            let zones: Vec<u32> = p
                .memory_zones
                .iter()
                .filter(|z| tier_matches(pref, z.tier))
                .map(|z| z.id)
                .collect();
            return (zones, step as u32);
        }
    }
    (topology.pool(leaf).zone_ids(), 0)
}

fn tier_matches(pref: &[MemoryTierPref], tier: MemoryTier) -> bool {
    pref.iter().any(|p| {
        matches!(
            (p, tier),
            (MemoryTierPref::Dram, MemoryTier::Dram)
                | (MemoryTierPref::Pmem, MemoryTier::Pmem)
                | (MemoryTierPref::Hbm, MemoryTier::Hbm)
        )
    })
}
