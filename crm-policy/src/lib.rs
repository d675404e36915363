//! Placement policy core (C4 — spec.md §4.4).
//!
//! Generalizes the teacher's single-metric NUMA placement
//! (`zerovisor_core::numa_optimizer`), scheduling loop (`scheduler.rs`), and
//! runtime feature toggles (`plugin_manager.rs`, `feature_registry.rs`) into
//! the classify → select → assign → rebalance pipeline spec.md describes,
//! behind a `Policy` trait so alternate policies (a `balloons`-style policy
//! alongside the fully built `topology-aware` one) share a registry the way
//! `feature_registry::FeatureRegistry` hands out named features by lookup.

mod classify;
mod select;
mod state;
mod topology_aware;

pub use classify::{classify, eligible_for_exclusive, ClassificationRule, Classification, ReqView};
pub use select::{Candidate, PoolLedger, PoolState, ScoreWeights};
pub use state::PlacementPhase;
pub use topology_aware::{BalloonsPolicy, PolicyParams, TopologyAwarePolicy};

use std::collections::BTreeMap;
use std::sync::Arc;

use crm_cache::{Container, ContainerKey, Pod};
use crm_topology::PoolId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no pool has enough free capacity for this container")]
    NoFeasiblePool,
    #[error("invalid container request: {0}")]
    InvalidContainer(String),
    #[error("adjustment for {key:?} overlaps exclusive CPUs already owned by {owner:?}")]
    AdjustmentOverlap { key: ContainerKey, owner: ContainerKey },
    #[error("container {0:?} has no active placement to adjust")]
    NoActivePlacement(ContainerKey),
    #[error("invalid state transition for {key:?}: {from:?} -> {to:?}")]
    InvalidTransition {
        key: ContainerKey,
        from: PlacementPhase,
        to: PlacementPhase,
    },
    #[error("failed to parse policy configuration: {0}")]
    Config(String),
    #[error("unknown policy {0:?}")]
    UnknownPolicy(String),
    #[error("policy {0:?} does not implement this operation")]
    NotImplemented(&'static str),
}

/// What the policy decided for a single container: the CPU/memory/class
/// assignment the effector layer (C5) is responsible for enforcing.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub pool: PoolId,
    pub classification: Classification,
    pub shared_cpus: Vec<u32>,
    pub exclusive_cpus: Vec<u32>,
    pub memory_zone_mask: Vec<u32>,
    pub rdt_class: String,
    pub blockio_class: String,
    pub cold_start_pending: bool,
}

impl Default for Classification {
    fn default() -> Self {
        Classification::LowPriority
    }
}

/// An externally requested change to a container already placed (spec.md
/// §4.4.6, "Adjusted" state). Any field left `None` is unchanged.
#[derive(Debug, Clone, Default)]
pub struct Adjustment {
    pub key: ContainerKey,
    pub exclusive_cpus: Option<Vec<u32>>,
    pub shared_cpus: Option<Vec<u32>>,
    pub memory_zone_mask: Option<Vec<u32>>,
}

/// A named, swappable placement strategy. `Allocate`/`Release` mirror a
/// container's lifecycle; `Reconfigure` applies a new parameter set (parsed
/// from the policy's own YAML schema — each implementation owns its shape,
/// the way `zerovisor-sdk`'s CLI parses a config file per subsystem rather
/// than a single shared struct); `Rebalance` returns the set of shared-CPU
/// containers whose effective CPU set changed since the last call.
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn allocate(&self, pod: &Pod, container: &Container) -> Result<Decision, PolicyError>;
    fn release(&self, container: &Container) -> Result<(), PolicyError>;
    fn reconfigure(&self, yaml: &str) -> Result<(), PolicyError>;
    fn adjust(&self, adjustment: Adjustment) -> Result<Decision, PolicyError>;
    fn rebalance(&self) -> Vec<(ContainerKey, Vec<u32>)>;

    /// Called once effector enforcement (and RDT/BlockIO class assignment)
    /// has succeeded for a container's initial placement, advancing its
    /// internal phase toward `Live`. Default no-op: only `topology-aware`
    /// tracks per-container placement phases.
    fn mark_live(&self, _key: &ContainerKey) -> Result<(), PolicyError> {
        Ok(())
    }

    /// Called once a container's cold-start timer elapses. Returns the full
    /// memory zone mask to widen back to, if this container had a cold
    /// start narrowing pending. Default no-op.
    fn widen_cold_start(&self, _key: &ContainerKey) -> Option<Vec<u32>> {
        None
    }
}

type PolicyFactory = Arc<dyn Fn() -> Arc<dyn Policy> + Send + Sync>;

/// Name -> factory lookup for policies, the same shape as
/// `feature_registry::FeatureRegistry`'s `BTreeMap<&'static str, Box<dyn
/// Feature>>`, except entries are factories rather than live instances so
/// `--reset-policy` can rebuild a clean one on demand.
pub struct PolicyRegistry {
    factories: BTreeMap<&'static str, (PolicyFactory, &'static str)>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self { factories: BTreeMap::new() }
    }

    pub fn register(&mut self, name: &'static str, description: &'static str, factory: PolicyFactory) {
        self.factories.insert(name, (factory, description));
    }

    pub fn build(&self, name: &str) -> Result<Arc<dyn Policy>, PolicyError> {
        self.factories
            .get(name)
            .map(|(f, _)| f())
            .ok_or_else(|| PolicyError::UnknownPolicy(name.to_string()))
    }

    pub fn names(&self) -> Vec<(&'static str, &'static str)> {
        self.factories.iter().map(|(name, (_, desc))| (*name, *desc)).collect()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut reg = Self::new();
        reg.register(
            "topology-aware",
            "NUMA/die/socket-aware CPU and memory-tier placement with exclusive-CPU isolation",
            Arc::new(|| Arc::new(TopologyAwarePolicy::disabled()) as Arc<dyn Policy>),
        );
        reg.register(
            "balloons",
            "Fixed-size CPU/memory pool (\"balloon\") placement grouped by workload class",
            Arc::new(|| Arc::new(BalloonsPolicy::new()) as Arc<dyn Policy>),
        );
        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_both_policies_and_builds_by_name() {
        let reg = PolicyRegistry::default();
        let names: Vec<&str> = reg.names().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"topology-aware"));
        assert!(names.contains(&"balloons"));
        assert!(reg.build("topology-aware").is_ok());
        assert!(reg.build("nonexistent").is_err());
    }
}
