//! Configuration and adjustment intake (C8): the UDS surface the node agent
//! dials to push policy config and per-container adjustments.
//!
//! Grounded on `zerovisor-sdk/src/bin/cri_server.rs`'s per-method
//! `tonic::async_trait` server shape; the debounce/coalesce behavior is
//! modeled after `zerovisor-core/src/numa_optimizer.rs`'s periodic rebalance
//! loop, rewritten here as a per-node minimum-spacing gate rather than a
//! free-running timer, since each RPC must still return a result to its
//! caller.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crm_proto::intake::agent_intake_service_server::AgentIntakeService;
use crm_proto::intake::{SetAdjustmentRequest, SetAdjustmentResponse, SetConfigRequest, SetConfigResponse};

/// Applies config/adjustment updates to the policy core. Implemented by the
/// supervisor, which owns the live `Policy` and cache handles.
pub trait ConfigSink: Send + Sync + 'static {
    fn apply_config(&self, node_name: &str, config: &BTreeMap<String, String>) -> Result<(), String>;

    /// Returns one entry per adjustment that failed to apply; an empty map
    /// means every adjustment in the batch succeeded.
    fn apply_adjustment(&self, node_name: &str, adjustment_json: &str) -> BTreeMap<String, String>;
}

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct NodeGate {
    last_hash: Option<u64>,
    last_applied_at: Option<Instant>,
}

struct Debouncer {
    debounce: Duration,
    gates: Mutex<BTreeMap<String, NodeGate>>,
}

impl Debouncer {
    fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            gates: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns `None` if `node`'s last applied update already hashed to
    /// `hash` (idempotent no-op). Otherwise returns how long the caller
    /// should wait before applying, to keep at most one update per
    /// `debounce` window per node.
    fn admit(&self, node: &str, hash: u64) -> Option<Duration> {
        let mut gates = self.gates.lock().unwrap();
        let gate = gates.entry(node.to_string()).or_default();
        if gate.last_hash == Some(hash) {
            return None;
        }
        let wait = gate
            .last_applied_at
            .map(|at| self.debounce.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO);
        gate.last_hash = Some(hash);
        Some(wait)
    }

    fn record_applied(&self, node: &str) {
        let mut gates = self.gates.lock().unwrap();
        gates.entry(node.to_string()).or_default().last_applied_at = Some(Instant::now());
    }
}

fn hash_config(config: &BTreeMap<String, String>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (k, v) in config {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}

fn hash_str(value: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

pub struct AgentIntake<S: ConfigSink> {
    sink: S,
    config_gate: Debouncer,
    adjustment_gate: Debouncer,
    retry_delay: Duration,
}

impl<S: ConfigSink> AgentIntake<S> {
    pub fn new(sink: S) -> Self {
        Self::with_timing(sink, DEFAULT_DEBOUNCE, DEFAULT_RETRY_DELAY)
    }

    pub fn with_timing(sink: S, debounce: Duration, retry_delay: Duration) -> Self {
        Self {
            sink,
            config_gate: Debouncer::new(debounce),
            adjustment_gate: Debouncer::new(debounce),
            retry_delay,
        }
    }
}

#[tonic::async_trait]
impl<S: ConfigSink> AgentIntakeService for AgentIntake<S> {
    async fn set_config(
        &self,
        request: Request<SetConfigRequest>,
    ) -> Result<Response<SetConfigResponse>, Status> {
        let req = request.into_inner();
        let hash = hash_config(&req.config);

        let Some(wait) = self.config_gate.admit(&req.node_name, hash) else {
            debug!(node = %req.node_name, "config unchanged, skipping apply");
            return Ok(Response::new(SetConfigResponse { error: String::new() }));
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let mut result = self.sink.apply_config(&req.node_name, &req.config);
        if let Err(ref err) = result {
            warn!(node = %req.node_name, error = %err, "config apply failed, retrying once");
            tokio::time::sleep(self.retry_delay).await;
            result = self.sink.apply_config(&req.node_name, &req.config);
        }
        self.config_gate.record_applied(&req.node_name);

        Ok(Response::new(SetConfigResponse {
            error: result.err().unwrap_or_default(),
        }))
    }

    async fn set_adjustment(
        &self,
        request: Request<SetAdjustmentRequest>,
    ) -> Result<Response<SetAdjustmentResponse>, Status> {
        let req = request.into_inner();
        let hash = hash_str(&req.adjustment_json);

        let Some(wait) = self.adjustment_gate.admit(&req.node_name, hash) else {
            debug!(node = %req.node_name, "adjustment unchanged, skipping apply");
            return Ok(Response::new(SetAdjustmentResponse { errors: BTreeMap::new() }));
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let mut errors = self.sink.apply_adjustment(&req.node_name, &req.adjustment_json);
        if !errors.is_empty() {
            warn!(node = %req.node_name, failures = errors.len(), "adjustment apply had failures, retrying once");
            tokio::time::sleep(self.retry_delay).await;
            errors = self.sink.apply_adjustment(&req.node_name, &req.adjustment_json);
        }
        self.adjustment_gate.record_applied(&req.node_name);

        Ok(Response::new(SetAdjustmentResponse {
            errors: errors.into_iter().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        config_calls: Arc<AtomicUsize>,
        fail_first_n: Arc<AtomicUsize>,
    }

    impl ConfigSink for CountingSink {
        fn apply_config(&self, _node_name: &str, _config: &BTreeMap<String, String>) -> Result<(), String> {
            self.config_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                return Err("transient".to_string());
            }
            Ok(())
        }

        fn apply_adjustment(&self, _node_name: &str, _adjustment_json: &str) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    fn request(config: &[(&str, &str)]) -> Request<SetConfigRequest> {
        Request::new(SetConfigRequest {
            node_name: "node-a".to_string(),
            config: config.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        })
    }

    #[tokio::test]
    async fn identical_config_applied_twice_does_no_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let intake = AgentIntake::with_timing(
            CountingSink {
                config_calls: calls.clone(),
                fail_first_n: Arc::new(AtomicUsize::new(0)),
            },
            Duration::from_millis(0),
            Duration::from_millis(10),
        );

        intake.set_config(request(&[("a", "1")])).await.unwrap();
        intake.set_config(request(&[("a", "1")])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_config_is_reapplied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let intake = AgentIntake::with_timing(
            CountingSink {
                config_calls: calls.clone(),
                fail_first_n: Arc::new(AtomicUsize::new(0)),
            },
            Duration::from_millis(0),
            Duration::from_millis(10),
        );

        intake.set_config(request(&[("a", "1")])).await.unwrap();
        intake.set_config(request(&[("a", "2")])).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_apply_is_retried_once_and_reported() {
        let calls = Arc::new(AtomicUsize::new(0));
        let intake = AgentIntake::with_timing(
            CountingSink {
                config_calls: calls.clone(),
                fail_first_n: Arc::new(AtomicUsize::new(1)),
            },
            Duration::from_millis(0),
            Duration::from_millis(1),
        );

        let response = intake.set_config(request(&[("a", "1")])).await.unwrap();
        assert!(response.into_inner().error.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
