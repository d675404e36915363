//! CRI interception server (C6 — spec.md §4.6): the gRPC front the kubelet
//! dials. Every method is either forwarded verbatim (passthrough) or routed
//! through the cache/policy/effector pipeline under the global policy lock
//! (intercepted).
//!
//! Grounded on `zerovisor-sdk/src/bin/cri_server.rs`'s `CriService`
//! (`tonic::async_trait` impl of a generated `*ServiceServer` trait,
//! forwarding into a lower-layer client); the passthrough/intercepted split
//! and the policy-lock discipline are new structure with no direct teacher
//! counterpart, built in the same idiom.

mod convert;
mod timing;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::{Arc, RwLock};

use tonic::{transport::Channel, Request, Response, Status};
use tracing::warn;

use crm_cache::{Container as CacheContainer, ContainerKey, ContainerState as CacheContainerState, Pod, PodUid, QosClass, WorkloadCache};
use crm_effector::{EffectorError, EnforceRequest};
use crm_policy::{Adjustment, Decision, Policy, PolicyError};
use crm_proto::runtime::image_service_client::ImageServiceClient;
use crm_proto::runtime::image_service_server::ImageService;
use crm_proto::runtime::runtime_service_client::RuntimeServiceClient;
use crm_proto::runtime::runtime_service_server::RuntimeService;
use crm_proto::runtime::*;
use crm_runtime_client::RuntimeClient;

use convert::{join_cpus, parse_cold_start, parse_cpu_list, parse_memory_pref, to_btree};
use timing::RequestTiming;

/// Predicate a caller (typically the supervisor, during shutdown) can flip
/// to force every method — intercepted or not — onto the passthrough path.
pub type BypassPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

struct SandboxIndex {
    pod_uid_by_sandbox: Mutex<BTreeMap<String, PodUid>>,
}

impl SandboxIndex {
    fn new() -> Self {
        Self {
            pod_uid_by_sandbox: Mutex::new(BTreeMap::new()),
        }
    }

    fn record(&self, sandbox_id: &str, pod_uid: &str) {
        self.pod_uid_by_sandbox
            .lock()
            .unwrap()
            .insert(sandbox_id.to_string(), pod_uid.to_string());
    }

    fn pod_uid_of(&self, sandbox_id: &str) -> Option<PodUid> {
        self.pod_uid_by_sandbox.lock().unwrap().get(sandbox_id).cloned()
    }

    fn forget(&self, sandbox_id: &str) {
        self.pod_uid_by_sandbox.lock().unwrap().remove(sandbox_id);
    }
}

pub struct CriServer {
    cache: Arc<WorkloadCache>,
    policy: RwLock<Arc<dyn Policy>>,
    effector: Arc<dyn crm_effector::Effector>,
    runtime: RuntimeClient,
    policy_lock: tokio::sync::RwLock<()>,
    sandboxes: SandboxIndex,
    bypass: BypassPredicate,
}

impl CriServer {
    pub fn new(
        cache: Arc<WorkloadCache>,
        policy: Arc<dyn Policy>,
        effector: Arc<dyn crm_effector::Effector>,
        runtime: RuntimeClient,
        bypass: BypassPredicate,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            policy: RwLock::new(policy),
            effector,
            runtime,
            policy_lock: tokio::sync::RwLock::new(()),
            sandboxes: SandboxIndex::new(),
            bypass,
        })
    }

    /// Swaps the active policy (`--reset-policy`, a config-driven policy
    /// switch). Rejected callers honor `--disable-policy-switch` by simply
    /// never calling this.
    pub fn set_policy(&self, policy: Arc<dyn Policy>) {
        *self.policy.write().unwrap() = policy;
    }

    fn policy(&self) -> Arc<dyn Policy> {
        self.policy.read().unwrap().clone()
    }

    fn bypassed(&self) -> bool {
        (self.bypass)()
    }

    fn runtime_client(&self) -> RuntimeServiceClient<Channel> {
        self.runtime.runtime()
    }

    fn image_client(&self) -> ImageServiceClient<Channel> {
        self.runtime.image()
    }

    /// Verbatim forward with no cache/policy involvement: the "Passthrough"
    /// path of spec.md §4.6. Generic over the request/response pair and the
    /// bound client method.
    async fn passthrough<Req, Resp, F, Fut>(&self, method: &'static str, request: Request<Req>, call: F) -> Result<Response<Resp>, Status>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: FnOnce(Request<Req>) -> Fut + Send,
        Fut: Future<Output = Result<Response<Resp>, Status>> + Send,
    {
        let mut timing = RequestTiming::start(method);
        timing.mark_sent();
        let result = call(request).await;
        timing.mark_received();
        timing.finish(result.is_ok());
        result
    }

    fn cgroup_path_for(pod: &Pod, container_id: &str) -> String {
        if pod.cgroup_parent.is_empty() {
            container_id.to_string()
        } else {
            format!("{}/{}", pod.cgroup_parent.trim_end_matches('/'), container_id)
        }
    }

    fn enforce_request(pod: &Pod, container: &CacheContainer) -> EnforceRequest {
        EnforceRequest {
            cgroup_path: Self::cgroup_path_for(pod, container.id.as_deref().unwrap_or(&container.key.container_name)),
            shared_cpus: container.shared_cpus.clone(),
            exclusive_cpus: container.exclusive_cpus.clone(),
            memory_zone_mask: container.memory_zone_mask.clone(),
            rdt_class: container.rdt_class.clone().unwrap_or_default(),
            blockio_class: container.blockio_class.clone().unwrap_or_default(),
        }
    }

    fn log_effector_err(context: &str, err: EffectorError) {
        warn!(context, error = %err, "effector write failed after retry, decision stands uncommitted at the kernel level");
    }

    /// Pushes a rebalance's shared-CPU deltas to the runtime and the local
    /// effector: each entry updates one sibling container's cpuset following
    /// an exclusive CPU allocation or release in its pool (spec.md §4.4.5).
    async fn push_rebalance(&self, changes: Vec<(ContainerKey, Vec<u32>)>) {
        for (key, new_shared) in changes {
            let Some(container) = self.cache.get_container(&key).await else { continue };
            let container_id = req_container_id(&container).to_string();
            let linux = LinuxContainerResources {
                cpuset_cpus: join_cpus(&new_shared),
                cpuset_mems: join_cpus(&container.memory_zone_mask),
                requested_millicpu: container.requested_millicpu,
                limit_millicpu: container.limit_millicpu,
                memory_limit_in_bytes: container.limit_memory_bytes as i64,
                ..Default::default()
            };
            let req = UpdateContainerResourcesRequest {
                container_id,
                linux: Some(linux),
            };
            if let Err(err) = self.runtime_client().update_container_resources(Request::new(req)).await {
                warn!(container = ?key, error = %err, "rebalance push to runtime failed");
                continue;
            }
            if let Err(err) = self.cache.update_container(&key, |c| c.shared_cpus = new_shared.clone()).await {
                warn!(container = ?key, error = %err, "rebalance cache update failed");
            }
            if let Some(pod) = self.cache.get_pod(&container.pod_uid).await {
                let mut updated = container.clone();
                updated.shared_cpus = new_shared;
                if let Err(err) = self.effector.enforce(&Self::enforce_request(&pod, &updated)) {
                    Self::log_effector_err("rebalance enforce", err);
                }
            }
        }
    }

    /// Spawns a one-shot timer that widens a cold-started container's memory
    /// zone mask back to its full preference once `duration` elapses
    /// (spec.md §4.4.4). Captures owned clones rather than `self` so it can
    /// outlive the request that triggered it.
    fn spawn_cold_start_widen(&self, key: ContainerKey, duration: std::time::Duration) {
        let cache = self.cache.clone();
        let policy = self.policy();
        let effector = self.effector.clone();
        let mut runtime_client = self.runtime_client();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let Some(full_mask) = policy.widen_cold_start(&key) else { return };
            let Some(container) = cache.get_container(&key).await else { return };
            let container_id = req_container_id(&container).to_string();
            let linux = LinuxContainerResources {
                cpuset_cpus: join_cpus(&[container.shared_cpus.clone(), container.exclusive_cpus.clone()].concat()),
                cpuset_mems: join_cpus(&full_mask),
                requested_millicpu: container.requested_millicpu,
                limit_millicpu: container.limit_millicpu,
                memory_limit_in_bytes: container.limit_memory_bytes as i64,
                ..Default::default()
            };
            let req = UpdateContainerResourcesRequest {
                container_id,
                linux: Some(linux),
            };
            if let Err(err) = runtime_client.update_container_resources(Request::new(req)).await {
                warn!(container = ?key, error = %err, "cold-start widen push to runtime failed");
                return;
            }
            if let Err(err) = cache.update_container(&key, |c| c.memory_zone_mask = full_mask.clone()).await {
                warn!(container = ?key, error = %err, "cold-start widen cache update failed");
            }
            if let Some(pod) = cache.get_pod(&container.pod_uid).await {
                let mut updated = container.clone();
                updated.memory_zone_mask = full_mask;
                if let Err(err) = effector.enforce(&CriServer::enforce_request(&pod, &updated)) {
                    CriServer::log_effector_err("cold-start widen enforce", err);
                }
            }
        });
    }
}

fn qos_from_annotations(annotations: &BTreeMap<String, String>) -> QosClass {
    match annotations.get("kubernetes.io/qos-class").map(String::as_str) {
        Some("Guaranteed") => QosClass::Guaranteed,
        Some("BestEffort") => QosClass::BestEffort,
        _ => QosClass::Burstable,
    }
}

#[tonic::async_trait]
impl RuntimeService for CriServer {
    async fn version(&self, request: Request<VersionRequest>) -> Result<Response<VersionResponse>, Status> {
        self.passthrough("Version", request, |r| async move { self.runtime_client().version(r).await }).await
    }

    async fn run_pod_sandbox(&self, request: Request<RunPodSandboxRequest>) -> Result<Response<RunPodSandboxResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("RunPodSandbox", request, |r| async move { self.runtime_client().run_pod_sandbox(r).await })
                .await;
        }
        let mut timing = RequestTiming::start("RunPodSandbox");
        let _guard = self.policy_lock.write().await;

        let req = request.into_inner();
        let config = req.config.clone().unwrap_or_default();
        let metadata = config.metadata.clone().unwrap_or_default();
        let annotations = to_btree(config.annotations.clone());
        let pod = Pod {
            uid: metadata.uid.clone(),
            name: metadata.name.clone(),
            namespace: metadata.namespace.clone(),
            qos_class: qos_from_annotations(&annotations),
            labels: to_btree(config.labels.clone()),
            annotations,
            cgroup_parent: config.linux.clone().map(|l| l.cgroup_parent).unwrap_or_default(),
            containers: Vec::new(),
            lingering_since: None,
        };
        if let Err(err) = self.cache.insert_pod(pod).await {
            timing.finish(false);
            return Err(Status::internal(err.to_string()));
        }

        timing.mark_sent();
        let reply = self.runtime_client().run_pod_sandbox(Request::new(req)).await;
        timing.mark_received();

        match &reply {
            Ok(resp) => self.sandboxes.record(&resp.get_ref().pod_sandbox_id, &metadata.uid),
            Err(_) => {
                // Sandbox creation failed upstream: drop the tentative cache entry.
                let _ = self.cache.remove_pod(&metadata.uid).await;
            }
        }
        timing.finish(reply.is_ok());
        reply
    }

    async fn stop_pod_sandbox(&self, request: Request<StopPodSandboxRequest>) -> Result<Response<StopPodSandboxResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("StopPodSandbox", request, |r| async move { self.runtime_client().stop_pod_sandbox(r).await })
                .await;
        }
        let _guard = self.policy_lock.write().await;
        self.passthrough("StopPodSandbox", request, |r| async move { self.runtime_client().stop_pod_sandbox(r).await })
            .await
    }

    async fn remove_pod_sandbox(&self, request: Request<RemovePodSandboxRequest>) -> Result<Response<RemovePodSandboxResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("RemovePodSandbox", request, |r| async move { self.runtime_client().remove_pod_sandbox(r).await })
                .await;
        }
        let mut timing = RequestTiming::start("RemovePodSandbox");
        let _guard = self.policy_lock.write().await;

        let req = request.into_inner();
        let sandbox_id = req.pod_sandbox_id.clone();

        timing.mark_sent();
        let reply = self.runtime_client().remove_pod_sandbox(Request::new(req)).await;
        timing.mark_received();

        if reply.is_ok() {
            if let Some(pod_uid) = self.sandboxes.pod_uid_of(&sandbox_id) {
                if let Err(err) = self.cache.remove_pod(&pod_uid).await {
                    warn!(error = %err, "cache pod removal failed after runtime removed the sandbox");
                }
            }
            self.sandboxes.forget(&sandbox_id);
        }
        timing.finish(reply.is_ok());
        reply
    }

    async fn pod_sandbox_status(&self, request: Request<PodSandboxStatusRequest>) -> Result<Response<PodSandboxStatusResponse>, Status> {
        self.passthrough("PodSandboxStatus", request, |r| async move { self.runtime_client().pod_sandbox_status(r).await })
            .await
    }

    async fn list_pod_sandbox(&self, request: Request<ListPodSandboxRequest>) -> Result<Response<ListPodSandboxResponse>, Status> {
        self.passthrough("ListPodSandbox", request, |r| async move { self.runtime_client().list_pod_sandbox(r).await })
            .await
    }

    async fn create_container(&self, request: Request<CreateContainerRequest>) -> Result<Response<CreateContainerResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("CreateContainer", request, |r| async move { self.runtime_client().create_container(r).await })
                .await;
        }
        let mut timing = RequestTiming::start("CreateContainer");
        let _guard = self.policy_lock.write().await;

        let mut req = request.into_inner();
        let sandbox_config = req.sandbox_config.clone().unwrap_or_default();
        let sandbox_meta = sandbox_config.metadata.clone().unwrap_or_default();
        let pod_uid = self
            .sandboxes
            .pod_uid_of(&req.pod_sandbox_id)
            .unwrap_or_else(|| sandbox_meta.uid.clone());

        let Some(pod) = self.cache.get_pod(&pod_uid).await else {
            timing.finish(false);
            return Err(Status::failed_precondition("pod sandbox not known to the cache"));
        };

        let config = req.config.clone().unwrap_or_default();
        let container_meta = config.metadata.clone().unwrap_or_default();
        let resources = config.resources.clone().unwrap_or_default();
        let annotations = to_btree(config.annotations.clone());

        let key = ContainerKey {
            namespace: pod.namespace.clone(),
            pod_name: pod.name.clone(),
            container_name: container_meta.name.clone(),
        };

        let cache_container = CacheContainer {
            key: key.clone(),
            id: None,
            pod_uid: pod_uid.clone(),
            requested_millicpu: resources.requested_millicpu,
            limit_millicpu: resources.limit_millicpu,
            requested_memory_bytes: resources.memory_limit_in_bytes.max(0) as u64,
            limit_memory_bytes: resources.memory_limit_in_bytes.max(0) as u64,
            shared_cpus: Vec::new(),
            exclusive_cpus: Vec::new(),
            memory_zone_mask: Vec::new(),
            memory_type_pref: parse_memory_pref(&annotations, &container_meta.name),
            rdt_class: None,
            blockio_class: None,
            cold_start: parse_cold_start(&annotations, &container_meta.name),
            owning_pool: None,
            state: CacheContainerState::Creating,
            lingering_since: None,
            created_at_unix: crm_cache::now_unix(),
        };

        if let Err(err) = self.cache.insert_container(&pod_uid, cache_container.clone()).await {
            timing.finish(false);
            return Err(Status::internal(err.to_string()));
        }

        let decision = match self.policy().allocate(&pod, &cache_container) {
            Ok(d) => d,
            Err(err) => {
                let _ = self.cache.remove_container(&key).await;
                timing.finish(false);
                return Err(policy_error_to_status(err));
            }
        };

        // Preferred path (spec.md §4.5): amend the outbound request's Linux
        // resources in place rather than writing cgroup files after the
        // fact, since the cgroup doesn't exist until the runtime creates it.
        let mut linux = resources;
        linux.cpuset_cpus = join_cpus(&[decision.shared_cpus.clone(), decision.exclusive_cpus.clone()].concat());
        linux.cpuset_mems = join_cpus(&decision.memory_zone_mask);
        let mut new_config = config;
        new_config.resources = Some(linux);
        req.config = Some(new_config);

        timing.mark_sent();
        let reply = self.runtime_client().create_container(Request::new(req)).await;
        timing.mark_received();

        match &reply {
            Ok(resp) => {
                let container_id = resp.get_ref().container_id.clone();
                if let Err(err) = self.commit_decision(&key, &container_id, &decision).await {
                    warn!(error = %err, "failed to commit placement decision to cache");
                }
                if !decision.exclusive_cpus.is_empty() {
                    let changes = self.policy().rebalance();
                    self.push_rebalance(changes).await;
                }
                if decision.cold_start_pending {
                    if let Some(duration) = cache_container.cold_start {
                        self.spawn_cold_start_widen(key.clone(), duration);
                    }
                }
            }
            Err(_) => {
                if let Err(err) = self.policy().release(&cache_container) {
                    warn!(error = %err, "policy release after failed CreateContainer also failed");
                }
                let _ = self.cache.remove_container(&key).await;
            }
        }
        timing.finish(reply.is_ok());
        reply
    }

    async fn start_container(&self, request: Request<StartContainerRequest>) -> Result<Response<StartContainerResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("StartContainer", request, |r| async move { self.runtime_client().start_container(r).await })
                .await;
        }
        let mut timing = RequestTiming::start("StartContainer");
        let _guard = self.policy_lock.write().await;

        let req = request.into_inner();
        let container_id = req.container_id.clone();

        timing.mark_sent();
        let reply = self.runtime_client().start_container(Request::new(req)).await;
        timing.mark_received();

        if reply.is_ok() {
            if let Some(container) = self.cache.get_container_by_id(&container_id).await {
                if let Some(pod) = self.cache.get_pod(&container.pod_uid).await {
                    let enforce_req = Self::enforce_request(&pod, &container);
                    if let Err(err) = self.effector.enforce(&enforce_req) {
                        Self::log_effector_err("start_container enforce", err);
                    }
                    if !enforce_req.rdt_class.is_empty() {
                        if let Err(err) = self.effector.assign_rdt_class(&enforce_req.cgroup_path, &enforce_req.rdt_class) {
                            Self::log_effector_err("start_container rdt", err);
                        }
                    }
                }
                let _ = self.cache.set_container_state(&container.key, CacheContainerState::Started).await;
                if let Err(err) = self.policy().mark_live(&container.key) {
                    warn!(error = %err, "policy mark_live after StartContainer enforcement failed");
                }
            }
        }
        timing.finish(reply.is_ok());
        reply
    }

    async fn stop_container(&self, request: Request<StopContainerRequest>) -> Result<Response<StopContainerResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("StopContainer", request, |r| async move { self.runtime_client().stop_container(r).await })
                .await;
        }
        let mut timing = RequestTiming::start("StopContainer");
        let _guard = self.policy_lock.write().await;

        let req = request.into_inner();
        let container_id = req.container_id.clone();

        timing.mark_sent();
        let reply = self.runtime_client().stop_container(Request::new(req)).await;
        timing.mark_received();

        if reply.is_ok() {
            if let Some(container) = self.cache.get_container_by_id(&container_id).await {
                let _ = self.cache.set_container_state(&container.key, CacheContainerState::Stopped).await;
            }
        }
        timing.finish(reply.is_ok());
        reply
    }

    async fn remove_container(&self, request: Request<RemoveContainerRequest>) -> Result<Response<RemoveContainerResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("RemoveContainer", request, |r| async move { self.runtime_client().remove_container(r).await })
                .await;
        }
        let mut timing = RequestTiming::start("RemoveContainer");
        let _guard = self.policy_lock.write().await;

        let req = request.into_inner();
        let container_id = req.container_id.clone();

        timing.mark_sent();
        let reply = self.runtime_client().remove_container(Request::new(req)).await;
        timing.mark_received();

        if reply.is_ok() {
            if let Some(container) = self.cache.get_container_by_id(&container_id).await {
                if let Some(pod) = self.cache.get_pod(&container.pod_uid).await {
                    let cgroup_path = Self::cgroup_path_for(&pod, &container_id);
                    if let Err(err) = self.effector.release(&cgroup_path) {
                        Self::log_effector_err("remove_container release", err);
                    }
                }
                if let Err(err) = self.policy().release(&container) {
                    warn!(error = %err, "policy release on RemoveContainer failed");
                }
                let had_exclusive = !container.exclusive_cpus.is_empty();
                let _ = self.cache.remove_container(&container.key).await;
                if had_exclusive {
                    let changes = self.policy().rebalance();
                    self.push_rebalance(changes).await;
                }
            }
        }
        timing.finish(reply.is_ok());
        reply
    }

    async fn list_containers(&self, request: Request<ListContainersRequest>) -> Result<Response<ListContainersResponse>, Status> {
        self.passthrough("ListContainers", request, |r| async move { self.runtime_client().list_containers(r).await })
            .await
    }

    async fn container_status(&self, request: Request<ContainerStatusRequest>) -> Result<Response<ContainerStatusResponse>, Status> {
        self.passthrough("ContainerStatus", request, |r| async move { self.runtime_client().container_status(r).await })
            .await
    }

    async fn update_container_resources(
        &self,
        request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("UpdateContainerResources", request, |r| async move {
                    self.runtime_client().update_container_resources(r).await
                })
                .await;
        }
        let mut timing = RequestTiming::start("UpdateContainerResources");
        let _guard = self.policy_lock.write().await;

        let mut req = request.into_inner();
        let Some(container) = self.cache.get_container_by_id(&req.container_id).await else {
            timing.finish(false);
            return Err(Status::not_found("container not tracked by cache"));
        };
        let linux = req.linux.clone().unwrap_or_default();

        // An UpdateContainerResources arriving over CRI carries one combined
        // cpuset with no shared/exclusive split; treated as an adjustment to
        // the shared subset (documented simplification — external callers
        // requesting exclusive isolation go through the adjustment intake,
        // C8, instead).
        let adjustment = Adjustment {
            key: container.key.clone(),
            exclusive_cpus: None,
            shared_cpus: Some(parse_cpu_list(&linux.cpuset_cpus)),
            memory_zone_mask: Some(parse_cpu_list(&linux.cpuset_mems)),
        };

        let decision = match self.policy().adjust(adjustment) {
            Ok(d) => d,
            Err(err) => {
                timing.finish(false);
                return Err(policy_error_to_status(err));
            }
        };

        let mut linux = linux;
        linux.cpuset_cpus = join_cpus(&[decision.shared_cpus.clone(), decision.exclusive_cpus.clone()].concat());
        linux.cpuset_mems = join_cpus(&decision.memory_zone_mask);
        req.linux = Some(linux);

        timing.mark_sent();
        let reply = self.runtime_client().update_container_resources(Request::new(req)).await;
        timing.mark_received();

        if reply.is_ok() {
            if let Err(err) = self.commit_decision(&container.key, req_container_id(&container), &decision).await {
                warn!(error = %err, "failed to commit adjustment to cache");
            }
            if let Some(pod) = self.cache.get_pod(&container.pod_uid).await {
                if let Err(err) = self.effector.enforce(&Self::enforce_request(&pod, &container)) {
                    Self::log_effector_err("update_container_resources enforce", err);
                }
            }
        }
        timing.finish(reply.is_ok());
        reply
    }

    async fn reopen_container_log(&self, request: Request<ReopenContainerLogRequest>) -> Result<Response<ReopenContainerLogResponse>, Status> {
        self.passthrough("ReopenContainerLog", request, |r| async move { self.runtime_client().reopen_container_log(r).await })
            .await
    }

    async fn exec_sync(&self, request: Request<ExecSyncRequest>) -> Result<Response<ExecSyncResponse>, Status> {
        self.passthrough("ExecSync", request, |r| async move { self.runtime_client().exec_sync(r).await }).await
    }

    async fn exec(&self, request: Request<ExecRequest>) -> Result<Response<ExecResponse>, Status> {
        self.passthrough("Exec", request, |r| async move { self.runtime_client().exec(r).await }).await
    }

    async fn attach(&self, request: Request<AttachRequest>) -> Result<Response<AttachResponse>, Status> {
        self.passthrough("Attach", request, |r| async move { self.runtime_client().attach(r).await }).await
    }

    async fn port_forward(&self, request: Request<PortForwardRequest>) -> Result<Response<PortForwardResponse>, Status> {
        self.passthrough("PortForward", request, |r| async move { self.runtime_client().port_forward(r).await })
            .await
    }

    async fn container_stats(&self, request: Request<ContainerStatsRequest>) -> Result<Response<ContainerStatsResponse>, Status> {
        self.passthrough("ContainerStats", request, |r| async move { self.runtime_client().container_stats(r).await })
            .await
    }

    async fn list_container_stats(&self, request: Request<ListContainerStatsRequest>) -> Result<Response<ListContainerStatsResponse>, Status> {
        self.passthrough("ListContainerStats", request, |r| async move {
            self.runtime_client().list_container_stats(r).await
        })
        .await
    }

    async fn pod_sandbox_stats(&self, request: Request<PodSandboxStatsRequest>) -> Result<Response<PodSandboxStatsResponse>, Status> {
        self.passthrough("PodSandboxStats", request, |r| async move { self.runtime_client().pod_sandbox_stats(r).await })
            .await
    }

    async fn list_pod_sandbox_stats(&self, request: Request<ListPodSandboxStatsRequest>) -> Result<Response<ListPodSandboxStatsResponse>, Status> {
        self.passthrough("ListPodSandboxStats", request, |r| async move {
            self.runtime_client().list_pod_sandbox_stats(r).await
        })
        .await
    }

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        if self.bypassed() {
            return self
                .passthrough("UpdateRuntimeConfig", request, |r| async move { self.runtime_client().update_runtime_config(r).await })
                .await;
        }
        let _guard = self.policy_lock.write().await;
        self.passthrough("UpdateRuntimeConfig", request, |r| async move { self.runtime_client().update_runtime_config(r).await })
            .await
    }

    async fn status(&self, request: Request<StatusRequest>) -> Result<Response<StatusResponse>, Status> {
        self.passthrough("Status", request, |r| async move { self.runtime_client().status(r).await }).await
    }

    async fn checkpoint_container(&self, request: Request<CheckpointContainerRequest>) -> Result<Response<CheckpointContainerResponse>, Status> {
        self.passthrough("CheckpointContainer", request, |r| async move { self.runtime_client().checkpoint_container(r).await })
            .await
    }

    type GetContainerEventsStream = tonic::Streaming<ContainerEventResponse>;

    async fn get_container_events(
        &self,
        request: Request<GetEventsRequest>,
    ) -> Result<Response<Self::GetContainerEventsStream>, Status> {
        let mut client = self.runtime_client();
        client.get_container_events(request).await
    }

    async fn list_metric_descriptors(
        &self,
        request: Request<ListMetricDescriptorsRequest>,
    ) -> Result<Response<ListMetricDescriptorsResponse>, Status> {
        self.passthrough("ListMetricDescriptors", request, |r| async move {
            self.runtime_client().list_metric_descriptors(r).await
        })
        .await
    }

    async fn list_pod_sandbox_metrics(
        &self,
        request: Request<ListPodSandboxMetricsRequest>,
    ) -> Result<Response<ListPodSandboxMetricsResponse>, Status> {
        self.passthrough("ListPodSandboxMetrics", request, |r| async move {
            self.runtime_client().list_pod_sandbox_metrics(r).await
        })
        .await
    }

    async fn runtime_config(&self, request: Request<RuntimeConfigRequest>) -> Result<Response<RuntimeConfigResponse>, Status> {
        self.passthrough("RuntimeConfig", request, |r| async move { self.runtime_client().runtime_config(r).await })
            .await
    }
}

#[tonic::async_trait]
impl ImageService for CriServer {
    async fn list_images(&self, request: Request<ListImagesRequest>) -> Result<Response<ListImagesResponse>, Status> {
        self.passthrough("ListImages", request, |r| async move { self.image_client().list_images(r).await }).await
    }

    async fn image_status(&self, request: Request<ImageStatusRequest>) -> Result<Response<ImageStatusResponse>, Status> {
        self.passthrough("ImageStatus", request, |r| async move { self.image_client().image_status(r).await }).await
    }

    async fn pull_image(&self, request: Request<PullImageRequest>) -> Result<Response<PullImageResponse>, Status> {
        self.passthrough("PullImage", request, |r| async move { self.image_client().pull_image(r).await }).await
    }

    async fn remove_image(&self, request: Request<RemoveImageRequest>) -> Result<Response<RemoveImageResponse>, Status> {
        self.passthrough("RemoveImage", request, |r| async move { self.image_client().remove_image(r).await }).await
    }

    async fn image_fs_info(&self, request: Request<ImageFsInfoRequest>) -> Result<Response<ImageFsInfoResponse>, Status> {
        self.passthrough("ImageFsInfo", request, |r| async move { self.image_client().image_fs_info(r).await }).await
    }
}

impl CriServer {
    async fn commit_decision(&self, key: &ContainerKey, container_id: &str, decision: &Decision) -> Result<(), crm_cache::CacheError> {
        self.cache.set_container_id(key, container_id.to_string()).await?;
        self.cache
            .update_container(key, |c| {
                c.shared_cpus = decision.shared_cpus.clone();
                c.exclusive_cpus = decision.exclusive_cpus.clone();
                c.memory_zone_mask = decision.memory_zone_mask.clone();
                c.owning_pool = Some(decision.pool);
                c.rdt_class = Some(decision.rdt_class.clone());
                c.blockio_class = Some(decision.blockio_class.clone());
            })
            .await?;
        self.cache.set_container_state(key, CacheContainerState::Created).await
    }
}

fn req_container_id(container: &CacheContainer) -> &str {
    container.id.as_deref().unwrap_or(&container.key.container_name)
}

fn policy_error_to_status(err: PolicyError) -> Status {
    match err {
        PolicyError::NoFeasiblePool => Status::resource_exhausted(err.to_string()),
        PolicyError::AdjustmentOverlap { .. } => Status::already_exists(err.to_string()),
        PolicyError::NoActivePlacement(_) | PolicyError::InvalidContainer(_) => Status::failed_precondition(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_defaults_to_burstable_without_an_explicit_annotation() {
        let annotations = BTreeMap::new();
        assert_eq!(qos_from_annotations(&annotations), QosClass::Burstable);
    }

    #[test]
    fn qos_reads_explicit_class_annotation() {
        let mut annotations = BTreeMap::new();
        annotations.insert("kubernetes.io/qos-class".to_string(), "Guaranteed".to_string());
        assert_eq!(qos_from_annotations(&annotations), QosClass::Guaranteed);
    }

    #[test]
    fn cgroup_path_joins_parent_and_container_id() {
        let mut pod = Pod {
            uid: "u".into(),
            name: "p".into(),
            namespace: "ns".into(),
            qos_class: QosClass::Burstable,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            cgroup_parent: "kubepods/burstable/poduid".into(),
            containers: Vec::new(),
            lingering_since: None,
        };
        assert_eq!(CriServer::cgroup_path_for(&pod, "abc123"), "kubepods/burstable/poduid/abc123");

        pod.cgroup_parent = "kubepods/burstable/poduid/".into();
        assert_eq!(CriServer::cgroup_path_for(&pod, "abc123"), "kubepods/burstable/poduid/abc123");

        pod.cgroup_parent.clear();
        assert_eq!(CriServer::cgroup_path_for(&pod, "abc123"), "abc123");
    }

    #[test]
    fn overlap_errors_map_to_already_exists() {
        let key = ContainerKey {
            namespace: "ns".into(),
            pod_name: "p".into(),
            container_name: "c".into(),
        };
        let err = PolicyError::AdjustmentOverlap {
            key: key.clone(),
            owner: key,
        };
        assert_eq!(policy_error_to_status(err).code(), tonic::Code::AlreadyExists);
    }

    #[test]
    fn exhaustion_errors_map_to_resource_exhausted() {
        assert_eq!(
            policy_error_to_status(PolicyError::NoFeasiblePool).code(),
            tonic::Code::ResourceExhausted
        );
    }
}
