//! Authoritative workload cache (C2 — spec.md §4.2).
//!
//! Generalizes the teacher's single-VM-per-pod toy runtime
//! (`zerovisor-core::kube_runtime::KubeRuntime`, `RuntimeState`) into the full
//! lingering/replace/replay semantics spec.md requires: pods keyed by UID,
//! containers keyed by a UID-independent `{namespace, pod, name}` triple so
//! identity survives pod UID churn (the "lingering container cleanup" rule in
//! DESIGN NOTES §9), snapshot/replay with a startup grace window, and
//! rollback-on-persist-failure per the error taxonomy (spec.md §7).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub type PodUid = String;
pub type ContainerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryTierPref {
    Dram,
    Pmem,
    Hbm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Creating,
    Created,
    Started,
    Stopped,
    Removed,
}

/// UID-independent identity for a container: `{pod-name, pod-namespace,
/// container-name}`. This is the key the "lingering container cleanup" rule
/// in DESIGN NOTES §9 is written against — at most one live record per this
/// triple regardless of how many times the owning pod's UID churns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerKey {
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub uid: PodUid,
    pub name: String,
    pub namespace: String,
    pub qos_class: QosClass,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub cgroup_parent: String,
    #[serde(default)]
    pub containers: Vec<ContainerKey>,
    /// Unix-epoch seconds at which this pod was marked lingering, if any.
    #[serde(default)]
    pub lingering_since: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub key: ContainerKey,
    /// The CRI-assigned container ID, once known. Present from creation
    /// onward once the runtime has echoed one back.
    #[serde(default)]
    pub id: Option<ContainerId>,
    pub pod_uid: PodUid,
    pub requested_millicpu: u64,
    pub limit_millicpu: u64,
    pub requested_memory_bytes: u64,
    pub limit_memory_bytes: u64,
    #[serde(default)]
    pub shared_cpus: Vec<u32>,
    #[serde(default)]
    pub exclusive_cpus: Vec<u32>,
    #[serde(default)]
    pub memory_zone_mask: Vec<u32>,
    #[serde(default)]
    pub memory_type_pref: Vec<MemoryTierPref>,
    #[serde(default)]
    pub rdt_class: Option<String>,
    #[serde(default)]
    pub blockio_class: Option<String>,
    /// Cold-start duration, if the container was placed with one (§4.4.4).
    #[serde(default)]
    pub cold_start: Option<Duration>,
    #[serde(default)]
    pub owning_pool: Option<u32>,
    pub state: ContainerState,
    /// Unix-epoch seconds at which this container was demoted to lingering.
    #[serde(default)]
    pub lingering_since: Option<u64>,
    #[serde(default)]
    pub created_at_unix: u64,
}

impl Container {
    pub fn is_lingering(&self) -> bool {
        self.lingering_since.is_some()
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("pod {0} not found")]
    PodNotFound(PodUid),
    #[error("container {0:?} not found")]
    ContainerNotFound(ContainerKey),
    #[error("failed to persist cache snapshot: {0}")]
    Persist(String),
    #[error("snapshot corrupt, starting empty: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CacheState {
    pods: BTreeMap<PodUid, Pod>,
    containers: BTreeMap<ContainerKey, Container>,
    #[serde(default)]
    id_index: BTreeMap<ContainerId, ContainerKey>,
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The workload cache. One instance per process, owned by the supervisor and
/// shared (via `Arc`) with the interception server and policy core.
pub struct WorkloadCache {
    state: RwLock<CacheState>,
    snapshot_path: PathBuf,
    max_age: Duration,
    /// Keys loaded from the snapshot at startup that have not yet been
    /// touched by a confirming CRI call. Cleared by `finalize_startup`.
    pending_confirmation: RwLock<HashSet<PendingKey>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    Pod(PodUid),
    Container(ContainerKey),
}

impl WorkloadCache {
    pub fn new(snapshot_path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            snapshot_path: snapshot_path.into(),
            max_age,
            pending_confirmation: RwLock::new(HashSet::new()),
        }
    }

    /// Reads the on-disk snapshot, discarding entries older than `max_age`.
    /// A corrupt snapshot is logged and the cache starts empty, per spec.md §4.2.
    pub async fn replay(&self) -> Result<(), CacheError> {
        if !self.snapshot_path.exists() {
            return Ok(());
        }
        let bytes = match std::fs::read(&self.snapshot_path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "cache snapshot unreadable, starting empty");
                return Ok(());
            }
        };
        let mut loaded: CacheState = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "cache snapshot corrupt, starting empty");
                return Err(CacheError::Corrupt(e.to_string()));
            }
        };

        let now = now_unix();
        let max_age_s = self.max_age.as_secs();
        loaded.pods.retain(|_, p| {
            p.lingering_since
                .map(|ts| now.saturating_sub(ts) <= max_age_s)
                .unwrap_or(true)
        });
        loaded.containers.retain(|_, c| {
            c.lingering_since
                .map(|ts| now.saturating_sub(ts) <= max_age_s)
                .unwrap_or(true)
        });
        loaded
            .id_index
            .retain(|_, key| loaded.containers.contains_key(key));

        let mut pending = self.pending_confirmation.write().await;
        pending.clear();
        for (uid, pod) in &loaded.pods {
            if pod.lingering_since.is_none() {
                pending.insert(PendingKey::Pod(uid.clone()));
            }
        }
        for (key, c) in &loaded.containers {
            if c.lingering_since.is_none() {
                pending.insert(PendingKey::Container(key.clone()));
            }
        }
        drop(pending);

        *self.state.write().await = loaded;
        Ok(())
    }

    /// Called once the startup grace window elapses: any replayed pod or
    /// container not yet confirmed by a matching CRI call is demoted to
    /// lingering so that a later re-appearance by the same identity resumes
    /// its prior placement instead of reallocating.
    pub async fn finalize_startup(&self) -> Result<(), CacheError> {
        let pending: Vec<PendingKey> = self.pending_confirmation.write().await.drain().collect();
        if pending.is_empty() {
            return Ok(());
        }
        let mut st = self.state.write().await;
        let before = st.clone();
        let now = now_unix();
        for key in pending {
            match key {
                PendingKey::Pod(uid) => {
                    if let Some(p) = st.pods.get_mut(&uid) {
                        p.lingering_since.get_or_insert(now);
                    }
                }
                PendingKey::Container(key) => {
                    if let Some(c) = st.containers.get_mut(&key) {
                        c.lingering_since.get_or_insert(now);
                    }
                }
            }
        }
        if let Err(err) = self.persist_locked(&st).await {
            *st = before;
            return Err(err);
        }
        Ok(())
    }

    async fn confirm(&self, key: PendingKey) {
        self.pending_confirmation.write().await.remove(&key);
    }

    /// Inserts or replaces a pod by UID. If a lingering entry with the same
    /// `{name, namespace}` exists under a different UID, its containers are
    /// carried forward onto the new UID (resource assignments intact, since
    /// containers are keyed independently of pod UID).
    pub async fn insert_pod(&self, mut pod: Pod) -> Result<(), CacheError> {
        let mut st = self.state.write().await;
        let before = st.clone();

        let old_uid = st
            .pods
            .iter()
            .find(|(uid, p)| {
                **uid != pod.uid && p.name == pod.name && p.namespace == pod.namespace
            })
            .map(|(uid, _)| uid.clone());

        if let Some(old_uid) = old_uid {
            if let Some(old_pod) = st.pods.remove(&old_uid) {
                let mut merged = old_pod.containers;
                for k in &pod.containers {
                    if !merged.contains(k) {
                        merged.push(k.clone());
                    }
                }
                for key in &merged {
                    if let Some(c) = st.containers.get_mut(key) {
                        c.pod_uid = pod.uid.clone();
                        c.lingering_since = None;
                    }
                }
                pod.containers = merged;
            }
        }
        pod.lingering_since = None;
        let uid = pod.uid.clone();
        st.pods.insert(uid.clone(), pod);
        if let Err(err) = self.persist_locked(&st).await {
            *st = before;
            return Err(err);
        }
        drop(st);
        self.confirm(PendingKey::Pod(uid)).await;
        Ok(())
    }

    /// Inserts a container under `pod_uid`. Re-insertion of a container whose
    /// name is already present in the same pod replaces in place, carrying
    /// forward the existing resource assignment rather than allocating a new
    /// one (S2's duplicate `Container#2` CreateContainer call).
    pub async fn insert_container(
        &self,
        pod_uid: &PodUid,
        mut container: Container,
    ) -> Result<ContainerKey, CacheError> {
        let mut st = self.state.write().await;
        if !st.pods.contains_key(pod_uid) {
            return Err(CacheError::PodNotFound(pod_uid.clone()));
        }
        let before = st.clone();
        container.pod_uid = pod_uid.clone();
        let key = container.key.clone();

        if let Some(existing) = st.containers.get(&key) {
            container.shared_cpus = existing.shared_cpus.clone();
            container.exclusive_cpus = existing.exclusive_cpus.clone();
            container.memory_zone_mask = existing.memory_zone_mask.clone();
            container.owning_pool = existing.owning_pool;
            container.rdt_class = existing.rdt_class.clone();
            container.blockio_class = existing.blockio_class.clone();
            if container.id.is_none() {
                container.id = existing.id.clone();
            }
        }
        container.lingering_since = None;
        if let Some(id) = &container.id {
            st.id_index.insert(id.clone(), key.clone());
        }
        st.containers.insert(key.clone(), container);

        if let Some(pod) = st.pods.get_mut(pod_uid) {
            if !pod.containers.contains(&key) {
                pod.containers.push(key.clone());
            }
        }
        if let Err(err) = self.persist_locked(&st).await {
            *st = before;
            return Err(err);
        }
        drop(st);
        self.confirm(PendingKey::Container(key.clone())).await;
        Ok(key)
    }

    /// Records the CRI-assigned ID for a container once known, re-keying the
    /// id index (the primary key stays the UID-independent `ContainerKey`).
    pub async fn set_container_id(
        &self,
        key: &ContainerKey,
        id: ContainerId,
    ) -> Result<(), CacheError> {
        let mut st = self.state.write().await;
        if !st.containers.contains_key(key) {
            return Err(CacheError::ContainerNotFound(key.clone()));
        }
        let before = st.clone();
        let c = st.containers.get_mut(key).expect("checked above");
        c.id = Some(id.clone());
        st.id_index.insert(id, key.clone());
        if let Err(err) = self.persist_locked(&st).await {
            *st = before;
            return Err(err);
        }
        Ok(())
    }

    pub async fn set_container_state(
        &self,
        key: &ContainerKey,
        state: ContainerState,
    ) -> Result<(), CacheError> {
        let mut st = self.state.write().await;
        if !st.containers.contains_key(key) {
            return Err(CacheError::ContainerNotFound(key.clone()));
        }
        let before = st.clone();
        st.containers.get_mut(key).expect("checked above").state = state;
        if let Err(err) = self.persist_locked(&st).await {
            *st = before;
            return Err(err);
        }
        Ok(())
    }

    pub async fn update_container<F>(&self, key: &ContainerKey, f: F) -> Result<(), CacheError>
    where
        F: FnOnce(&mut Container),
    {
        let mut st = self.state.write().await;
        if !st.containers.contains_key(key) {
            return Err(CacheError::ContainerNotFound(key.clone()));
        }
        let before = st.clone();
        f(st.containers.get_mut(key).expect("checked above"));
        if let Err(err) = self.persist_locked(&st).await {
            *st = before;
            return Err(err);
        }
        Ok(())
    }

    /// Idempotent. A removed container with a still-running pod is demoted
    /// to lingering (TTL-bounded) rather than deleted outright.
    pub async fn remove_container(&self, key: &ContainerKey) -> Result<(), CacheError> {
        let mut st = self.state.write().await;
        let before = st.clone();
        let pod_running = st
            .containers
            .get(key)
            .map(|c| st.pods.contains_key(&c.pod_uid))
            .unwrap_or(false);
        if let Some(c) = st.containers.get_mut(key) {
            if pod_running {
                c.state = ContainerState::Removed;
                c.lingering_since.get_or_insert(now_unix());
            } else {
                let id = c.id.clone();
                st.containers.remove(key);
                if let Some(id) = id {
                    st.id_index.remove(&id);
                }
            }
        }
        if let Err(err) = self.persist_locked(&st).await {
            *st = before;
            return Err(err);
        }
        Ok(())
    }

    /// Idempotent. A pod is destroyed only once none of its containers are
    /// lingering; otherwise it is itself marked lingering so the identity
    /// (and any still-lingering containers') resources survive.
    pub async fn remove_pod(&self, uid: &PodUid) -> Result<(), CacheError> {
        let mut st = self.state.write().await;
        let before = st.clone();
        let has_lingering = st
            .pods
            .get(uid)
            .map(|p| {
                p.containers
                    .iter()
                    .any(|k| st.containers.get(k).map_or(false, |c| c.is_lingering()))
            })
            .unwrap_or(false);
        if has_lingering {
            if let Some(p) = st.pods.get_mut(uid) {
                p.lingering_since.get_or_insert(now_unix());
            }
        } else {
            st.pods.remove(uid);
        }
        if let Err(err) = self.persist_locked(&st).await {
            *st = before;
            return Err(err);
        }
        Ok(())
    }

    /// Drops lingering pods/containers whose age exceeds `ttl`.
    pub async fn purge_expired(&self, ttl: Duration) -> Result<(usize, usize), CacheError> {
        let mut st = self.state.write().await;
        let before = st.clone();
        let now = now_unix();
        let ttl_s = ttl.as_secs();
        let before_pods = st.pods.len();
        let before_containers = st.containers.len();
        st.pods
            .retain(|_, p| !p.lingering_since.map_or(false, |ts| now.saturating_sub(ts) > ttl_s));
        st.containers.retain(|_, c| {
            !c.lingering_since
                .map_or(false, |ts| now.saturating_sub(ts) > ttl_s)
        });
        st.id_index.retain(|_, k| st.containers.contains_key(k));
        let removed_pods = before_pods - st.pods.len();
        let removed_containers = before_containers - st.containers.len();
        if removed_pods > 0 || removed_containers > 0 {
            if let Err(err) = self.persist_locked(&st).await {
                *st = before;
                return Err(err);
            }
        }
        Ok((removed_pods, removed_containers))
    }

    pub async fn get_pod(&self, uid: &PodUid) -> Option<Pod> {
        self.state.read().await.pods.get(uid).cloned()
    }

    pub async fn get_container(&self, key: &ContainerKey) -> Option<Container> {
        self.state.read().await.containers.get(key).cloned()
    }

    pub async fn get_container_by_id(&self, id: &ContainerId) -> Option<Container> {
        let st = self.state.read().await;
        let key = st.id_index.get(id)?;
        st.containers.get(key).cloned()
    }

    pub async fn list_pods(&self) -> Vec<Pod> {
        self.state.read().await.pods.values().cloned().collect()
    }

    pub async fn list_containers(&self) -> Vec<Container> {
        self.state
            .read()
            .await
            .containers
            .values()
            .cloned()
            .collect()
    }

    pub async fn pod_count(&self) -> usize {
        self.state.read().await.pods.len()
    }

    pub async fn container_count(&self) -> usize {
        self.state.read().await.containers.len()
    }

    /// Forces a snapshot write of the current state. Every mutating method
    /// already persists after itself; this exists for the supervisor's
    /// shutdown sequence, which snapshots the cache last, after every other
    /// component has stopped and no further mutations are expected.
    pub async fn snapshot_now(&self) -> Result<(), CacheError> {
        let st = self.state.read().await;
        self.persist_locked(&st).await
    }

    /// Atomically serializes to a temp file, fsyncs, then renames over the
    /// configured snapshot path.
    async fn persist_locked(&self, st: &CacheState) -> Result<(), CacheError> {
        persist_to(&self.snapshot_path, st).map_err(|e| CacheError::Persist(e.to_string()))
    }
}

fn persist_to(path: &Path, st: &CacheState) -> std::io::Result<()> {
    use std::io::Write;
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(st).map_err(std::io::Error::other)?;
    {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(uid: &str, name: &str) -> Pod {
        Pod {
            uid: uid.into(),
            name: name.into(),
            namespace: "default".into(),
            qos_class: QosClass::Guaranteed,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            cgroup_parent: String::new(),
            containers: Vec::new(),
            lingering_since: None,
        }
    }

    fn container(ns: &str, pod_name: &str, name: &str) -> Container {
        Container {
            key: ContainerKey {
                namespace: ns.into(),
                pod_name: pod_name.into(),
                container_name: name.into(),
            },
            id: None,
            pod_uid: String::new(),
            requested_millicpu: 1000,
            limit_millicpu: 1000,
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
            created_at_unix: now_unix(),
        }
    }

    #[tokio::test]
    async fn s2_lingering_replay_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let cache = WorkloadCache::new(dir.path().join("cache.json"), Duration::from_secs(3600));

        cache.insert_pod(pod("UID1", "Pod#1")).await.unwrap();
        cache
            .insert_container(&"UID1".to_string(), container("default", "Pod#1", "Container#1"))
            .await
            .unwrap();
        cache
            .insert_container(&"UID1".to_string(), container("default", "Pod#1", "Container#2"))
            .await
            .unwrap();

        cache.insert_pod(pod("UID'1", "Pod#1")).await.unwrap();
        cache
            .insert_container(&"UID'1".to_string(), container("default", "Pod#1", "Container#3"))
            .await
            .unwrap();
        // Re-entry of Container#2 must not create a 4th entry.
        cache
            .insert_container(&"UID'1".to_string(), container("default", "Pod#1", "Container#2"))
            .await
            .unwrap();

        assert_eq!(cache.pod_count().await, 1);
        assert_eq!(cache.container_count().await, 3);
        let live_pod = cache.get_pod(&"UID'1".to_string()).await.unwrap();
        assert_eq!(live_pod.containers.len(), 3);
    }

    #[tokio::test]
    async fn snapshot_round_trips_non_lingering_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = WorkloadCache::new(&path, Duration::from_secs(3600));
        cache.insert_pod(pod("UID1", "Pod#1")).await.unwrap();
        cache
            .insert_container(&"UID1".to_string(), container("default", "Pod#1", "C1"))
            .await
            .unwrap();

        let cache2 = WorkloadCache::new(&path, Duration::from_secs(3600));
        cache2.replay().await.unwrap();
        assert_eq!(cache2.pod_count().await, 1);
        assert_eq!(cache2.container_count().await, 1);
    }

    #[tokio::test]
    async fn lingering_entries_survive_replay_within_ttl_and_expire_after() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = WorkloadCache::new(&path, Duration::from_secs(3600));
        cache.insert_pod(pod("UID1", "Pod#1")).await.unwrap();
        let key = cache
            .insert_container(&"UID1".to_string(), container("default", "Pod#1", "C1"))
            .await
            .unwrap();
        cache.remove_container(&key).await.unwrap();
        assert!(cache.get_container(&key).await.unwrap().is_lingering());

        let cache2 = WorkloadCache::new(&path, Duration::from_secs(3600));
        cache2.replay().await.unwrap();
        assert!(cache2.get_container(&key).await.is_some());

        let (_, removed) = cache2.purge_expired(Duration::from_secs(0)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache2.get_container(&key).await.is_none());
    }

    #[tokio::test]
    async fn persist_failure_rolls_back_pod_insertion() {
        let dir = tempfile::tempdir().unwrap();
        // The parent directory does not exist, so every persist attempt fails.
        let bad_path = dir.path().join("missing-subdir").join("cache.json");
        let cache = WorkloadCache::new(&bad_path, Duration::from_secs(3600));

        assert!(cache.insert_pod(pod("UID1", "Pod#1")).await.is_err());
        assert_eq!(cache.pod_count().await, 0);
    }

    #[tokio::test]
    async fn persist_failure_rolls_back_container_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = WorkloadCache::new(&path, Duration::from_secs(3600));
        cache.insert_pod(pod("UID1", "Pod#1")).await.unwrap();
        let key = cache
            .insert_container(&"UID1".to_string(), container("default", "Pod#1", "C1"))
            .await
            .unwrap();

        // Point the snapshot at an unwritable location after the initial
        // writes succeeded, so the next mutation's persist fails.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = cache.set_container_state(&key, ContainerState::Started).await;
        assert!(err.is_err());
        let still = cache.get_container(&key).await.unwrap();
        assert_eq!(still.state, ContainerState::Creating);
    }

    #[tokio::test]
    async fn finalize_startup_marks_unconfirmed_entries_lingering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = WorkloadCache::new(&path, Duration::from_secs(3600));
        cache.insert_pod(pod("UID1", "Pod#1")).await.unwrap();
        let key = cache
            .insert_container(&"UID1".to_string(), container("default", "Pod#1", "C1"))
            .await
            .unwrap();

        let cache2 = WorkloadCache::new(&path, Duration::from_secs(3600));
        cache2.replay().await.unwrap();
        cache2.finalize_startup().await.unwrap();
        assert!(cache2.get_container(&key).await.unwrap().is_lingering());
    }
}
