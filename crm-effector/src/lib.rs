//! Effector layer (C5 — spec.md §4.5): turns a policy [`Decision`] into
//! writes against cgroupfs, resctrl, and the block-IO controller.
//!
//! Generalizes the teacher's CRI command-handler idiom
//! (`zerovisor_core::kube_cri`, a thin synchronous dispatch into a lower
//! layer with a two-valued success/failure result) into a trait with a real
//! error type, so callers — the CRI server, holding the global policy lock —
//! can tell a retryable write failure from a permanently unsupported
//! controller.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EffectorError {
    #[error("write to {path} failed: {detail}")]
    Io { path: String, detail: String },
    #[error("controller {0} is not available on this node")]
    UnsupportedController(String),
    #[error("cgroup {0} not found")]
    CgroupNotFound(String),
}

/// Everything the effector needs to enforce one container's assignment.
/// Field names mirror `crm_policy::Decision` deliberately; this crate does
/// not depend on `crm-policy` to keep the dependency graph a DAG rooted at
/// the CRI server, which holds both.
#[derive(Debug, Clone, Default)]
pub struct EnforceRequest {
    /// Path of this container's cgroup, relative to the cgroup root (e.g.
    /// `kubepods/burstable/pod<uid>/<container id>`).
    pub cgroup_path: String,
    pub shared_cpus: Vec<u32>,
    pub exclusive_cpus: Vec<u32>,
    pub memory_zone_mask: Vec<u32>,
    pub rdt_class: String,
    pub blockio_class: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockIoVariant {
    /// cgroup v1 `blkio.bfq.weight` (BFQ I/O scheduler).
    Bfq,
    /// cgroup v1 `blkio.weight` (legacy CFQ-style) or cgroup v2 `io.weight`.
    Weight,
    Unsupported,
}

pub trait Effector: Send + Sync {
    /// Writes the CPU set, memory node mask, and block-IO class for a
    /// container's cgroup. Idempotent: re-enforcing the same request is a
    /// no-op in effect.
    fn enforce(&self, req: &EnforceRequest) -> Result<(), EffectorError>;

    /// Moves every PID currently in `cgroup_path`'s `cgroup.procs` into the
    /// named RDT (resctrl) class. Called once the container's process tree
    /// exists, separately from `enforce` which runs beforehand.
    fn assign_rdt_class(&self, cgroup_path: &str, class: &str) -> Result<(), EffectorError>;

    /// Best-effort cleanup once a container is gone: moves any leftover
    /// task membership back to the default resctrl group. Idempotent —
    /// succeeds even if the cgroup has already been removed by the kubelet.
    fn release(&self, cgroup_path: &str) -> Result<(), EffectorError>;

    /// Verifies the controllers this effector needs are present. Run once
    /// at startup (spec.md's C5 self-test step); a missing RDT controller
    /// degrades RDT assignment to a no-op rather than failing the whole
    /// node, but a missing cgroup root is fatal.
    fn self_test(&self) -> Result<(), EffectorError>;
}

fn write_once(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}

/// Runs `f` once, and on failure logs and retries exactly once before
/// surfacing the error — the retry-once-then-fail contract spec.md's
/// effector section calls for.
fn retry_once(path: &Path, f: impl Fn() -> std::io::Result<()>) -> Result<(), EffectorError> {
    match f() {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(path = %path.display(), error = %first, "effector write failed, retrying once");
            f().map_err(|e| EffectorError::Io { path: path.display().to_string(), detail: e.to_string() })
        }
    }
}

fn join_list(values: &[u32]) -> String {
    values.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

/// Production effector writing to real cgroupfs/resctrl paths (or, in
/// tests, a tempdir standing in for them).
pub struct CgroupEffector {
    cgroup_root: PathBuf,
    resctrl_root: PathBuf,
    blockio_variant: OnceLock<BlockIoVariant>,
}

impl CgroupEffector {
    pub fn new(cgroup_root: impl Into<PathBuf>, resctrl_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            resctrl_root: resctrl_root.into(),
            blockio_variant: OnceLock::new(),
        }
    }

    fn blockio_variant(&self) -> BlockIoVariant {
        *self.blockio_variant.get_or_init(|| {
            if self.cgroup_root.join("blkio.bfq.weight").exists() || self.cgroup_root.join("io.weight").exists() {
                BlockIoVariant::Bfq
            } else if self.cgroup_root.join("blkio.weight").exists() {
                BlockIoVariant::Weight
            } else {
                BlockIoVariant::Unsupported
            }
        })
    }

    fn dir(&self, cgroup_path: &str) -> PathBuf {
        self.cgroup_root.join(cgroup_path)
    }

    fn apply_blockio(&self, dir: &Path, class: &str) -> Result<(), EffectorError> {
        if class.is_empty() {
            return Ok(());
        }
        let file = match self.blockio_variant() {
            BlockIoVariant::Bfq => dir.join("blkio.bfq.weight_device"),
            BlockIoVariant::Weight => dir.join("blkio.weight_device"),
            BlockIoVariant::Unsupported => return Ok(()),
        };
        retry_once(&file, || write_once(&file, class))
    }
}

impl Effector for CgroupEffector {
    fn enforce(&self, req: &EnforceRequest) -> Result<(), EffectorError> {
        let dir = self.dir(&req.cgroup_path);

        let mut all_cpus: BTreeSet<u32> = req.shared_cpus.iter().copied().collect();
        all_cpus.extend(req.exclusive_cpus.iter().copied());
        let cpus: Vec<u32> = all_cpus.into_iter().collect();

        let cpus_file = dir.join("cpuset.cpus");
        retry_once(&cpus_file, || write_once(&cpus_file, &join_list(&cpus)))?;

        let mems_file = dir.join("cpuset.mems");
        retry_once(&mems_file, || write_once(&mems_file, &join_list(&req.memory_zone_mask)))?;

        self.apply_blockio(&dir, &req.blockio_class)?;

        tracing::debug!(
            cgroup = %req.cgroup_path,
            shared = req.shared_cpus.len(),
            exclusive = req.exclusive_cpus.len(),
            "enforced cgroup assignment"
        );
        Ok(())
    }

    fn assign_rdt_class(&self, cgroup_path: &str, class: &str) -> Result<(), EffectorError> {
        if class.is_empty() {
            return Ok(());
        }
        let procs_file = self.dir(cgroup_path).join("cgroup.procs");
        let pids = match std::fs::read_to_string(&procs_file) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(EffectorError::CgroupNotFound(cgroup_path.to_string())),
            Err(e) => return Err(EffectorError::Io { path: procs_file.display().to_string(), detail: e.to_string() }),
        };
        let tasks_file = self.resctrl_root.join(class).join("tasks");
        if !self.resctrl_root.join(class).exists() {
            return Err(EffectorError::UnsupportedController(format!("resctrl class {class}")));
        }
        for pid in pids.lines().filter(|l| !l.is_empty()) {
            retry_once(&tasks_file, || write_once(&tasks_file, pid))?;
        }
        Ok(())
    }

    fn release(&self, cgroup_path: &str) -> Result<(), EffectorError> {
        let dir = self.dir(cgroup_path);
        if !dir.exists() {
            return Ok(());
        }
        let default_tasks = self.resctrl_root.join("tasks");
        if let Ok(pids) = std::fs::read_to_string(dir.join("cgroup.procs")) {
            if default_tasks.exists() {
                for pid in pids.lines().filter(|l| !l.is_empty()) {
                    let _ = write_once(&default_tasks, pid);
                }
            }
        }
        Ok(())
    }

    fn self_test(&self) -> Result<(), EffectorError> {
        if !self.cgroup_root.is_dir() {
            return Err(EffectorError::CgroupNotFound(self.cgroup_root.display().to_string()));
        }
        if !self.resctrl_root.is_dir() {
            tracing::warn!(path = %self.resctrl_root.display(), "resctrl not mounted, RDT assignment disabled");
        }
        if self.blockio_variant() == BlockIoVariant::Unsupported {
            tracing::warn!("no recognized block-IO controller, blockio class assignment disabled");
        }
        Ok(())
    }
}

/// Records every call it receives instead of touching the filesystem, for
/// tests of the layers above this one.
#[derive(Default)]
pub struct MockEffector {
    enforced: Mutex<Vec<EnforceRequest>>,
    rdt_assignments: Mutex<Vec<(String, String)>>,
    released: Mutex<Vec<String>>,
}

impl MockEffector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enforced(&self) -> Vec<EnforceRequest> {
        self.enforced.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

impl Effector for MockEffector {
    fn enforce(&self, req: &EnforceRequest) -> Result<(), EffectorError> {
        self.enforced.lock().unwrap().push(req.clone());
        Ok(())
    }

    fn assign_rdt_class(&self, cgroup_path: &str, class: &str) -> Result<(), EffectorError> {
        self.rdt_assignments.lock().unwrap().push((cgroup_path.to_string(), class.to_string()));
        Ok(())
    }

    fn release(&self, cgroup_path: &str) -> Result<(), EffectorError> {
        self.released.lock().unwrap().push(cgroup_path.to_string());
        Ok(())
    }

    fn self_test(&self) -> Result<(), EffectorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(path: &str) -> EnforceRequest {
        EnforceRequest {
            cgroup_path: path.to_string(),
            shared_cpus: vec![1, 2],
            exclusive_cpus: vec![3],
            memory_zone_mask: vec![0],
            rdt_class: "rm.mixed".to_string(),
            blockio_class: String::new(),
        }
    }

    #[test]
    fn enforce_writes_cpuset_files() {
        let dir = tempfile::tempdir().unwrap();
        let effector = CgroupEffector::new(dir.path(), dir.path().join("resctrl"));
        effector.enforce(&req("kubepods/pod1/c1")).unwrap();
        let cpus = std::fs::read_to_string(dir.path().join("kubepods/pod1/c1/cpuset.cpus")).unwrap();
        assert_eq!(cpus, "1,2,3");
        let mems = std::fs::read_to_string(dir.path().join("kubepods/pod1/c1/cpuset.mems")).unwrap();
        assert_eq!(mems, "0");
    }

    #[test]
    fn assign_rdt_class_requires_existing_resctrl_group() {
        let dir = tempfile::tempdir().unwrap();
        let effector = CgroupEffector::new(dir.path(), dir.path().join("resctrl"));
        let cgroup_dir = dir.path().join("kubepods/pod1/c1");
        std::fs::create_dir_all(&cgroup_dir).unwrap();
        std::fs::write(cgroup_dir.join("cgroup.procs"), "123\n456\n").unwrap();

        let err = effector.assign_rdt_class("kubepods/pod1/c1", "rm.mixed").unwrap_err();
        assert!(matches!(err, EffectorError::UnsupportedController(_)));

        std::fs::create_dir_all(dir.path().join("resctrl/rm.mixed")).unwrap();
        effector.assign_rdt_class("kubepods/pod1/c1", "rm.mixed").unwrap();
        let tasks = std::fs::read_to_string(dir.path().join("resctrl/rm.mixed/tasks")).unwrap();
        assert!(tasks.contains("456"));
    }

    #[test]
    fn release_is_idempotent_for_missing_cgroup() {
        let dir = tempfile::tempdir().unwrap();
        let effector = CgroupEffector::new(dir.path(), dir.path().join("resctrl"));
        assert!(effector.release("kubepods/pod1/gone").is_ok());
    }

    #[test]
    fn self_test_fails_when_cgroup_root_missing() {
        let effector = CgroupEffector::new("/nonexistent/cgroup/root", "/nonexistent/resctrl");
        assert!(effector.self_test().is_err());
    }

    #[test]
    fn mock_effector_records_calls() {
        let mock = MockEffector::new();
        mock.enforce(&req("c1")).unwrap();
        mock.release("c1").unwrap();
        assert_eq!(mock.enforced().len(), 1);
        assert_eq!(mock.released(), vec!["c1".to_string()]);
    }
}
