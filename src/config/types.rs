/// Core types and structures for the rustjail system
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::kernel::mount::{MountRequest, MountSpec};

#[derive(Error, Debug)]
pub enum JailError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No usable scratch directory of type '{0}'")]
    NoScratch(String),
}

pub type Result<T> = std::result::Result<T, JailError>;

/// Jail lifecycle mode, selected by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Accept TCP connections and jail one process per client.
    ListenTcp,
    /// Run a single jailed process and wait for it.
    StandaloneOnce,
    /// Re-launch the jailed process whenever it exits.
    StandaloneRerun,
    /// Replace the current process with the jailed one. Mount init must
    /// then run in a short-lived CLONE_FS helper, because procfs can only
    /// be mounted from a process already inside the new PID namespace.
    StandaloneExecve,
}

/// Per-controller cgroup-v1 settings. A zero cap disables its controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Memory cap in bytes.
    pub mem_max: u64,
    pub mem_mount: PathBuf,
    pub mem_parent: String,
    /// Maximum number of PIDs.
    pub pids_max: u64,
    pub pids_mount: PathBuf,
    pub pids_parent: String,
    /// Network classifier id written to net_cls.classid.
    pub net_cls_classid: u32,
    pub net_cls_mount: PathBuf,
    pub net_cls_parent: String,
    /// CPU milliseconds per second of wall time (CFS bandwidth).
    pub cpu_ms_per_sec: u32,
    pub cpu_mount: PathBuf,
    pub cpu_parent: String,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            mem_max: 0,
            mem_mount: PathBuf::from("/sys/fs/cgroup/memory"),
            mem_parent: "NSJAIL".to_string(),
            pids_max: 0,
            pids_mount: PathBuf::from("/sys/fs/cgroup/pids"),
            pids_parent: "NSJAIL".to_string(),
            net_cls_classid: 0,
            net_cls_mount: PathBuf::from("/sys/fs/cgroup/net_cls"),
            net_cls_parent: "NSJAIL".to_string(),
            cpu_ms_per_sec: 0,
            cpu_mount: PathBuf::from("/sys/fs/cgroup/cpu"),
            cpu_parent: "NSJAIL".to_string(),
        }
    }
}

/// Jail configuration assembled by the supervisor's config layer.
#[derive(Clone, Debug)]
pub struct JailConfig {
    /// Requested mount points, processed strictly in insertion order.
    /// Parent directories must be registered before their children.
    pub mountpts: Vec<MountSpec>,
    /// Whether the jailed process runs in a private mount namespace.
    pub clone_newns: bool,
    /// Chroot target, used only when `clone_newns` is false.
    pub chroot: String,
    /// Working directory entered after the root swap.
    pub cwd: String,
    /// UID of the invoking user; names the scratch directories.
    pub orig_uid: u32,
    pub mode: RunMode,
    pub cgroup: CgroupConfig,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            mountpts: Vec::new(),
            clone_newns: true,
            chroot: String::new(),
            cwd: "/".to_string(),
            orig_uid: 0,
            mode: RunMode::StandaloneOnce,
            cgroup: CgroupConfig::default(),
        }
    }
}

impl JailConfig {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Register a mount ahead of every existing one.
    pub fn add_mountpt_head(&mut self, req: MountRequest) -> Result<()> {
        let mnt = req.resolve()?;
        self.mountpts.insert(0, mnt);
        Ok(())
    }

    /// Register a mount after every existing one.
    pub fn add_mountpt_tail(&mut self, req: MountRequest) -> Result<()> {
        let mnt = req.resolve()?;
        self.mountpts.push(mnt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mount::MountRequest;

    #[test]
    fn test_default_cgroup_config_disables_all_controllers() {
        let conf = CgroupConfig::default();
        assert_eq!(conf.mem_max, 0);
        assert_eq!(conf.pids_max, 0);
        assert_eq!(conf.net_cls_classid, 0);
        assert_eq!(conf.cpu_ms_per_sec, 0);
        assert_eq!(conf.mem_mount, PathBuf::from("/sys/fs/cgroup/memory"));
        assert_eq!(conf.mem_parent, "NSJAIL");
    }

    #[test]
    fn test_mountpt_head_tail_ordering() {
        let mut conf = JailConfig::default();

        conf.add_mountpt_tail(MountRequest {
            dst: "/first".to_string(),
            ..Default::default()
        })
        .unwrap();
        conf.add_mountpt_tail(MountRequest {
            dst: "/second".to_string(),
            ..Default::default()
        })
        .unwrap();
        conf.add_mountpt_head(MountRequest {
            dst: "/zeroth".to_string(),
            ..Default::default()
        })
        .unwrap();

        let dsts: Vec<&str> = conf.mountpts.iter().map(|m| m.dst.as_str()).collect();
        assert_eq!(dsts, vec!["/zeroth", "/first", "/second"]);
    }

    #[test]
    fn test_failed_registration_leaves_list_untouched() {
        let mut conf = JailConfig::default();
        let result = conf.add_mountpt_tail(MountRequest {
            dst: "/x".to_string(),
            src_env: "RUSTJAIL_TEST_NO_SUCH_ENVVAR".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
        assert!(conf.mountpts.is_empty());
    }
}
