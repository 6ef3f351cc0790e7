//! Cgroup-v1 lifecycle for jailed processes.
//!
//! One `NSJAIL.<pid>` leaf per enabled controller is created and
//! populated before the child starts user work, and removed after the
//! child has been reaped. A controller with a zero cap stays untouched.

use nix::unistd::Pid;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::config::types::{CgroupConfig, JailError, Result};

fn leaf_path(mount: &Path, parent: &str, pid: Pid) -> PathBuf {
    mount.join(parent).join(format!("NSJAIL.{}", pid))
}

fn create_leaf(leaf: &Path, pid: Pid) -> Result<()> {
    log::debug!("Create '{}' for PID={}", leaf.display(), pid);
    match fs::DirBuilder::new().mode(0o700).create(leaf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => {
            log::warn!("mkdir('{}', 0700) failed: {}", leaf.display(), e);
            Err(JailError::Cgroup(format!(
                "mkdir('{}'): {}",
                leaf.display(),
                e
            )))
        }
    }
}

fn write_knob(leaf: &Path, knob: &str, value: &str) -> Result<()> {
    let fname = leaf.join(knob);
    log::debug!("Setting '{}' to '{}'", fname.display(), value);
    fs::write(&fname, value).map_err(|e| {
        log::warn!("Could not write '{}' to '{}': {}", value, fname.display(), e);
        JailError::Cgroup(format!("write('{}'): {}", fname.display(), e))
    })
}

fn add_task(leaf: &Path, pid: Pid) -> Result<()> {
    let tasks = leaf.join("tasks");
    log::debug!("Adding PID='{}' to '{}'", pid, tasks.display());
    fs::write(&tasks, pid.to_string()).map_err(|e| {
        log::warn!("Could not update '{}' task list: {}", tasks.display(), e);
        JailError::Cgroup(format!("write('{}'): {}", tasks.display(), e))
    })
}

fn attach_mem(conf: &CgroupConfig, pid: Pid) -> Result<()> {
    if conf.mem_max == 0 {
        return Ok(());
    }
    let leaf = leaf_path(&conf.mem_mount, &conf.mem_parent, pid);
    create_leaf(&leaf, pid)?;
    write_knob(&leaf, "memory.limit_in_bytes", &conf.mem_max.to_string())?;
    // 0 keeps the OOM killer active instead of freezing the group at the
    // limit.
    write_knob(&leaf, "memory.oom_control", "0")?;
    add_task(&leaf, pid)
}

fn attach_pids(conf: &CgroupConfig, pid: Pid) -> Result<()> {
    if conf.pids_max == 0 {
        return Ok(());
    }
    let leaf = leaf_path(&conf.pids_mount, &conf.pids_parent, pid);
    create_leaf(&leaf, pid)?;
    write_knob(&leaf, "pids.max", &conf.pids_max.to_string())?;
    add_task(&leaf, pid)
}

fn attach_net_cls(conf: &CgroupConfig, pid: Pid) -> Result<()> {
    if conf.net_cls_classid == 0 {
        return Ok(());
    }
    let leaf = leaf_path(&conf.net_cls_mount, &conf.net_cls_parent, pid);
    create_leaf(&leaf, pid)?;
    write_knob(
        &leaf,
        "net_cls.classid",
        &format!("{:#x}", conf.net_cls_classid),
    )?;
    add_task(&leaf, pid)
}

fn attach_cpu(conf: &CgroupConfig, pid: Pid) -> Result<()> {
    if conf.cpu_ms_per_sec == 0 {
        return Ok(());
    }
    let leaf = leaf_path(&conf.cpu_mount, &conf.cpu_parent, pid);
    create_leaf(&leaf, pid)?;
    let quota_us = u64::from(conf.cpu_ms_per_sec) * 1000;
    write_knob(&leaf, "cpu.cfs_quota_us", &quota_us.to_string())?;
    write_knob(&leaf, "cpu.cfs_period_us", "1000000")?;
    add_task(&leaf, pid)
}

/// Create and populate the `NSJAIL.<pid>` leaf of every enabled
/// controller, then add `pid` to its task list. Must complete before the
/// child execs user code. Partial state from a failed attach is left in
/// place for the supervisor to inspect.
pub fn attach(conf: &CgroupConfig, pid: Pid) -> Result<()> {
    attach_mem(conf, pid)?;
    attach_pids(conf, pid)?;
    attach_net_cls(conf, pid)?;
    attach_cpu(conf, pid)
}

fn remove_leaf(leaf: &Path) {
    log::debug!("Remove '{}'", leaf.display());
    if let Err(e) = fs::remove_dir(leaf) {
        // Expected while the kernel still accounts exiting tasks to the
        // group.
        log::warn!("rmdir('{}') failed: {}", leaf.display(), e);
    }
}

/// Remove the per-instance leaves. Best-effort: the kernel refuses rmdir
/// while tasks remain, which the supervisor may retry after reaping.
pub fn release(conf: &CgroupConfig, pid: Pid) {
    if conf.mem_max != 0 {
        remove_leaf(&leaf_path(&conf.mem_mount, &conf.mem_parent, pid));
    }
    if conf.pids_max != 0 {
        remove_leaf(&leaf_path(&conf.pids_mount, &conf.pids_parent, pid));
    }
    if conf.net_cls_classid != 0 {
        remove_leaf(&leaf_path(&conf.net_cls_mount, &conf.net_cls_parent, pid));
    }
    if conf.cpu_ms_per_sec != 0 {
        remove_leaf(&leaf_path(&conf.cpu_mount, &conf.cpu_parent, pid));
    }
}
