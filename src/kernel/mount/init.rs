//! Sandbox root construction, run inside the child's mount namespace.
//!
//! The new root is a fresh tmpfs staged over a host scratch directory,
//! populated mount by mount in registration order, swapped in with
//! pivot_root, and finally hardened read-only where requested.

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneCb, CloneFlags};
use nix::sys::stat::Mode;
use nix::sys::statvfs::{statvfs, FsFlags, Statvfs};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, mkdir, pivot_root, unlink};
use std::ffi::CString;
use std::fs;
use std::io::Write as _;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::types::{JailConfig, JailError, Result, RunMode};
use crate::kernel::mount::spec::{flags_to_str, MountSpec};
use crate::kernel::scratch::scratch_dir;

/// Option string for both staging tmpfs mounts (16 MiB).
const SCRATCH_TMPFS_OPTS: &str = "size=16777216";

const HELPER_STACK_SIZE: usize = 1024 * 1024;

/// Names staged src_content files. Process-wide; the staging directory
/// itself is per-instance, so restarts of the counter are harmless.
static DYNAMIC_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn mount_err(msg: String) -> JailError {
    JailError::Mount(msg)
}

/// Create the mount-point placeholder file with open(O_CREAT|O_RDONLY).
fn create_placeholder_file(dstpath: &Path) {
    let path_c = match CString::new(dstpath.as_os_str().as_bytes()) {
        Ok(c) => c,
        Err(_) => {
            log::warn!("open('{}'): path contains NUL byte", dstpath.display());
            return;
        }
    };
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_CREAT | libc::O_RDONLY | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    } else {
        log::warn!(
            "open('{}', O_CREAT|O_RDONLY|O_CLOEXEC, 0644): {}",
            dstpath.display(),
            std::io::Error::last_os_error()
        );
    }
}

/// Write `src_content` to a fresh staging file under `tmpdir` and return
/// its path.
fn stage_src_content(mpt: &MountSpec, tmpdir: &Path) -> Result<String> {
    let n = DYNAMIC_FILE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let staged = format!("{}/dynamic_file.{}", tmpdir.display(), n);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .custom_flags(libc::O_CLOEXEC)
        .open(&staged)
        .map_err(|e| {
            log::warn!(
                "open('{}', O_CREAT|O_EXCL|O_CLOEXEC|O_WRONLY, 0644) failed: {}",
                staged,
                e
            );
            mount_err(format!("open('{}'): {}", staged, e))
        })?;

    file.write_all(&mpt.src_content).map_err(|e| {
        log::warn!(
            "Writing {} bytes to '{}' failed: {}",
            mpt.src_content.len(),
            staged,
            e
        );
        mount_err(format!("write('{}'): {}", staged, e))
    })?;

    Ok(staged)
}

/// Mount one spec under `newroot`, staging synthetic content in `tmpdir`.
fn mount_pt(mpt: &mut MountSpec, newroot: &Path, tmpdir: &Path) -> Result<()> {
    log::debug!("Mounting '{}'", mpt);

    let dstpath = PathBuf::from(format!("{}/{}", newroot.display(), mpt.dst));
    let mut srcpath = if mpt.src.is_empty() {
        "none".to_string()
    } else {
        mpt.src.clone()
    };

    if let Some(parent) = dstpath.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            log::warn!(
                "Couldn't create upper directories for '{}': {}",
                dstpath.display(),
                e
            );
            return Err(mount_err(format!(
                "mkdir ancestors of '{}': {}",
                dstpath.display(),
                e
            )));
        }
    }

    if mpt.is_symlink {
        log::debug!("symlink('{}', '{}')", srcpath, dstpath.display());
        if let Err(e) = symlink(&srcpath, &dstpath) {
            if mpt.is_mandatory {
                log::warn!("symlink('{}', '{}'): {}", srcpath, dstpath.display(), e);
                return Err(mount_err(format!(
                    "symlink('{}', '{}'): {}",
                    srcpath,
                    dstpath.display(),
                    e
                )));
            }
            log::warn!(
                "symlink('{}', '{}'): {}, but it's not mandatory, continuing",
                srcpath,
                dstpath.display(),
                e
            );
        }
        return Ok(());
    }

    // Placeholder failures are only warnings; the mount below is the
    // authoritative failure point.
    if mpt.is_dir {
        match mkdir(&dstpath, Mode::from_bits_truncate(0o711)) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => log::warn!("mkdir('{}'): {}", dstpath.display(), e),
        }
    } else {
        create_placeholder_file(&dstpath);
    }

    if !mpt.src_content.is_empty() {
        srcpath = stage_src_content(mpt, tmpdir)?;
        mpt.flags |= MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    }

    // Mounted R/W first; MS_RDONLY is applied by the remount pass after
    // pivot_root.
    let flags = mpt.flags.difference(MsFlags::MS_RDONLY);
    let fs_type = if mpt.fs_type.is_empty() {
        None
    } else {
        Some(mpt.fs_type.as_str())
    };
    let options = if mpt.options.is_empty() {
        None
    } else {
        Some(mpt.options.as_str())
    };

    if let Err(e) = mount(
        Some(srcpath.as_str()),
        &dstpath,
        fs_type,
        flags,
        options,
    ) {
        if e == Errno::EACCES {
            log::warn!(
                "mount('{}') src:'{}' dstpath:'{}' failed: {}. Try fixing this problem by \
                 applying 'chmod o+x' to the '{}' directory and its ancestors",
                mpt,
                srcpath,
                dstpath.display(),
                e,
                srcpath
            );
        } else {
            log::warn!(
                "mount('{}') src:'{}' dstpath:'{}' failed: {}",
                mpt,
                srcpath,
                dstpath.display(),
                e
            );
            if mpt.fs_type == "proc" {
                log::warn!(
                    "procfs can only be mounted if the original /proc doesn't have any other \
                     file-systems mounted on top of it (e.g. /dev/null on top of /proc/kcore)"
                );
            }
        }
        return Err(mount_err(format!("mount('{}'): {}", mpt, e)));
    }
    mpt.mounted = true;

    // The bind holds the inode open; drop the staging directory entry.
    if !mpt.src_content.is_empty() {
        if let Err(e) = unlink(srcpath.as_str()) {
            log::warn!("unlink('{}'): {}", srcpath, e);
        }
    }

    Ok(())
}

/// Mount flags carried over from the statvfs view on bind remount. A
/// remount that omits a flag the kernel already reports clears it.
const REMOUNT_PRESERVE: &[(MsFlags, FsFlags)] = &[
    (MsFlags::MS_RDONLY, FsFlags::ST_RDONLY),
    (MsFlags::MS_NOSUID, FsFlags::ST_NOSUID),
    (MsFlags::MS_NODEV, FsFlags::ST_NODEV),
    (MsFlags::MS_NOEXEC, FsFlags::ST_NOEXEC),
    (MsFlags::MS_SYNCHRONOUS, FsFlags::ST_SYNCHRONOUS),
    (MsFlags::MS_MANDLOCK, FsFlags::ST_MANDLOCK),
    (MsFlags::MS_NOATIME, FsFlags::ST_NOATIME),
    (MsFlags::MS_NODIRATIME, FsFlags::ST_NODIRATIME),
    (MsFlags::MS_RELATIME, FsFlags::ST_RELATIME),
];

fn statvfs_retry(path: &str) -> std::result::Result<Statvfs, Errno> {
    loop {
        match statvfs(path) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Re-apply MS_RDONLY to a mounted spec via bind remount.
fn remount_ro(mpt: &MountSpec) -> Result<()> {
    if !mpt.mounted || mpt.is_symlink || !mpt.flags.contains(MsFlags::MS_RDONLY) {
        return Ok(());
    }

    let vfs = statvfs_retry(mpt.dst.as_str()).map_err(|e| {
        log::warn!("statvfs('{}'): {}", mpt.dst, e);
        mount_err(format!("statvfs('{}'): {}", mpt.dst, e))
    })?;

    let mut new_flags = MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_BIND;
    for (mount_flag, vfs_flag) in REMOUNT_PRESERVE {
        if vfs.flags().contains(*vfs_flag) {
            new_flags |= *mount_flag;
        }
    }

    log::debug!(
        "Re-mounting R/O '{}' (flags:{})",
        mpt.dst,
        flags_to_str(new_flags)
    );
    mount(
        Some(mpt.dst.as_str()),
        mpt.dst.as_str(),
        None::<&str>,
        new_flags,
        None::<&str>,
    )
    .map_err(|e| {
        log::warn!(
            "mount('{}', flags:{}): {}",
            mpt.dst,
            flags_to_str(new_flags),
            e
        );
        mount_err(format!("remount R/O '{}': {}", mpt.dst, e))
    })
}

fn init_ns_internal(conf: &mut JailConfig) -> Result<()> {
    // Without CLONE_NEWNS any mount would alter the global namespace, so
    // only a plain chroot is offered.
    if !conf.clone_newns {
        if conf.chroot.is_empty() {
            log::error!("chroot was not specified, and it's required when not using CLONE_NEWNS");
            return Err(JailError::Config(
                "chroot path required when CLONE_NEWNS is not used".to_string(),
            ));
        }
        chroot(conf.chroot.as_str()).map_err(|e| {
            log::error!("chroot('{}'): {}", conf.chroot, e);
            mount_err(format!("chroot('{}'): {}", conf.chroot, e))
        })?;
        chdir("/").map_err(|e| {
            log::error!("chdir('/'): {}", e);
            mount_err(format!("chdir('/'): {}", e))
        })?;
        return Ok(());
    }

    chdir("/").map_err(|e| {
        log::error!("chdir('/'): {}", e);
        mount_err(format!("chdir('/'): {}", e))
    })?;

    let destdir = scratch_dir(conf.orig_uid, "root")?;
    let tmpdir = scratch_dir(conf.orig_uid, "tmp")?;

    // Make changes to / (recursively) private so nothing leaks into the
    // global mount namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        log::error!("mount('/', '/', NULL, MS_REC|MS_PRIVATE, NULL): {}", e);
        mount_err(format!("mount('/', MS_REC|MS_PRIVATE): {}", e))
    })?;

    mount(
        None::<&str>,
        &destdir,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(SCRATCH_TMPFS_OPTS),
    )
    .map_err(|e| {
        log::error!("mount('{}', 'tmpfs'): {}", destdir.display(), e);
        mount_err(format!("mount('{}', tmpfs): {}", destdir.display(), e))
    })?;

    mount(
        None::<&str>,
        &tmpdir,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(SCRATCH_TMPFS_OPTS),
    )
    .map_err(|e| {
        log::error!("mount('{}', 'tmpfs'): {}", tmpdir.display(), e);
        mount_err(format!("mount('{}', tmpfs): {}", tmpdir.display(), e))
    })?;

    for mpt in conf.mountpts.iter_mut() {
        if let Err(e) = mount_pt(mpt, &destdir, &tmpdir) {
            if mpt.is_mandatory {
                return Err(e);
            }
            log::warn!("mount('{}') failed, but it's not mandatory, continuing", mpt);
        }
    }

    // All staged content files are unlinked by now; drop the staging tmpfs.
    umount2(&tmpdir, MntFlags::MNT_DETACH).map_err(|e| {
        log::error!("umount2('{}', MNT_DETACH): {}", tmpdir.display(), e);
        mount_err(format!("umount2('{}'): {}", tmpdir.display(), e))
    })?;

    // pivot_root into the new root with itself as put_old: the old root
    // ends up stacked on top of the new one, so a single lazy detach of
    // '/' discards it. No put_old directory inside the new root needed.
    pivot_root(&destdir, &destdir).map_err(|e| {
        log::error!(
            "pivot_root('{}', '{}'): {}",
            destdir.display(),
            destdir.display(),
            e
        );
        mount_err(format!("pivot_root('{}'): {}", destdir.display(), e))
    })?;

    umount2("/", MntFlags::MNT_DETACH).map_err(|e| {
        log::error!("umount2('/', MNT_DETACH): {}", e);
        mount_err(format!("umount2('/', MNT_DETACH): {}", e))
    })?;

    chdir(conf.cwd.as_str()).map_err(|e| {
        log::error!("chdir('{}'): {}", conf.cwd, e);
        mount_err(format!("chdir('{}'): {}", conf.cwd, e))
    })?;

    for mpt in conf.mountpts.iter() {
        if let Err(e) = remount_ro(mpt) {
            if mpt.is_mandatory {
                return Err(e);
            }
            log::warn!(
                "remount R/O '{}' failed, but it's not mandatory, continuing",
                mpt.dst
            );
        }
    }

    Ok(())
}

/// Construct the jail's filesystem view.
///
/// With `RunMode::StandaloneExecve` the work runs in a short-lived child
/// sharing filesystem attributes with the caller (CLONE_FS), so the
/// pivoted root takes effect in the caller once the helper exits.
pub fn init_ns(conf: &mut JailConfig) -> Result<()> {
    if conf.mode != RunMode::StandaloneExecve {
        return init_ns_internal(conf);
    }

    let mut stack = vec![0u8; HELPER_STACK_SIZE];
    let cb: CloneCb = Box::new(|| match init_ns_internal(conf) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("Mount namespace init failed in helper child: {}", e);
            0xff
        }
    });

    let helper = unsafe { clone(cb, &mut stack, CloneFlags::CLONE_FS, Some(libc::SIGCHLD)) }
        .map_err(|e| mount_err(format!("clone(CLONE_FS|SIGCHLD): {}", e)))?;

    loop {
        match waitpid(helper, None) {
            Ok(WaitStatus::Exited(_, 0)) => return Ok(()),
            Ok(WaitStatus::Exited(_, status)) => {
                return Err(mount_err(format!(
                    "mount helper exited with status {}",
                    status
                )))
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Err(mount_err(format!("mount helper killed by {:?}", sig)))
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(mount_err(format!("wait4(helper): {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::JailConfig;

    #[test]
    fn test_no_newns_requires_chroot() {
        let mut conf = JailConfig {
            clone_newns: false,
            ..Default::default()
        };
        let err = init_ns(&mut conf).unwrap_err();
        assert!(matches!(err, JailError::Config(_)));
    }

    #[test]
    fn test_staged_content_lands_in_numbered_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mpt = MountSpec {
            src: String::new(),
            dst: "/etc/hosts".to_string(),
            fs_type: String::new(),
            options: String::new(),
            flags: MsFlags::empty(),
            is_dir: false,
            is_mandatory: true,
            is_symlink: false,
            src_content: b"127.0.0.1 localhost\n".to_vec(),
            mounted: false,
        };

        let staged = stage_src_content(&mpt, tmp.path()).unwrap();
        assert!(staged.starts_with(&format!("{}/dynamic_file.", tmp.path().display())));
        assert_eq!(fs::read(&staged).unwrap(), mpt.src_content);

        let n: u64 = staged.rsplit('.').next().unwrap().parse().unwrap();
        assert!(n >= 1);
        let again = stage_src_content(&mpt, tmp.path()).unwrap();
        assert_ne!(staged, again);
    }

    #[test]
    fn test_remount_ro_skips_unmounted_and_symlinks() {
        let base = MountSpec {
            src: "/lib".to_string(),
            dst: "/definitely/not/mounted".to_string(),
            fs_type: String::new(),
            options: String::new(),
            flags: MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            is_dir: true,
            is_mandatory: true,
            is_symlink: false,
            src_content: Vec::new(),
            mounted: false,
        };
        // Not mounted: nothing to do even though the path doesn't exist.
        assert!(remount_ro(&base).is_ok());

        let symlink_spec = MountSpec {
            is_symlink: true,
            mounted: true,
            ..base.clone()
        };
        assert!(remount_ro(&symlink_spec).is_ok());

        let rw = MountSpec {
            flags: MsFlags::MS_BIND,
            mounted: true,
            ..base
        };
        assert!(remount_ro(&rw).is_ok());
    }
}
