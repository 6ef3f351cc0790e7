//! Mount-point model and registration-time resolution.

use nix::mount::MsFlags;
use std::fmt::{self, Write as _};

use crate::config::types::{JailError, Result};

/// Whether the mount destination is created as a directory or a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirHint {
    Yes,
    No,
    /// Resolve from the source at registration time.
    Maybe,
}

/// One requested mount point, fully resolved at registration.
#[derive(Clone, Debug)]
pub struct MountSpec {
    /// Host-side source path; empty when no source applies (tmpfs, proc).
    pub src: String,
    /// Destination, interpreted relative to the new root.
    pub dst: String,
    pub fs_type: String,
    /// Option string passed verbatim to the kernel.
    pub options: String,
    pub flags: MsFlags,
    pub is_dir: bool,
    /// A failed non-mandatory mount is logged and skipped.
    pub is_mandatory: bool,
    /// Create `dst` as a symlink to `src` instead of mounting.
    pub is_symlink: bool,
    /// Synthetic file contents; staged in the tmp scratch and bind-mounted.
    pub src_content: Vec<u8>,
    /// Set once the initial mount succeeds; guards the read-only pass.
    pub mounted: bool,
}

/// Registration inputs for one mount point.
#[derive(Clone, Debug)]
pub struct MountRequest {
    pub src: String,
    pub dst: String,
    pub fs_type: String,
    pub options: String,
    pub flags: MsFlags,
    pub is_dir: DirHint,
    pub is_mandatory: bool,
    /// Env var whose value is prefixed to `src`; registration fails if unset.
    pub src_env: String,
    /// Env var whose value is prefixed to `dst`; registration fails if unset.
    pub dst_env: String,
    pub src_content: Vec<u8>,
    pub is_symlink: bool,
}

impl Default for MountRequest {
    fn default() -> Self {
        Self {
            src: String::new(),
            dst: String::new(),
            fs_type: String::new(),
            options: String::new(),
            flags: MsFlags::empty(),
            is_dir: DirHint::Maybe,
            is_mandatory: true,
            src_env: String::new(),
            dst_env: String::new(),
            src_content: Vec::new(),
            is_symlink: false,
        }
    }
}

impl MountRequest {
    /// Resolve env-var prefixes and the directory hint into a `MountSpec`.
    pub fn resolve(self) -> Result<MountSpec> {
        let mut src = String::new();
        if !self.src_env.is_empty() {
            match std::env::var(&self.src_env) {
                Ok(v) => src = v,
                Err(_) => {
                    log::warn!("No such envvar:'{}'", self.src_env);
                    return Err(JailError::Config(format!(
                        "no such envvar: '{}'",
                        self.src_env
                    )));
                }
            }
        }
        src.push_str(&self.src);

        let mut dst = String::new();
        if !self.dst_env.is_empty() {
            match std::env::var(&self.dst_env) {
                Ok(v) => dst = v,
                Err(_) => {
                    log::warn!("No such envvar:'{}'", self.dst_env);
                    return Err(JailError::Config(format!(
                        "no such envvar: '{}'",
                        self.dst_env
                    )));
                }
            }
        }
        dst.push_str(&self.dst);

        let is_dir = match self.is_dir {
            DirHint::Yes => true,
            DirHint::No => false,
            DirHint::Maybe => {
                if !self.src_content.is_empty() {
                    false
                } else if src.is_empty() {
                    // No source means a kernel filesystem (proc, tmpfs).
                    true
                } else if self.flags.contains(MsFlags::MS_BIND) {
                    path_is_dir(&src)
                } else {
                    true
                }
            }
        };

        Ok(MountSpec {
            src,
            dst,
            fs_type: self.fs_type,
            options: self.options,
            flags: self.flags,
            is_dir,
            is_mandatory: self.is_mandatory,
            is_symlink: self.is_symlink,
            src_content: self.src_content,
            mounted: false,
        })
    }
}

fn path_is_dir(path: &str) -> bool {
    match std::fs::metadata(path) {
        Ok(md) => md.is_dir(),
        Err(e) => {
            log::debug!("stat('{}'): {}", path, e);
            false
        }
    }
}

const MOUNT_FLAG_NAMES: &[(MsFlags, &str)] = &[
    (MsFlags::MS_RDONLY, "MS_RDONLY"),
    (MsFlags::MS_NOSUID, "MS_NOSUID"),
    (MsFlags::MS_NODEV, "MS_NODEV"),
    (MsFlags::MS_NOEXEC, "MS_NOEXEC"),
    (MsFlags::MS_SYNCHRONOUS, "MS_SYNCHRONOUS"),
    (MsFlags::MS_REMOUNT, "MS_REMOUNT"),
    (MsFlags::MS_MANDLOCK, "MS_MANDLOCK"),
    (MsFlags::MS_DIRSYNC, "MS_DIRSYNC"),
    (MsFlags::MS_NOATIME, "MS_NOATIME"),
    (MsFlags::MS_NODIRATIME, "MS_NODIRATIME"),
    (MsFlags::MS_BIND, "MS_BIND"),
    (MsFlags::MS_MOVE, "MS_MOVE"),
    (MsFlags::MS_REC, "MS_REC"),
    (MsFlags::MS_SILENT, "MS_SILENT"),
    (MsFlags::MS_POSIXACL, "MS_POSIXACL"),
    (MsFlags::MS_UNBINDABLE, "MS_UNBINDABLE"),
    (MsFlags::MS_PRIVATE, "MS_PRIVATE"),
    (MsFlags::MS_SLAVE, "MS_SLAVE"),
    (MsFlags::MS_SHARED, "MS_SHARED"),
    (MsFlags::MS_RELATIME, "MS_RELATIME"),
    (MsFlags::MS_KERNMOUNT, "MS_KERNMOUNT"),
    (MsFlags::MS_I_VERSION, "MS_I_VERSION"),
    (MsFlags::MS_STRICTATIME, "MS_STRICTATIME"),
    (MsFlags::MS_LAZYTIME, "MS_LAZYTIME"),
];

/// Render mount flags under their kernel-header names. Bits without a
/// known name are kept as a trailing hex remainder.
pub fn flags_to_str(flags: MsFlags) -> String {
    let mut res = String::new();
    let mut known = MsFlags::empty();

    for (flag, name) in MOUNT_FLAG_NAMES {
        if flags.contains(*flag) {
            res.push_str(name);
            res.push('|');
        }
        known |= *flag;
    }

    let unknown = flags.bits() & !known.bits();
    if unknown == 0 {
        if res.is_empty() {
            res.push('0');
        } else {
            res.pop();
        }
    } else {
        let _ = write!(res, "{:#x}", unknown);
    }

    res
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "src:'{}' dst:'{}' flags:'{}' type:'{}' options:'{}' is_dir:{}",
            self.src,
            self.dst,
            flags_to_str(self.flags),
            self.fs_type,
            self.options,
            self.is_dir
        )?;
        if !self.is_mandatory {
            write!(f, " mandatory:false")?;
        }
        if !self.src_content.is_empty() {
            write!(f, " src_content_len:{}", self.src_content.len())?;
        }
        if self.is_symlink {
            write!(f, " symlink:true")?;
        }
        Ok(())
    }
}
