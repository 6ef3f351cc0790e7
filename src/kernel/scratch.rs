//! Host-side scratch directory discovery.
//!
//! The new root and the synthetic-content staging area are tmpfs mounts
//! stacked over plain host directories named `nsjail.<uid>.<purpose>`.
//! Concurrent jails of the same user share candidates, so pre-existing
//! directories are acceptable.

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::{access, mkdir, AccessFlags};
use std::path::{Path, PathBuf};

use crate::config::types::{JailError, Result};

/// Create `dir` (0755) if missing and probe it for readability.
fn mkdir_and_test(dir: &Path) -> bool {
    match mkdir(dir, Mode::from_bits_truncate(0o755)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => {
            log::debug!("Couldn't create '{}' directory: {}", dir.display(), e);
            return false;
        }
    }
    if let Err(e) = access(dir, AccessFlags::R_OK) {
        log::warn!("access('{}', R_OK): {}", dir.display(), e);
        return false;
    }
    log::debug!("Created accessible directory in '{}'", dir.display());
    true
}

fn rnd64() -> u64 {
    uuid::Uuid::new_v4().as_u128() as u64
}

// The double slash after /run/user is kept for compatibility with
// existing nsjail.<uid>.* scratch paths.
fn fixed_candidates(orig_uid: u32, purpose: &str) -> Vec<PathBuf> {
    let mut dirs = vec![
        PathBuf::from(format!("/run/user//nsjail.{}.{}", orig_uid, purpose)),
        PathBuf::from(format!("/tmp/nsjail.{}.{}", orig_uid, purpose)),
    ];
    if let Ok(tmpdir) = std::env::var("TMPDIR") {
        dirs.push(PathBuf::from(format!(
            "{}/nsjail.{}.{}",
            tmpdir, orig_uid, purpose
        )));
    }
    dirs.push(PathBuf::from(format!(
        "/dev/shm/nsjail.{}.{}",
        orig_uid, purpose
    )));
    dirs
}

/// Find or create a host directory usable for staging, owned by the
/// invoking user. Candidates are tried in a fixed order and the first
/// one that can be created and read wins.
pub fn scratch_dir(orig_uid: u32, purpose: &str) -> Result<PathBuf> {
    for dir in fixed_candidates(orig_uid, purpose) {
        if mkdir_and_test(&dir) {
            return Ok(dir);
        }
    }

    let fallback = PathBuf::from(format!(
        "/tmp/nsjail.{}.{}.{}",
        orig_uid,
        purpose,
        rnd64()
    ));
    if mkdir_and_test(&fallback) {
        return Ok(fallback);
    }

    log::error!("Couldn't create tmp directory of type '{}'", purpose);
    Err(JailError::NoScratch(purpose.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // TMPDIR is process-global, so both candidate-list cases run in one
    // test to keep them off parallel test threads.
    #[test]
    fn test_candidate_order_and_naming() {
        std::env::remove_var("TMPDIR");
        let dirs = fixed_candidates(1000, "root");
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/run/user//nsjail.1000.root"),
                PathBuf::from("/tmp/nsjail.1000.root"),
                PathBuf::from("/dev/shm/nsjail.1000.root"),
            ]
        );

        std::env::set_var("TMPDIR", "/var/tmp");
        let dirs = fixed_candidates(0, "tmp");
        std::env::remove_var("TMPDIR");
        assert_eq!(dirs[2], PathBuf::from("/var/tmp/nsjail.0.tmp"));
        assert_eq!(dirs[3], PathBuf::from("/dev/shm/nsjail.0.tmp"));
    }

    #[test]
    fn test_mkdir_and_test_tolerates_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("scratch");
        assert!(mkdir_and_test(&dir));
        assert!(mkdir_and_test(&dir));
        assert!(dir.is_dir());
    }

    #[test]
    fn test_mkdir_and_test_rejects_uncreatable_path() {
        assert!(!mkdir_and_test(Path::new(
            "/nonexistent-rustjail/deep/scratch"
        )));
    }
}
