//! Linux kernel primitive wrappers
//!
//! Thin wrappers around the mount table, the cgroup-v1 hierarchy, and the
//! host scratch directories that back the jail root. All `unsafe` code is
//! concentrated here with explicit preconditions.

pub mod cgroup;
pub mod mount;
pub mod scratch;
