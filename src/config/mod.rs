//! Configuration layer shared between the supervisor and the jail core.

pub mod types;

pub use types::{CgroupConfig, JailConfig, JailError, Result, RunMode};
