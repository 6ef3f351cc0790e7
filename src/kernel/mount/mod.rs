//! Jail filesystem construction
//!
//! Mount-point model plus the orchestrator that stages, pivots, and
//! read-only-hardens the sandbox root.

pub mod init;
pub mod spec;

// Re-export commonly used items
pub use init::init_ns;
pub use spec::{flags_to_str, DirHint, MountRequest, MountSpec};
